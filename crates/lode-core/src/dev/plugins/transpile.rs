//! TypeScript and JSX to browser JavaScript.
//!
//! Each `.ts`, `.tsx`, `.mts` and `.jsx` module is parsed, run through the
//! oxc transformer and printed back out. Types are erased and JSX compiles
//! to `React.createElement` calls (a `/** @jsx h */` pragma picks another
//! factory). Imports that are only used as types are dropped. No bundling
//! and no syntax lowering happen here.

use crate::dev::plugin::{HookResult, Plugin, PluginContext, PluginError, TransformResult};
use crate::dev::url::{clean_url, extension_of};
use async_trait::async_trait;
use oxc_allocator::Allocator;
use oxc_codegen::Codegen;
use oxc_parser::Parser;
use oxc_semantic::SemanticBuilder;
use oxc_span::SourceType;
use oxc_transformer::{JsxRuntime, TransformOptions, Transformer};
use std::path::Path;
use tracing::trace;

/// Parser dialect for a transpiled extension.
fn dialect(path: &str) -> Option<SourceType> {
    match extension_of(path)?.as_str() {
        "ts" | "mts" => Some(SourceType::ts()),
        "tsx" => Some(SourceType::tsx()),
        "jsx" => Some(SourceType::jsx()),
        _ => None,
    }
}

/// Compile one module. The error is the first parser or transformer
/// diagnostic.
pub fn transpile(code: &str, path: &str, source_type: SourceType) -> Result<String, String> {
    let allocator = Allocator::default();
    let parsed = Parser::new(&allocator, code, source_type).parse();
    if let Some(error) = parsed.errors.first() {
        return Err(error.to_string());
    }
    let mut program = parsed.program;

    let scoping = SemanticBuilder::new().build(&program).semantic.into_scoping();

    let mut options = TransformOptions::default();
    options.jsx.runtime = JsxRuntime::Classic;
    let transformed =
        Transformer::new(&allocator, Path::new(path), &options).build_with_scoping(scoping, &mut program);
    if let Some(error) = transformed.errors.first() {
        return Err(error.to_string());
    }

    Ok(Codegen::new().build(&program).code)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TranspilePlugin;

#[async_trait]
impl Plugin for TranspilePlugin {
    fn name(&self) -> &str {
        "lode:transpile"
    }

    async fn transform(
        &self,
        code: &str,
        id: &str,
        _ctx: &PluginContext,
    ) -> HookResult<Option<TransformResult>> {
        if id.starts_with('\0') {
            return Ok(None);
        }
        let path = clean_url(id);
        let Some(source_type) = dialect(path) else {
            return Ok(None);
        };

        let code = transpile(code, path, source_type)
            .map_err(|message| PluginError::new(self.name(), "transform", format!("{path}: {message}")))?;
        trace!(id, "transpiled");
        Ok(Some(TransformResult::code(code)))
    }
}
