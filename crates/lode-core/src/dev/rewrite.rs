//! Import scanning and rewriting for unbundled module serving.
//!
//! Modules are parsed with oxc. The scan records the source span of every
//! static import, re-export and literal dynamic `import('...')`, plus the
//! dependency arguments of `import.meta.hot.accept(...)`. Rewrites splice new
//! specifiers into those spans and leave every other byte untouched, so
//! statements may span any number of lines.

use crate::dev::url::extension_of;
use oxc_allocator::Allocator;
use oxc_ast::ast::{
    Argument, ArrayExpressionElement, CallExpression, ExportAllDeclaration, ExportNamedDeclaration,
    Expression, ImportDeclaration, ImportExpression, StringLiteral,
};
use oxc_ast_visit::{walk, Visit};
use oxc_parser::Parser;
use oxc_span::SourceType;
use std::collections::HashSet;
use std::ops::Range;
use thiserror::Error;

/// A module that could not be parsed.
#[derive(Debug, Clone, Error)]
#[error("failed to parse {path}: {message}")]
pub struct ParseError {
    pub path: String,
    pub message: String,
}

/// One specifier string in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSite {
    /// The specifier as written.
    pub specifier: String,
    /// Byte range of the specifier text, quotes excluded.
    pub span: Range<usize>,
}

impl ImportSite {
    fn from_literal(literal: &StringLiteral<'_>) -> Self {
        let start = literal.span.start as usize + 1;
        let end = (literal.span.end as usize).saturating_sub(1).max(start);
        Self {
            specifier: literal.value.to_string(),
            span: start..end,
        }
    }
}

/// What a module imports and which HMR updates it accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleImports {
    /// Static imports, re-exports and literal dynamic imports, in source
    /// order. Type-only imports are skipped.
    pub imports: Vec<ImportSite>,
    /// Arguments of `import.meta.hot.accept('dep')` / `accept(['a', 'b'])`.
    pub accepted_deps: Vec<ImportSite>,
    /// `import.meta.hot.accept()` with no dependency list was called.
    pub self_accepting: bool,
}

impl ModuleImports {
    /// Scan `code`; `path` picks the dialect (TS, TSX, JS with JSX).
    pub fn parse(code: &str, path: &str) -> Result<Self, ParseError> {
        let allocator = Allocator::default();
        let parsed = Parser::new(&allocator, code, source_type_for(path)).parse();
        if let Some(error) = parsed.errors.first() {
            return Err(ParseError {
                path: path.to_string(),
                message: error.to_string(),
            });
        }

        let mut collector = ImportCollector::default();
        collector.visit_program(&parsed.program);
        Ok(collector.imports)
    }

    /// Import specifiers, deduplicated. Virtual ids (`\0` prefix) and
    /// external urls are skipped.
    #[must_use]
    pub fn urls(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.imports
            .iter()
            .map(|site| site.specifier.as_str())
            .filter(|specifier| !specifier.starts_with('\0') && !specifier.contains("://"))
            .filter(|specifier| seen.insert(*specifier))
            .map(str::to_string)
            .collect()
    }
}

/// Parser dialect for a module path.
#[must_use]
pub fn source_type_for(path: &str) -> SourceType {
    match extension_of(path).as_deref() {
        Some("ts" | "mts" | "cts") => SourceType::ts(),
        Some("tsx") => SourceType::tsx(),
        _ => SourceType::jsx(),
    }
}

#[derive(Default)]
struct ImportCollector {
    imports: ModuleImports,
}

impl ImportCollector {
    fn push(&mut self, literal: &StringLiteral<'_>) {
        self.imports.imports.push(ImportSite::from_literal(literal));
    }

    fn record_accept(&mut self, call: &CallExpression<'_>) {
        match call.arguments.first() {
            Some(Argument::StringLiteral(dep)) => {
                self.imports.accepted_deps.push(ImportSite::from_literal(dep));
            }
            Some(Argument::ArrayExpression(deps)) => {
                for element in &deps.elements {
                    if let ArrayExpressionElement::StringLiteral(dep) = element {
                        self.imports.accepted_deps.push(ImportSite::from_literal(dep));
                    }
                }
            }
            _ => self.imports.self_accepting = true,
        }
    }
}

impl<'a> Visit<'a> for ImportCollector {
    fn visit_import_declaration(&mut self, decl: &ImportDeclaration<'a>) {
        if !decl.import_kind.is_type() {
            self.push(&decl.source);
        }
    }

    fn visit_export_named_declaration(&mut self, decl: &ExportNamedDeclaration<'a>) {
        if let Some(source) = &decl.source {
            if !decl.export_kind.is_type() {
                self.push(source);
            }
        }
        walk::walk_export_named_declaration(self, decl);
    }

    fn visit_export_all_declaration(&mut self, decl: &ExportAllDeclaration<'a>) {
        if !decl.export_kind.is_type() {
            self.push(&decl.source);
        }
    }

    fn visit_import_expression(&mut self, expr: &ImportExpression<'a>) {
        if let Expression::StringLiteral(literal) = &expr.source {
            self.push(literal);
        }
        walk::walk_import_expression(self, expr);
    }

    fn visit_call_expression(&mut self, call: &CallExpression<'a>) {
        if is_hot_accept(&call.callee) {
            self.record_accept(call);
        }
        walk::walk_call_expression(self, call);
    }
}

/// `import.meta.hot.accept`, plain or optionally chained.
fn is_hot_accept(callee: &Expression<'_>) -> bool {
    let Expression::StaticMemberExpression(accept) = callee else {
        return false;
    };
    let Expression::StaticMemberExpression(hot) = &accept.object else {
        return false;
    };
    accept.property.name.as_str() == "accept"
        && hot.property.name.as_str() == "hot"
        && matches!(
            &hot.object,
            Expression::MetaProperty(meta)
                if meta.meta.name.as_str() == "import" && meta.property.name.as_str() == "meta"
        )
}

/// Replace each byte range of `code` with its text. Overlapping edits after
/// the first are dropped.
#[must_use]
pub fn replace_spans(code: &str, mut edits: Vec<(Range<usize>, String)>) -> String {
    edits.sort_by_key(|(span, _)| span.start);
    let mut out = String::with_capacity(code.len());
    let mut last = 0;
    for (span, text) in edits {
        if span.start < last || span.end > code.len() {
            continue;
        }
        out.push_str(&code[last..span.start]);
        out.push_str(&text);
        last = span.end;
    }
    out.push_str(&code[last..]);
    out
}

/// Every import specifier in `code`, deduplicated, in source order.
pub fn extract_import_urls(code: &str, path: &str) -> Result<Vec<String>, ParseError> {
    Ok(ModuleImports::parse(code, path)?.urls())
}

/// Whether the module uses the HMR API at all.
#[must_use]
pub fn uses_hot_api(code: &str) -> bool {
    code.contains("import.meta.hot")
}

/// Bare specifier: a package name, not a path or url.
#[must_use]
pub fn is_bare_specifier(specifier: &str) -> bool {
    !specifier.is_empty()
        && !specifier.starts_with('.')
        && !specifier.starts_with('/')
        && !specifier.starts_with('\0')
        && !specifier.contains("://")
        && !specifier.starts_with("data:")
}

/// Package name of a bare specifier (`@scope/pkg/sub` -> `@scope/pkg`).
#[must_use]
pub fn package_name_from_specifier(specifier: &str) -> String {
    let mut parts = specifier.split('/');
    match (parts.next(), parts.next()) {
        (Some(scope), Some(name)) if scope.starts_with('@') => format!("{scope}/{name}"),
        (Some(name), _) => name.to_string(),
        _ => specifier.to_string(),
    }
}
