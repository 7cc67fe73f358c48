//! Import analysis: rewrites specifiers into browser urls and records what a
//! module imports and which HMR updates it accepts.
//!
//! - bare `react` -> optimized dependency url
//! - relative `./App` -> root-relative `/src/App.tsx`
//! - styles, assets and JSON -> `...?import`
//! - modules already updated by HMR get `?t=<timestamp>` so the browser
//!   fetches the new version

use super::alias::AliasPlugin;
use super::resolve::{file_to_url, lexical_normalize, find_file, url_to_file, FS_PREFIX};
use crate::dev::hmr::HmrEngine;
use crate::dev::plugin::{HookResult, Plugin, PluginContext, PluginError, ServerContext, TransformResult};
use crate::dev::rewrite::{is_bare_specifier, replace_spans, uses_hot_api, ModuleImports};
use crate::dev::url::{clean_url, is_js_request};
use async_trait::async_trait;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

pub struct ImportAnalysisPlugin {
    aliases: AliasPlugin,
    server: OnceLock<ServerContext>,
}

impl ImportAnalysisPlugin {
    pub fn new(aliases: AliasPlugin) -> Self {
        Self {
            aliases,
            server: OnceLock::new(),
        }
    }

    /// Normalized url for `specifier` imported from `importer`, or `None`
    /// to leave the specifier untouched.
    fn resolve_import(&self, specifier: &str, importer: &Path, root: &Path) -> Option<String> {
        if specifier.starts_with('\0') || specifier.contains("://") || specifier.starts_with("data:") {
            return None;
        }
        // Server-internal urls (`/@lode/client`) are served as-is.
        if specifier.starts_with("/@") && !specifier.starts_with(FS_PREFIX) {
            return None;
        }

        let specifier = match self.aliases.apply(specifier) {
            Some(target) => match target.strip_prefix("./") {
                Some(rest) => format!("/{rest}"),
                None => target,
            },
            None => specifier.to_string(),
        };

        if is_bare_specifier(&specifier) {
            let url = self.server.get().and_then(|server| server.deps.url_for(&specifier));
            if url.is_none() {
                debug!(specifier = %specifier, importer = %importer.display(), "bare import not optimized");
            }
            return url;
        }

        let base = if specifier.starts_with('/') {
            url_to_file(root, &specifier)
        } else {
            importer.parent()?.join(clean_url(&specifier))
        };
        let base = lexical_normalize(&base);
        let file = find_file(&base).unwrap_or(base);

        let mut url = file_to_url(root, &file);
        if !is_js_request(&url) {
            url.push_str("?import");
        }
        Some(url)
    }

    /// `url` with the cache-busting timestamp of its last HMR invalidation.
    fn served_url(&self, url: &str) -> String {
        let timestamp = self.server.get().and_then(|server| {
            server.module_graph.transaction(|table| {
                table
                    .key_for_url(url)
                    .and_then(|key| table.node(key))
                    .map(|node| node.last_hmr_timestamp)
            })
        });
        match timestamp {
            Some(t) if t > 0 => {
                let sep = if url.contains('?') { '&' } else { '?' };
                format!("{url}{sep}t={t}")
            }
            _ => url.to_string(),
        }
    }
}

#[async_trait]
impl Plugin for ImportAnalysisPlugin {
    fn name(&self) -> &str {
        "lode:import-analysis"
    }

    async fn configure_server(&self, server: &ServerContext) -> HookResult<()> {
        let _ = self.server.set(server.clone());
        Ok(())
    }

    async fn transform(
        &self,
        code: &str,
        id: &str,
        ctx: &PluginContext,
    ) -> HookResult<Option<TransformResult>> {
        if id.starts_with('\0') || !is_js_request(clean_url(id)) {
            return Ok(None);
        }

        let root = self
            .server
            .get()
            .map_or(ctx.root.as_path(), |server| server.root.as_path());
        let importer = Path::new(clean_url(id));

        let scanned = ModuleImports::parse(code, id)
            .map_err(|e| PluginError::new(self.name(), "transform", e.to_string()))?;

        let mut edits = Vec::new();
        let mut imported: Vec<String> = Vec::new();
        for site in scanned.imports {
            let Some(url) = self.resolve_import(&site.specifier, importer, root) else {
                continue;
            };
            edits.push((site.span, self.served_url(&url)));
            if !imported.contains(&url) {
                imported.push(url);
            }
        }

        // `hot.accept('dep')` arguments point at the same urls the imports
        // use, so the client can match incoming updates against them.
        let mut accepted: Vec<String> = Vec::new();
        for site in scanned.accepted_deps {
            let Some(url) = self.resolve_import(&site.specifier, importer, root) else {
                continue;
            };
            edits.push((site.span, url.clone()));
            if !accepted.contains(&url) {
                accepted.push(url);
            }
        }
        let rewritten = replace_spans(code, edits);

        let code = if uses_hot_api(&rewritten) {
            let owner = file_to_url(root, importer);
            format!("{}{rewritten}", HmrEngine::module_preamble(&owner))
        } else {
            rewritten
        };

        Ok(Some(TransformResult {
            code,
            map: None,
            imported_urls: Some(imported),
            accepted_urls: Some(accepted),
            self_accepting: Some(scanned.self_accepting),
        }))
    }
}

impl std::fmt::Debug for ImportAnalysisPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportAnalysisPlugin")
            .field("aliases", &self.aliases)
            .field("configured", &self.server.get().is_some())
            .finish()
    }
}
