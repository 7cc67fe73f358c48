//! Plugin container: composes the ordered plugin list into the pipeline
//! operations.
//!
//! - `resolve_id` and `load` are first-match-wins.
//! - `transform` and `transform_index_html` pipe through every plugin.
//!
//! A hook error aborts the whole composite operation.

use crate::dev::graph::ModuleResolver;
use crate::dev::plugin::{
    HookResult, LoadResult, Plugin, PluginContext, PluginError, ResolveIdResult, ServerContext,
    TransformResult,
};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::trace;

/// Ordered plugin list plus the context handed to hooks.
///
/// Order is registration order and is fixed once the container is shared.
pub struct PluginContainer {
    plugins: Vec<Box<dyn Plugin>>,
    ctx: PluginContext,
}

impl PluginContainer {
    /// Create an empty container for the project at `root`.
    pub fn new(root: PathBuf) -> Self {
        Self {
            plugins: Vec::new(),
            ctx: PluginContext::new(root),
        }
    }

    /// Append a plugin.
    pub fn add(&mut self, plugin: Box<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    /// Append several plugins, keeping their order.
    pub fn extend(&mut self, plugins: impl IntoIterator<Item = Box<dyn Plugin>>) {
        self.plugins.extend(plugins);
    }

    /// Get the context (for modification).
    pub fn context_mut(&mut self) -> &mut PluginContext {
        &mut self.ctx
    }

    /// Registered plugin names, in order.
    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Resolve a url through the plugins. First non-`None` result wins.
    pub async fn resolve_id(
        &self,
        url: &str,
        importer: Option<&str>,
    ) -> HookResult<Option<ResolveIdResult>> {
        for plugin in &self.plugins {
            if let Some(result) = plugin.resolve_id(url, importer, &self.ctx).await? {
                trace!(plugin = plugin.name(), url, id = %result.id, "resolved");
                return Ok(Some(result));
            }
        }
        Ok(None)
    }

    /// Load a module through the plugins. First non-`None` result wins.
    pub async fn load(&self, id: &str) -> HookResult<Option<LoadResult>> {
        for plugin in &self.plugins {
            if let Some(result) = plugin.load(id, &self.ctx).await? {
                trace!(plugin = plugin.name(), id, "loaded");
                return Ok(Some(result));
            }
        }
        Ok(None)
    }

    /// Transform code through all plugins.
    ///
    /// Each plugin's output is passed to the next. Annotations (imports,
    /// acceptance) and the source map are carried forward until a later
    /// plugin replaces them.
    pub async fn transform(&self, code: &str, id: &str) -> HookResult<TransformResult> {
        let mut current = TransformResult::code(code);
        for plugin in &self.plugins {
            let Some(result) = plugin.transform(&current.code, id, &self.ctx).await? else {
                continue;
            };
            trace!(plugin = plugin.name(), id, "transformed");
            current.code = result.code;
            if result.map.is_some() {
                current.map = result.map;
            }
            if result.imported_urls.is_some() {
                current.imported_urls = result.imported_urls;
            }
            if result.accepted_urls.is_some() {
                current.accepted_urls = result.accepted_urls;
            }
            if result.self_accepting.is_some() {
                current.self_accepting = result.self_accepting;
            }
        }
        Ok(current)
    }

    /// Call `configure_server` on every plugin, in order.
    pub async fn configure_server(&self, server: &ServerContext) -> HookResult<()> {
        for plugin in &self.plugins {
            plugin.configure_server(server).await?;
        }
        Ok(())
    }

    /// Pipe the root HTML document through every plugin.
    pub async fn transform_index_html(&self, html: &str) -> HookResult<String> {
        let mut current = html.to_string();
        for plugin in &self.plugins {
            if let Some(transformed) = plugin.transform_index_html(&current).await? {
                current = transformed;
            }
        }
        Ok(current)
    }
}

impl Default for PluginContainer {
    fn default() -> Self {
        Self::new(std::env::current_dir().unwrap_or_default())
    }
}

#[async_trait]
impl ModuleResolver for PluginContainer {
    async fn resolve_url(&self, url: &str) -> Result<Option<String>, PluginError> {
        Ok(self.resolve_id(url, None).await?.map(|r| r.id))
    }
}
