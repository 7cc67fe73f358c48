//! Plugin interface for the dev server pipeline.
//!
//! A plugin is a named set of optional hooks. The container composes the
//! ordered plugin list into resolve, load and transform operations.
//!
//! ## Example
//!
//! ```ignore
//! use async_trait::async_trait;
//! use lode_core::dev::{HookResult, Plugin, PluginContext, TransformResult};
//!
//! struct TxtPlugin;
//!
//! #[async_trait]
//! impl Plugin for TxtPlugin {
//!     fn name(&self) -> &str { "txt" }
//!
//!     async fn transform(&self, code: &str, id: &str, _ctx: &PluginContext) -> HookResult<Option<TransformResult>> {
//!         if id.ends_with(".txt") {
//!             return Ok(Some(TransformResult::code(format!("export default {code:?};"))));
//!         }
//!         Ok(None)
//!     }
//! }
//! ```

use crate::config::DevConfig;
use crate::dev::graph::ModuleGraph;
use crate::dev::optimizer::OptimizedDeps;
use crate::dev::ws::WsChannel;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Result type for plugin hooks.
pub type HookResult<T> = Result<T, PluginError>;

/// Source map payload (JSON text).
pub type SourceMap = String;

/// Error raised by a plugin hook.
#[derive(Debug, Clone, Error)]
#[error("[{plugin}] {hook}: {message}")]
pub struct PluginError {
    /// Plugin name that caused the error.
    pub plugin: String,
    /// Hook that failed.
    pub hook: &'static str,
    /// Error message.
    pub message: String,
}

impl PluginError {
    pub fn new(plugin: impl Into<String>, hook: &'static str, message: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            hook,
            message: message.into(),
        }
    }
}

/// Context passed to every resolve/load/transform hook.
#[derive(Debug, Clone, Default)]
pub struct PluginContext {
    /// Project root.
    pub root: PathBuf,
    /// Serving mode (always "development" for the dev server).
    pub mode: String,
    /// Free-form metadata for inter-plugin communication.
    meta: HashMap<String, String>,
}

impl PluginContext {
    /// Create a new plugin context.
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            mode: "development".to_string(),
            meta: HashMap::new(),
        }
    }

    /// Set a metadata value.
    pub fn set_meta(&mut self, key: &str, value: String) {
        self.meta.insert(key.to_string(), value);
    }

    /// Get a metadata value.
    pub fn get_meta(&self, key: &str) -> Option<&String> {
        self.meta.get(key)
    }
}

/// Result of the `resolve_id` hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveIdResult {
    /// Resolved module id (usually an absolute file path).
    pub id: String,
}

impl ResolveIdResult {
    pub fn resolved(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Result of the `load` hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadResult {
    /// Module source code.
    pub code: String,
    /// Optional source map.
    pub map: Option<SourceMap>,
}

impl LoadResult {
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            map: None,
        }
    }
}

impl From<String> for LoadResult {
    fn from(code: String) -> Self {
        Self::code(code)
    }
}

impl From<&str> for LoadResult {
    fn from(code: &str) -> Self {
        Self::code(code)
    }
}

/// Result of the `transform` hook, and of the whole transform pipeline.
///
/// Besides code and map, a plugin that analyses imports may annotate the
/// result with the urls the module imports and its HMR acceptance. The
/// pipeline uses these to keep the module graph in sync with the source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformResult {
    /// Transformed code.
    pub code: String,
    /// Optional source map.
    pub map: Option<SourceMap>,
    /// Normalized urls of every module this one imports.
    pub imported_urls: Option<Vec<String>>,
    /// Urls of dependencies this module accepts hot updates for.
    pub accepted_urls: Option<Vec<String>>,
    /// Whether the module calls `import.meta.hot.accept()` on itself.
    pub self_accepting: Option<bool>,
}

impl TransformResult {
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Default::default()
        }
    }
}

/// Shared server state handed to `configure_server`.
///
/// Built once at startup. Plugins that need to call back into the graph or
/// the HMR channel later keep a clone.
#[derive(Clone)]
pub struct ServerContext {
    /// Project root.
    pub root: PathBuf,
    /// Resolved configuration.
    pub config: Arc<DevConfig>,
    /// The module graph.
    pub module_graph: Arc<ModuleGraph>,
    /// HMR WebSocket channel.
    pub ws: Arc<WsChannel>,
    /// Pre-bundled dependency mapping.
    pub deps: Arc<OptimizedDeps>,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("root", &self.root)
            .field("modules", &self.module_graph.module_count())
            .field("clients", &self.ws.client_count())
            .finish_non_exhaustive()
    }
}

/// A dev server plugin.
///
/// All hooks have default implementations that do nothing, so a plugin only
/// implements the hooks it cares about.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Plugin name for debugging and error messages.
    fn name(&self) -> &str;

    /// Resolve a url or import specifier to a module id.
    ///
    /// Return `Some` to claim the resolution; the first plugin to do so wins.
    async fn resolve_id(
        &self,
        _url: &str,
        _importer: Option<&str>,
        _ctx: &PluginContext,
    ) -> HookResult<Option<ResolveIdResult>> {
        Ok(None)
    }

    /// Load a module's source by id. First `Some` wins.
    async fn load(&self, _id: &str, _ctx: &PluginContext) -> HookResult<Option<LoadResult>> {
        Ok(None)
    }

    /// Transform module code.
    ///
    /// Every plugin runs in order; `None` passes the code through unchanged.
    async fn transform(
        &self,
        _code: &str,
        _id: &str,
        _ctx: &PluginContext,
    ) -> HookResult<Option<TransformResult>> {
        Ok(None)
    }

    /// Called once at server start, before the listener accepts connections.
    async fn configure_server(&self, _server: &ServerContext) -> HookResult<()> {
        Ok(())
    }

    /// Transform the root HTML document. Chained like `transform`.
    async fn transform_index_html(&self, _html: &str) -> HookResult<Option<String>> {
        Ok(None)
    }
}
