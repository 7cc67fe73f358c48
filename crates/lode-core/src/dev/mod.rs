//! Unbundled development server core.
//!
//! Modules are served individually on demand. Each request runs
//! resolve -> load -> transform through the plugin container, and the
//! result is cached on the module graph until a file change invalidates it.
//! The HMR engine walks the graph to decide what the browser re-imports.

pub mod container;
pub mod graph;
pub mod hmr;
pub mod optimizer;
pub mod plugin;
pub mod plugins;
pub mod rewrite;
pub mod transform;
pub mod url;
pub mod ws;

pub use container::PluginContainer;
pub use graph::{GraphError, ModuleGraph, ModuleKey, ModuleNode, ModuleResolver, ModuleState};
pub use hmr::{
    ClientMessage, FileChangeEvent, FileChangeKind, HmrEngine, HmrMessage, HmrUpdate, CLIENT_PUBLIC_PATH,
};
pub use optimizer::{DepOptimizer, OptimizedDeps, ScanOptimizer};
pub use plugin::{
    HookResult, LoadResult, Plugin, PluginContext, PluginError, ResolveIdResult, ServerContext,
    TransformResult,
};
pub use plugins::{builtin_plugins, resolve_plugins};
pub use transform::{ModuleTransformer, TransformError, TransformOutcome};
pub use url::{clean_url, is_transform_request, normalize_url};
pub use ws::{ClientId, WsChannel};
