//! Built-in plugins.
//!
//! Registration order matters: resolution and loading are first-match-wins,
//! so the client runtime and aliases must claim their urls before the file
//! system resolver sees them. Transforms chain in the same order, so
//! TypeScript and JSX are compiled before defines and import analysis read
//! the code.

pub mod alias;
pub mod asset;
pub mod client_inject;
pub mod css;
pub mod define;
pub mod import_analysis;
pub mod json;
pub mod resolve;
pub mod transpile;

pub use alias::AliasPlugin;
pub use asset::AssetPlugin;
pub use client_inject::{ClientInjectPlugin, CLIENT_ID};
pub use css::CssPlugin;
pub use define::DefinePlugin;
pub use import_analysis::ImportAnalysisPlugin;
pub use json::JsonPlugin;
pub use resolve::{file_to_url, url_to_file, ResolvePlugin, FS_PREFIX, RESOLVE_EXTENSIONS};
pub use transpile::TranspilePlugin;

use crate::config::DevConfig;
use crate::dev::plugin::Plugin;

/// The built-in plugins for `config`, in registration order.
pub fn builtin_plugins(config: &DevConfig) -> Vec<Box<dyn Plugin>> {
    let aliases = AliasPlugin::from_map(&config.alias);

    vec![
        Box::new(ClientInjectPlugin::new(config.hmr_port)),
        Box::new(aliases.clone()),
        Box::new(ResolvePlugin::new(&config.root, config.fs_allow.iter().cloned())),
        Box::new(TranspilePlugin),
        Box::new(DefinePlugin::from_map(&config.define)),
        Box::new(ImportAnalysisPlugin::new(aliases)),
        Box::new(CssPlugin),
        Box::new(AssetPlugin),
        Box::new(JsonPlugin),
    ]
}

/// Built-in plugins followed by `user` plugins.
pub fn resolve_plugins(config: &DevConfig, user: Vec<Box<dyn Plugin>>) -> Vec<Box<dyn Plugin>> {
    let mut plugins = builtin_plugins(config);
    plugins.extend(user);
    plugins
}
