//! Dev server configuration.
//!
//! Loaded from `lode.config.json` in the project root (or an explicit path)
//! and overridden by CLI flags. The core only ever sees the resolved
//! [`DevConfig`] value.
//!
//! ```json
//! {
//!   "port": 3000,
//!   "hmrPort": 24678,
//!   "define": { "__DEV__": "true" },
//!   "alias": { "@": "/src" },
//!   "fsAllow": ["../shared"]
//! }
//! ```

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Config file names in priority order.
const CONFIG_FILES: &[&str] = &["lode.config.json", ".lode.json"];

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HMR_PORT: u16 = 24678;
pub const DEFAULT_HOST: &str = "localhost";

/// Resolved dev server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DevConfig {
    /// Project root. Module urls are resolved relative to it.
    pub root: PathBuf,
    /// HTTP port.
    pub port: u16,
    /// Host to bind to.
    pub host: String,
    /// Port of the dedicated HMR WebSocket listener.
    pub hmr_port: u16,
    /// Base public path.
    pub base: String,
    /// Open the browser after start.
    pub open: bool,
    /// Explicit entry module (otherwise `main.*` / `src/main.*` is used).
    pub entry: Option<PathBuf>,
    /// Global identifier replacements applied to every JS module.
    pub define: BTreeMap<String, String>,
    /// Import aliases (e.g. `@` -> `/src`).
    pub alias: BTreeMap<String, String>,
    /// Directories outside the root that may be served through `/@fs/`.
    pub fs_allow: Vec<PathBuf>,
}

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            port: DEFAULT_PORT,
            host: DEFAULT_HOST.to_string(),
            hmr_port: DEFAULT_HMR_PORT,
            base: "/".to_string(),
            open: false,
            entry: None,
            define: BTreeMap::new(),
            alias: BTreeMap::new(),
            fs_allow: Vec::new(),
        }
    }
}

impl DevConfig {
    /// Create a config rooted at `root`.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            ..Default::default()
        }
    }

    /// Set the HTTP port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the HMR WebSocket port.
    #[must_use]
    pub fn with_hmr_port(mut self, port: u16) -> Self {
        self.hmr_port = port;
        self
    }

    /// Set the bind host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Absolute entry module path, if one was configured.
    #[must_use]
    pub fn entry_path(&self) -> Option<PathBuf> {
        self.entry.as_ref().map(|entry| {
            if entry.is_absolute() {
                entry.clone()
            } else {
                self.root.join(entry)
            }
        })
    }
}

/// Find a config file in the given root directory.
#[must_use]
pub fn find_config_file(root: &Path) -> Option<PathBuf> {
    CONFIG_FILES
        .iter()
        .map(|name| root.join(name))
        .find(|path| path.is_file())
}

/// Load configuration for `root`.
///
/// If `config_path` is `Some`, that file must exist. Otherwise the root is
/// searched for a config file and defaults are returned when none is found.
/// The returned config always has `root` set to `root`.
pub fn load_config(root: &Path, config_path: Option<&Path>) -> Result<(Option<PathBuf>, DevConfig), Error> {
    let path = match config_path {
        Some(p) => {
            let abs = if p.is_absolute() { p.to_path_buf() } else { root.join(p) };
            if !abs.exists() {
                return Err(Error::ConfigNotFound { path: abs });
            }
            abs
        }
        None => match find_config_file(root) {
            Some(p) => p,
            None => return Ok((None, DevConfig::new(root.to_path_buf()))),
        },
    };

    let source = std::fs::read_to_string(&path).map_err(|source| Error::ConfigRead {
        path: path.clone(),
        source,
    })?;

    let mut config: DevConfig =
        serde_json::from_str(&source).map_err(|source| Error::ConfigParse {
            path: path.clone(),
            source,
        })?;
    config.root = root.to_path_buf();

    Ok((Some(path), config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_without_config_file() {
        let dir = tempdir().unwrap();
        let (path, config) = load_config(dir.path(), None).unwrap();
        assert!(path.is_none());
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.hmr_port, DEFAULT_HMR_PORT);
        assert_eq!(config.root, dir.path());
    }

    #[test]
    fn test_load_partial_config() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("lode.config.json"),
            r#"{ "port": 4000, "define": { "__DEV__": "true" }, "alias": { "@": "/src" }, "fsAllow": ["../shared"] }"#,
        )
        .unwrap();

        let (path, config) = load_config(dir.path(), None).unwrap();
        assert_eq!(path, Some(dir.path().join("lode.config.json")));
        assert_eq!(config.port, 4000);
        assert_eq!(config.hmr_port, DEFAULT_HMR_PORT);
        assert_eq!(config.define.get("__DEV__").map(String::as_str), Some("true"));
        assert_eq!(config.alias.get("@").map(String::as_str), Some("/src"));
        assert_eq!(config.fs_allow, vec![PathBuf::from("../shared")]);
    }

    #[test]
    fn test_invalid_config_is_parse_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("lode.config.json"), "{ port: ").unwrap();
        let err = load_config(dir.path(), None).unwrap_err();
        assert!(matches!(err, Error::ConfigParse { .. }));
    }

    #[test]
    fn test_explicit_missing_config() {
        let dir = tempdir().unwrap();
        let err = load_config(dir.path(), Some(Path::new("nope.json"))).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound { .. }));
    }

    #[test]
    fn test_entry_path_relative_to_root() {
        let mut config = DevConfig::new(PathBuf::from("/project"));
        config.entry = Some(PathBuf::from("src/main.ts"));
        assert_eq!(config.entry_path(), Some(PathBuf::from("/project/src/main.ts")));
    }
}
