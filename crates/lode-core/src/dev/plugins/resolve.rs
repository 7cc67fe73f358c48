//! Url and specifier resolution against the file system.
//!
//! Module ids are absolute, forward-slash file paths. A non-JS id keeps its
//! `?import` flag so that `/logo.png` and `/logo.png?import` stay distinct
//! modules. JS-like and JSON files are loaded here; styles and assets are
//! left to their own plugins.
//!
//! Only files under the project root, or under a directory listed in
//! `fsAllow`, resolve. Anything else (`/@fs/etc/...`, `/../../x.js`) is
//! left unresolved and never read.

use crate::dev::plugin::{HookResult, LoadResult, Plugin, PluginContext, PluginError, ResolveIdResult};
use crate::dev::url::{clean_url, extension_of, is_import_request, is_js_request};
use crate::paths::normalize_path;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Extensions tried for extensionless imports, in priority order.
pub const RESOLVE_EXTENSIONS: &[&str] = &[".tsx", ".ts", ".jsx", ".js", ".mjs"];

/// Url prefix for files outside the project root.
pub const FS_PREFIX: &str = "/@fs/";

/// Extensions the resolver loads from disk itself.
const LOADABLE_EXTENSIONS: &[&str] = &["js", "jsx", "ts", "tsx", "mjs", "json"];

/// Find the file `base` refers to: as-is, with an extension, or as a
/// directory index.
#[must_use]
pub fn find_file(base: &Path) -> Option<PathBuf> {
    if base.is_file() {
        return Some(base.to_path_buf());
    }

    let display = base.display().to_string();
    if let Some(found) = RESOLVE_EXTENSIONS
        .iter()
        .map(|ext| PathBuf::from(format!("{display}{ext}")))
        .find(|candidate| candidate.is_file())
    {
        return Some(found);
    }

    if base.is_dir() {
        return RESOLVE_EXTENSIONS
            .iter()
            .map(|ext| base.join(format!("index{ext}")))
            .find(|candidate| candidate.is_file());
    }
    None
}

/// File path a root-relative url points at (query and hash ignored).
#[must_use]
pub fn url_to_file(root: &Path, url: &str) -> PathBuf {
    let path = clean_url(url);
    match path.strip_prefix(FS_PREFIX) {
        Some(absolute) => PathBuf::from(format!("/{absolute}")),
        None => root.join(path.trim_start_matches('/')),
    }
}

/// Browser url of a file: root-relative inside the root, `/@fs/...` outside.
#[must_use]
pub fn file_to_url(root: &Path, file: &Path) -> String {
    let file = lexical_normalize(file);
    match file.strip_prefix(root) {
        Ok(rel) => format!("/{}", normalize_path(rel)),
        Err(_) => format!("{FS_PREFIX}{}", normalize_path(&file).trim_start_matches('/')),
    }
}

/// Resolve `.` and `..` components without touching the file system.
#[must_use]
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Resolves request urls and relative specifiers to file ids, and loads
/// JS-like and JSON files from disk.
#[derive(Debug, Default, Clone)]
pub struct ResolvePlugin {
    /// Directories outside the root that may be served.
    allow: Vec<PathBuf>,
}

impl ResolvePlugin {
    /// Resolver that also serves files under `allow`. Relative entries are
    /// taken against `root`.
    pub fn new(root: &Path, allow: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            allow: allow
                .into_iter()
                .map(|dir| lexical_normalize(&root.join(dir)))
                .collect(),
        }
    }

    fn is_allowed(&self, file: &Path, root: &Path) -> bool {
        file.starts_with(root) || self.allow.iter().any(|dir| file.starts_with(dir))
    }

    fn base_path(url: &str, importer: Option<&str>, root: &Path) -> Option<PathBuf> {
        let path = clean_url(url);
        if path.starts_with('/') {
            return Some(url_to_file(root, path));
        }
        if path.starts_with("./") || path.starts_with("../") {
            let importer = Path::new(clean_url(importer?));
            return Some(importer.parent()?.join(path));
        }
        None
    }
}

#[async_trait]
impl Plugin for ResolvePlugin {
    fn name(&self) -> &str {
        "lode:resolve"
    }

    async fn resolve_id(
        &self,
        url: &str,
        importer: Option<&str>,
        ctx: &PluginContext,
    ) -> HookResult<Option<ResolveIdResult>> {
        if url.starts_with('\0') {
            return Ok(None);
        }
        let Some(base) = Self::base_path(url, importer, &ctx.root) else {
            return Ok(None);
        };
        let Some(file) = find_file(&lexical_normalize(&base)) else {
            return Ok(None);
        };
        if !self.is_allowed(&file, &ctx.root) {
            warn!(url, file = %file.display(), "refusing to serve file outside the project root");
            return Ok(None);
        }

        let mut id = normalize_path(&file);
        if is_import_request(url) && !is_js_request(&id) {
            id.push_str("?import");
        }
        Ok(Some(ResolveIdResult::resolved(id)))
    }

    async fn load(&self, id: &str, _ctx: &PluginContext) -> HookResult<Option<LoadResult>> {
        if id.starts_with('\0') {
            return Ok(None);
        }
        let path = clean_url(id);
        let loadable = extension_of(path).is_some_and(|ext| LOADABLE_EXTENSIONS.contains(&ext.as_str()));
        if !loadable {
            return Ok(None);
        }

        let code = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PluginError::new(self.name(), "load", format!("{path}: {e}")))?;
        Ok(Some(LoadResult::code(code)))
    }
}
