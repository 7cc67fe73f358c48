//! Dependency optimizer adapter.
//!
//! The server treats dependency optimization as a black box that yields a
//! mapping from bare package names to files on disk. Import analysis
//! rewrites bare specifiers to the browser url of the mapped file.

use crate::dev::rewrite::{extract_import_urls, is_bare_specifier, package_name_from_specifier};
use crate::error::Error;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Extensions tried when following relative imports during the scan.
const SCAN_EXTENSIONS: &[&str] = &["", ".ts", ".tsx", ".js", ".jsx", ".mjs"];

/// Candidates tried for a deep import without an `exports` entry.
const DEEP_IMPORT_SUFFIXES: &[&str] = &["", ".mjs", ".js", "/index.mjs", "/index.js"];

/// `exports` conditions honored for browser ESM, in priority order.
const EXPORT_CONDITIONS: &[&str] = &["browser", "import", "module", "default"];

/// Package name -> optimized file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizedDeps {
    root: PathBuf,
    deps: BTreeMap<String, PathBuf>,
}

impl OptimizedDeps {
    /// Empty mapping for the project at `root`.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            deps: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, package: impl Into<String>, file: PathBuf) {
        self.deps.insert(package.into(), file);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.deps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    /// Browser url for a bare specifier.
    ///
    /// The package root maps to its optimized file. A deep import
    /// (`pkg/sub`) maps to the file the package's `exports` names for
    /// `./sub`, or else to the first existing `sub`, `sub.mjs`, `sub.js` or
    /// `sub/index.*`. Unknown packages and unresolvable subpaths yield
    /// `None`.
    #[must_use]
    pub fn url_for(&self, specifier: &str) -> Option<String> {
        if !is_bare_specifier(specifier) {
            return None;
        }
        let package = package_name_from_specifier(specifier);
        let entry = self.deps.get(&package)?;

        let Some(subpath) = specifier.strip_prefix(&package).and_then(|rest| rest.strip_prefix('/')) else {
            return Some(self.to_url(entry));
        };
        let dir = self.package_dir(&package, entry);
        let file = resolve_deep_import(&dir, subpath)?;
        Some(self.to_url(&file))
    }

    /// Installed directory of `package`, found above its optimized file.
    fn package_dir(&self, package: &str, entry: &Path) -> PathBuf {
        let suffix = Path::new("node_modules").join(package);
        entry
            .ancestors()
            .find(|dir| dir.ends_with(&suffix))
            .map_or_else(|| self.root.join(&suffix), Path::to_path_buf)
    }

    fn to_url(&self, file: &Path) -> String {
        match file.strip_prefix(&self.root) {
            Ok(rel) => {
                let rel = rel.to_string_lossy().replace('\\', "/");
                format!("/{rel}")
            }
            Err(_) => format!("/@fs{}", file.display()),
        }
    }
}

/// File a deep import names inside `package_dir`.
fn resolve_deep_import(package_dir: &Path, subpath: &str) -> Option<PathBuf> {
    let manifest = std::fs::read_to_string(package_dir.join("package.json"))
        .ok()
        .and_then(|source| serde_json::from_str::<serde_json::Value>(&source).ok());
    let exported = manifest.as_ref().and_then(|manifest| {
        let target = manifest.get("exports")?.get(format!("./{subpath}").as_str())?;
        export_target(target)
    });
    if let Some(target) = exported {
        let file = package_dir.join(target.trim_start_matches("./"));
        return file.is_file().then_some(file);
    }

    DEEP_IMPORT_SUFFIXES
        .iter()
        .map(|suffix| package_dir.join(format!("{subpath}{suffix}")))
        .find(|candidate| candidate.is_file())
}

/// Target of one `exports` entry: a path, or the first matching condition.
fn export_target(entry: &serde_json::Value) -> Option<&str> {
    match entry {
        serde_json::Value::String(target) => Some(target.as_str()),
        serde_json::Value::Object(conditions) => EXPORT_CONDITIONS
            .iter()
            .find_map(|condition| conditions.get(*condition))
            .and_then(export_target),
        _ => None,
    }
}

/// Produces the dependency mapping for a project.
pub trait DepOptimizer: Send + Sync {
    fn optimize(&self, root: &Path, entries: &[PathBuf]) -> Result<OptimizedDeps, Error>;
}

/// Scans the entry graph for bare imports and maps every package found to
/// the entry file named by its `package.json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScanOptimizer;

impl ScanOptimizer {
    /// Bare packages reachable from `entry` through relative imports.
    #[must_use]
    pub fn scan(entry: &Path) -> HashSet<String> {
        let mut packages = HashSet::new();
        let mut visited = HashSet::new();
        let mut queue = vec![entry.to_path_buf()];

        while let Some(path) = queue.pop() {
            if !visited.insert(path.clone()) {
                continue;
            }
            let Ok(source) = std::fs::read_to_string(&path) else {
                continue;
            };
            let specifiers = match extract_import_urls(&source, &path.to_string_lossy()) {
                Ok(specifiers) => specifiers,
                Err(e) => {
                    warn!(error = %e, "skipping module in dependency scan");
                    continue;
                }
            };
            packages.extend(
                specifiers
                    .iter()
                    .filter(|specifier| is_bare_specifier(specifier))
                    .map(|specifier| package_name_from_specifier(specifier)),
            );

            let Some(dir) = path.parent() else { continue };
            for specifier in specifiers {
                if !(specifier.starts_with("./") || specifier.starts_with("../")) {
                    continue;
                }
                let base = dir.join(&specifier);
                if let Some(found) = SCAN_EXTENSIONS
                    .iter()
                    .map(|ext| PathBuf::from(format!("{}{ext}", base.display())))
                    .find(|candidate| candidate.is_file())
                {
                    queue.push(found);
                }
            }
        }

        packages
    }

    /// Entry file of an installed package.
    fn package_entry(root: &Path, package: &str) -> Option<PathBuf> {
        let dir = root.join("node_modules").join(package);
        let manifest = std::fs::read_to_string(dir.join("package.json")).ok()?;
        let manifest: serde_json::Value = serde_json::from_str(&manifest).ok()?;

        let field = ["module", "main"]
            .iter()
            .find_map(|key| manifest.get(*key).and_then(serde_json::Value::as_str))
            .unwrap_or("index.js");
        let entry = dir.join(field.trim_start_matches("./"));
        entry.is_file().then_some(entry)
    }
}

impl DepOptimizer for ScanOptimizer {
    fn optimize(&self, root: &Path, entries: &[PathBuf]) -> Result<OptimizedDeps, Error> {
        let mut deps = OptimizedDeps::new(root.to_path_buf());

        let mut packages: Vec<String> = entries
            .iter()
            .flat_map(|entry| Self::scan(entry))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        packages.sort();

        for package in packages {
            match Self::package_entry(root, &package) {
                Some(file) => {
                    debug!(package = %package, file = %file.display(), "optimized dependency");
                    deps.insert(package, file);
                }
                None => warn!(package = %package, "dependency not found in node_modules"),
            }
        }

        Ok(deps)
    }
}
