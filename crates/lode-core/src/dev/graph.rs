//! Module graph: the transform cache and dependency index.
//!
//! Nodes live in one arena owned by the graph and are addressed by a stable
//! [`ModuleKey`]. `importers`/`importees` hold keys, never references, so
//! there are no ownership cycles. Three indices map into the arena:
//!
//! - request url -> key
//! - resolved id -> key
//! - file (id without query) -> keys (one file may back several nodes)
//!
//! All state sits behind one mutex that is never held across an `.await`,
//! so every public operation is atomic and an importer/importee edge pair is
//! never observed half-updated.

use crate::dev::plugin::{PluginError, TransformResult};
use crate::dev::url::clean_url;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Turns a request url into a module id.
///
/// Injected into the graph at construction (the plugin container implements
/// it) so the graph does not depend on the container.
#[async_trait]
pub trait ModuleResolver: Send + Sync {
    async fn resolve_url(&self, url: &str) -> Result<Option<String>, PluginError>;
}

/// Errors from graph operations.
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    /// The resolver failed while creating a node.
    #[error("failed to resolve {url}: {source}")]
    Resolve {
        url: String,
        #[source]
        source: PluginError,
    },

    /// An internal invariant was broken. This is a bug, not a user error.
    #[error("module graph inconsistency at {url}: {detail}")]
    Inconsistent { url: String, detail: String },
}

/// Stable arena index of a module node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleKey(usize);

impl ModuleKey {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// HMR-facing state of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// Has a valid transform result.
    Fresh,
    /// No transform result: never computed, or invalidated and awaiting a
    /// re-request.
    Stale,
    /// Fresh and self-accepting: can hot-swap without touching importers.
    BoundaryAccepted,
}

/// One resolved module.
#[derive(Debug, Clone)]
pub struct ModuleNode {
    /// Request-facing url (may carry `?import`).
    pub url: String,
    /// Resolved identity.
    pub id: String,
    /// `id` without its query: the file on disk backing this node.
    pub file: String,
    /// Modules importing this one.
    pub importers: HashSet<ModuleKey>,
    /// Modules this one imports.
    pub importees: HashSet<ModuleKey>,
    /// Cached pipeline output.
    pub transform_result: Option<Arc<TransformResult>>,
    /// Bumped on every invalidation. Zero until first invalidated.
    pub last_hmr_timestamp: u64,
    /// Whether the module accepts updates to itself.
    pub is_self_accepting: bool,
    /// Dependencies whose updates this module accepts.
    pub accepted_deps: HashSet<ModuleKey>,
}

impl ModuleNode {
    fn new(url: String, id: String) -> Self {
        let file = clean_url(&id).to_string();
        Self {
            url,
            id,
            file,
            importers: HashSet::new(),
            importees: HashSet::new(),
            transform_result: None,
            last_hmr_timestamp: 0,
            is_self_accepting: false,
            accepted_deps: HashSet::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ModuleState {
        match (&self.transform_result, self.is_self_accepting) {
            (None, _) => ModuleState::Stale,
            (Some(_), true) => ModuleState::BoundaryAccepted,
            (Some(_), false) => ModuleState::Fresh,
        }
    }

    /// Whether an update to `dep` stops at this module.
    #[must_use]
    pub fn accepts(&self, dep: ModuleKey) -> bool {
        self.is_self_accepting || self.accepted_deps.contains(&dep)
    }
}

/// Arena and indices. Reached through [`ModuleGraph::transaction`] for
/// multi-step operations that must not interleave with other graph writes.
#[derive(Debug, Default)]
pub struct ModuleTable {
    nodes: Vec<ModuleNode>,
    url_to_module: HashMap<String, ModuleKey>,
    id_to_module: HashMap<String, ModuleKey>,
    file_to_modules: HashMap<String, BTreeSet<ModuleKey>>,
    last_timestamp: u64,
}

impl ModuleTable {
    /// Node for `key`.
    #[must_use]
    pub fn node(&self, key: ModuleKey) -> Option<&ModuleNode> {
        self.nodes.get(key.0)
    }

    #[must_use]
    pub fn key_for_url(&self, url: &str) -> Option<ModuleKey> {
        self.url_to_module.get(url).copied()
    }

    #[must_use]
    pub fn key_for_id(&self, id: &str) -> Option<ModuleKey> {
        self.id_to_module.get(id).copied()
    }

    /// Every node backed by `file`, in creation order.
    #[must_use]
    pub fn modules_by_file(&self, file: &str) -> Vec<ModuleKey> {
        self.file_to_modules
            .get(file)
            .map(|keys| keys.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Clear the cached result and bump the HMR timestamp.
    ///
    /// Does not touch importers; propagation is the HMR controller's call.
    /// Returns the new timestamp.
    pub fn invalidate_module(&mut self, key: ModuleKey) -> u64 {
        let timestamp = self.next_timestamp();
        if let Some(node) = self.nodes.get_mut(key.0) {
            node.transform_result = None;
            node.last_hmr_timestamp = timestamp;
            trace!(url = %node.url, timestamp, "invalidated");
        }
        timestamp
    }

    fn next_timestamp(&mut self) -> u64 {
        self.last_timestamp = now_ms().max(self.last_timestamp + 1);
        self.last_timestamp
    }

    fn insert(&mut self, url: &str, id: String) -> ModuleKey {
        if let Some(key) = self.url_to_module.get(url) {
            return *key;
        }
        // Another url already resolved to this id: share the node.
        if let Some(key) = self.id_to_module.get(&id).copied() {
            self.url_to_module.insert(url.to_string(), key);
            return key;
        }

        let key = ModuleKey(self.nodes.len());
        let node = ModuleNode::new(url.to_string(), id);
        self.url_to_module.insert(url.to_string(), key);
        self.id_to_module.insert(node.id.clone(), key);
        self.file_to_modules
            .entry(node.file.clone())
            .or_default()
            .insert(key);
        self.nodes.push(node);
        key
    }

    /// Replace the importees of `key`, fixing the inverse edges in the same
    /// step. Returns the modules that are no longer imported by `key`.
    fn set_importees(&mut self, key: ModuleKey, importees: HashSet<ModuleKey>) -> Vec<ModuleKey> {
        let old = std::mem::take(&mut self.nodes[key.0].importees);

        let removed: Vec<ModuleKey> = old.difference(&importees).copied().collect();
        for dep in &removed {
            self.nodes[dep.0].importers.remove(&key);
        }
        for dep in importees.difference(&old) {
            self.nodes[dep.0].importers.insert(key);
        }

        self.nodes[key.0].importees = importees;
        removed
    }

    fn check_edges(&self) -> Result<(), GraphError> {
        let inconsistent = |node: &ModuleNode, detail: String| GraphError::Inconsistent {
            url: node.url.clone(),
            detail,
        };

        for (index, node) in self.nodes.iter().enumerate() {
            let key = ModuleKey(index);
            if self.id_to_module.get(&node.id) != Some(&key) {
                return Err(inconsistent(node, "id index does not point back".into()));
            }
            if self.url_to_module.get(&node.url) != Some(&key) {
                return Err(inconsistent(node, "url index does not point back".into()));
            }
            for dep in &node.importees {
                let Some(target) = self.nodes.get(dep.0) else {
                    return Err(inconsistent(node, format!("dangling importee {dep:?}")));
                };
                if !target.importers.contains(&key) {
                    return Err(inconsistent(
                        node,
                        format!("imports {} without back-edge", target.url),
                    ));
                }
            }
            for importer in &node.importers {
                let Some(source) = self.nodes.get(importer.0) else {
                    return Err(inconsistent(node, format!("dangling importer {importer:?}")));
                };
                if !source.importees.contains(&key) {
                    return Err(inconsistent(
                        node,
                        format!("imported by {} without forward edge", source.url),
                    ));
                }
            }
        }

        if let Some((url, key)) = self
            .url_to_module
            .iter()
            .find(|(_, key)| key.0 >= self.nodes.len())
        {
            return Err(GraphError::Inconsistent {
                url: url.clone(),
                detail: format!("url index points at missing node {key:?}"),
            });
        }

        Ok(())
    }
}

/// The module graph.
pub struct ModuleGraph {
    resolver: Arc<dyn ModuleResolver>,
    table: Mutex<ModuleTable>,
}

impl ModuleGraph {
    /// Create an empty graph that resolves new urls through `resolver`.
    pub fn new(resolver: Arc<dyn ModuleResolver>) -> Self {
        Self {
            resolver,
            table: Mutex::new(ModuleTable::default()),
        }
    }

    /// Run `f` with exclusive access to the arena.
    ///
    /// `f` must not block; it runs under the graph lock.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut ModuleTable) -> R) -> R {
        f(&mut self.table.lock())
    }

    /// Snapshot of the node registered for `url`.
    #[must_use]
    pub fn get_module_by_url(&self, url: &str) -> Option<ModuleNode> {
        let table = self.table.lock();
        table.key_for_url(url).and_then(|key| table.node(key).cloned())
    }

    /// Snapshot of the node registered for the resolved `id`.
    #[must_use]
    pub fn get_module_by_id(&self, id: &str) -> Option<ModuleNode> {
        let table = self.table.lock();
        table.key_for_id(id).and_then(|key| table.node(key).cloned())
    }

    /// Snapshot of the node at `key`.
    #[must_use]
    pub fn get(&self, key: ModuleKey) -> Option<ModuleNode> {
        self.table.lock().node(key).cloned()
    }

    #[must_use]
    pub fn key_for_url(&self, url: &str) -> Option<ModuleKey> {
        self.table.lock().key_for_url(url)
    }

    /// Keys of every node backed by `file`.
    #[must_use]
    pub fn get_modules_by_file(&self, file: &str) -> Vec<ModuleKey> {
        self.table.lock().modules_by_file(file)
    }

    /// Cached transform result for `url`, if still valid.
    #[must_use]
    pub fn cached_result(&self, url: &str) -> Option<Arc<TransformResult>> {
        let table = self.table.lock();
        table
            .key_for_url(url)
            .and_then(|key| table.node(key))
            .and_then(|node| node.transform_result.clone())
    }

    /// Get or create the node for `url`.
    ///
    /// Idempotent. The resolver runs without the lock held; the insert
    /// re-checks the indices so concurrent callers converge on one node.
    /// An unresolvable url gets its own url as id.
    pub async fn ensure_entry_from_url(&self, url: &str) -> Result<ModuleKey, GraphError> {
        if let Some(key) = self.key_for_url(url) {
            return Ok(key);
        }

        let id = self
            .resolver
            .resolve_url(url)
            .await
            .map_err(|source| GraphError::Resolve {
                url: url.to_string(),
                source,
            })?
            .unwrap_or_else(|| url.to_string());

        Ok(self.table.lock().insert(url, id))
    }

    /// Clear the cached result of `key` and bump its timestamp.
    pub fn invalidate_module(&self, key: ModuleKey) -> u64 {
        self.table.lock().invalidate_module(key)
    }

    /// Store a transform result unless the node was invalidated since
    /// `expected_timestamp` was read. Returns whether it was stored.
    pub fn set_transform_result(
        &self,
        key: ModuleKey,
        result: Arc<TransformResult>,
        expected_timestamp: u64,
    ) -> bool {
        let mut table = self.table.lock();
        match table.nodes.get_mut(key.0) {
            Some(node) if node.last_hmr_timestamp == expected_timestamp => {
                node.transform_result = Some(result);
                true
            }
            _ => false,
        }
    }

    /// Reconcile the import edges of `key` with `imported_urls`.
    ///
    /// Nodes are created for urls not seen yet. Edges that disappeared from
    /// the source are removed on both sides. Returns the modules that are no
    /// longer imported.
    pub async fn update_module_info(
        &self,
        key: ModuleKey,
        imported_urls: &[String],
    ) -> Result<Vec<ModuleKey>, GraphError> {
        let importees = self.ensure_all(imported_urls).await?;
        Ok(self.table.lock().set_importees(key, importees))
    }

    /// Record the HMR acceptance of `key`.
    ///
    /// `self_accepting: None` keeps the current flag (it may have been set by
    /// the client after the module ran).
    pub async fn update_hmr_acceptance(
        &self,
        key: ModuleKey,
        accepted_urls: &[String],
        self_accepting: Option<bool>,
    ) -> Result<(), GraphError> {
        let accepted = self.ensure_all(accepted_urls).await?;
        let mut table = self.table.lock();
        if let Some(node) = table.nodes.get_mut(key.0) {
            node.accepted_deps = accepted;
            if let Some(flag) = self_accepting {
                node.is_self_accepting = flag;
            }
        }
        Ok(())
    }

    /// Mark the module at `url` as self-accepting (client confirmed
    /// `import.meta.hot.accept()` ran). Returns false for unknown urls.
    pub fn mark_self_accepting(&self, url: &str) -> bool {
        let mut table = self.table.lock();
        let Some(key) = table.key_for_url(url) else {
            return false;
        };
        table.nodes[key.0].is_self_accepting = true;
        true
    }

    /// Number of nodes.
    #[must_use]
    pub fn module_count(&self) -> usize {
        self.table.lock().nodes.len()
    }

    /// Check the index and edge-symmetry invariants.
    pub fn verify_edges(&self) -> Result<(), GraphError> {
        self.table.lock().check_edges()
    }

    async fn ensure_all(&self, urls: &[String]) -> Result<HashSet<ModuleKey>, GraphError> {
        let mut keys = HashSet::with_capacity(urls.len());
        for url in urls {
            keys.insert(self.ensure_entry_from_url(url).await?);
        }
        Ok(keys)
    }
}

impl std::fmt::Debug for ModuleGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleGraph")
            .field("modules", &self.module_count())
            .finish_non_exhaustive()
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
