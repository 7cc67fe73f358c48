//! Per-request transform pipeline.
//!
//! `normalize -> cache -> resolve -> graph entry -> load -> transform ->
//! store + graph edges`. Results are cached on the module graph and shared
//! as `Arc`s; concurrent requests for one url await a single computation.

use crate::dev::container::PluginContainer;
use crate::dev::graph::{GraphError, ModuleGraph};
use crate::dev::plugin::{PluginError, TransformResult};
use crate::dev::url::normalize_url;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Pipeline failure. Nothing is cached when one is returned.
#[derive(Debug, Clone, Error)]
pub enum TransformError {
    #[error("failed to resolve {url}: {source}")]
    Resolve {
        url: String,
        #[source]
        source: PluginError,
    },

    #[error("failed to load {id}: {source}")]
    Load {
        id: String,
        #[source]
        source: PluginError,
    },

    #[error("failed to transform {id}: {source}")]
    Transform {
        id: String,
        #[source]
        source: PluginError,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("transform of {url} was aborted")]
    Aborted { url: String },
}

/// Outcome of one pipeline run. `Ok(None)`: nothing to serve (unresolved or
/// no loader claimed the id); the caller falls through to static serving.
pub type TransformOutcome = Result<Option<Arc<TransformResult>>, TransformError>;

type PendingTransform = Shared<BoxFuture<'static, TransformOutcome>>;

/// Runs the transform pipeline against a plugin container and module graph.
pub struct ModuleTransformer {
    container: Arc<PluginContainer>,
    graph: Arc<ModuleGraph>,
    /// Normalized url -> in-flight computation.
    pending: Arc<Mutex<HashMap<String, PendingTransform>>>,
}

impl ModuleTransformer {
    pub fn new(container: Arc<PluginContainer>, graph: Arc<ModuleGraph>) -> Self {
        Self {
            container,
            graph,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn graph(&self) -> &Arc<ModuleGraph> {
        &self.graph
    }

    #[must_use]
    pub fn container(&self) -> &Arc<PluginContainer> {
        &self.container
    }

    /// Number of computations currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    /// Transform the module at `url`.
    ///
    /// A cached result is returned as the same `Arc`. Otherwise the
    /// computation is spawned onto the runtime, so it completes (and its
    /// graph writes land) even if every requester goes away.
    pub async fn transform_request(&self, url: &str) -> TransformOutcome {
        let url = normalize_url(url);

        if let Some(cached) = self.graph.cached_result(&url) {
            debug!(url = %url, "transform cache hit");
            return Ok(Some(cached));
        }

        let pending = {
            let mut pending = self.pending.lock();
            if let Some(shared) = pending.get(&url) {
                shared.clone()
            } else {
                // A computation may have finished between the cache check
                // and taking the lock.
                if let Some(cached) = self.graph.cached_result(&url) {
                    return Ok(Some(cached));
                }
                let shared = self.spawn_transform(url.clone());
                pending.insert(url.clone(), shared.clone());
                shared
            }
        };

        pending.await
    }

    fn spawn_transform(&self, url: String) -> PendingTransform {
        let container = Arc::clone(&self.container);
        let graph = Arc::clone(&self.graph);
        let pending = Arc::clone(&self.pending);

        let task_url = url.clone();
        let handle = tokio::spawn(async move {
            let outcome = run_pipeline(&container, &graph, &task_url).await;
            pending.lock().remove(&task_url);
            outcome
        });

        async move {
            handle
                .await
                .unwrap_or_else(|_| Err(TransformError::Aborted { url }))
        }
        .boxed()
        .shared()
    }
}

impl std::fmt::Debug for ModuleTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleTransformer")
            .field("graph", &self.graph)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

async fn run_pipeline(container: &PluginContainer, graph: &ModuleGraph, url: &str) -> TransformOutcome {
    let resolved = container
        .resolve_id(url, None)
        .await
        .map_err(|source| TransformError::Resolve {
            url: url.to_string(),
            source,
        })?;
    let Some(resolved) = resolved else {
        debug!(url, "unresolved");
        return Ok(None);
    };
    let id = resolved.id;

    // The node and its epoch exist before the load, so a file change landing
    // while the source is read is seen by the staleness check below.
    let key = graph.ensure_entry_from_url(url).await?;
    let epoch = graph.get(key).map_or(0, |node| node.last_hmr_timestamp);

    let loaded = container
        .load(&id)
        .await
        .map_err(|source| TransformError::Load {
            id: id.clone(),
            source,
        })?;
    let Some(loaded) = loaded else {
        debug!(url, id = %id, "no loader");
        return Ok(None);
    };

    let mut result = container
        .transform(&loaded.code, &id)
        .await
        .map_err(|source| TransformError::Transform {
            id: id.clone(),
            source,
        })?;
    if result.map.is_none() {
        result.map = loaded.map;
    }

    if let Some(imported) = &result.imported_urls {
        graph.update_module_info(key, imported).await?;
    }
    let accepted = result.accepted_urls.clone().unwrap_or_default();
    graph
        .update_hmr_acceptance(key, &accepted, result.self_accepting)
        .await?;

    let result = Arc::new(result);
    if graph.set_transform_result(key, Arc::clone(&result), epoch) {
        debug!(url, id = %id, "transformed");
    } else {
        debug!(url, id = %id, "invalidated while transforming, not cached");
    }
    Ok(Some(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::graph::ModuleResolver;
    use crate::dev::plugin::{HookResult, LoadResult, Plugin, PluginContext, ResolveIdResult};
    use crate::dev::rewrite::extract_import_urls;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// In-memory project: url `/x` resolves to id `/project/x` when `x` is a
    /// known file. Loads are counted and optionally slowed down.
    struct MemoryFs {
        files: HashMap<&'static str, &'static str>,
        loads: Arc<AtomicUsize>,
        delay: Duration,
        fail_transform: bool,
    }

    #[async_trait]
    impl Plugin for MemoryFs {
        fn name(&self) -> &str {
            "memory-fs"
        }

        async fn resolve_id(
            &self,
            url: &str,
            _importer: Option<&str>,
            _ctx: &PluginContext,
        ) -> HookResult<Option<ResolveIdResult>> {
            Ok(self
                .files
                .contains_key(url)
                .then(|| ResolveIdResult::resolved(format!("/project{url}"))))
        }

        async fn load(&self, id: &str, _ctx: &PluginContext) -> HookResult<Option<LoadResult>> {
            let Some(url) = id.strip_prefix("/project") else {
                return Ok(None);
            };
            if url == "/no-loader.js" {
                return Ok(None);
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.files.get(url).map(|code| LoadResult::from(*code)))
        }

        async fn transform(
            &self,
            code: &str,
            id: &str,
            _ctx: &PluginContext,
        ) -> HookResult<Option<TransformResult>> {
            if self.fail_transform {
                return Err(PluginError::new("memory-fs", "transform", "syntax error"));
            }
            let mut result = TransformResult::code(code);
            result.imported_urls = Some(
                extract_import_urls(code, id)
                    .map_err(|e| PluginError::new("memory-fs", "transform", e.to_string()))?,
            );
            Ok(Some(result))
        }
    }

    struct Fixture {
        transformer: Arc<ModuleTransformer>,
        loads: Arc<AtomicUsize>,
    }

    fn fixture(delay: Duration, fail_transform: bool) -> Fixture {
        let loads = Arc::new(AtomicUsize::new(0));
        let files = HashMap::from([
            ("/main.js", "import { a } from '/a.js';\nconsole.log(a);"),
            ("/a.js", "export const a = 1;"),
            ("/logo.png?import", "export default '/logo.png';"),
            ("/no-loader.js", ""),
        ]);
        let mut container = PluginContainer::default();
        container.add(Box::new(MemoryFs {
            files,
            loads: Arc::clone(&loads),
            delay,
            fail_transform,
        }));
        let container = Arc::new(container);
        let graph = Arc::new(ModuleGraph::new(
            Arc::clone(&container) as Arc<dyn ModuleResolver>
        ));
        Fixture {
            transformer: Arc::new(ModuleTransformer::new(container, graph)),
            loads,
        }
    }

    #[tokio::test]
    async fn test_cached_result_is_same_arc() {
        let fx = fixture(Duration::ZERO, false);
        let first = fx.transformer.transform_request("/a.js").await.unwrap().unwrap();
        let second = fx.transformer.transform_request("/a.js").await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fx.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_query_and_hash_share_cache_entry() {
        let fx = fixture(Duration::ZERO, false);
        let plain = fx.transformer.transform_request("/a.js").await.unwrap().unwrap();
        let busted = fx
            .transformer
            .transform_request("/a.js?t=123#x")
            .await
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&plain, &busted));
        assert_eq!(fx.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_import_flag_is_a_distinct_module() {
        let fx = fixture(Duration::ZERO, false);
        let asset = fx
            .transformer
            .transform_request("/logo.png?t=9&import")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(asset.code, "export default '/logo.png';");
        assert!(fx.transformer.graph().get_module_by_url("/logo.png?import").is_some());
    }

    #[tokio::test]
    async fn test_concurrent_requests_collapse() {
        let fx = fixture(Duration::from_millis(50), false);
        let requests: Vec<_> = (0..8)
            .map(|_| {
                let transformer = Arc::clone(&fx.transformer);
                tokio::spawn(async move { transformer.transform_request("/a.js").await })
            })
            .collect();

        let mut results = Vec::new();
        for request in requests {
            results.push(request.await.unwrap().unwrap().unwrap());
        }
        assert_eq!(fx.loads.load(Ordering::SeqCst), 1);
        assert!(results.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(fx.transformer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unresolved_and_unloaded_are_none() {
        let fx = fixture(Duration::ZERO, false);
        assert!(fx.transformer.transform_request("/nope.js").await.unwrap().is_none());
        assert!(fx.transformer.transform_request("/no-loader.js").await.unwrap().is_none());
        assert!(fx.transformer.graph().get_module_by_url("/nope.js").is_none());
    }

    #[tokio::test]
    async fn test_transform_records_imports() {
        let fx = fixture(Duration::ZERO, false);
        fx.transformer.transform_request("/main.js").await.unwrap();

        let graph = fx.transformer.graph();
        let main = graph.key_for_url("/main.js").unwrap();
        let a = graph.get_module_by_url("/a.js").unwrap();
        assert!(a.importers.contains(&main));
        // placeholder: known to the graph, not transformed yet
        assert!(a.transform_result.is_none());
        graph.verify_edges().unwrap();
    }

    #[tokio::test]
    async fn test_error_is_not_cached() {
        let fx = fixture(Duration::ZERO, true);
        let err = fx.transformer.transform_request("/a.js").await.unwrap_err();
        assert!(matches!(err, TransformError::Transform { ref id, .. } if id == "/project/a.js"));
        assert!(err.to_string().contains("syntax error"));

        assert!(fx.transformer.graph().cached_result("/a.js").is_none());
        fx.transformer.transform_request("/a.js").await.unwrap_err();
        assert_eq!(fx.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidated_module_is_recomputed() {
        let fx = fixture(Duration::ZERO, false);
        let first = fx.transformer.transform_request("/a.js").await.unwrap().unwrap();

        let graph = fx.transformer.graph();
        graph.invalidate_module(graph.key_for_url("/a.js").unwrap());

        let second = fx.transformer.transform_request("/a.js").await.unwrap().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(fx.loads.load(Ordering::SeqCst), 2);
    }

    /// Serves one module whose source can be swapped while a load sleeps.
    struct EditableFs {
        source: Arc<Mutex<&'static str>>,
        delay: Duration,
    }

    #[async_trait]
    impl Plugin for EditableFs {
        fn name(&self) -> &str {
            "editable-fs"
        }

        async fn resolve_id(
            &self,
            url: &str,
            _importer: Option<&str>,
            _ctx: &PluginContext,
        ) -> HookResult<Option<ResolveIdResult>> {
            Ok((url == "/a.js").then(|| ResolveIdResult::resolved("/project/a.js")))
        }

        async fn load(&self, _id: &str, _ctx: &PluginContext) -> HookResult<Option<LoadResult>> {
            // Read before sleeping: the load returns what was on disk when it started.
            let code = *self.source.lock();
            tokio::time::sleep(self.delay).await;
            Ok(Some(LoadResult::from(code)))
        }
    }

    #[tokio::test]
    async fn test_change_during_load_is_not_cached() {
        let source = Arc::new(Mutex::new("v1"));
        let mut container = PluginContainer::default();
        container.add(Box::new(EditableFs {
            source: Arc::clone(&source),
            delay: Duration::from_millis(50),
        }));
        let container = Arc::new(container);
        let graph = Arc::new(ModuleGraph::new(
            Arc::clone(&container) as Arc<dyn ModuleResolver>
        ));
        let transformer = Arc::new(ModuleTransformer::new(container, Arc::clone(&graph)));

        let first = {
            let transformer = Arc::clone(&transformer);
            tokio::spawn(async move { transformer.transform_request("/a.js").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The edit lands while the first load is suspended.
        *source.lock() = "v2";
        let key = graph.key_for_url("/a.js").expect("node exists before the load finishes");
        graph.invalidate_module(key);

        let served = first.await.unwrap().unwrap().unwrap();
        assert_eq!(served.code, "v1");
        assert!(graph.cached_result("/a.js").is_none());

        let fresh = transformer.transform_request("/a.js").await.unwrap().unwrap();
        assert_eq!(fresh.code, "v2");
    }

    #[tokio::test]
    async fn test_dropped_request_still_populates_cache() {
        let fx = fixture(Duration::from_millis(30), false);
        let transformer = Arc::clone(&fx.transformer);
        let request = tokio::spawn(async move { transformer.transform_request("/a.js").await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        request.abort();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.transformer.graph().cached_result("/a.js").is_some());
    }
}
