//! End-to-end tests of the dev server core with the built-in plugins
//! against a project on disk.

use lode_core::dev::{
    builtin_plugins, FileChangeEvent, FileChangeKind, HmrEngine, HmrMessage, HmrUpdate, ModuleGraph,
    ModuleResolver, ModuleTransformer, OptimizedDeps, PluginContainer, ServerContext, WsChannel,
};
use lode_core::DevConfig;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

struct Server {
    dir: TempDir,
    graph: Arc<ModuleGraph>,
    ws: Arc<WsChannel>,
    transformer: ModuleTransformer,
    hmr: HmrEngine,
}

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

fn project() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(
        root,
        "index.html",
        "<html><head></head><body><script type=\"module\" src=\"/src/main.ts\"></script></body></html>",
    );
    write(
        root,
        "src/main.ts",
        "import type { Options } from './types';\nimport {\n  render,\n} from './App';\nimport './style.css';\nimport logo from './logo.svg';\nconst options: Options = {};\nrender(logo as string, options);\n",
    );
    write(
        root,
        "src/App.tsx",
        "import { helper } from './util.js';\nexport function render(x: string, _options?: object) { return helper(x); }\nimport.meta.hot.accept();\n",
    );
    write(
        root,
        "src/util.js",
        "import {\n  prefix,\n} from './base.js';\nexport const helper = (x) => prefix + x;\n",
    );
    write(root, "src/base.js", "export const prefix = '';\n");
    write(root, "src/style.css", "body { margin: 0; }\n");
    write(root, "src/logo.svg", "<svg></svg>");
    dir
}

async fn server(dir: TempDir) -> Server {
    let root = dir.path().to_path_buf();
    let config = DevConfig::new(root.clone());

    let mut container = PluginContainer::new(root.clone());
    container.extend(builtin_plugins(&config));
    let container = Arc::new(container);

    let resolver: Arc<dyn ModuleResolver> = Arc::clone(&container) as Arc<dyn ModuleResolver>;
    let graph = Arc::new(ModuleGraph::new(resolver));
    let ws = Arc::new(WsChannel::new());

    let server = ServerContext {
        root: root.clone(),
        config: Arc::new(config),
        module_graph: Arc::clone(&graph),
        ws: Arc::clone(&ws),
        deps: Arc::new(OptimizedDeps::new(root)),
    };
    container.configure_server(&server).await.unwrap();

    Server {
        transformer: ModuleTransformer::new(container, Arc::clone(&graph)),
        hmr: HmrEngine::new(Arc::clone(&graph), Arc::clone(&ws)),
        graph,
        ws,
        dir,
    }
}

impl Server {
    async fn load_app(&self) {
        for url in [
            "/src/main.ts",
            "/src/App.tsx",
            "/src/util.js",
            "/src/base.js",
            "/src/style.css?import",
        ] {
            self.transformer.transform_request(url).await.unwrap().unwrap();
        }
    }

    fn change(&self, rel: &str) -> Option<HmrMessage> {
        let event = FileChangeEvent::new(FileChangeKind::Change, self.dir.path().join(rel));
        self.hmr.handle_file_change(&event)
    }
}

#[tokio::test]
async fn test_serves_rewritten_modules_from_cache() {
    let server = server(project()).await;

    let first = server.transformer.transform_request("/src/main.ts").await.unwrap().unwrap();
    assert!(first.code.contains(r#"from "/src/App.tsx""#));
    assert!(first.code.contains(r#"import "/src/style.css?import""#));
    assert!(first.code.contains(r#"from "/src/logo.svg?import""#));
    // served as JavaScript: types and type-only imports are gone
    assert!(!first.code.contains("as string"));
    assert!(!first.code.contains("./types"));

    let second = server
        .transformer
        .transform_request("/src/main.ts?t=123#top")
        .await
        .unwrap()
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let main = server.graph.get_module_by_url("/src/main.ts").unwrap();
    assert_eq!(main.importees.len(), 3);
    server.graph.verify_edges().unwrap();
}

#[tokio::test]
async fn test_concurrent_requests_share_one_result() {
    let server = Arc::new(server(project()).await);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                server
                    .transformer
                    .transform_request(&format!("/src/App.tsx?t={i}"))
                    .await
                    .unwrap()
                    .unwrap()
            })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    assert!(results.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    assert_eq!(server.transformer.in_flight(), 0);
}

#[tokio::test]
async fn test_client_runtime_and_assets() {
    let server = server(project()).await;

    let client = server.transformer.transform_request("/@lode/client").await.unwrap().unwrap();
    assert!(client.code.contains("export function createHotContext"));
    assert!(client.code.contains("const hmrPort = 24678;"));

    let logo = server.transformer.transform_request("/src/logo.svg?import").await.unwrap().unwrap();
    assert_eq!(logo.code, r#"export default "/src/logo.svg";"#);

    // Plain asset requests are left to static serving.
    assert!(server.transformer.transform_request("/src/logo.svg").await.unwrap().is_none());
    assert!(server.transformer.transform_request("/src/missing.ts").await.unwrap().is_none());
}

#[tokio::test]
async fn test_change_updates_nearest_accepting_importer() {
    let server = server(project()).await;
    server.load_app().await;
    let (_client, mut rx) = server.ws.connect();
    rx.recv().await.unwrap();

    let message = server.change("src/util.js").unwrap();
    let HmrMessage::Update { updates } = &message else {
        panic!("expected update, got {message:?}");
    };
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].path, "/src/App.tsx");
    assert_eq!(updates[0].accepted_path, None);

    // util and App are re-transformed; main keeps its cached result.
    assert!(server.graph.cached_result("/src/util.js").is_none());
    assert!(server.graph.cached_result("/src/App.tsx").is_none());
    assert!(server.graph.cached_result("/src/main.ts").is_some());

    let sent: HmrMessage = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(sent, message);
}

#[tokio::test]
async fn test_reimport_after_update_carries_timestamp() {
    let server = server(project()).await;
    server.load_app().await;

    let Some(HmrMessage::Update { updates }) = server.change("src/util.js") else {
        panic!("expected update");
    };
    let HmrUpdate { timestamp, .. } = updates[0].clone();

    let app = server.transformer.transform_request("/src/App.tsx").await.unwrap().unwrap();
    let util = server.graph.get_module_by_url("/src/util.js").unwrap();
    assert!(util.last_hmr_timestamp > 0);
    assert!(timestamp > 0);
    assert!(app
        .code
        .contains(&format!("from \"/src/util.js?t={}\"", util.last_hmr_timestamp)));
}

#[tokio::test]
async fn test_multiline_import_is_an_edge() {
    let server = server(project()).await;
    server.load_app().await;

    let util = server.transformer.transform_request("/src/util.js").await.unwrap().unwrap();
    assert!(util.code.contains("} from '/src/base.js';"));
    let base = server.graph.get_module_by_url("/src/base.js").unwrap();
    assert!(base.importers.contains(&server.graph.key_for_url("/src/util.js").unwrap()));

    let Some(HmrMessage::Update { updates }) = server.change("src/base.js") else {
        panic!("expected update");
    };
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].path, "/src/App.tsx");
}

#[tokio::test]
async fn test_css_change_is_its_own_boundary() {
    let server = server(project()).await;
    server.load_app().await;

    let Some(HmrMessage::Update { updates }) = server.change("src/style.css") else {
        panic!("expected update");
    };
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].path, "/src/style.css?import");
}

#[tokio::test]
async fn test_unaccepted_change_reloads_page() {
    let server = server(project()).await;
    server.load_app().await;

    assert_eq!(server.change("src/main.ts"), Some(HmrMessage::FullReload));
    assert_eq!(server.change("index.html"), Some(HmrMessage::FullReload));
    assert_eq!(server.change("README.md"), None);
}

#[tokio::test]
async fn test_index_html_gets_client_script() {
    let dir = project();
    let html = std::fs::read_to_string(dir.path().join("index.html")).unwrap();
    let server = server(dir).await;

    let container = server.transformer.container();
    let served = container.transform_index_html(&html).await.unwrap();
    assert!(served.contains(r#"<script type="module" src="/@lode/client"></script>"#));
}
