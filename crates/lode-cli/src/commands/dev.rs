//! `lode dev` command implementation.
//!
//! ```text
//! Browser requests GET /src/App.tsx
//!   -> transform middleware: normalize, cache, resolve, load, transform
//!   -> 200 application/javascript
//! anything the pipeline does not claim
//!   -> index.html / static files
//! ```
//!
//! HMR runs on its own WebSocket listener (`hmr_port`). Watcher events are
//! debounced, then each changed file goes through the HMR engine, which
//! broadcasts one message for it.

use crate::watcher;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Request, State,
    },
    http::{header, Method, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use lode_core::config::load_config;
use lode_core::dev::plugins::file_to_url;
use lode_core::dev::{
    builtin_plugins, is_transform_request, DepOptimizer, FileChangeEvent, HmrEngine, ModuleGraph,
    ModuleResolver, ModuleTransformer, OptimizedDeps, PluginContainer, ScanOptimizer, ServerContext,
    WsChannel,
};
use lode_core::paths::determine_entry_file;
use lode_core::DevConfig;
use miette::{IntoDiagnostic, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

/// Changes arriving within this window are handled as one batch.
const DEBOUNCE: Duration = Duration::from_millis(50);

/// Dev server action. `None` fields fall back to the config file.
#[derive(Debug, Clone)]
pub struct DevAction {
    /// Project root.
    pub root: PathBuf,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub hmr_port: Option<u16>,
    /// Open browser automatically.
    pub open: bool,
    /// Explicit config file path (overrides auto-discovery).
    pub config: Option<PathBuf>,
}

impl DevAction {
    /// Apply CLI flags on top of the loaded config. Flags win.
    fn apply(&self, mut config: DevConfig) -> DevConfig {
        if let Some(port) = self.port {
            config = config.with_port(port);
        }
        if let Some(host) = &self.host {
            config = config.with_host(host.as_str());
        }
        if let Some(hmr_port) = self.hmr_port {
            config = config.with_hmr_port(hmr_port);
        }
        config.open |= self.open;
        config
    }
}

/// State shared by the HTTP and WebSocket handlers.
struct DevState {
    root: PathBuf,
    entry_url: Option<String>,
    container: Arc<PluginContainer>,
    transformer: ModuleTransformer,
    hmr: HmrEngine,
    ws: Arc<WsChannel>,
}

/// Run the dev server until Ctrl+C.
pub async fn run(action: DevAction) -> Result<()> {
    let root = action.root.canonicalize().into_diagnostic()?;

    let (config_path, config) = load_config(&root, action.config.as_deref()).into_diagnostic()?;
    if let Some(path) = &config_path {
        info!(path = %path.display(), "loaded config");
    }
    let config = action.apply(config);

    let entry = config.entry_path().or_else(|| determine_entry_file(&root));
    let entry_url = entry.as_deref().map(|entry| file_to_url(&root, entry));
    if entry.is_none() {
        warn!(root = %root.display(), "no entry module found");
    }

    let entries: Vec<PathBuf> = entry.into_iter().collect();
    let deps = match ScanOptimizer.optimize(&root, &entries) {
        Ok(deps) => deps,
        Err(e) => {
            warn!(error = %e, "dependency optimization failed");
            OptimizedDeps::new(root.clone())
        }
    };
    if !deps.is_empty() {
        info!(count = deps.len(), "optimized dependencies");
    }

    let mut container = PluginContainer::new(root.clone());
    container
        .context_mut()
        .set_meta("mode", "development".to_string());
    container.extend(builtin_plugins(&config));
    debug!(plugins = ?container.plugin_names(), "registered plugins");
    let container = Arc::new(container);

    let resolver: Arc<dyn ModuleResolver> = Arc::clone(&container) as Arc<dyn ModuleResolver>;
    let graph = Arc::new(ModuleGraph::new(resolver));
    let ws = Arc::new(WsChannel::new());

    let server = ServerContext {
        root: root.clone(),
        config: Arc::new(config.clone()),
        module_graph: Arc::clone(&graph),
        ws: Arc::clone(&ws),
        deps: Arc::new(deps),
    };
    container.configure_server(&server).await.into_diagnostic()?;

    let state = Arc::new(DevState {
        root: root.clone(),
        entry_url,
        transformer: ModuleTransformer::new(Arc::clone(&container), Arc::clone(&graph)),
        hmr: HmrEngine::new(Arc::clone(&graph), Arc::clone(&ws)),
        container,
        ws: Arc::clone(&ws),
    });

    let (change_tx, change_rx) = mpsc::unbounded_channel();
    let _watcher = watcher::watch(&root, change_tx).into_diagnostic()?;
    tokio::spawn(hmr_loop(Arc::clone(&state), change_rx));

    let app = Router::new()
        .route("/", get(serve_index))
        .route("/index.html", get(serve_index))
        .fallback_service(ServeDir::new(&root))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), transform_middleware))
        .with_state(Arc::clone(&state));

    let hmr_app = Router::new()
        .route("/", get(hmr_websocket))
        .with_state(Arc::clone(&state));

    let addr = socket_addr(&config.host, config.port)?;
    let hmr_addr = socket_addr(&config.host, config.hmr_port)?;
    let listener = tokio::net::TcpListener::bind(addr).await.into_diagnostic()?;
    let hmr_listener = tokio::net::TcpListener::bind(hmr_addr).await.into_diagnostic()?;

    let url = format!("http://{}:{}", config.host, config.port);
    info!(url = %url, hmr_port = config.hmr_port, "dev server running");
    if config.open {
        if let Err(e) = open_browser(&url) {
            warn!(error = %e, "failed to open browser");
        }
    }

    let hmr_ws = Arc::clone(&ws);
    let hmr_server = tokio::spawn(async move {
        axum::serve(hmr_listener, hmr_app)
            .with_graceful_shutdown(async move { hmr_ws.closed().await })
            .await
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&ws)))
        .await
        .into_diagnostic()?;

    match hmr_server.await {
        Ok(result) => result.into_diagnostic()?,
        Err(e) => warn!(error = %e, "hmr server task failed"),
    }
    info!("dev server stopped");
    Ok(())
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let ip = if host == "localhost" { "127.0.0.1" } else { host };
    format!("{ip}:{port}").parse().into_diagnostic()
}

async fn shutdown_signal(ws: Arc<WsChannel>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
    }
    info!("shutting down");
    ws.close();
}

// ============================================================================
// HTTP
// ============================================================================

/// Serve pipeline modules; everything else continues to the router.
async fn transform_middleware(State(state): State<Arc<DevState>>, request: Request, next: Next) -> Response {
    let url = request
        .uri()
        .path_and_query()
        .map_or_else(|| request.uri().path().to_string(), |pq| pq.as_str().to_string());

    if request.method() != Method::GET || !is_transform_request(&url) {
        return next.run(request).await;
    }

    match state.transformer.transform_request(&url).await {
        Ok(Some(result)) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/javascript"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            result.code.clone(),
        )
            .into_response(),
        Ok(None) => next.run(request).await,
        Err(e) => {
            warn!(url = %url, error = %e, "transform failed");
            state.hmr.send_error(e.to_string());
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Serve `index.html` (or a generated shell) through `transform_index_html`.
async fn serve_index(State(state): State<Arc<DevState>>) -> Response {
    let html = match tokio::fs::read_to_string(state.root.join("index.html")).await {
        Ok(html) => html,
        Err(_) => match &state.entry_url {
            Some(entry_url) => generate_index_html(entry_url),
            None => return (StatusCode::NOT_FOUND, "index.html not found").into_response(),
        },
    };

    match state.container.transform_index_html(&html).await {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            warn!(error = %e, "transform_index_html failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

// ============================================================================
// WebSocket HMR
// ============================================================================

async fn hmr_websocket(ws: WebSocketUpgrade, State(state): State<Arc<DevState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_hmr_socket(socket, state))
}

/// Pump queued server messages to the socket and client messages to the
/// HMR engine until either side goes away.
async fn handle_hmr_socket(mut socket: WebSocket, state: Arc<DevState>) {
    let (client, mut outgoing) = state.ws.connect();
    debug!(client, "hmr client connected");

    loop {
        tokio::select! {
            message = outgoing.recv() => {
                let Some(text) = message else { break };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => state.hmr.handle_client_message(client, &text),
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.ws.disconnect(client);
    debug!(client, "hmr client disconnected");
}

// ============================================================================
// File changes
// ============================================================================

/// Feed watcher events to the HMR engine, one batch per debounce window.
async fn hmr_loop(state: Arc<DevState>, mut changes: mpsc::UnboundedReceiver<FileChangeEvent>) {
    while let Some(first) = changes.recv().await {
        let mut batch: HashMap<PathBuf, FileChangeEvent> = HashMap::new();
        batch.insert(first.path.clone(), first);

        while let Ok(Some(next)) = tokio::time::timeout(DEBOUNCE, changes.recv()).await {
            batch.insert(next.path.clone(), next);
        }

        for event in batch.values() {
            info!(
                kind = ?event.kind,
                file = %event.path.strip_prefix(&state.root).unwrap_or(&event.path).display(),
                "file changed"
            );
            state.hmr.handle_file_change(event);
        }
    }
}

// ============================================================================
// Utilities
// ============================================================================

/// Fallback index HTML when the project has no index.html.
fn generate_index_html(entry_url: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>lode dev</title>
</head>
<body>
  <div id="root"></div>
  <script type="module" src="{entry_url}"></script>
</body>
</html>"#
    )
}

/// Open a URL in the default browser.
fn open_browser(url: &str) -> std::io::Result<()> {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg(url).spawn()?;
    }
    #[cfg(target_os = "linux")]
    {
        std::process::Command::new("xdg-open").arg(url).spawn()?;
    }
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("cmd")
            .args(["/C", "start", url])
            .spawn()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action() -> DevAction {
        DevAction {
            root: PathBuf::from("/project"),
            port: None,
            host: None,
            hmr_port: None,
            open: false,
            config: None,
        }
    }

    #[test]
    fn test_flags_override_config() {
        let mut config = DevConfig::new(PathBuf::from("/project"));
        config.port = 4000;
        config.open = true;

        let kept = action().apply(config.clone());
        assert_eq!(kept.port, 4000);
        assert!(kept.open);

        let overridden = DevAction {
            port: Some(5000),
            hmr_port: Some(5001),
            host: Some("0.0.0.0".to_string()),
            ..action()
        }
        .apply(config);
        assert_eq!(overridden.port, 5000);
        assert_eq!(overridden.hmr_port, 5001);
        assert_eq!(overridden.host, "0.0.0.0");
    }

    #[test]
    fn test_socket_addr() {
        assert_eq!(socket_addr("localhost", 3000).unwrap().to_string(), "127.0.0.1:3000");
        assert_eq!(socket_addr("0.0.0.0", 24678).unwrap().to_string(), "0.0.0.0:24678");
        assert!(socket_addr("not a host", 1).is_err());
    }

    #[test]
    fn test_generate_index_html() {
        let html = generate_index_html("/src/main.tsx");
        assert!(html.contains(r#"<script type="module" src="/src/main.tsx"></script>"#));
        assert!(html.contains(r#"<div id="root"></div>"#));
    }
}
