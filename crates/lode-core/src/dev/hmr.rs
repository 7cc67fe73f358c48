//! HMR controller.
//!
//! Turns file change events into exactly one client message: a list of
//! boundary updates, a full reload, or nothing. Boundaries are found by
//! walking importer edges up from the changed modules:
//!
//! - a module that accepts updates to itself is its own boundary
//! - an importer that is self-accepting, or lists the child in its
//!   accepted deps, is a boundary for that child
//! - reaching a module with no importers that is not a boundary means the
//!   change cannot be applied in place
//!
//! Every module the update passes through is invalidated so the next
//! request re-runs the pipeline.

use crate::dev::graph::{ModuleGraph, ModuleKey, ModuleTable};
use crate::dev::url::normalize_url;
use crate::dev::ws::{ClientId, WsChannel};
use crate::paths::normalize_path;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Public url of the HMR client runtime module.
pub const CLIENT_PUBLIC_PATH: &str = "/@lode/client";

/// Server -> client message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HmrMessage {
    Connected,
    Update { updates: Vec<HmrUpdate> },
    FullReload,
    Error { message: String },
}

/// One module to re-import on the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HmrUpdate {
    /// Url of the boundary module.
    pub path: String,
    /// Url of the dependency the boundary accepts, when it is not `path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_path: Option<String>,
    /// Cache-busting timestamp for the re-import.
    pub timestamp: u64,
}

/// Client -> server message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// `import.meta.hot.accept()` ran for the module at `path`.
    #[serde(rename = "hotAccept")]
    HotAccept { path: String },
    /// The module at `path` could not apply an update.
    #[serde(rename = "invalidate")]
    Invalidate { path: String },
    /// Plugin-defined event.
    #[serde(rename = "custom")]
    Custom {
        event: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

/// Kind of file system change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    Add,
    Change,
    Unlink,
}

/// A file system change under the project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChangeEvent {
    pub kind: FileChangeKind,
    pub path: PathBuf,
}

impl FileChangeEvent {
    pub fn new(kind: FileChangeKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

/// HMR controller bound to a module graph and a client channel.
pub struct HmrEngine {
    graph: Arc<ModuleGraph>,
    ws: Arc<WsChannel>,
}

impl HmrEngine {
    pub fn new(graph: Arc<ModuleGraph>, ws: Arc<WsChannel>) -> Self {
        Self { graph, ws }
    }

    /// Compute the message for a file change, invalidating every module on
    /// the way. `None` when no module in the graph is backed by the file.
    #[must_use]
    pub fn on_file_change(&self, event: &FileChangeEvent) -> Option<HmrMessage> {
        let file = normalize_path(&event.path);

        // The entry document is not part of the module graph.
        if file.ends_with(".html") {
            return Some(HmrMessage::FullReload);
        }

        self.graph.transaction(|table| propagate_update(table, &file))
    }

    /// Handle a change end to end: compute the message and broadcast it.
    pub fn handle_file_change(&self, event: &FileChangeEvent) -> Option<HmrMessage> {
        let message = self.on_file_change(event);
        match &message {
            Some(HmrMessage::Update { updates }) => {
                for update in updates {
                    info!(path = %update.path, file = %event.path.display(), "hmr update");
                }
            }
            Some(HmrMessage::FullReload) => {
                info!(file = %event.path.display(), "page reload");
            }
            Some(_) => {}
            None => debug!(file = %event.path.display(), kind = ?event.kind, "change not in module graph"),
        }
        if let Some(message) = &message {
            self.ws.send(message);
        }
        message
    }

    /// Apply a raw text frame received from a client.
    pub fn handle_client_message(&self, client: ClientId, text: &str) {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(client, error = %e, "malformed hmr client message");
                return;
            }
        };

        match message {
            ClientMessage::HotAccept { path } => {
                let url = normalize_url(&path);
                if !self.graph.mark_self_accepting(&url) {
                    debug!(client, url = %url, "hotAccept for unknown module");
                }
            }
            ClientMessage::Invalidate { path } => {
                info!(client, path = %path, "module invalidated by client, reloading");
                if let Some(key) = self.graph.key_for_url(&normalize_url(&path)) {
                    self.graph.invalidate_module(key);
                }
                self.ws.send(&HmrMessage::FullReload);
            }
            ClientMessage::Custom { event, .. } => {
                debug!(client, event = %event, "custom hmr event");
            }
        }
    }

    /// Broadcast a pipeline error to the browser overlay.
    pub fn send_error(&self, message: impl Into<String>) {
        self.ws.send(&HmrMessage::Error {
            message: message.into(),
        });
    }

    /// Client runtime with the WebSocket port baked in.
    #[must_use]
    pub fn client_runtime(port: u16) -> String {
        HMR_CLIENT_RUNTIME.replace("__HMR_PORT__", &port.to_string())
    }

    /// Prelude giving a served module its `import.meta.hot`.
    #[must_use]
    pub fn module_preamble(module_url: &str) -> String {
        format!(
            "import {{ createHotContext as __lode__createHotContext }} from \"{CLIENT_PUBLIC_PATH}\";\n\
             import.meta.hot = __lode__createHotContext(\"{module_url}\");\n"
        )
    }
}

impl std::fmt::Debug for HmrEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmrEngine")
            .field("graph", &self.graph)
            .field("ws", &self.ws)
            .finish()
    }
}

/// Breadth-first boundary search from the nodes backed by `file`.
fn propagate_update(table: &mut ModuleTable, file: &str) -> Option<HmrMessage> {
    let changed = table.modules_by_file(file);
    if changed.is_empty() {
        return None;
    }

    let mut updates = Vec::new();
    let mut full_reload = false;
    let mut invalidated: HashSet<ModuleKey> = HashSet::new();
    let mut boundaries: HashSet<(ModuleKey, ModuleKey)> = HashSet::new();
    let mut queue: VecDeque<(ModuleKey, ModuleKey)> = VecDeque::new();

    for key in changed {
        let timestamp = table.invalidate_module(key);
        invalidated.insert(key);
        let Some(node) = table.node(key) else { continue };

        if node.is_self_accepting {
            updates.push(HmrUpdate {
                path: node.url.clone(),
                accepted_path: None,
                timestamp,
            });
            boundaries.insert((key, key));
        } else if node.importers.is_empty() {
            full_reload = true;
        } else {
            queue.extend(node.importers.iter().map(|importer| (*importer, key)));
        }
    }

    while let Some((key, child)) = queue.pop_front() {
        let Some(node) = table.node(key) else { continue };

        if node.accepts(child) {
            if !boundaries.insert((key, child)) {
                continue;
            }
            let path = node.url.clone();
            let accepted_path = (!node.is_self_accepting)
                .then(|| table.node(child).map(|c| c.url.clone()))
                .flatten();
            let timestamp = if invalidated.insert(key) {
                table.invalidate_module(key)
            } else {
                table.node(key).map_or(0, |n| n.last_hmr_timestamp)
            };
            updates.push(HmrUpdate {
                path,
                accepted_path,
                timestamp,
            });
            continue;
        }

        if !invalidated.insert(key) {
            continue;
        }
        table.invalidate_module(key);
        let Some(node) = table.node(key) else { continue };
        if node.importers.is_empty() {
            full_reload = true;
        } else {
            queue.extend(node.importers.iter().map(|importer| (*importer, key)));
        }
    }

    // An import cycle with no entry and no boundary leaves nothing to update.
    if full_reload || updates.is_empty() {
        Some(HmrMessage::FullReload)
    } else {
        Some(HmrMessage::Update { updates })
    }
}

/// The HMR client runtime (served at [`CLIENT_PUBLIC_PATH`]).
///
/// Provides the `import.meta.hot` API:
/// - `hot.accept()` / `hot.accept(cb)`: self-accepting module
/// - `hot.accept(deps, cb)`: accept dependency updates
/// - `hot.dispose(cb)` / `hot.prune(cb)`: cleanup hooks
/// - `hot.invalidate()`: give up and reload
/// - `hot.data`: state persisted across updates
/// - `hot.on(event, cb)` / `hot.send(event, data)`: custom events
///
/// Plus `updateStyle` / `removeStyle` for CSS modules.
const HMR_CLIENT_RUNTIME: &str = r"
// lode HMR client
const hmrPort = __HMR_PORT__;
const hotModulesMap = new Map();
const disposeMap = new Map();
const pruneMap = new Map();
const dataMap = new Map();
const customListeners = new Map();
const sheetsMap = new Map();

let ws;
let isConnected = false;
const pending = [];

function setupWebSocket() {
  ws = new WebSocket(`ws://${location.hostname}:${hmrPort}/`);

  ws.onopen = () => {
    isConnected = true;
    pending.splice(0).forEach((msg) => ws.send(msg));
  };

  ws.onmessage = (event) => handleMessage(JSON.parse(event.data));

  ws.onclose = () => {
    if (isConnected) {
      console.log('[lode] server connection lost. Reloading...');
      isConnected = false;
      setTimeout(() => location.reload(), 1000);
    }
  };
}

function send(msg) {
  const text = JSON.stringify(msg);
  if (ws && ws.readyState === WebSocket.OPEN) {
    ws.send(text);
  } else {
    pending.push(text);
  }
}

function handleMessage(msg) {
  switch (msg.type) {
    case 'connected':
      console.log('[lode] connected.');
      break;
    case 'update':
      hideErrorOverlay();
      msg.updates.forEach(handleUpdate);
      break;
    case 'full-reload':
      location.reload();
      break;
    case 'error':
      console.error('[lode] error:', msg.message);
      showErrorOverlay(msg.message);
      break;
    case 'custom':
      (customListeners.get(msg.event) || []).forEach((cb) => cb(msg.data));
      break;
  }
}

function withTimestamp(url, timestamp) {
  return url + (url.includes('?') ? '&' : '?') + 't=' + timestamp;
}

async function handleUpdate({ path, acceptedPath = path, timestamp }) {
  const hotModule = hotModulesMap.get(path);
  if (!hotModule) {
    location.reload();
    return;
  }

  const dispose = disposeMap.get(acceptedPath);
  if (dispose) {
    await dispose(dataMap.get(acceptedPath));
  }

  try {
    const newModule = await import(withTimestamp(acceptedPath, timestamp));
    if (acceptedPath === path && hotModule.selfAccepted && hotModule.selfAcceptCb) {
      hotModule.selfAcceptCb(newModule);
    }
    for (const [deps, cb] of hotModule.depCallbacks) {
      if (deps.includes(acceptedPath) && cb) {
        cb(deps.map((dep) => (dep === acceptedPath ? newModule : undefined)));
      }
    }
    console.log(`[lode] hot updated: ${acceptedPath}`);
  } catch (err) {
    console.error(`[lode] hot update failed for ${acceptedPath}:`, err);
    location.reload();
  }
}

function showErrorOverlay(message) {
  let overlay = document.getElementById('__lode_error_overlay');
  if (!overlay) {
    overlay = document.createElement('div');
    overlay.id = '__lode_error_overlay';
    overlay.style.cssText = `
      position: fixed; inset: 0; background: rgba(0,0,0,0.9); color: #ff5555;
      padding: 32px; font-family: monospace; font-size: 16px;
      white-space: pre-wrap; overflow: auto; z-index: 999999;
    `;
    document.body.appendChild(overlay);
  }
  overlay.textContent = message;
  overlay.style.display = 'block';
}

function hideErrorOverlay() {
  const overlay = document.getElementById('__lode_error_overlay');
  if (overlay) overlay.style.display = 'none';
}

export function updateStyle(id, content) {
  let style = sheetsMap.get(id);
  if (!style) {
    style = document.createElement('style');
    style.setAttribute('type', 'text/css');
    style.setAttribute('data-lode-id', id);
    document.head.appendChild(style);
    sheetsMap.set(id, style);
  }
  style.textContent = content;
}

export function removeStyle(id) {
  const style = sheetsMap.get(id);
  if (style) {
    document.head.removeChild(style);
    sheetsMap.delete(id);
  }
}

export function createHotContext(ownerPath) {
  if (!dataMap.has(ownerPath)) {
    dataMap.set(ownerPath, {});
  }
  const entry = () => {
    let mod = hotModulesMap.get(ownerPath);
    if (!mod) {
      mod = { selfAccepted: false, depCallbacks: [] };
      hotModulesMap.set(ownerPath, mod);
    }
    return mod;
  };
  const toUrl = (dep) => {
    const url = new URL(dep, location.origin + ownerPath);
    return url.pathname + url.search;
  };

  return {
    get data() {
      return dataMap.get(ownerPath);
    },

    accept(deps, cb) {
      if (typeof deps === 'function' || !deps) {
        const mod = entry();
        mod.selfAccepted = true;
        mod.selfAcceptCb = typeof deps === 'function' ? deps : cb;
        send({ type: 'hotAccept', path: ownerPath });
      } else if (typeof deps === 'string') {
        entry().depCallbacks.push([[toUrl(deps)], cb && (([m]) => cb(m))]);
      } else if (Array.isArray(deps)) {
        entry().depCallbacks.push([deps.map(toUrl), cb]);
      }
    },

    dispose(cb) {
      disposeMap.set(ownerPath, cb);
    },

    prune(cb) {
      pruneMap.set(ownerPath, cb);
    },

    invalidate() {
      send({ type: 'invalidate', path: ownerPath });
    },

    on(event, cb) {
      if (!customListeners.has(event)) {
        customListeners.set(event, []);
      }
      customListeners.get(event).push(cb);
    },

    send(event, data) {
      send({ type: 'custom', event, data });
    },
  };
}

setupWebSocket();
";
