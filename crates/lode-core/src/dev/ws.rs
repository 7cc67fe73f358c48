//! HMR WebSocket channel.
//!
//! Transport-agnostic registry of connected clients. The HTTP layer owns the
//! actual sockets: each socket task calls [`WsChannel::connect`], forwards
//! everything from the returned receiver to the socket, and calls
//! [`WsChannel::disconnect`] when the socket closes.

use crate::dev::hmr::HmrMessage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// Identifier of a connected client.
pub type ClientId = u64;

/// Broadcast channel to every connected HMR client.
#[derive(Default)]
pub struct WsChannel {
    clients: Mutex<HashMap<ClientId, mpsc::UnboundedSender<String>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    shutdown: Notify,
}

impl WsChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client. The `connected` greeting is already queued on the
    /// returned receiver.
    pub fn connect(&self) -> (ClientId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        if let Ok(greeting) = serde_json::to_string(&HmrMessage::Connected) {
            // Receiver is alive until we return it.
            let _ = tx.send(greeting);
        }

        if !self.closed.load(Ordering::SeqCst) {
            self.clients.lock().insert(id, tx);
        }
        debug!(client = id, "hmr client connected");
        (id, rx)
    }

    /// Remove a client.
    pub fn disconnect(&self, id: ClientId) {
        if self.clients.lock().remove(&id).is_some() {
            debug!(client = id, "hmr client disconnected");
        }
    }

    /// Broadcast `message` to every client. Returns how many received it.
    ///
    /// Clients whose socket is gone are dropped from the registry.
    pub fn send(&self, message: &HmrMessage) -> usize {
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to serialize hmr message");
                return 0;
            }
        };

        let mut clients = self.clients.lock();
        let mut dead = Vec::new();
        for (id, tx) in clients.iter() {
            if tx.send(payload.clone()).is_err() {
                dead.push(*id);
            }
        }
        for id in &dead {
            clients.remove(id);
            warn!(client = id, "dropped hmr client: socket closed");
        }
        clients.len()
    }

    /// Number of connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Drop every client and wake whoever awaits [`WsChannel::closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.clients.lock().clear();
        self.shutdown.notify_waiters();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once [`WsChannel::close`] has been called.
    pub async fn closed(&self) {
        let notified = self.shutdown.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

impl std::fmt::Debug for WsChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsChannel")
            .field("clients", &self.client_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::hmr::HmrUpdate;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_connect_queues_greeting() {
        let channel = WsChannel::new();
        let (_, mut rx) = channel.connect();
        assert_eq!(rx.try_recv().unwrap(), r#"{"type":"connected"}"#);
        assert_eq!(channel.client_count(), 1);
    }

    #[test]
    fn test_broadcast_reaches_all_clients() {
        let channel = WsChannel::new();
        let (_, mut a) = channel.connect();
        let (_, mut b) = channel.connect();
        a.try_recv().unwrap();
        b.try_recv().unwrap();

        let message = HmrMessage::Update {
            updates: vec![HmrUpdate {
                path: "/src/a.js".into(),
                accepted_path: None,
                timestamp: 7,
            }],
        };
        assert_eq!(channel.send(&message), 2);

        let expected = r#"{"type":"update","updates":[{"path":"/src/a.js","timestamp":7}]}"#;
        assert_eq!(a.try_recv().unwrap(), expected);
        assert_eq!(b.try_recv().unwrap(), expected);
    }

    #[test]
    fn test_closed_receiver_is_dropped_on_send() {
        let channel = WsChannel::new();
        let (_, alive) = channel.connect();
        let (_, gone) = channel.connect();
        drop(gone);

        assert_eq!(channel.send(&HmrMessage::FullReload), 1);
        assert_eq!(channel.client_count(), 1);
        drop(alive);
    }

    #[test]
    fn test_disconnect_stops_delivery() {
        let channel = WsChannel::new();
        let (id, mut rx) = channel.connect();
        rx.try_recv().unwrap();

        assert_eq!(channel.send(&HmrMessage::FullReload), 1);
        assert_eq!(rx.try_recv().unwrap(), r#"{"type":"full-reload"}"#);

        channel.disconnect(id);
        assert_eq!(channel.send(&HmrMessage::FullReload), 0);
        assert_eq!(channel.client_count(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters_and_clears_clients() {
        let channel = Arc::new(WsChannel::new());
        let (_, _rx) = channel.connect();

        let waiter = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.closed().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.close();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(channel.client_count(), 0);

        // already closed: returns immediately
        channel.closed().await;
    }
}
