//! Response dispatcher: one inbound stream, many per-request channels.
//!
//! One dispatch loop per transport turns the single inbound channel into
//! capacity-1 per-request channels indexed by stringified JSON-RPC id. A
//! caller must register its id *before* writing the request, or the response
//! can race past it. The pending map is the only shared mutable state and is
//! guarded by a read-write lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::jsonrpc::JsonRpcMessage;

/// Correlates inbound responses to in-flight requests by id.
pub struct ResponseDispatcher {
    pending: Arc<RwLock<HashMap<String, mpsc::Sender<JsonRpcMessage>>>>,
    started: AtomicBool,
}

impl ResponseDispatcher {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(RwLock::new(HashMap::new())),
            started: AtomicBool::new(false),
        }
    }

    /// Creates the per-request response channel for `id`.
    ///
    /// Capacity 1: exactly one response per id is expected. Call this before
    /// writing the matching request.
    pub async fn register_request(&self, id: &str) -> mpsc::Receiver<JsonRpcMessage> {
        let (tx, rx) = mpsc::channel(1);
        let mut pending = self.pending.write().await;
        if pending.insert(id.to_string(), tx).is_some() {
            warn!(%id, "replacing pending request with duplicate id");
        }
        rx
    }

    /// Removes a pending entry on timeout or cancellation.
    pub async fn unregister_request(&self, id: &str) {
        self.pending.write().await.remove(id);
    }

    /// Number of requests still awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Starts the dispatch loop over `inbound`. Guarded so a second call is a
    /// no-op; there is exactly one loop per transport.
    pub fn start(self: &Arc<Self>, mut inbound: mpsc::Receiver<JsonRpcMessage>) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("dispatch loop already started; ignoring");
            return;
        }
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                dispatcher.dispatch(msg).await;
            }
            // Transport shut down: close every pending channel so callers
            // observe the disconnect instead of hanging.
            dispatcher.pending.write().await.clear();
        });
    }

    async fn dispatch(&self, msg: JsonRpcMessage) {
        if msg.is_notification() {
            debug!(method = msg.method.as_deref().unwrap_or(""), "ignoring notification");
            return;
        }
        let Some(id) = msg.id_key() else {
            debug!("inbound message without usable id");
            return;
        };
        let tx = {
            let pending = self.pending.read().await;
            pending.get(&id).cloned()
        };
        match tx {
            Some(tx) => {
                if tx.try_send(msg).is_err() {
                    // Channels are cap-1 and ids are unique, so a full
                    // channel means a duplicate response or a caller bug.
                    warn!(%id, "response channel full; dropping duplicate response");
                }
                self.pending.write().await.remove(&id);
            }
            None => {
                debug!(%id, "response for unknown or already-completed request");
            }
        }
    }
}

impl Default for ResponseDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(id: impl Into<serde_json::Value>, marker: &str) -> JsonRpcMessage {
        JsonRpcMessage::response(id.into(), json!({ "marker": marker }))
    }

    #[tokio::test]
    async fn correlates_interleaved_responses_without_crosstalk() {
        let dispatcher = Arc::new(ResponseDispatcher::new());
        let (tx, rx) = mpsc::channel(16);
        dispatcher.start(rx);

        let mut rx_a = dispatcher.register_request("1").await;
        let mut rx_b = dispatcher.register_request("2").await;
        let mut rx_c = dispatcher.register_request("3").await;

        // Arrive out of order.
        tx.send(response(3, "c")).await.unwrap();
        tx.send(response(1, "a")).await.unwrap();
        tx.send(response(2, "b")).await.unwrap();

        assert_eq!(rx_a.recv().await.unwrap().result.unwrap()["marker"], "a");
        assert_eq!(rx_b.recv().await.unwrap().result.unwrap()["marker"], "b");
        assert_eq!(rx_c.recv().await.unwrap().result.unwrap()["marker"], "c");
        assert_eq!(dispatcher.pending_count().await, 0);
    }

    #[tokio::test]
    async fn number_and_string_wire_ids_hit_the_same_key() {
        let dispatcher = Arc::new(ResponseDispatcher::new());
        let (tx, rx) = mpsc::channel(4);
        dispatcher.start(rx);

        let mut pending = dispatcher.register_request("42").await;
        tx.send(response(42, "numeric")).await.unwrap();
        assert!(pending.recv().await.is_some());
    }

    #[tokio::test]
    async fn unknown_ids_are_dropped_quietly() {
        let dispatcher = Arc::new(ResponseDispatcher::new());
        let (tx, rx) = mpsc::channel(4);
        dispatcher.start(rx);

        tx.send(response("nobody", "x")).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(dispatcher.pending_count().await, 0);
    }

    #[tokio::test]
    async fn unregister_cancels_delivery() {
        let dispatcher = Arc::new(ResponseDispatcher::new());
        let (tx, rx) = mpsc::channel(4);
        dispatcher.start(rx);

        let mut pending = dispatcher.register_request("7").await;
        dispatcher.unregister_request("7").await;
        tx.send(response(7, "late")).await.unwrap();
        // Channel was removed; sender side dropped, recv yields None.
        assert!(pending.recv().await.is_none());
    }

    #[tokio::test]
    async fn transport_shutdown_closes_pending_channels() {
        let dispatcher = Arc::new(ResponseDispatcher::new());
        let (tx, rx) = mpsc::channel(4);
        dispatcher.start(rx);

        let mut pending = dispatcher.register_request("held").await;
        drop(tx);
        assert!(pending.recv().await.is_none());
    }

    #[tokio::test]
    async fn second_start_is_a_no_op() {
        let dispatcher = Arc::new(ResponseDispatcher::new());
        let (_tx1, rx1) = mpsc::channel::<JsonRpcMessage>(1);
        let (_tx2, rx2) = mpsc::channel::<JsonRpcMessage>(1);
        dispatcher.start(rx1);
        dispatcher.start(rx2);
    }
}
