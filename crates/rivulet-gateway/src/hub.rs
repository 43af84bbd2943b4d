//! Connection hub: id-addressed live WebSocket connections.
//!
//! Two populations (workers, clients), each a map from id to an outbound
//! frame queue. The reader half of every socket stays with its axum task;
//! writes go through the queue so a dedicated writer task serialises frames
//! and preserves order per connection. Detaching a worker clears its entry
//! immediately; the registry record lags until the sweep.

use std::collections::HashMap;
use std::sync::RwLock;

use rivulet_proto::Frame;
use tokio::sync::mpsc;
use tracing::debug;

/// Errors surfaced by hub sends.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HubError {
    #[error("worker {node_id} is not connected")]
    WorkerNotConnected { node_id: String },
}

/// Outbound queue for one connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<Frame>,
}

impl ConnectionHandle {
    /// Create a handle plus the receiver its writer task drains.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn enqueue(&self, frame: Frame) -> bool {
        self.tx.send(frame).is_ok()
    }
}

/// Live connection registry for workers and clients.
#[derive(Default)]
pub struct ConnectionHub {
    workers: RwLock<HashMap<String, ConnectionHandle>>,
    clients: RwLock<HashMap<String, ConnectionHandle>>,
}

impl ConnectionHub {
    /// Empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a worker connection, replacing any previous one for the id.
    pub fn attach_worker(&self, node_id: &str, handle: ConnectionHandle) {
        let mut workers = self.workers.write().expect("hub lock poisoned");
        workers.insert(node_id.to_string(), handle);
    }

    /// Drop a worker connection entry.
    pub fn detach_worker(&self, node_id: &str) {
        let mut workers = self.workers.write().expect("hub lock poisoned");
        workers.remove(node_id);
    }

    /// Bind a client connection, replacing any previous one for the id.
    pub fn attach_client(&self, client_id: &str, handle: ConnectionHandle) {
        let mut clients = self.clients.write().expect("hub lock poisoned");
        clients.insert(client_id.to_string(), handle);
    }

    /// Drop a client connection entry. Sessions referencing the client stay
    /// alive until the table sweep.
    pub fn detach_client(&self, client_id: &str) {
        let mut clients = self.clients.write().expect("hub lock poisoned");
        clients.remove(client_id);
    }

    /// Whether a worker connection is currently attached.
    #[must_use]
    pub fn worker_connected(&self, node_id: &str) -> bool {
        let workers = self.workers.read().expect("hub lock poisoned");
        workers.contains_key(node_id)
    }

    /// Queue a frame for a worker.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::WorkerNotConnected`] when the worker has no live
    /// connection (including a closed queue, which is treated as detached).
    pub fn send_to_worker(&self, node_id: &str, frame: Frame) -> Result<(), HubError> {
        let workers = self.workers.read().expect("hub lock poisoned");
        let delivered = workers
            .get(node_id)
            .is_some_and(|handle| handle.enqueue(frame));
        if delivered {
            Ok(())
        } else {
            Err(HubError::WorkerNotConnected {
                node_id: node_id.to_string(),
            })
        }
    }

    /// Queue a frame for a client. Frames to absent clients are dropped
    /// silently per the session-ownership rules; the return value exists for
    /// observability only.
    pub fn send_to_client(&self, client_id: &str, frame: Frame) -> bool {
        let clients = self.clients.read().expect("hub lock poisoned");
        let delivered = clients
            .get(client_id)
            .is_some_and(|handle| handle.enqueue(frame));
        if !delivered {
            debug!(client_id = %client_id, "dropping frame for absent client");
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat() -> Frame {
        Frame::Heartbeat {
            timestamp: 0,
            node_id: "w1".into(),
        }
    }

    #[tokio::test]
    async fn worker_sends_require_attachment() {
        let hub = ConnectionHub::new();
        assert_eq!(
            hub.send_to_worker("w1", heartbeat()),
            Err(HubError::WorkerNotConnected {
                node_id: "w1".into()
            })
        );

        let (handle, mut rx) = ConnectionHandle::channel();
        hub.attach_worker("w1", handle);
        assert!(hub.worker_connected("w1"));
        hub.send_to_worker("w1", heartbeat()).expect("queued");
        assert!(rx.recv().await.is_some());

        hub.detach_worker("w1");
        assert!(!hub.worker_connected("w1"));
        assert!(hub.send_to_worker("w1", heartbeat()).is_err());
    }

    #[tokio::test]
    async fn client_sends_drop_silently() {
        let hub = ConnectionHub::new();
        assert!(!hub.send_to_client("c1", heartbeat()));

        let (handle, mut rx) = ConnectionHandle::channel();
        hub.attach_client("c1", handle);
        assert!(hub.send_to_client("c1", heartbeat()));
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn queue_preserves_order() {
        let hub = ConnectionHub::new();
        let (handle, mut rx) = ConnectionHandle::channel();
        hub.attach_worker("w1", handle);

        for i in 0..10 {
            hub.send_to_worker(
                "w1",
                Frame::GetTasks {
                    request_id: format!("R{i}"),
                    timestamp: i,
                },
            )
            .expect("queued");
        }
        for i in 0..10 {
            match rx.recv().await {
                Some(Frame::GetTasks { request_id, .. }) => {
                    assert_eq!(request_id, format!("R{i}"));
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn closed_queue_counts_as_detached() {
        let hub = ConnectionHub::new();
        let (handle, rx) = ConnectionHandle::channel();
        hub.attach_worker("w1", handle);
        drop(rx);
        assert!(hub.send_to_worker("w1", heartbeat()).is_err());
    }
}
