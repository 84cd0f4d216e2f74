use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

use parley_types::wire::ServerFrame;

/// Whether a user may hold several live connections at once, or a new
/// registration replaces the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePolicy {
    Multi,
    Single,
}

/// Items queued to a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    /// A pre-serialized frame; routing serializes once and every target
    /// connection gets the identical bytes.
    Frame(Arc<str>),
    Close,
}

/// Cheap handle to one live connection's write path.
#[derive(Clone)]
pub struct ConnectionHandle {
    conn_id: Uuid,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn id(&self) -> Uuid {
        self.conn_id
    }

    /// Queue a frame. False means the writer task is gone and the frame
    /// was not delivered.
    pub fn send(&self, frame: Arc<str>) -> bool {
        self.tx.send(Outbound::Frame(frame)).is_ok()
    }

    pub fn send_frame(&self, frame: &ServerFrame) -> bool {
        // serializing our own wire types cannot fail
        let json = serde_json::to_string(frame).unwrap();
        self.send(Arc::from(json.as_str()))
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

/// The shared map from authenticated user id to that user's live
/// connections, plus the process-wide set of every open handler (needed for
/// the shutdown broadcast before clients authenticate).
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    policy: DevicePolicy,
    /// user_id -> conn_id -> handle
    connections: RwLock<HashMap<String, HashMap<Uuid, ConnectionHandle>>>,
    /// every tracked handler, authenticated or not
    handlers: RwLock<HashMap<Uuid, ConnectionHandle>>,
}

impl Registry {
    pub fn new(policy: DevicePolicy) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                policy,
                connections: RwLock::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Mint a handle and the receiver its writer task will drain.
    pub fn new_handle(&self) -> (ConnectionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ConnectionHandle {
                conn_id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    pub async fn track(&self, handle: ConnectionHandle) {
        self.inner.handlers.write().await.insert(handle.id(), handle);
    }

    pub async fn untrack(&self, conn_id: Uuid) {
        self.inner.handlers.write().await.remove(&conn_id);
    }

    /// Attach an authenticated connection to its user. Under the Single
    /// policy any previous connections of the same user are closed and
    /// replaced.
    pub async fn register(&self, user_id: &str, handle: ConnectionHandle) {
        let mut connections = self.inner.connections.write().await;
        let entry = connections.entry(user_id.to_string()).or_default();

        if self.inner.policy == DevicePolicy::Single && !entry.is_empty() {
            debug!("single-device policy: replacing {} connection(s) of {}", entry.len(), user_id);
            for old in entry.values() {
                old.close();
            }
            entry.clear();
        }

        entry.insert(handle.id(), handle);
    }

    /// Detach one connection; the user entry goes away with its last
    /// connection.
    pub async fn unregister(&self, user_id: &str, conn_id: Uuid) {
        let mut connections = self.inner.connections.write().await;
        if let Some(entry) = connections.get_mut(user_id) {
            entry.remove(&conn_id);
            if entry.is_empty() {
                connections.remove(user_id);
            }
        }
    }

    /// Deliver a frame to every live connection of one user. Returns the
    /// number of connections that accepted it; a dead connection is skipped
    /// and pruned without affecting the rest.
    pub async fn send_to_user(&self, user_id: &str, frame: Arc<str>) -> usize {
        let mut delivered = 0;
        let mut dead: Vec<Uuid> = Vec::new();

        {
            let connections = self.inner.connections.read().await;
            let Some(entry) = connections.get(user_id) else {
                return 0;
            };
            for handle in entry.values() {
                if handle.send(frame.clone()) {
                    delivered += 1;
                } else {
                    dead.push(handle.id());
                }
            }
        }

        for conn_id in dead {
            self.unregister(user_id, conn_id).await;
        }

        delivered
    }

    pub async fn connection_count(&self, user_id: &str) -> usize {
        self.inner
            .connections
            .read()
            .await
            .get(user_id)
            .map_or(0, |entry| entry.len())
    }

    /// Shutdown broadcast: push `server_closed` to every tracked handler and
    /// close its write path. Safe to call while accepts and routes are still
    /// in flight.
    pub async fn close_all(&self) {
        let frame: Arc<str> =
            Arc::from(serde_json::to_string(&ServerFrame::ServerClosed).unwrap().as_str());

        let handlers = self.inner.handlers.read().await;
        info!("closing {} connection(s)", handlers.len());
        for handle in handlers.values() {
            handle.send(frame.clone());
            handle.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn recv_frame(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Arc<str> {
        match rx.recv().await {
            Some(Outbound::Frame(frame)) => frame,
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn multi_device_counts_connections_not_users() {
        let registry = Registry::new(DevicePolicy::Multi);
        let (h1, mut rx1) = registry.new_handle();
        let (h2, mut rx2) = registry.new_handle();
        registry.register("alice", h1.clone()).await;
        registry.register("alice", h2).await;

        let frame: Arc<str> = Arc::from(r#"{"type":"message"}"#);
        assert_eq!(registry.send_to_user("alice", frame.clone()).await, 2);
        assert_eq!(&*recv_frame(&mut rx1).await, r#"{"type":"message"}"#);
        assert_eq!(&*recv_frame(&mut rx2).await, r#"{"type":"message"}"#);

        registry.unregister("alice", h1.id()).await;
        assert_eq!(registry.send_to_user("alice", frame).await, 1);
    }

    #[tokio::test]
    async fn unknown_user_delivers_zero() {
        let registry = Registry::new(DevicePolicy::Multi);
        let frame: Arc<str> = Arc::from("{}");
        assert_eq!(registry.send_to_user("nobody", frame).await, 0);
    }

    #[tokio::test]
    async fn last_unregister_removes_the_user_entry() {
        let registry = Registry::new(DevicePolicy::Multi);
        let (h1, _rx1) = registry.new_handle();
        registry.register("alice", h1.clone()).await;
        assert_eq!(registry.connection_count("alice").await, 1);

        registry.unregister("alice", h1.id()).await;
        assert_eq!(registry.connection_count("alice").await, 0);
    }

    #[tokio::test]
    async fn dead_connections_are_pruned_not_counted() {
        let registry = Registry::new(DevicePolicy::Multi);
        let (h1, rx1) = registry.new_handle();
        let (h2, mut rx2) = registry.new_handle();
        registry.register("alice", h1).await;
        registry.register("alice", h2).await;

        drop(rx1); // writer task gone

        let frame: Arc<str> = Arc::from("{}");
        assert_eq!(registry.send_to_user("alice", frame.clone()).await, 1);
        assert_eq!(registry.connection_count("alice").await, 1);
        assert_eq!(&*recv_frame(&mut rx2).await, "{}");
    }

    #[tokio::test]
    async fn single_device_policy_replaces() {
        let registry = Registry::new(DevicePolicy::Single);
        let (h1, mut rx1) = registry.new_handle();
        let (h2, mut rx2) = registry.new_handle();
        registry.register("alice", h1).await;
        registry.register("alice", h2).await;

        assert!(matches!(rx1.recv().await, Some(Outbound::Close)));
        assert_eq!(registry.connection_count("alice").await, 1);

        let frame: Arc<str> = Arc::from("{}");
        assert_eq!(registry.send_to_user("alice", frame).await, 1);
        assert_eq!(&*recv_frame(&mut rx2).await, "{}");
    }

    #[tokio::test]
    async fn concurrent_registration_and_routing_stay_consistent() {
        let registry = Registry::new(DevicePolicy::Multi);
        let frame: Arc<str> = Arc::from("{}");

        // a connection registered before the route begins is always counted
        let (stable, mut stable_rx) = registry.new_handle();
        registry.register("alice", stable).await;

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (h, _rx) = registry.new_handle();
                let id = h.id();
                registry.register("alice", h).await;
                registry.unregister("alice", id).await;
            }));
        }
        for _ in 0..16 {
            let registry = registry.clone();
            let frame = frame.clone();
            tasks.push(tokio::spawn(async move {
                let delivered = registry.send_to_user("alice", frame).await;
                assert!(delivered >= 1);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.connection_count("alice").await, 1);
        let mut seen = 0;
        while let Ok(item) = stable_rx.try_recv() {
            assert!(matches!(item, Outbound::Frame(_)));
            seen += 1;
        }
        assert_eq!(seen, 16);
    }

    #[tokio::test]
    async fn close_all_reaches_unauthenticated_handlers() {
        let registry = Registry::new(DevicePolicy::Multi);
        let (h1, mut rx1) = registry.new_handle();
        registry.track(h1).await; // never registered to a user

        registry.close_all().await;
        let frame = recv_frame(&mut rx1).await;
        assert!(frame.contains("server_closed"));
        assert!(matches!(rx1.recv().await, Some(Outbound::Close)));
    }
}
