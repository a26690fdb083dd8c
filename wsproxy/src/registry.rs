//! Registry of attached agent connections.
//!
//! Selection is round-robin over the live set, recomputed on every call. Reads take the
//! shared lock only; attach and detach take it exclusively.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Error;
use crate::transport::message::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Receiving end of an agent's outbound queue, drained by the outbound pump.
pub type OutboundQueue = mpsc::Receiver<Frame>;

/// One attached tunnel connection.
pub struct AgentConnection {
    id: ConnectionId,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    shutdown: watch::Sender<bool>,
    connected_at: Instant,
    last_seen_ms: AtomicU64,
}

impl fmt::Debug for AgentConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConnection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AgentConnection {
    pub fn new(capacity: usize) -> (Arc<Self>, OutboundQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let connection = Arc::new(Self {
            id: ConnectionId::new(),
            outbound: Mutex::new(Some(tx)),
            shutdown,
            connected_at: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        });
        (connection, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Enqueues a frame for the outbound pump.
    ///
    /// Waits while the queue is full. Fails with [`Error::AgentDisconnected`] once the
    /// connection has been closed or its outbound pump is gone.
    pub async fn send(&self, frame: Frame) -> Result<(), Error> {
        let sender = self
            .outbound
            .lock()
            .map_err(|_| Error::AgentDisconnected)?
            .clone()
            .ok_or(Error::AgentDisconnected)?;
        sender.send(frame).await.map_err(|_| Error::AgentDisconnected)
    }

    /// Closes the outbound queue and signals both pumps to stop. Idempotent.
    pub fn close(&self) {
        if let Ok(mut outbound) = self.outbound.lock() {
            outbound.take();
        }
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once [`AgentConnection::close`] has been called.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shutdown.subscribe();
        async move {
            let _ = rx.wait_for(|closed| *closed).await;
        }
    }

    /// Records that the agent showed a sign of life.
    pub fn touch(&self) {
        let elapsed = self.connected_at.elapsed().as_millis() as u64;
        self.last_seen_ms.store(elapsed, Ordering::Relaxed);
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        let last_seen = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.connected_at.elapsed().saturating_sub(last_seen)
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<Vec<Arc<AgentConnection>>>,
    cursor: AtomicUsize,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection; it is eligible for selection as soon as this returns.
    pub fn attach(&self, connection: Arc<AgentConnection>) {
        let Ok(mut connections) = self.connections.write() else {
            return;
        };
        if connections.iter().any(|c| c.id == connection.id) {
            debug!(connection_id = %connection.id, "Connection already attached");
            return;
        }
        connections.push(connection.clone());
        info!(
            connection_id = %connection.id,
            total = connections.len(),
            "Client connected"
        );
    }

    /// Removes a connection and closes its outbound queue.
    ///
    /// Returns `true` only for the call that actually removed it.
    pub fn detach(&self, connection: &AgentConnection) -> bool {
        let removed = match self.connections.write() {
            Ok(mut connections) => {
                let position = connections.iter().position(|c| c.id == connection.id);
                position.map(|index| {
                    connections.remove(index);
                    connections.len()
                })
            }
            Err(_) => None,
        };
        connection.close();

        match removed {
            Some(total) => {
                info!(
                    connection_id = %connection.id,
                    total,
                    connected_for = ?connection.connected_for(),
                    "Client disconnected"
                );
                true
            }
            None => false,
        }
    }

    pub fn select_next(&self) -> Result<Arc<AgentConnection>, Error> {
        let connections = self
            .connections
            .read()
            .map_err(|_| Error::NoAgentAvailable)?;
        if connections.is_empty() {
            return Err(Error::NoAgentAvailable);
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % connections.len();
        Ok(connections[index].clone())
    }

    pub fn len(&self) -> usize {
        self.connections.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections
            .read()
            .map(|c| c.iter().map(|c| c.id).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn connection() -> Arc<AgentConnection> {
        AgentConnection::new(4).0
    }

    #[test]
    fn test_select_from_empty_registry() {
        let registry = ConnectionRegistry::new();
        assert!(matches!(
            registry.select_next(),
            Err(Error::NoAgentAvailable)
        ));
    }

    #[test]
    fn test_round_robin_visits_every_connection() {
        let registry = ConnectionRegistry::new();
        let connections: Vec<_> = (0..3).map(|_| connection()).collect();
        for c in &connections {
            registry.attach(c.clone());
        }

        let picked: Vec<_> = (0..6).map(|_| registry.select_next().unwrap().id()).collect();
        let distinct: HashSet<_> = picked[..3].iter().collect();
        assert_eq!(distinct.len(), 3);
        assert_eq!(picked[..3], picked[3..]);
    }

    #[test]
    fn test_attach_twice_keeps_one_entry() {
        let registry = ConnectionRegistry::new();
        let c = connection();
        registry.attach(c.clone());
        registry.attach(c.clone());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_detach_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let c = connection();
        registry.attach(c.clone());

        assert!(registry.detach(&c));
        assert!(!registry.detach(&c));
        assert!(registry.is_empty());
        assert!(c.is_closed());
    }

    #[test]
    fn test_never_selects_detached_connection() {
        let registry = ConnectionRegistry::new();
        let connections: Vec<_> = (0..4).map(|_| connection()).collect();
        for c in &connections {
            registry.attach(c.clone());
        }

        registry.detach(&connections[1]);
        registry.detach(&connections[3]);

        for _ in 0..16 {
            let picked = registry.select_next().unwrap();
            assert!(picked.id() == connections[0].id() || picked.id() == connections[2].id());
        }

        registry.detach(&connections[0]);
        registry.detach(&connections[2]);
        assert!(matches!(
            registry.select_next(),
            Err(Error::NoAgentAvailable)
        ));
    }

    #[test]
    fn test_ids_follow_live_set() {
        let registry = ConnectionRegistry::new();
        let (a, b) = (connection(), connection());
        registry.attach(a.clone());
        registry.attach(b.clone());
        assert_eq!(registry.ids(), vec![a.id(), b.id()]);

        registry.detach(&a);
        assert_eq!(registry.ids(), vec![b.id()]);
    }

    #[test]
    fn test_touch_resets_idle_time() {
        let c = connection();
        std::thread::sleep(Duration::from_millis(30));
        assert!(c.idle_for() >= Duration::from_millis(30));
        assert!(c.connected_for() >= c.idle_for());

        c.touch();
        assert!(c.idle_for() < Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (c, mut queue) = AgentConnection::new(4);
        c.send(Frame::from("one")).await.unwrap();
        c.close();

        assert!(matches!(
            c.send(Frame::from("two")).await,
            Err(Error::AgentDisconnected)
        ));
        assert_eq!(queue.recv().await.unwrap().as_str(), "one");
        assert!(queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_fails_when_pump_is_gone() {
        let (c, queue) = AgentConnection::new(4);
        drop(queue);
        assert!(matches!(
            c.send(Frame::from("lost")).await,
            Err(Error::AgentDisconnected)
        ));
    }

    #[tokio::test]
    async fn test_closed_resolves_after_close() {
        let c = connection();
        let closed = c.closed();
        c.close();
        tokio::time::timeout(Duration::from_secs(1), closed)
            .await
            .unwrap();
    }
}
