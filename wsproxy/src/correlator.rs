//! Correlation of tunneled replies with the HTTP exchanges waiting for them.
//!
//! Each exchange owns an event channel. The correlator keeps the sending half in its
//! pending map; removing the entry drops that half, which wakes the waiter. Terminal
//! failures are recorded in a slot shared with the waiter before the entry is dropped, so
//! the waiter can tell a timeout from a lost agent from a plain cancellation.
//!
//! Routing never waits on a waiter. Body data an exchange has not consumed yet counts
//! against a byte budget; an exchange that exceeds it is failed on its own.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::Error;
use crate::registry::ConnectionId;
use crate::transport::message::{
    Frame, RESPONSE_CHUNK, RESPONSE_HEADERS, ResponseChunk, ResponseHeaders, TunnelMessage,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeEvent {
    Headers(ResponseHeaders),
    Chunk { data: Bytes, is_final: bool },
}

struct PendingExchange {
    connection_id: ConnectionId,
    events: mpsc::UnboundedSender<ExchangeEvent>,
    outcome: Arc<OnceLock<Error>>,
    buffered: Arc<AtomicUsize>,
    headers_delivered: bool,
    created_at: Instant,
    expiry: AbortHandle,
}

impl Drop for PendingExchange {
    fn drop(&mut self) {
        self.expiry.abort();
    }
}

type PendingMap = HashMap<String, PendingExchange>;

pub struct Correlator {
    pending: RwLock<PendingMap>,
    body_buffer_limit: usize,
}

impl Correlator {
    /// `body_buffer_limit` caps the unread body bytes held for one exchange.
    pub fn new(body_buffer_limit: usize) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            body_buffer_limit: body_buffer_limit.max(1),
        }
    }

    /// Opens an exchange owned by `connection_id`, with its deadline armed now.
    ///
    /// The deadline fires whether or not anyone is waiting on the handle.
    pub fn register(
        self: &Arc<Self>,
        id: impl Into<String>,
        connection_id: ConnectionId,
        timeout: Duration,
    ) -> Result<ExchangeHandle, Error> {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let outcome = Arc::new(OnceLock::new());
        let buffered = Arc::new(AtomicUsize::new(0));
        let deadline = tokio::time::Instant::now() + timeout;

        let mut pending = self
            .pending
            .write()
            .map_err(|_| Error::Message("pending map poisoned".into()))?;
        match pending.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::Message(format!("duplicate request id {id}")));
            }
            Entry::Vacant(slot) => {
                let expiry =
                    tokio::spawn(expire(Arc::downgrade(self), id.clone(), deadline)).abort_handle();
                slot.insert(PendingExchange {
                    connection_id,
                    events: tx,
                    outcome: outcome.clone(),
                    buffered: buffered.clone(),
                    headers_delivered: false,
                    created_at: Instant::now(),
                    expiry,
                });
            }
        }
        drop(pending);
        debug!(request_id = %id, %connection_id, "Registered pending request");

        Ok(ExchangeHandle {
            id,
            events: rx,
            outcome,
            buffered,
            deadline,
            finished: false,
            correlator: self.clone(),
        })
    }

    /// Removes an exchange without a failure; its waiter observes [`Error::Cancelled`].
    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.pending.write().ok().and_then(|mut p| p.remove(id));
        if let Some(exchange) = &removed {
            debug!(
                request_id = %id,
                age_ms = exchange.created_at.elapsed().as_millis() as u64,
                "Unregistered pending request"
            );
        }
        removed.is_some()
    }

    /// Removes an exchange and wakes its waiter with `error`.
    pub fn fail(&self, id: &str, error: Error) -> bool {
        match self.pending.write() {
            Ok(mut pending) => fail_locked(&mut pending, id, error),
            Err(_) => false,
        }
    }

    /// Fails every exchange that was dispatched through `connection_id`.
    pub fn fail_connection(&self, connection_id: ConnectionId) -> usize {
        let failed: Vec<(String, PendingExchange)> = match self.pending.write() {
            Ok(mut pending) => {
                let ids: Vec<String> = pending
                    .iter()
                    .filter(|(_, exchange)| exchange.connection_id == connection_id)
                    .map(|(id, _)| id.clone())
                    .collect();
                ids.into_iter()
                    .filter_map(|id| pending.remove(&id).map(|exchange| (id, exchange)))
                    .collect()
            }
            Err(_) => Vec::new(),
        };

        for (id, exchange) in &failed {
            debug!(request_id = %id, %connection_id, "Client lost with request in flight");
            let _ = exchange.outcome.set(Error::AgentDisconnected);
        }
        failed.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending
            .read()
            .map(|p| p.contains_key(id))
            .unwrap_or(false)
    }

    /// Routes one frame received from an agent to the exchange it names.
    ///
    /// Never fails and never waits: unknown ids, unknown types and malformed frames are
    /// logged and dropped.
    pub fn dispatch(&self, frame: &Frame) {
        let envelope = match frame.peek() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Could not unmarshal base message: {}", e);
                return;
            }
        };

        if envelope.kind != RESPONSE_HEADERS && envelope.kind != RESPONSE_CHUNK {
            warn!(request_id = %envelope.id, "Unknown message type received: {}", envelope.kind);
            return;
        }

        if !self.contains(&envelope.id) {
            warn!("Received message for unknown id: {}", envelope.id);
            return;
        }

        match frame.decode_with(&envelope) {
            Ok(TunnelMessage::ResponseHeaders(headers)) => self.deliver_headers(headers),
            Ok(TunnelMessage::ResponseChunk(chunk)) => self.deliver_chunk(chunk),
            Ok(TunnelMessage::Request(_)) => {
                warn!(request_id = %envelope.id, "Unexpected request message from client");
            }
            Err(e) => {
                warn!(request_id = %envelope.id, "Malformed {} message: {}", envelope.kind, e);
                self.fail(
                    &envelope.id,
                    Error::ProtocolViolation(format!("malformed {}: {}", envelope.kind, e)),
                );
            }
        }
    }

    fn deliver_headers(&self, headers: ResponseHeaders) {
        let Ok(mut pending) = self.pending.write() else {
            return;
        };
        let id = headers.id.clone();
        let Some(exchange) = pending.get_mut(&id) else {
            warn!("Received message for unknown id: {}", id);
            return;
        };
        if exchange.headers_delivered {
            warn!(request_id = %id, "Ignoring duplicate response headers");
            return;
        }
        exchange.headers_delivered = true;

        if exchange.events.send(ExchangeEvent::Headers(headers)).is_err() {
            debug!(request_id = %id, "Response reader went away");
            pending.remove(&id);
        }
    }

    fn deliver_chunk(&self, chunk: ResponseChunk) {
        let Ok(mut pending) = self.pending.write() else {
            return;
        };
        let id = chunk.id;
        let Some(exchange) = pending.get(&id) else {
            warn!("Received message for unknown id: {}", id);
            return;
        };

        if !exchange.headers_delivered {
            warn!("Error: Received chunk before headers for {}", id);
            fail_locked(
                &mut pending,
                &id,
                Error::ProtocolViolation("received chunk before headers".into()),
            );
            return;
        }

        let size = chunk.data.len();
        let buffered = exchange.buffered.load(Ordering::Acquire);
        if buffered + size > self.body_buffer_limit {
            warn!(
                request_id = %id,
                buffered,
                "Response reader fell behind, dropping request"
            );
            fail_locked(&mut pending, &id, Error::SlowConsumer);
            return;
        }

        exchange.buffered.fetch_add(size, Ordering::AcqRel);
        let event = ExchangeEvent::Chunk {
            data: Bytes::from(chunk.data.into_bytes()),
            is_final: chunk.is_final,
        };
        let delivered = exchange.events.send(event).is_ok();
        if !delivered {
            debug!(request_id = %id, "Response reader went away");
        }
        if chunk.is_final || !delivered {
            // The waiter drains what was queued and then sees the channel close.
            pending.remove(&id);
        }
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(crate::config::BODY_BUFFER_LIMIT)
    }
}

fn fail_locked(pending: &mut PendingMap, id: &str, error: Error) -> bool {
    match pending.remove(id) {
        Some(exchange) => {
            debug!(request_id = %id, %error, "Failing pending request");
            let _ = exchange.outcome.set(error);
            true
        }
        None => false,
    }
}

async fn expire(correlator: Weak<Correlator>, id: String, deadline: tokio::time::Instant) {
    tokio::time::sleep_until(deadline).await;
    if let Some(correlator) = correlator.upgrade() {
        if correlator.fail(&id, Error::RequestTimeout) {
            warn!("Request {} timed out", id);
        }
    }
}

/// The waiting side of one exchange.
///
/// Dropping the handle unregisters the exchange.
pub struct ExchangeHandle {
    id: String,
    events: mpsc::UnboundedReceiver<ExchangeEvent>,
    outcome: Arc<OnceLock<Error>>,
    buffered: Arc<AtomicUsize>,
    deadline: tokio::time::Instant,
    finished: bool,
    correlator: Arc<Correlator>,
}

impl ExchangeHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn deadline(&self) -> tokio::time::Instant {
        self.deadline
    }

    /// Waits for the next event of this exchange.
    ///
    /// Returns `Ok(None)` after the final chunk has been handed out. Resolves with the
    /// exchange's terminal error on timeout, agent loss, protocol violation, a reader
    /// that fell behind or cancellation, whichever happens first.
    pub async fn recv(&mut self) -> Result<Option<ExchangeEvent>, Error> {
        if self.finished {
            return Ok(None);
        }

        match self.events.recv().await {
            Some(event) => {
                if let ExchangeEvent::Chunk { data, is_final } = &event {
                    self.buffered.fetch_sub(data.len(), Ordering::AcqRel);
                    self.finished = *is_final;
                }
                Ok(Some(event))
            }
            None => Err(self.outcome.get().cloned().unwrap_or(Error::Cancelled)),
        }
    }
}

impl Drop for ExchangeHandle {
    fn drop(&mut self) {
        self.correlator.unregister(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn headers_frame(id: &str, status: u16) -> Frame {
        Frame::from(
            json!({
                "type": "response-headers",
                "id": id,
                "status": status,
                "statusText": "OK",
                "headers": {"content-type": "text/plain"},
            })
            .to_string(),
        )
    }

    fn chunk_frame(id: &str, data: &str, is_final: bool) -> Frame {
        Frame::from(
            json!({"type": "response-chunk", "id": id, "data": data, "isFinal": is_final})
                .to_string(),
        )
    }

    fn correlator() -> Arc<Correlator> {
        Arc::new(Correlator::new(8))
    }

    const LONG: Duration = Duration::from_secs(30);

    async fn expect_chunk(handle: &mut ExchangeHandle) -> (Bytes, bool) {
        match handle.recv().await.unwrap() {
            Some(ExchangeEvent::Chunk { data, is_final }) => (data, is_final),
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_headers_then_ordered_chunks() {
        let correlator = correlator();
        let mut handle = correlator.register("a", ConnectionId::new(), LONG).unwrap();

        correlator.dispatch(&headers_frame("a", 200));
        for (data, last) in [("A", false), ("B", false), ("C", false), ("D", true)] {
            correlator.dispatch(&chunk_frame("a", data, last));
        }

        match handle.recv().await.unwrap() {
            Some(ExchangeEvent::Headers(h)) => assert_eq!(h.status, 200),
            other => panic!("expected headers, got {other:?}"),
        }
        let mut body = Vec::new();
        loop {
            let (data, is_final) = expect_chunk(&mut handle).await;
            body.push((String::from_utf8(data.to_vec()).unwrap(), is_final));
            if is_final {
                break;
            }
        }
        assert_eq!(
            body,
            vec![
                ("A".to_string(), false),
                ("B".to_string(), false),
                ("C".to_string(), false),
                ("D".to_string(), true),
            ]
        );
        assert_eq!(handle.recv().await.unwrap(), None);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_chunk_before_headers_fails_exchange() {
        let correlator = correlator();
        let mut handle = correlator.register("x", ConnectionId::new(), LONG).unwrap();

        correlator.dispatch(&chunk_frame("x", "early", false));

        assert!(matches!(
            handle.recv().await,
            Err(Error::ProtocolViolation(_))
        ));
        assert!(!correlator.contains("x"));
    }

    #[tokio::test]
    async fn test_duplicate_headers_first_wins() {
        let correlator = correlator();
        let mut handle = correlator.register("d", ConnectionId::new(), LONG).unwrap();

        correlator.dispatch(&headers_frame("d", 201));
        correlator.dispatch(&headers_frame("d", 500));
        correlator.dispatch(&chunk_frame("d", "ok", true));

        match handle.recv().await.unwrap() {
            Some(ExchangeEvent::Headers(h)) => assert_eq!(h.status, 201),
            other => panic!("expected headers, got {other:?}"),
        }
        assert_eq!(expect_chunk(&mut handle).await, (Bytes::from("ok"), true));
    }

    #[tokio::test]
    async fn test_unknown_id_is_dropped() {
        let correlator = correlator();
        let _handle = correlator.register("known", ConnectionId::new(), LONG).unwrap();

        correlator.dispatch(&headers_frame("stranger", 200));
        correlator.dispatch(&Frame::from("not json"));
        correlator
            .dispatch(&Frame::from(r#"{"type":"telemetry","id":"known"}"#));

        assert!(correlator.contains("known"));
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_fails_routed_exchange() {
        let correlator = correlator();
        let mut handle = correlator.register("m", ConnectionId::new(), LONG).unwrap();

        correlator
            .dispatch(&Frame::from(
                r#"{"type":"response-headers","id":"m","status":"two hundred"}"#,
            ));

        assert!(matches!(
            handle.recv().await,
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_conflicting_ids_fail_routed_exchange() {
        let correlator = correlator();
        let mut handle = correlator.register("n", ConnectionId::new(), LONG).unwrap();

        correlator.dispatch(&Frame::from(
            r#"{"type":"response-headers","id":"n","uuid":"n","status":200,"headers":{}}"#,
        ));

        assert!(matches!(
            handle.recv().await,
            Err(Error::ProtocolViolation(_))
        ));
        assert!(!correlator.contains("n"));
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent_and_wakes_waiter() {
        let correlator = correlator();
        let mut handle = correlator.register("u", ConnectionId::new(), LONG).unwrap();

        let waiter = tokio::spawn(async move { handle.recv().await });
        tokio::task::yield_now().await;

        assert!(correlator.unregister("u"));
        assert!(!correlator.unregister("u"));

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_timeout_removes_exchange() {
        let correlator = correlator();
        let mut handle = correlator
            .register("slow", ConnectionId::new(), Duration::from_millis(50))
            .unwrap();

        let started = Instant::now();
        assert!(matches!(handle.recv().await, Err(Error::RequestTimeout)));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!correlator.contains("slow"));
    }

    #[tokio::test]
    async fn test_connection_loss_fails_only_owned_exchanges() {
        let correlator = correlator();
        let lost = ConnectionId::new();
        let alive = ConnectionId::new();
        let mut doomed = correlator.register("1", lost, LONG).unwrap();
        let _survivor = correlator.register("2", alive, LONG).unwrap();

        assert_eq!(correlator.fail_connection(lost), 1);

        assert!(matches!(doomed.recv().await, Err(Error::AgentDisconnected)));
        assert!(correlator.contains("2"));
    }

    #[tokio::test]
    async fn test_dropping_handle_unregisters() {
        let correlator = correlator();
        let handle = correlator.register("gone", ConnectionId::new(), LONG).unwrap();
        assert_eq!(correlator.pending_count(), 1);

        drop(handle);
        assert_eq!(correlator.pending_count(), 0);

        // Late frames for the dropped exchange are harmless.
        correlator.dispatch(&headers_frame("gone", 200));
    }

    #[tokio::test]
    async fn test_duplicate_register_rejected() {
        let correlator = correlator();
        let _first = correlator.register("dup", ConnectionId::new(), LONG).unwrap();
        assert!(correlator.register("dup", ConnectionId::new(), LONG).is_err());
    }

    #[tokio::test]
    async fn test_concurrent_exchanges_never_cross() {
        let correlator = Arc::new(Correlator::new(64));
        let connection = ConnectionId::new();

        let mut waiters = Vec::new();
        for i in 0..32 {
            let id = format!("req-{i}");
            let mut handle = correlator.register(id.clone(), connection, LONG).unwrap();
            waiters.push(tokio::spawn(async move {
                let status = match handle.recv().await.unwrap() {
                    Some(ExchangeEvent::Headers(h)) => h.status,
                    other => panic!("expected headers, got {other:?}"),
                };
                let mut body = String::new();
                while let Some(ExchangeEvent::Chunk { data, .. }) = handle.recv().await.unwrap() {
                    body.push_str(std::str::from_utf8(&data).unwrap());
                }
                (id, status, body)
            }));
        }

        // Interleave frames of all exchanges on one "connection".
        for i in 0..32 {
            correlator
                .dispatch(&headers_frame(&format!("req-{i}"), 200 + i as u16));
        }
        for part in 0..3 {
            for i in 0..32 {
                let id = format!("req-{i}");
                correlator
                    .dispatch(&chunk_frame(&id, &format!("{id}:{part};"), part == 2));
            }
        }

        for waiter in waiters {
            let (id, status, body) = waiter.await.unwrap();
            let i: u16 = id.trim_start_matches("req-").parse().unwrap();
            assert_eq!(status, 200 + i);
            assert_eq!(body, format!("{id}:0;{id}:1;{id}:2;"));
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_deadline_fires_without_a_waiter() {
        let correlator = correlator();
        let handle = correlator
            .register("idle", ConnectionId::new(), Duration::from_millis(50))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!correlator.contains("idle"));
        drop(handle);
    }

    #[tokio::test]
    async fn test_reader_falling_behind_fails_only_its_exchange() {
        let correlator = Arc::new(Correlator::new(8));
        let connection = ConnectionId::new();
        let mut stalled = correlator.register("stalled", connection, LONG).unwrap();
        let mut other = correlator.register("other", connection, LONG).unwrap();

        correlator.dispatch(&headers_frame("stalled", 200));
        for _ in 0..4 {
            correlator.dispatch(&chunk_frame("stalled", "abcd", false));
        }
        correlator.dispatch(&headers_frame("other", 202));
        correlator.dispatch(&chunk_frame("other", "done", true));

        assert!(!correlator.contains("stalled"));
        match other.recv().await.unwrap() {
            Some(ExchangeEvent::Headers(h)) => assert_eq!(h.status, 202),
            event => panic!("expected headers, got {event:?}"),
        }
        assert_eq!(expect_chunk(&mut other).await, (Bytes::from("done"), true));

        // What was buffered before the overflow is still handed out.
        assert!(matches!(
            stalled.recv().await,
            Ok(Some(ExchangeEvent::Headers(_)))
        ));
        assert_eq!(expect_chunk(&mut stalled).await, (Bytes::from("abcd"), false));
        assert_eq!(expect_chunk(&mut stalled).await, (Bytes::from("abcd"), false));
        assert!(matches!(stalled.recv().await, Err(Error::SlowConsumer)));
    }

    #[tokio::test]
    async fn test_consumed_chunks_free_the_budget() {
        let correlator = Arc::new(Correlator::new(8));
        let mut handle = correlator.register("s", ConnectionId::new(), LONG).unwrap();

        correlator.dispatch(&headers_frame("s", 200));
        handle.recv().await.unwrap();
        for _ in 0..10 {
            correlator.dispatch(&chunk_frame("s", "abcdef", false));
            assert_eq!(expect_chunk(&mut handle).await.0, Bytes::from("abcdef"));
        }
        correlator.dispatch(&chunk_frame("s", "", true));
        assert_eq!(expect_chunk(&mut handle).await, (Bytes::new(), true));
        assert_eq!(handle.recv().await.unwrap(), None);
    }
}
