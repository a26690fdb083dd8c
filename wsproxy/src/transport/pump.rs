//! Reader and writer loops of one tunnel connection.
//!
//! Neither loop removes the connection from the registry itself. The writer closes the
//! connection when it fails, which stops the reader; the reader's caller then detaches.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::correlator::Correlator;
use crate::registry::{AgentConnection, OutboundQueue};
use crate::transport::message::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// The connection was closed from our side.
    Closed,
    /// The agent sent a close frame or ended the stream.
    PeerClosed,
    /// Nothing was received within the read-liveness deadline.
    LivenessExpired,
    /// The transport reported an error.
    TransportError,
}

/// Reads frames from the agent and hands them to the correlator until the connection
/// ends.
///
/// Routing a frame never waits on the exchange it belongs to, so one stalled HTTP reader
/// cannot hold up the others sharing this connection.
pub async fn inbound<S>(
    connection: Arc<AgentConnection>,
    mut stream: S,
    correlator: Arc<Correlator>,
    config: &TunnelConfig,
) -> PumpExit
where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    let closed = connection.closed();
    tokio::pin!(closed);

    loop {
        let next = tokio::select! {
            biased;
            _ = &mut closed => return PumpExit::Closed,
            next = timeout(config.pong_wait, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                warn!(
                    connection_id = %connection.id(),
                    idle_for = ?connection.idle_for(),
                    "No message from client within {:?}",
                    config.pong_wait
                );
                return PumpExit::LivenessExpired;
            }
            Ok(None) => return PumpExit::PeerClosed,
            Ok(Some(Err(e))) => {
                match e {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => {}
                    WsError::Protocol(ref p) => {
                        debug!(connection_id = %connection.id(), "Unexpected close: {}", p);
                    }
                    e => warn!(connection_id = %connection.id(), "error: {}", e),
                }
                return PumpExit::TransportError;
            }
            Ok(Some(Ok(message))) => message,
        };

        connection.touch();
        match message {
            WsMessage::Text(text) => {
                correlator.dispatch(&Frame::from(text.as_str()));
            }
            WsMessage::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => correlator.dispatch(&Frame::from(text)),
                Err(_) => warn!(connection_id = %connection.id(), "Dropping non UTF-8 binary frame"),
            },
            WsMessage::Ping(_) | WsMessage::Pong(_) => {
                debug!(connection_id = %connection.id(), "Received keepalive");
            }
            WsMessage::Close(frame) => {
                info!(connection_id = %connection.id(), "Client closed connection: {:?}", frame);
                return PumpExit::PeerClosed;
            }
            WsMessage::Frame(_) => {}
        }
    }
}

/// Drains the outbound queue into the agent and pings it on a fixed interval.
///
/// Returns when the queue is closed (after sending a close frame) or when a write fails
/// (after closing the connection).
pub async fn outbound<S>(
    connection: Arc<AgentConnection>,
    mut queue: OutboundQueue,
    mut sink: S,
    config: TunnelConfig,
) -> PumpExit
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    let mut ticker = interval_at(Instant::now() + config.ping_period, config.ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let exit = loop {
        tokio::select! {
            frame = queue.recv() => {
                let Some(frame) = frame else {
                    let close = WsMessage::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    }));
                    let _ = timeout(config.write_wait, sink.send(close)).await;
                    break PumpExit::Closed;
                };
                let message = WsMessage::text(frame.into_inner());
                if !write(&mut sink, message, &config).await {
                    break PumpExit::TransportError;
                }
            }
            _ = ticker.tick() => {
                if !write(&mut sink, WsMessage::Ping(Bytes::new()), &config).await {
                    warn!(connection_id = %connection.id(), "Failed to ping client");
                    break PumpExit::TransportError;
                }
            }
        }
    };

    connection.close();
    exit
}

async fn write<S>(sink: &mut S, message: WsMessage, config: &TunnelConfig) -> bool
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    match timeout(config.write_wait, sink.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("Write to client failed: {}", e);
            false
        }
        Err(_) => {
            debug!("Write to client timed out after {:?}", config.write_wait);
            false
        }
    }
}
