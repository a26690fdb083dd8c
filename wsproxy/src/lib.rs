//! Expose an HTTP origin that has no inbound reachability.
//!
//! An agent dials the server's tunnel endpoint over WebSocket. Every public HTTP request
//! the server receives is sent to one attached agent as a `request` frame; the agent
//! performs the call and streams `response-headers` and `response-chunk` frames back,
//! which are replayed to the HTTP caller as they arrive.

pub mod auth;
pub mod config;
pub mod correlator;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod transport;

pub use config::TunnelConfig;
pub use correlator::{Correlator, ExchangeEvent, ExchangeHandle};
pub use error::Error;
pub use gateway::{Gateway, ProxyBody};
pub use registry::{AgentConnection, ConnectionId, ConnectionRegistry};
pub use transport::message::{
    Envelope, Frame, MessageError, ProxyRequest, ResponseChunk, ResponseHeaders, TunnelMessage,
};
