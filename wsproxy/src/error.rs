use http::StatusCode;
use thiserror::Error;

use crate::transport::message::MessageError;

/// Failures of a single exchange or of the tunnel connection carrying it.
///
/// None of these is fatal to the process; each one ends at most one exchange
/// or one agent connection.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("No available proxy clients")]
    NoAgentAvailable,

    #[error("Proxy request timed out")]
    RequestTimeout,

    #[error("Proxy protocol error: {0}")]
    ProtocolViolation(String),

    #[error("Proxy client disconnected")]
    AgentDisconnected,

    #[error("Proxy request cancelled")]
    Cancelled,

    #[error("Response reader fell behind the proxy client")]
    SlowConsumer,

    #[error("Failed to create proxy request: {0}")]
    Message(String),

    #[error("Failed to read request body: {0}")]
    Body(String),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::NoAgentAvailable => StatusCode::SERVICE_UNAVAILABLE,
            Error::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            Error::ProtocolViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::AgentDisconnected | Error::Cancelled | Error::SlowConsumer => {
                StatusCode::BAD_GATEWAY
            }
            Error::Message(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Body(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<MessageError> for Error {
    fn from(value: MessageError) -> Self {
        Error::Message(value.to_string())
    }
}
