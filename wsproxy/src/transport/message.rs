use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const REQUEST: &str = "request";
pub const RESPONSE_HEADERS: &str = "response-headers";
pub const RESPONSE_CHUNK: &str = "response-chunk";

/// One text frame on the tunnel socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    inner: String,
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Failed to (de)serialize message")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown message type `{0}`")]
    UnknownType(String),
}

/// The routing part of every frame, readable even when the payload is not.
///
/// `id` wins over the legacy `uuid` when a frame carries both; the full decode then
/// rejects the frame, which fails the exchange it names.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawEnvelope")]
pub struct Envelope {
    pub kind: String,
    pub id: String,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    id: Option<String>,
    uuid: Option<String>,
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = String;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        let id = raw
            .id
            .or(raw.uuid)
            .ok_or_else(|| "missing field `id`".to_string())?;
        Ok(Self { kind: raw.kind, id })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TunnelMessage {
    Request(ProxyRequest),
    ResponseHeaders(ResponseHeaders),
    ResponseChunk(ResponseChunk),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRequest {
    #[serde(alias = "uuid")]
    pub id: String,
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseHeaders {
    #[serde(alias = "uuid")]
    pub id: String,
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseChunk {
    #[serde(alias = "uuid")]
    pub id: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub is_final: bool,
}

impl TunnelMessage {
    pub fn id(&self) -> &str {
        match self {
            TunnelMessage::Request(req) => &req.id,
            TunnelMessage::ResponseHeaders(headers) => &headers.id,
            TunnelMessage::ResponseChunk(chunk) => &chunk.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TunnelMessage::Request(_) => REQUEST,
            TunnelMessage::ResponseHeaders(_) => RESPONSE_HEADERS,
            TunnelMessage::ResponseChunk(_) => RESPONSE_CHUNK,
        }
    }
}

impl From<String> for Frame {
    fn from(value: String) -> Self {
        Self { inner: value }
    }
}

impl From<&str> for Frame {
    fn from(value: &str) -> Self {
        Self {
            inner: value.to_owned(),
        }
    }
}

impl From<Frame> for String {
    fn from(value: Frame) -> Self {
        value.inner
    }
}

impl Frame {
    pub fn as_str(&self) -> &str {
        &self.inner
    }

    pub fn into_inner(self) -> String {
        self.inner
    }

    pub fn encode(message: &TunnelMessage) -> Result<Self, MessageError> {
        Ok(serde_json::to_string(message)?.into())
    }

    /// First decoding pass: only the discriminant and the identifier.
    pub fn peek(&self) -> Result<Envelope, MessageError> {
        Ok(serde_json::from_str(&self.inner)?)
    }

    /// Second decoding pass, driven by an envelope obtained from [`Frame::peek`].
    pub fn decode_with(&self, envelope: &Envelope) -> Result<TunnelMessage, MessageError> {
        let message = match envelope.kind.as_str() {
            REQUEST => TunnelMessage::Request(serde_json::from_str(&self.inner)?),
            RESPONSE_HEADERS => TunnelMessage::ResponseHeaders(serde_json::from_str(&self.inner)?),
            RESPONSE_CHUNK => TunnelMessage::ResponseChunk(serde_json::from_str(&self.inner)?),
            other => return Err(MessageError::UnknownType(other.to_owned())),
        };
        Ok(message)
    }

    pub fn decode(&self) -> Result<TunnelMessage, MessageError> {
        let envelope = self.peek()?;
        self.decode_with(&envelope)
    }
}
