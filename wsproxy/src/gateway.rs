//! Public HTTP surface: the tunnel upgrade endpoint and the catch-all proxy.

use std::convert::Infallible;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Sink, Stream, StreamExt, stream};
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame as BodyFrame, Incoming};
use hyper::ext::ReasonPhrase;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::auth;
use crate::config::TunnelConfig;
use crate::correlator::{Correlator, ExchangeEvent, ExchangeHandle};
use crate::error::Error;
use crate::registry::{AgentConnection, ConnectionRegistry};
use crate::transport::message::{Frame, ProxyRequest, ResponseHeaders, TunnelMessage};
use crate::transport::pump;

pub type ProxyBody = UnsyncBoxBody<Bytes, Error>;

/// Headers that describe the agent's own hop and are never mirrored.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct Gateway {
    config: TunnelConfig,
    registry: Arc<ConnectionRegistry>,
    correlator: Arc<Correlator>,
}

impl Gateway {
    pub fn new(config: TunnelConfig) -> Arc<Self> {
        let correlator = Arc::new(Correlator::new(config.body_buffer_limit));
        Arc::new(Self {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            correlator,
        })
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Accepts HTTP connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let gateway = self.clone();
            tokio::spawn(
                async move {
                    let service = service_fn(move |req| {
                        let gateway = gateway.clone();
                        async move { Ok::<_, Infallible>(gateway.handle(req).await) }
                    });
                    if let Err(err) = auto::Builder::new(TokioExecutor::new())
                        .serve_connection_with_upgrades(TokioIo::new(stream), service)
                        .await
                    {
                        debug!("Connection ended with error: {err:#}");
                    }
                }
                .instrument(info_span!("http", %remote_addr)),
            );
        }
    }

    pub async fn handle(self: Arc<Self>, req: Request<Incoming>) -> Response<ProxyBody> {
        if req.uri().path() == self.config.tunnel_path {
            return self.accept_tunnel(req);
        }

        match self.proxy(req).await {
            Ok(response) => response,
            Err(error) => {
                warn!("{}", error);
                error_response(&error)
            }
        }
    }

    /// Selects an agent, tunnels the request to it and returns the streamed reply.
    pub async fn forward(
        &self,
        method: &Method,
        path: &str,
        body: Bytes,
    ) -> Result<Response<ProxyBody>, Error> {
        let connection = self.registry.select_next()?;
        self.exchange(&connection, method, path, body).await
    }

    async fn proxy(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, Error> {
        let connection = self.registry.select_next()?;

        let method = req.method().clone();
        let path = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str().to_owned())
            .unwrap_or_else(|| "/".to_owned());
        info!(
            "Proxying request {} {} via client {}",
            method,
            path,
            connection.id()
        );

        let body = req
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Body(e.to_string()))?
            .to_bytes();

        self.exchange(&connection, &method, &path, body).await
    }

    async fn exchange(
        &self,
        connection: &AgentConnection,
        method: &Method,
        path: &str,
        body: Bytes,
    ) -> Result<Response<ProxyBody>, Error> {
        let id = Uuid::new_v4().to_string();
        let frame = Frame::encode(&TunnelMessage::Request(ProxyRequest {
            id: id.clone(),
            method: method.to_string(),
            path: path.to_owned(),
            body: (!body.is_empty()).then(|| String::from_utf8_lossy(&body).into_owned()),
        }))?;

        let mut exchange =
            self.correlator
                .register(id, connection.id(), self.config.request_timeout)?;

        tokio::time::timeout_at(exchange.deadline(), connection.send(frame))
            .await
            .map_err(|_| Error::RequestTimeout)??;

        let head = match exchange.recv().await? {
            Some(ExchangeEvent::Headers(head)) => head,
            _ => {
                return Err(Error::ProtocolViolation(
                    "response ended before headers".into(),
                ));
            }
        };

        let builder = response_builder(&head)?;
        builder
            .body(body_stream(exchange))
            .map_err(|e| Error::ProtocolViolation(e.to_string()))
    }

    fn accept_tunnel(self: &Arc<Self>, mut req: Request<Incoming>) -> Response<ProxyBody> {
        if !auth::authorize(self.config.password.as_deref(), req.uri().query()) {
            warn!("WebSocket connection rejected: invalid password");
            return plain(StatusCode::UNAUTHORIZED, "Unauthorized");
        }
        if !hyper_tungstenite::is_upgrade_request(&req) {
            return plain(StatusCode::BAD_REQUEST, "Expected a WebSocket upgrade");
        }

        let (response, websocket) = match hyper_tungstenite::upgrade(&mut req, None) {
            Ok(upgrade) => upgrade,
            Err(e) => {
                warn!("Failed to upgrade connection: {}", e);
                return plain(StatusCode::BAD_REQUEST, "Failed to upgrade connection");
            }
        };

        let gateway = self.clone();
        tokio::spawn(async move {
            match websocket.await {
                Ok(socket) => gateway.run_tunnel(socket).await,
                Err(e) => warn!("Failed to upgrade connection: {}", e),
            }
        });

        response.map(|body| body.map_err(|never| match never {}).boxed_unsync())
    }

    /// Attaches an upgraded socket as an agent connection and runs its pumps until the
    /// connection is lost.
    pub async fn run_tunnel<S>(self: Arc<Self>, socket: S)
    where
        S: Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError>,
        S: Send + 'static,
    {
        let (connection, queue) = AgentConnection::new(self.config.outbound_capacity);
        self.registry.attach(connection.clone());

        let (sink, stream) = socket.split();
        let writer = tokio::spawn(pump::outbound(
            connection.clone(),
            queue,
            sink,
            self.config.clone(),
        ));

        let exit = pump::inbound(
            connection.clone(),
            stream,
            self.correlator.clone(),
            &self.config,
        )
        .await;
        debug!(connection_id = %connection.id(), ?exit, "Reader stopped");

        self.detach(&connection);
        let _ = writer.await;
    }

    /// Removes a connection and fails the exchanges that were dispatched through it.
    pub fn detach(&self, connection: &AgentConnection) {
        if self.registry.detach(connection) {
            let failed = self.correlator.fail_connection(connection.id());
            if failed > 0 {
                warn!(
                    connection_id = %connection.id(),
                    "Client lost with {} requests in flight",
                    failed
                );
            }
        }
    }
}

fn response_builder(head: &ResponseHeaders) -> Result<http::response::Builder, Error> {
    let status = StatusCode::from_u16(head.status)
        .map_err(|_| Error::ProtocolViolation(format!("invalid status {}", head.status)))?;

    let mut builder = Response::builder().status(status);
    for (name, value) in &head.headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!(request_id = %head.id, "Skipping invalid header name {:?}", name);
            continue;
        };
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        let Ok(value) = HeaderValue::from_str(value) else {
            warn!(request_id = %head.id, "Skipping invalid value for header {}", name);
            continue;
        };
        builder = builder.header(name, value);
    }

    if !head.status_text.is_empty() && status.canonical_reason() != Some(head.status_text.as_str())
    {
        if let Ok(reason) = ReasonPhrase::try_from(head.status_text.clone()) {
            builder = builder.extension(reason);
        }
    }
    Ok(builder)
}

/// Streams the exchange's chunks as response body frames.
///
/// A terminal error after the headers went out surfaces as a body error, which aborts
/// the transfer.
fn body_stream(exchange: ExchangeHandle) -> ProxyBody {
    let chunks = stream::unfold(Some(exchange), |state| async move {
        let mut exchange = state?;
        loop {
            match exchange.recv().await {
                Ok(Some(ExchangeEvent::Chunk { data, is_final })) => {
                    if data.is_empty() {
                        if is_final {
                            return None;
                        }
                        continue;
                    }
                    let next = (!is_final).then_some(exchange);
                    return Some((Ok(BodyFrame::data(data)), next));
                }
                Ok(Some(ExchangeEvent::Headers(_))) => continue,
                Ok(None) => return None,
                Err(error) => {
                    warn!(request_id = %exchange.id(), "Aborting response body: {}", error);
                    return Some((Err(error), None));
                }
            }
        }
    });
    StreamBody::new(chunks).boxed_unsync()
}

fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn plain(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full(format!("{message}\n")));
    *response.status_mut() = status;
    if let Ok(content_type) = HeaderValue::from_str(mime::TEXT_PLAIN_UTF_8.as_ref()) {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    response
}

fn error_response(error: &Error) -> Response<ProxyBody> {
    plain(error.status(), &error.to_string())
}
