//! Agent command - answers tunneled requests from a local HTTP server.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use reqwest::header::HeaderMap;
use reqwest_hickory_resolver::HickoryResolver;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use url::Url;
use wsproxy::auth::PASSWORD_PARAM;
use wsproxy::{Frame, ProxyRequest, ResponseChunk, ResponseHeaders, TunnelMessage};

/// Connect to a proxy server and answer its requests from a local server
#[derive(Debug, clap::Args)]
pub struct Args {
    /// Tunnel endpoint of the proxy server
    #[arg(
        long,
        env = "WSPROXY_SERVER",
        default_value = "ws://127.0.0.1:7769/__ws_proxy"
    )]
    server: Url,

    /// Password expected by the proxy server
    #[arg(long, env = "WSPROXY_PASSWORD")]
    password: Option<String>,

    /// Origin of the local server that receives the requests
    #[arg(long, env = "WSPROXY_TARGET", default_value = "http://127.0.0.1:3000")]
    target: Url,
}

const INITIAL_BACKOFF_MS: u64 = 1000;
const MAX_BACKOFF_MS: u64 = 60000;
const BACKOFF_MULTIPLIER: f64 = 2.0;

const BAD_GATEWAY: u16 = 502;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SharedSink = Arc<Mutex<SplitSink<WsStream, WsMessage>>>;

pub async fn execute(args: &Args) -> Result<()> {
    let client = local_client()?;
    let endpoint = tunnel_url(&args.server, args.password.as_deref());

    let mut backoff_ms = INITIAL_BACKOFF_MS;
    let mut first_connect = true;

    loop {
        if !first_connect {
            info!("Reconnecting in {} ms...", backoff_ms);
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        }
        first_connect = false;

        match connect_and_run(&endpoint, &client, &args.target).await {
            Ok(()) => {
                info!("Agent stopped");
                break;
            }
            Err(e) => {
                error!("Tunnel error: {:#}", e);
                backoff_ms = ((backoff_ms as f64) * BACKOFF_MULTIPLIER) as u64;
                if backoff_ms > MAX_BACKOFF_MS {
                    backoff_ms = MAX_BACKOFF_MS;
                }
            }
        }
    }

    Ok(())
}

fn local_client() -> Result<reqwest::Client> {
    let resolver = Arc::new(HickoryResolver::default());
    let client = reqwest::Client::builder()
        .dns_resolver(resolver)
        // Bodies are relayed byte for byte with their Content-Encoding.
        .no_gzip()
        .no_brotli()
        .no_deflate()
        .no_zstd()
        .build()?;
    Ok(client)
}

fn tunnel_url(server: &Url, password: Option<&str>) -> Url {
    let mut url = server.clone();
    if let Some(password) = password.filter(|p| !p.is_empty()) {
        url.query_pairs_mut().append_pair(PASSWORD_PARAM, password);
    }
    url
}

async fn connect_and_run(endpoint: &Url, client: &reqwest::Client, target: &Url) -> Result<()> {
    info!("Connecting to {}...", endpoint.origin().ascii_serialization());

    let (ws_stream, _) = connect_async(endpoint.as_str())
        .await
        .context("Failed to establish WebSocket connection")?;

    info!("Tunnel established, forwarding to {}", target);
    run_agent(ws_stream, client.clone(), target.clone()).await
}

async fn run_agent(ws_stream: WsStream, client: reqwest::Client, target: Url) -> Result<()> {
    let (ws_write, mut ws_read) = ws_stream.split();
    let ws_write: SharedSink = Arc::new(Mutex::new(ws_write));

    loop {
        tokio::select! {
            msg = ws_read.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_frame(Frame::from(text.as_str()), &client, &target, &ws_write);
                    }
                    Some(Ok(WsMessage::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => handle_frame(Frame::from(text), &client, &target, &ws_write),
                        Err(_) => warn!("Dropping non UTF-8 binary frame"),
                    },
                    Some(Ok(WsMessage::Ping(data))) => {
                        debug!("Received ping");
                        let mut ws = ws_write.lock().await;
                        let _ = ws.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        debug!("Received pong");
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        return Err(anyhow!("Server closed connection: {:?}", frame));
                    }
                    Some(Ok(WsMessage::Frame(_))) => {}
                    Some(Err(e)) => {
                        return Err(anyhow!("WebSocket error: {}", e));
                    }
                    None => {
                        return Err(anyhow!("WebSocket connection closed unexpectedly"));
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down agent...");
                let mut ws = ws_write.lock().await;
                let _ = ws.close().await;
                return Ok(());
            }
        }
    }
}

fn handle_frame(frame: Frame, client: &reqwest::Client, target: &Url, ws_write: &SharedSink) {
    match frame.decode() {
        Ok(TunnelMessage::Request(request)) => {
            let client = client.clone();
            let target = target.clone();
            let ws_write = ws_write.clone();
            tokio::spawn(async move {
                let id = request.id.clone();
                if let Err(e) = handle_request(request, &client, &target, &ws_write).await {
                    error!(%id, "Error answering request: {:#}", e);
                }
            });
        }
        Ok(other) => warn!(id = %other.id(), "Ignoring unexpected {} message", other.kind()),
        Err(e) => error!("Error decoding message: {}", e),
    }
}

async fn handle_request(
    request: ProxyRequest,
    client: &reqwest::Client,
    target: &Url,
    ws_write: &SharedSink,
) -> Result<()> {
    let response = match forward_to_local(client, target, &request).await {
        Ok(response) => response,
        Err(e) => {
            warn!("{} {} failed: {:#}", request.method, request.path, e);
            return send_bad_gateway(ws_write, &request.id, &e).await;
        }
    };

    let status = response.status();
    info!("{} {} -> {}", request.method, request.path, status.as_u16());

    send_message(
        ws_write,
        TunnelMessage::ResponseHeaders(ResponseHeaders {
            id: request.id.clone(),
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers: collect_headers(response.headers()),
        }),
    )
    .await?;

    let mut body = response.bytes_stream();
    let mut carry = Utf8Carry::default();
    while let Some(chunk) = body.next().await {
        // Without a final chunk the server aborts the response once its deadline passes.
        let chunk = chunk.context("Failed to read local response body")?;
        let data = carry.push(&chunk);
        if data.is_empty() {
            continue;
        }
        send_chunk(ws_write, &request.id, data, false).await?;
    }
    send_chunk(ws_write, &request.id, carry.finish(), true).await
}

async fn forward_to_local(
    client: &reqwest::Client,
    target: &Url,
    request: &ProxyRequest,
) -> Result<reqwest::Response> {
    let url = target
        .join(&request.path)
        .context("Invalid request path")?;
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .context("Invalid HTTP method")?;

    let mut req = client.request(method, url);
    if let Some(body) = &request.body {
        req = req.body(body.clone());
    }

    req.send()
        .await
        .context("Failed to forward request to local server")
}

async fn send_bad_gateway(ws_write: &SharedSink, id: &str, cause: &anyhow::Error) -> Result<()> {
    send_message(
        ws_write,
        TunnelMessage::ResponseHeaders(ResponseHeaders {
            id: id.to_string(),
            status: BAD_GATEWAY,
            status_text: "Bad Gateway".to_string(),
            headers: BTreeMap::from([(
                "content-type".to_string(),
                mime::TEXT_PLAIN_UTF_8.to_string(),
            )]),
        }),
    )
    .await?;
    send_chunk(ws_write, id, format!("Bad Gateway: {cause:#}\n"), true).await
}

async fn send_chunk(ws_write: &SharedSink, id: &str, data: String, is_final: bool) -> Result<()> {
    send_message(
        ws_write,
        TunnelMessage::ResponseChunk(ResponseChunk {
            id: id.to_string(),
            data,
            is_final,
        }),
    )
    .await
}

async fn send_message(ws_write: &SharedSink, message: TunnelMessage) -> Result<()> {
    let frame = Frame::encode(&message)?;
    let mut ws = ws_write.lock().await;
    ws.send(WsMessage::text(frame.into_inner()))
        .await
        .context("Failed to send message to server")
}

/// Flattens a header map, joining repeated names with `, `.
fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut collected = BTreeMap::<String, String>::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        collected
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    collected
}

/// Holds back a trailing incomplete UTF-8 sequence until the next network chunk.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Err(e) if e.error_len().is_none() => {
                let tail = self.pending.split_off(e.valid_up_to());
                let head = std::mem::replace(&mut self.pending, tail);
                String::from_utf8_lossy(&head).into_owned()
            }
            _ => self.finish(),
        }
    }

    fn finish(&mut self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut self.pending)).into_owned()
    }
}
