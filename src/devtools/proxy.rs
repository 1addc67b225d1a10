// SPDX-License-Identifier: MIT
// DevTools WebSocket proxy.
//
// One TCP port, two jobs: a plain HTTP `GET /json/version` that points
// automation clients back at this proxy, and a WebSocket bridge for
// everything else. The bridge always dials the URL the upstream manager
// currently publishes, never the client's request path, so clients survive
// browser restarts without re-resolving anything.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::devtools::upstream::UpstreamManager;
use crate::idle::IdleController;

/// Effectively no cap on CDP messages; screenshots and heap snapshots are
/// routinely tens of megabytes.
const MAX_MESSAGE_BYTES: usize = 100 * 1024 * 1024;

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

fn bridge_config() -> WebSocketConfig {
    // No permessage-deflate here: tokio-tungstenite does not implement it,
    // so the bridge runs uncompressed (SPEC_FULL.md §4.2.2, known gap).
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_MESSAGE_BYTES);
    config.max_frame_size = Some(MAX_MESSAGE_BYTES);
    config
}

/// Accept loop for the proxy port. Runs until `shutdown` flips.
pub async fn serve(
    listener: TcpListener,
    upstream: Arc<UpstreamManager>,
    idle: Arc<IdleController>,
    log_cdp_messages: bool,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(addr = ?listener.local_addr().ok(), "devtools proxy listening");
    let shutdown_template = shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(conn) => conn,
                    Err(err) => {
                        error!(err = %err, "proxy accept error");
                        continue;
                    }
                };
                debug!(peer = %peer, "new devtools connection");
                let upstream = upstream.clone();
                let idle = idle.clone();
                let shutdown = shutdown_template.clone();
                tokio::spawn(async move {
                    // A live DevTools session counts as a long operation:
                    // hold the idle lease for the connection's lifetime.
                    if let Err(err) = idle.disable().await {
                        warn!(err = %err, "failed to take idle lease for devtools connection");
                    }
                    if let Err(err) = handle_connection(stream, upstream, log_cdp_messages, shutdown).await {
                        warn!(peer = %peer, err = %err, "devtools connection error");
                    }
                    if let Err(err) = idle.enable().await {
                        warn!(err = %err, "failed to release idle lease");
                    }
                });
            }
        }
    }
    info!("devtools proxy stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    upstream: Arc<UpstreamManager>,
    log_cdp_messages: bool,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    // Peek so the WebSocket handshake stays intact for the bridge path.
    let mut peek_buf = [0u8; 32];
    let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    let head = &peek_buf[..n];
    if head.starts_with(b"GET /json/version")
        || head.starts_with(b"GET /cdp/json/version")
    {
        return handle_version_request(stream, &upstream).await;
    }

    bridge(stream, upstream, log_cdp_messages, shutdown).await
}

/// Minimal `/json/version` so clients that resolve the browser WebSocket URL
/// over HTTP reconnect through this proxy rather than at the browser.
async fn handle_version_request(mut stream: TcpStream, upstream: &UpstreamManager) -> Result<()> {
    let mut request = vec![0u8; 4096];
    let n = stream.read(&mut request).await.unwrap_or(0);

    if upstream.current().is_empty() {
        return write_http_response(
            &mut stream,
            "503 Service Unavailable",
            "text/plain",
            "upstream not ready",
        )
        .await;
    }

    let host = String::from_utf8_lossy(&request[..n])
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("host")
                .then(|| value.trim().to_string())
        })
        .unwrap_or_default();

    let body = serde_json::json!({
        "webSocketDebuggerUrl": format!("ws://{host}"),
    })
    .to_string();
    write_http_response(&mut stream, "200 OK", "application/json", &body).await
}

async fn write_http_response(
    stream: &mut TcpStream,
    status: &str,
    content_type: &str,
    body: &str,
) -> Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

async fn bridge(
    stream: TcpStream,
    upstream: Arc<UpstreamManager>,
    log_cdp_messages: bool,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let upstream_url = upstream.current();
    if upstream_url.is_empty() {
        let mut stream = stream;
        let mut discard = [0u8; 4096];
        let _ = stream.read(&mut discard).await;
        return write_http_response(
            &mut stream,
            "503 Service Unavailable",
            "text/plain",
            "upstream not ready",
        )
        .await;
    }
    if upstream_url
        .parse::<tokio_tungstenite::tungstenite::http::Uri>()
        .is_err()
    {
        let mut stream = stream;
        let mut discard = [0u8; 4096];
        let _ = stream.read(&mut discard).await;
        return write_http_response(
            &mut stream,
            "500 Internal Server Error",
            "text/plain",
            "invalid upstream",
        )
        .await;
    }

    let client_ws = tokio_tungstenite::accept_async_with_config(stream, Some(bridge_config()))
        .await
        .context("websocket upgrade failed")?;

    // Dial the published upstream URL as-is; the client's path is ignored.
    let dial = tokio::time::timeout(
        DIAL_TIMEOUT,
        tokio_tungstenite::connect_async_with_config(
            upstream_url.clone(),
            Some(bridge_config()),
            false,
        ),
    )
    .await;
    let upstream_ws = match dial {
        Ok(Ok((ws, _response))) => ws,
        Ok(Err(err)) => {
            error!(url = %upstream_url, err = %err, "dial upstream failed");
            drop(client_ws);
            return Ok(());
        }
        Err(_elapsed) => {
            error!(url = %upstream_url, "dial upstream timed out");
            drop(client_ws);
            return Ok(());
        }
    };
    debug!(url = %upstream_url, "proxying devtools websocket");

    let (client_tx, client_rx) = client_ws.split();
    let (upstream_tx, upstream_rx) = upstream_ws.split();

    let mut client_to_upstream = tokio::spawn(copy_frames(
        client_rx,
        upstream_tx,
        "->",
        log_cdp_messages,
    ));
    let mut upstream_to_client = tokio::spawn(copy_frames(
        upstream_rx,
        client_tx,
        "<-",
        log_cdp_messages,
    ));

    // First direction to finish (error or close) tears down both; aborting
    // the tasks drops both halves of both connections.
    tokio::select! {
        _ = &mut client_to_upstream => upstream_to_client.abort(),
        _ = &mut upstream_to_client => client_to_upstream.abort(),
        _ = shutdown.wait_for(|stop| *stop) => {
            client_to_upstream.abort();
            upstream_to_client.abort();
        }
    }
    Ok(())
}

/// One copy direction: read message-by-message, preserving the opcode, and
/// forward. Logging never blocks or alters the forwarded bytes.
async fn copy_frames<R, W>(
    mut rx: SplitStream<WebSocketStream<R>>,
    mut tx: SplitSink<WebSocketStream<W>, Message>,
    direction: &'static str,
    log_cdp_messages: bool,
) where
    R: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    W: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(message) = rx.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                debug!(dir = direction, err = %err, "websocket read ended");
                break;
            }
        };
        if log_cdp_messages {
            log_cdp_message(direction, &message);
        }
        let closing = message.is_close();
        if let Err(err) = tx.send(message).await {
            debug!(dir = direction, err = %err, "websocket write ended");
            break;
        }
        if closing {
            break;
        }
    }
}

// ─── CDP message logging ─────────────────────────────────────────────────────

static CDP_METHOD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""method"\s*:\s*"([^"]*)""#).expect("valid regex"));
static CDP_SESSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""sessionId"\s*:\s*"([^"]*)""#).expect("valid regex"));
static CDP_TARGET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""targetId"\s*:\s*"([^"]*)""#).expect("valid regex"));
static CDP_FRAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""frameId"\s*:\s*"([^"]*)""#).expect("valid regex"));
static CDP_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""id"\s*:\s*(\d+)"#).expect("valid regex"));

fn capture(re: &Regex, raw: &str) -> String {
    re.captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

/// Best-effort structured view of a CDP text frame. Regex extraction on the
/// raw bytes; no JSON parse on the forwarding path.
fn log_cdp_message(direction: &str, message: &Message) {
    let Message::Text(raw) = message else {
        return;
    };
    info!(
        dir = direction,
        method = %capture(&CDP_METHOD_RE, raw),
        id = %capture(&CDP_ID_RE, raw),
        session_id = %capture(&CDP_SESSION_RE, raw),
        target_id = %capture(&CDP_TARGET_RE, raw),
        frame_id = %capture(&CDP_FRAME_RE, raw),
        raw_length = raw.len(),
        "cdp"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cdp_field_extraction() {
        let raw = r#"{"id": 7, "method":"Page.navigate", "sessionId":"S1", "params":{"frameId": "F9"}}"#;
        assert_eq!(capture(&CDP_METHOD_RE, raw), "Page.navigate");
        assert_eq!(capture(&CDP_ID_RE, raw), "7");
        assert_eq!(capture(&CDP_SESSION_RE, raw), "S1");
        assert_eq!(capture(&CDP_FRAME_RE, raw), "F9");
        assert_eq!(capture(&CDP_TARGET_RE, raw), "");
    }

    #[test]
    fn cdp_extraction_tolerates_non_json() {
        assert_eq!(capture(&CDP_METHOD_RE, "not json at all"), "");
    }
}
