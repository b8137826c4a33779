//! Live query surface.
//!
//! `GovernorHandle` is what every outside reader gets: the latest published
//! snapshot, health, mode changes and subscriptions. The HTTP server on top
//! of it is deliberately small: request line in, JSON out.
//!
//! Endpoints:
//!   GET  /health            - liveness and current mode
//!   GET  /state             - latest snapshot
//!   POST /set_mode?mode=ACT - switch mode (OBSERVE | ADVISE | ACT)

use std::io;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Duration};

use crate::broadcast::{BroadcastHub, Subscription};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::snapshot::{GovernorSnapshot, SnapshotStore};
use crate::state::{Mode, ModeCell, ModeParseError};

pub const HEALTH_STATUS: &str = "alpha-governor-online";

/// Pause after a failed `accept` (e.g. out of file descriptors) before the
/// listener is polled again.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    pub mode: Mode,
}

#[derive(Debug, Clone)]
pub struct GovernorHandle {
    mode: ModeCell,
    snapshots: SnapshotStore,
    hub: BroadcastHub,
}

impl GovernorHandle {
    pub fn new(mode: ModeCell, snapshots: SnapshotStore, hub: BroadcastHub) -> Self {
        Self { mode, snapshots, hub }
    }

    /// Latest published snapshot; identical between ticks.
    pub fn snapshot(&self) -> Arc<GovernorSnapshot> {
        self.snapshots.load()
    }

    pub fn health(&self) -> Health {
        Health { status: HEALTH_STATUS.to_string(), mode: self.mode.get() }
    }

    pub fn mode(&self) -> Mode {
        self.mode.get()
    }

    /// Takes effect on the next tick. Invalid input leaves the mode as is.
    pub fn set_mode(&self, raw: &str) -> Result<Mode, ModeParseError> {
        let previous = self.mode.get();
        match self.mode.set_str(raw) {
            Ok(mode) => {
                log(
                    Level::Info,
                    Domain::Api,
                    "mode_changed",
                    obj(&[("mode", v_str(mode.as_str())), ("previous", v_str(previous.as_str()))]),
                );
                Ok(mode)
            }
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Api,
                    "mode_rejected",
                    obj(&[("requested", v_str(raw)), ("mode", v_str(previous.as_str()))]),
                );
                Err(err)
            }
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.hub.unsubscribe(id)
    }
}

// =============================================================================
// HTTP
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: &'static str,
    pub content_type: &'static str,
    pub body: String,
}

impl Response {
    fn json(status: &'static str, body: String) -> Self {
        Self { status, content_type: "application/json", body }
    }

    fn to_http(&self) -> String {
        format!(
            "HTTP/1.1 {}\r\n\
             Content-Type: {}\r\n\
             Access-Control-Allow-Origin: *\r\n\
             Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n{}",
            self.status,
            self.content_type,
            self.body.len(),
            self.body
        )
    }
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

/// Route a request line (`METHOD /path?query HTTP/1.1`).
pub fn route(handle: &GovernorHandle, request_line: &str) -> Response {
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("");
    let (path, query) = target.split_once('?').unwrap_or((target, ""));

    match (method, path) {
        ("GET", "/health") => {
            Response::json("200 OK", serde_json::to_string(&handle.health()).unwrap_or_default())
        }
        ("GET", "/state") => Response::json("200 OK", handle.snapshot().to_json()),
        ("POST", "/set_mode") => match handle.set_mode(query_param(query, "mode").unwrap_or("")) {
            Ok(mode) => Response::json("200 OK", json!({"status": "ok", "mode": mode}).to_string()),
            Err(_) => Response::json(
                "400 Bad Request",
                json!({"status": "error", "message": "Invalid mode"}).to_string(),
            ),
        },
        ("OPTIONS", _) => Response::json("204 No Content", String::new()),
        _ => Response { status: "404 Not Found", content_type: "text/plain", body: "Not Found".to_string() },
    }
}

async fn handle_connection(stream: TcpStream, handle: GovernorHandle) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(());
    }
    // Drain headers; bodies are not used.
    let mut header = String::new();
    loop {
        header.clear();
        if reader.read_line(&mut header).await? == 0 || header.trim().is_empty() {
            break;
        }
    }

    let response = route(&handle, request_line.trim());
    log(
        Level::Debug,
        Domain::Api,
        "http_request",
        obj(&[("request", v_str(request_line.trim())), ("status", v_str(response.status))]),
    );
    write.write_all(response.to_http().as_bytes()).await?;
    write.shutdown().await?;
    Ok(())
}

/// Pass an accepted connection through; log a failed accept and back off.
pub(crate) async fn accepted<T>(result: io::Result<T>, event: &str) -> Option<T> {
    match result {
        Ok(conn) => Some(conn),
        Err(err) => {
            log(Level::Warn, Domain::Api, event, obj(&[("error", v_str(&err.to_string()))]));
            sleep(ACCEPT_BACKOFF).await;
            None
        }
    }
}

/// Serve the query surface until the listener fails.
pub async fn serve_http(listener: TcpListener, handle: GovernorHandle) -> Result<()> {
    loop {
        let Some((stream, peer)) = accepted(listener.accept().await, "http_accept_failed").await else {
            continue;
        };
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, handle).await {
                log(
                    Level::Debug,
                    Domain::Api,
                    "http_connection_error",
                    obj(&[("peer", v_str(&peer.to_string())), ("error", v_str(&err.to_string()))]),
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(mode: Mode) -> GovernorHandle {
        GovernorHandle::new(
            ModeCell::new(mode),
            SnapshotStore::new(GovernorSnapshot::empty(mode)),
            BroadcastHub::new(),
        )
    }

    #[test]
    fn test_health_reports_mode() {
        let h = handle(Mode::Advise);
        let resp = route(&h, "GET /health HTTP/1.1");
        assert_eq!(resp.status, "200 OK");
        let v: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
        assert_eq!(v["status"], HEALTH_STATUS);
        assert_eq!(v["mode"], "ADVISE");
    }

    #[test]
    fn test_set_mode_valid_and_invalid() {
        let h = handle(Mode::Observe);
        let ok = route(&h, "POST /set_mode?mode=ACT HTTP/1.1");
        assert_eq!(ok.status, "200 OK");
        assert_eq!(h.mode(), Mode::Act);

        let bad = route(&h, "POST /set_mode?mode=turbo HTTP/1.1");
        assert_eq!(bad.status, "400 Bad Request");
        assert!(bad.body.contains("Invalid mode"));
        assert_eq!(h.mode(), Mode::Act);

        let missing = route(&h, "POST /set_mode HTTP/1.1");
        assert_eq!(missing.status, "400 Bad Request");
        assert_eq!(h.mode(), Mode::Act);
    }

    #[test]
    fn test_state_is_idempotent_between_ticks() {
        let h = handle(Mode::Observe);
        let a = route(&h, "GET /state HTTP/1.1");
        let b = route(&h, "GET /state HTTP/1.1");
        assert_eq!(a, b);
        assert_eq!(h.snapshot(), h.snapshot());
    }

    #[test]
    fn test_unknown_route_is_404() {
        let h = handle(Mode::Observe);
        assert_eq!(route(&h, "GET /nope HTTP/1.1").status, "404 Not Found");
        assert_eq!(route(&h, "DELETE /state HTTP/1.1").status, "404 Not Found");
    }

    #[test]
    fn test_query_param() {
        assert_eq!(query_param("a=1&mode=ACT", "mode"), Some("ACT"));
        assert_eq!(query_param("mode", "mode"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_accept_backs_off() {
        let start = tokio::time::Instant::now();
        let refused: io::Result<()> = Err(io::Error::new(io::ErrorKind::Other, "too many open files"));
        assert!(accepted(refused, "http_accept_failed").await.is_none());
        assert!(start.elapsed() >= ACCEPT_BACKOFF);

        let start = tokio::time::Instant::now();
        assert_eq!(accepted(Ok(7), "http_accept_failed").await, Some(7));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_http_roundtrip_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let h = handle(Mode::Observe);
        tokio::spawn(serve_http(listener, h.clone()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"POST /set_mode?mode=ADVISE HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut buf = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut stream, &mut buf).await.unwrap();
        assert!(buf.starts_with("HTTP/1.1 200 OK"));
        assert!(buf.contains("Access-Control-Allow-Origin: *"));
        assert!(buf.ends_with(r#"{"mode":"ADVISE","status":"ok"}"#));
        assert_eq!(h.mode(), Mode::Advise);
    }
}
