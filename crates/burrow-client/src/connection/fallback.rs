//! Fallback/proxy responder.
//!
//! A tiny local HTTP server that stands in for the downstream leg when the
//! local service is unreachable. It forwards each request to the real local
//! origin over a one-shot round trip and mirrors the response back; when
//! forwarding fails it renders a templated unavailable page instead, with
//! 200-class framing so the relay-to-client pipe is not torn down.

use std::net::SocketAddr;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::error::{ClientError, TunnelError, TunnelLeg};
use crate::events::TunnelEvent;
use crate::lease::TunnelLease;

const UNAVAILABLE_PAGE: &str = include_str!("unavailable.html");

/// Headers that describe the hop rather than the request; never forwarded.
const HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forwarded request bodies are buffered; anything larger than this is a
/// misuse of the diagnostic path, not a streaming proxy.
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Clone)]
struct FallbackState {
    local_address: String,
    canonical_host: String,
    unavailable_page: String,
    http: reqwest::Client,
    events: broadcast::Sender<TunnelEvent>,
}

/// Handle to the running fallback responder.
pub struct FallbackServer {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl FallbackServer {
    /// Bind on an ephemeral localhost port and start serving.
    ///
    /// Bind failure is fatal: without the responder there is no
    /// graceful-degradation path for the session.
    pub async fn start(
        config: &TunnelConfig,
        lease: &TunnelLease,
        http: reqwest::Client,
        events: broadcast::Sender<TunnelEvent>,
    ) -> Result<Self, ClientError> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(ClientError::FallbackBind)?;
        let addr = listener.local_addr().map_err(ClientError::FallbackBind)?;

        // The canonical host forwarded as x-forwarded-host; the cached URL
        // outlives the lease, so it wins when present.
        let canonical_host = lease
            .cached_url
            .as_ref()
            .unwrap_or(&lease.tunnel_url)
            .host_str()
            .unwrap_or_default()
            .to_string();

        let state = FallbackState {
            local_address: config.local_address(),
            canonical_host,
            unavailable_page: UNAVAILABLE_PAGE.replace("${address}", &config.local_address()),
            http,
            events,
        };

        let app = Router::new().fallback(handle).with_state(state);

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(e) = serve.await {
                warn!(error = %e, "fallback responder stopped unexpectedly");
            }
        });

        info!(%addr, "fallback responder up");
        Ok(Self {
            addr,
            shutdown,
            task: tokio::sync::Mutex::new(Some(task)),
        })
    }

    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Open the socket a tunnel unit pipes into. This is the proxy leg.
    pub async fn open_proxy_socket(&self) -> Result<TcpStream, TunnelError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| TunnelError::from_io(TunnelLeg::Proxy, &e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TunnelError::from_io(TunnelLeg::Proxy, &e))?;
        Ok(stream)
    }

    /// Stop serving. Swallows the race where another path already tore the
    /// responder down.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let Some(task) = self.task.lock().await.take() else {
            debug!("fallback responder already torn down");
            return;
        };
        if let Err(e) = task.await
            && !e.is_cancelled()
        {
            debug!(error = %e, "fallback responder teardown race");
        }
    }
}

/// Catch-all handler: answer keep-alive probes locally, forward everything
/// else to the real local origin.
async fn handle(State(state): State<FallbackState>, request: Request) -> Response {
    let method = request.method().clone();
    let query = request.uri().query().unwrap_or_default();

    if method == Method::OPTIONS && query == "keepalive" {
        return keepalive_response();
    }

    match forward(&state, request).await {
        Ok(response) => response,
        Err(error) => {
            debug!(%error, "forwarding to the local service failed");
            let _ = state.events.send(TunnelEvent::DownstreamError(error.clone()));
            unavailable_response(&state, &error)
        }
    }
}

/// One-shot round trip to the real local origin.
async fn forward(state: &FallbackState, request: Request) -> Result<Response, TunnelError> {
    let (parts, body) = request.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or("/", axum::http::uri::PathAndQuery::as_str);
    let target = format!("{}{path_and_query}", state.local_address);

    let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let mut outbound = state.http.request(method, &target);

    for (name, value) in &parts.headers {
        if HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        outbound = outbound.header(name.as_str(), value.as_bytes());
    }
    outbound = outbound.header("x-forwarded-host", &state.canonical_host);

    // The original client only forwards bodies for POST; everything else is
    // treated as body-less.
    if parts.method == Method::POST {
        let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|_| TunnelError {
                leg: TunnelLeg::Downstream,
                severity: crate::error::Severity::Unknown,
                reason: "EMSGSIZE".into(),
                detail: None,
            })?;
        outbound = outbound.body(bytes);
    }

    let inbound = outbound
        .send()
        .await
        .map_err(|e| TunnelError::from_reqwest(TunnelLeg::Downstream, &e))?;

    let status = StatusCode::from_u16(inbound.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut headers = HeaderMap::new();
    for (name, value) in inbound.headers() {
        if HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.insert(name, value);
        }
    }
    if !headers.contains_key("content-type") {
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
    }

    let body = inbound
        .bytes()
        .await
        .map_err(|e| TunnelError::from_reqwest(TunnelLeg::Downstream, &e))?;

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Empty 200 for `OPTIONS *?keepalive`, answered without touching the local
/// origin.
fn keepalive_response() -> Response {
    (
        StatusCode::OK,
        [
            ("content-type", "text/plain"),
            ("allow", "OPTIONS"),
            ("access-control-allow-methods", "OPTIONS"),
        ],
    )
        .into_response()
}

/// Templated unavailable page with 200 framing.
fn unavailable_response(state: &FallbackState, error: &TunnelError) -> Response {
    let page = state
        .unavailable_page
        .replace("${errorCode}", &error.reason)
        .replace("${errorDetails}", &error.to_json());
    (StatusCode::OK, [("content-type", "text/html")], page).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientOptions;
    use crate::error::Severity;
    use url::Url;

    fn test_lease() -> TunnelLease {
        TunnelLease {
            id: "lease-1".into(),
            tunnel_url: Url::parse("https://abc.relay.example").unwrap(),
            cached_url: Some(Url::parse("https://abc.cdn.example").unwrap()),
            remote_target: "127.0.0.1".into(),
            remote_port: 1,
            max_connections: 5,
            client_ip: None,
        }
    }

    async fn start_fallback(local_port: u16) -> (FallbackServer, broadcast::Receiver<TunnelEvent>) {
        let config = TunnelConfig::resolve(ClientOptions::new(format!(
            "http://127.0.0.1:{local_port}"
        )))
        .unwrap();
        let (events, rx) = broadcast::channel(64);
        let server = FallbackServer::start(&config, &test_lease(), reqwest::Client::new(), events)
            .await
            .unwrap();
        (server, rx)
    }

    #[tokio::test]
    async fn keepalive_probe_is_answered_without_the_local_origin() {
        // Local origin is a closed port; the probe must still get a 200.
        let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let (server, _rx) = start_fallback(port).await;
        let url = format!("http://{}/anything?keepalive", server.addr());
        let response = reqwest::Client::new()
            .request(reqwest::Method::OPTIONS, url)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers().get("allow").unwrap().to_str().unwrap(),
            "OPTIONS"
        );
        server.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_origin_renders_the_unavailable_page() {
        let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let (server, mut rx) = start_fallback(port).await;
        let url = format!("http://{}/health", server.addr());
        let response = reqwest::get(url).await.unwrap();
        assert_eq!(response.status(), 200);
        let body = response.text().await.unwrap();
        assert!(body.contains("ECONNREFUSED"));
        assert!(!body.contains("${errorCode}"));
        assert!(body.contains(&format!("http://127.0.0.1:{port}")));

        match rx.recv().await.unwrap() {
            TunnelEvent::DownstreamError(e) => {
                assert_eq!(e.severity, Severity::Rejected);
                assert_eq!(e.reason, "ECONNREFUSED");
            }
            other => panic!("expected a downstream error, got {other:?}"),
        }
        server.shutdown().await;
    }

    #[tokio::test]
    async fn requests_are_forwarded_and_mirrored() {
        // A one-request local origin that records the forwarded host.
        let origin = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = origin.local_addr().unwrap().port();
        let seen = std::sync::Arc::new(tokio::sync::Mutex::new(String::new()));
        let seen_writer = std::sync::Arc::clone(&seen);
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let (mut socket, _) = origin.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            *seen_writer.lock().await = String::from_utf8_lossy(&buf[..n]).into_owned();
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 11\r\n\r\n{\"ok\":true}",
                )
                .await
                .unwrap();
        });

        let (server, _rx) = start_fallback(port).await;
        let url = format!("http://{}/health?probe=1", server.addr());
        let response = reqwest::get(url).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .unwrap()
                .to_str()
                .unwrap(),
            "application/json"
        );
        assert_eq!(response.text().await.unwrap(), r#"{"ok":true}"#);

        let request_seen = seen.lock().await.clone();
        assert!(request_seen.starts_with("GET /health?probe=1 HTTP/1.1\r\n"));
        assert!(request_seen.to_lowercase().contains("x-forwarded-host: abc.cdn.example"));
        server.shutdown().await;
    }
}
