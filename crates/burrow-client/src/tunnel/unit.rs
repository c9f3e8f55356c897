//! A single tunnel unit: one upstream socket paired with one
//! downstream-or-fallback socket, piped bidirectionally.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace};

use crate::config::TunnelConfig;
use crate::connection::{DownstreamStream, FallbackServer, downstream, upstream};
use crate::error::{TunnelError, TunnelLeg};
use crate::events::{TunnelEvent, Warning, WarningKind};
use crate::lease::TunnelLease;
use crate::transform::HostRewrite;

const PIPE_BUFFER: usize = 8 * 1024;

/// Lifecycle of one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// How a pipe cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    /// Either side closed or errored; the owner may reconnect.
    Collapsed,
    /// The shared cancellation signal fired; do not reconnect.
    Cancelled,
}

/// The connected socket pair for one pipe cycle.
pub struct UnitPipe {
    upstream: TcpStream,
    local: LocalSide,
}

enum LocalSide {
    /// Direct connection to the local service.
    Downstream(DownstreamStream),
    /// Connection to the shared fallback responder.
    Fallback(TcpStream),
}

/// One slot in the tunnel pool. The pool exclusively owns its units and
/// replaces the socket pair in place on failure; the slot id is stable.
pub struct TunnelUnit {
    pub id: usize,
    config: Arc<TunnelConfig>,
    lease: Arc<TunnelLease>,
    events: broadcast::Sender<TunnelEvent>,
    status: Mutex<UnitStatus>,
}

impl TunnelUnit {
    pub fn new(
        id: usize,
        config: Arc<TunnelConfig>,
        lease: Arc<TunnelLease>,
        events: broadcast::Sender<TunnelEvent>,
    ) -> Self {
        Self {
            id,
            config,
            lease,
            events,
            status: Mutex::new(UnitStatus::Idle),
        }
    }

    pub fn status(&self) -> UnitStatus {
        self.status.lock().map_or(UnitStatus::Closed, |s| *s)
    }

    fn set_status(&self, status: UnitStatus) {
        if let Ok(mut guard) = self.status.lock() {
            *guard = status;
        }
    }

    /// Establish a fresh socket pair for this slot.
    ///
    /// The upstream leg connects first; then the downstream leg, falling
    /// back to the shared responder when the local service refuses the
    /// connection. All failures are classified and emitted; the `Err`
    /// return only tells the owner that this cycle produced no pipe.
    pub async fn connect(&self, fallback: &FallbackServer) -> Result<UnitPipe, TunnelError> {
        self.set_status(UnitStatus::Connecting);

        let upstream = match upstream::connect(&self.lease).await {
            Ok(stream) => stream,
            Err(error) => {
                let _ = self.events.send(TunnelEvent::UpstreamError(error.clone()));
                self.set_status(UnitStatus::Idle);
                return Err(error);
            }
        };

        let local = match downstream::connect(&self.config).await {
            Ok(stream) => LocalSide::Downstream(stream),
            Err(error) if error.is_rejected() => {
                debug!(
                    unit = self.id,
                    reason = %error.reason,
                    "local service unavailable, using the fallback responder"
                );
                let _ = self
                    .events
                    .send(TunnelEvent::DownstreamError(error));
                match fallback.open_proxy_socket().await {
                    Ok(stream) => LocalSide::Fallback(stream),
                    Err(proxy_error) => {
                        let _ = self
                            .events
                            .send(TunnelEvent::ProxyError(proxy_error.clone()));
                        self.set_status(UnitStatus::Idle);
                        return Err(proxy_error);
                    }
                }
            }
            Err(error) => {
                let _ = self.events.send(TunnelEvent::DownstreamError(error.clone()));
                self.set_status(UnitStatus::Idle);
                return Err(error);
            }
        };

        self.set_status(UnitStatus::Open);
        debug!(unit = self.id, "tunnel unit open");
        Ok(UnitPipe {
            upstream,
            local,
        })
    }

    /// Pipe bidirectionally until either side collapses or cancellation
    /// fires. The upstream-to-local direction passes through the host
    /// rewrite; steady-state errors are classified per leg and emitted.
    pub async fn pipe(&self, pipe: UnitPipe, cancel: watch::Receiver<bool>) -> PipeEnd {
        let UnitPipe { upstream, local } = pipe;
        let end = match local {
            LocalSide::Downstream(stream) => {
                self.pipe_io(upstream, stream, TunnelLeg::Downstream, cancel)
                    .await
            }
            LocalSide::Fallback(stream) => {
                self.pipe_io(upstream, stream, TunnelLeg::Proxy, cancel).await
            }
        };
        if end == PipeEnd::Collapsed {
            self.set_status(UnitStatus::Idle);
            debug!(unit = self.id, "tunnel unit pipe collapsed");
        }
        end
    }

    async fn pipe_io<S>(
        &self,
        upstream: TcpStream,
        local: S,
        local_leg: TunnelLeg,
        mut cancel: watch::Receiver<bool>,
    ) -> PipeEnd
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut up_read, mut up_write) = tokio::io::split(upstream);
        let (mut local_read, mut local_write) = tokio::io::split(local);
        let mut rewrite = HostRewrite::new(self.config.host_header_value());
        let mut up_buf = vec![0u8; PIPE_BUFFER];
        let mut local_buf = vec![0u8; PIPE_BUFFER];

        let end = loop {
            tokio::select! {
                result = up_read.read(&mut up_buf) => match result {
                    Ok(0) => break PipeEnd::Collapsed,
                    Ok(n) => {
                        let (bytes, request) = rewrite.push(&up_buf[..n]);
                        if let Some(line) = request {
                            trace!(unit = self.id, method = %line.method, path = %line.path, "pipe request");
                            let _ = self.events.send(TunnelEvent::Request {
                                method: line.method,
                                path: line.path,
                            });
                        }
                        if !bytes.is_empty()
                            && let Err(e) = local_write.write_all(&bytes).await
                        {
                            self.emit_io(local_leg, &e);
                            break PipeEnd::Collapsed;
                        }
                    }
                    Err(e) => {
                        self.emit_io(TunnelLeg::Upstream, &e);
                        break PipeEnd::Collapsed;
                    }
                },
                result = local_read.read(&mut local_buf) => match result {
                    Ok(0) => break PipeEnd::Collapsed,
                    Ok(n) => {
                        if let Err(e) = up_write.write_all(&local_buf[..n]).await {
                            self.emit_io(TunnelLeg::Upstream, &e);
                            break PipeEnd::Collapsed;
                        }
                    }
                    Err(e) => {
                        self.emit_io(local_leg, &e);
                        break PipeEnd::Collapsed;
                    }
                },
                changed = cancel.changed() => {
                    // A dropped sender means the pool is gone; stop piping.
                    if changed.is_err() || *cancel.borrow() {
                        break PipeEnd::Cancelled;
                    }
                }
            }
        };

        // Graceful end before the sockets drop.
        let _ = local_write.shutdown().await;
        let _ = up_write.shutdown().await;
        end
    }

    fn emit_io(&self, leg: TunnelLeg, err: &std::io::Error) {
        let error = TunnelError::from_io(leg, err);
        let event = match leg {
            TunnelLeg::Upstream => TunnelEvent::UpstreamError(error),
            TunnelLeg::Proxy => TunnelEvent::ProxyError(error),
            _ => TunnelEvent::DownstreamError(error),
        };
        let _ = self.events.send(event);
    }

    /// Record unit shutdown. Idempotent: a duplicate call raises a
    /// duplicate-call warning, never an error. Socket teardown itself is
    /// driven by the shared cancellation signal.
    pub fn close(&self) {
        let already_closed = {
            self.status.lock().is_ok_and(|guard| {
                matches!(*guard, UnitStatus::Closing | UnitStatus::Closed)
            })
        };
        if already_closed {
            let _ = self.events.send(TunnelEvent::Warning(Warning::new(
                WarningKind::DuplicateCall,
                format!("tunnel unit {} was already closed, noop", self.id),
            )));
            return;
        }
        self.set_status(UnitStatus::Closing);
        self.set_status(UnitStatus::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientOptions;
    use url::Url;

    fn unit_for(
        local_port: u16,
        relay_port: u16,
    ) -> (TunnelUnit, broadcast::Receiver<TunnelEvent>) {
        let config = Arc::new(
            TunnelConfig::resolve(ClientOptions::new(format!("http://127.0.0.1:{local_port}")))
                .unwrap(),
        );
        let lease = Arc::new(TunnelLease {
            id: "lease-1".into(),
            tunnel_url: Url::parse("https://abc.relay.example").unwrap(),
            cached_url: None,
            remote_target: "127.0.0.1".into(),
            remote_port: relay_port,
            max_connections: 5,
            client_ip: None,
        });
        let (events, rx) = broadcast::channel(64);
        (TunnelUnit::new(0, config, lease, events), rx)
    }

    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn failed_upstream_connect_emits_and_errs() {
        let relay_port = closed_port().await;
        let (unit, mut rx) = unit_for(80, relay_port);

        let config = Arc::clone(&unit.config);
        let lease = Arc::clone(&unit.lease);
        let fallback = FallbackServer::start(
            &config,
            &lease,
            reqwest::Client::new(),
            unit.events.clone(),
        )
        .await
        .unwrap();

        assert!(unit.connect(&fallback).await.is_err());
        assert_eq!(unit.status(), UnitStatus::Idle);
        assert!(matches!(
            rx.recv().await.unwrap(),
            TunnelEvent::UpstreamError(e) if e.leg == TunnelLeg::Upstream
        ));
        fallback.shutdown().await;
    }

    #[tokio::test]
    async fn refused_downstream_falls_back_to_the_responder() {
        let relay = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_port = relay.local_addr().unwrap().port();
        let local_port = closed_port().await;
        let (unit, mut rx) = unit_for(local_port, relay_port);

        let fallback = FallbackServer::start(
            &unit.config,
            &unit.lease,
            reqwest::Client::new(),
            unit.events.clone(),
        )
        .await
        .unwrap();

        let pipe = unit.connect(&fallback).await.unwrap();
        assert!(matches!(pipe.local, LocalSide::Fallback(_)));
        assert_eq!(unit.status(), UnitStatus::Open);
        assert!(matches!(
            rx.recv().await.unwrap(),
            TunnelEvent::DownstreamError(e) if e.is_rejected()
        ));
        fallback.shutdown().await;
    }

    #[tokio::test]
    async fn pipe_ends_cancelled_when_the_shutdown_sender_drops() {
        let relay = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (unit, _rx) = unit_for(
            local.local_addr().unwrap().port(),
            relay.local_addr().unwrap().port(),
        );

        let fallback = FallbackServer::start(
            &unit.config,
            &unit.lease,
            reqwest::Client::new(),
            unit.events.clone(),
        )
        .await
        .unwrap();
        let pipe = unit.connect(&fallback).await.unwrap();

        let (cancel, cancel_rx) = watch::channel(false);
        drop(cancel);
        let end = tokio::time::timeout(
            std::time::Duration::from_secs(3),
            unit.pipe(pipe, cancel_rx),
        )
        .await
        .unwrap();
        assert_eq!(end, PipeEnd::Cancelled);
        fallback.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_close_raises_a_warning() {
        let (unit, mut rx) = unit_for(80, 1);
        unit.close();
        assert_eq!(unit.status(), UnitStatus::Closed);

        unit.close();
        assert!(matches!(
            rx.recv().await.unwrap(),
            TunnelEvent::Warning(w) if w.kind == WarningKind::DuplicateCall
        ));
        assert_eq!(unit.status(), UnitStatus::Closed);
    }
}
