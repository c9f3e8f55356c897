//! The tunnel client façade: lease, pool, keep-alive, and lifecycle.
//!
//! One `TunnelClient` owns one tunnel session. It sizes a pool of tunnel
//! units from the lease's connection grant, supervises their reconnects,
//! and surfaces everything observable through one broadcast channel.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use crate::config::{ClientOptions, TunnelConfig};
use crate::connection::FallbackServer;
use crate::error::{ClientError, LeaseError};
use crate::events::{self, TunnelEvent, Warning, WarningKind};
use crate::keepalive::spawn_keepalive_task;
use crate::lease::{LeaseClient, TunnelLease};
use crate::tunnel::unit::{PipeEnd, TunnelUnit};

/// Delay between the initial connects of consecutive pool slots, so the
/// relay sees a ramp rather than a burst.
const CONNECT_STAGGER: Duration = Duration::from_millis(200);

/// Delay before a slot reconnects after its pipe collapsed.
const RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// Lifecycle of the client as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Everything that only exists while a session is open.
struct Session {
    fallback: Arc<FallbackServer>,
    units: Vec<Arc<TunnelUnit>>,
    supervisors: Vec<JoinHandle<()>>,
    keepalive: JoinHandle<()>,
}

/// A tunnel session: acquired lease, unit pool, and event surface.
pub struct TunnelClient {
    config: Arc<TunnelConfig>,
    lease: Arc<TunnelLease>,
    http: reqwest::Client,
    events: broadcast::Sender<TunnelEvent>,
    /// Warnings raised before `open()`, replayed once listeners can exist.
    pending_warnings: Mutex<Vec<Warning>>,
    status: Mutex<ClientStatus>,
    cancel: watch::Sender<bool>,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl TunnelClient {
    /// Resolve the options and acquire a lease from the relay.
    ///
    /// The client is ready but not yet connected; call [`open`](Self::open)
    /// to bring the pool up.
    pub async fn create(options: ClientOptions) -> Result<Self, ClientError> {
        let config = TunnelConfig::resolve(options)?;
        let lease_client = LeaseClient::new()?;
        let (lease, warnings) = lease_client.acquire(&config).await?;
        Ok(Self::assemble(config, lease, warnings, lease_client.http()))
    }

    /// Assemble a client around an already-acquired lease.
    pub fn from_parts(
        config: TunnelConfig,
        lease: TunnelLease,
        warnings: Vec<Warning>,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| LeaseError::FetchRejected {
                reason: e.to_string(),
            })?;
        Ok(Self::assemble(config, lease, warnings, http))
    }

    fn assemble(
        config: TunnelConfig,
        lease: TunnelLease,
        warnings: Vec<Warning>,
        http: reqwest::Client,
    ) -> Self {
        let events = events::channel(lease.max_connections);
        let (cancel, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            lease: Arc::new(lease),
            http,
            events,
            pending_warnings: Mutex::new(warnings),
            status: Mutex::new(ClientStatus::Idle),
            cancel,
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// Bring the tunnel up: start the fallback responder, connect the unit
    /// pool, and start the keep-alive probe.
    ///
    /// Resolves once every slot has completed its first connect attempt,
    /// successful or not. Calling `open()` on an already-open client is a
    /// warning, never an error.
    pub async fn open(&self) -> Result<(), ClientError> {
        if let Ok(mut status) = self.status.lock() {
            if matches!(*status, ClientStatus::Connecting | ClientStatus::Open) {
                self.emit(TunnelEvent::Warning(Warning::new(
                    WarningKind::DuplicateCall,
                    "tunnel was already open, noop",
                )));
                return Ok(());
            }
            *status = ClientStatus::Connecting;
        }

        // Replay warnings buffered before any subscriber could exist.
        let buffered = self
            .pending_warnings
            .lock()
            .map(|mut pending| pending.drain(..).collect::<Vec<_>>())
            .unwrap_or_default();
        for warning in buffered {
            self.emit(TunnelEvent::Warning(warning));
        }

        let fallback = match FallbackServer::start(
            &self.config,
            &self.lease,
            self.http.clone(),
            self.events.clone(),
        )
        .await
        {
            Ok(server) => Arc::new(server),
            Err(error) => {
                self.set_status(ClientStatus::Idle);
                return Err(error);
            }
        };

        let (size, margin_warning) = pool_size(self.lease.max_connections);
        if let Some(warning) = margin_warning {
            self.emit(TunnelEvent::Warning(warning));
        }
        debug!(
            granted = self.lease.max_connections,
            pool = size,
            "sizing the tunnel pool"
        );

        // Fresh cancellation epoch for this session.
        let _ = self.cancel.send(false);

        let (ready_tx, mut ready_rx) = mpsc::channel::<usize>(size);
        let mut units = Vec::with_capacity(size);
        let mut supervisors = Vec::with_capacity(size);
        for slot in 0..size {
            let unit = Arc::new(TunnelUnit::new(
                slot,
                Arc::clone(&self.config),
                Arc::clone(&self.lease),
                self.events.clone(),
            ));
            supervisors.push(spawn_supervisor(
                Arc::clone(&unit),
                Arc::clone(&fallback),
                self.cancel.subscribe(),
                ready_tx.clone(),
            ));
            units.push(unit);
        }
        drop(ready_tx);

        // Every slot reports after its first connect attempt settles.
        let mut settled = 0;
        while settled < size {
            if ready_rx.recv().await.is_none() {
                break;
            }
            settled += 1;
        }

        let keepalive = spawn_keepalive_task(
            self.http.clone(),
            Arc::clone(&self.lease),
            self.cancel.subscribe(),
        );

        *self.session.lock().await = Some(Session {
            fallback,
            units,
            supervisors,
            keepalive,
        });

        self.set_status(ClientStatus::Open);
        self.emit(TunnelEvent::Open);
        info!(url = %self.lease.tunnel_url, pool = size, "tunnel open");
        Ok(())
    }

    /// Tear the session down: cancel the pool, stop the keep-alive probe
    /// and the fallback responder, and emit `Closed` exactly once.
    ///
    /// Idempotent: a duplicate call raises a duplicate-call warning.
    pub async fn close(&self) {
        if let Ok(mut status) = self.status.lock() {
            if matches!(*status, ClientStatus::Closing | ClientStatus::Closed) {
                self.emit(TunnelEvent::Warning(Warning::new(
                    WarningKind::DuplicateCall,
                    "tunnel was already closed, noop",
                )));
                return;
            }
            *status = ClientStatus::Closing;
        }

        let _ = self.cancel.send(true);

        let session = self.session.lock().await.take();
        if let Some(session) = session {
            let Session {
                fallback,
                units,
                supervisors,
                keepalive,
            } = session;
            for unit in &units {
                unit.close();
            }
            // The pool, the probe, and the responder all answer the same
            // cancel epoch; tear them down together.
            let join_supervisors = async {
                for supervisor in supervisors {
                    let _ = supervisor.await;
                }
            };
            let join_keepalive = async {
                let _ = keepalive.await;
            };
            tokio::join!(join_supervisors, join_keepalive, fallback.shutdown());
        }

        self.set_status(ClientStatus::Closed);
        self.emit(TunnelEvent::Closed);
        info!(url = %self.lease.tunnel_url, "tunnel closed");
    }

    pub fn status(&self) -> ClientStatus {
        self.status.lock().map_or(ClientStatus::Closed, |s| *s)
    }

    /// Public URL the tunnel is reachable at.
    pub fn url(&self) -> Url {
        self.lease.tunnel_url.clone()
    }

    /// CDN-style alias for the tunnel URL, when the relay issued one.
    pub fn cached_url(&self) -> Option<Url> {
        self.lease.cached_url.clone()
    }

    /// `host:port` of the local service being exposed.
    pub fn local_address(&self) -> String {
        self.config.local_address()
    }

    /// The discovered public IP, usable as a low-security tunnel password
    /// on relays that enforce one. Absent when discovery failed.
    pub fn password(&self) -> Option<String> {
        self.lease.client_ip.clone()
    }

    /// Subscribe to the session's event stream. Late subscribers only see
    /// events emitted after they subscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: TunnelEvent) {
        let _ = self.events.send(event);
    }

    fn set_status(&self, status: ClientStatus) {
        if let Ok(mut guard) = self.status.lock() {
            *guard = status;
        }
    }
}

/// Supervise one pool slot: stagger the initial connect, report the first
/// settled attempt, then reconnect after each collapse until cancelled.
fn spawn_supervisor(
    unit: Arc<TunnelUnit>,
    fallback: Arc<FallbackServer>,
    mut cancel: watch::Receiver<bool>,
    ready: mpsc::Sender<usize>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ready = Some(ready);
        let stagger = CONNECT_STAGGER * unit.id as u32;
        if sleep_unless_cancelled(stagger, &mut cancel).await {
            loop {
                // The connect itself must yield to cancellation, or close()
                // would wait out the OS connect timeout.
                let attempt = tokio::select! {
                    attempt = unit.connect(&fallback) => attempt,
                    () = cancelled(&mut cancel) => break,
                };
                if let Some(tx) = ready.take() {
                    let _ = tx.send(unit.id).await;
                }
                if let Ok(pipe) = attempt
                    && unit.pipe(pipe, cancel.clone()).await == PipeEnd::Cancelled
                {
                    break;
                }
                if !sleep_unless_cancelled(RECONNECT_DELAY, &mut cancel).await {
                    break;
                }
                debug!(unit = unit.id, "reconnecting tunnel unit");
            }
        }
        // Never leave open() waiting on a slot that exited early.
        if let Some(tx) = ready.take() {
            let _ = tx.send(unit.id).await;
        }
    })
}

/// Resolves once cancellation fires, or the sender side is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|&stop| stop).await;
}

/// Sleep for `duration`, returning `false` when cancellation fires first
/// (or has already fired). A dropped sender counts as cancellation.
async fn sleep_unless_cancelled(
    duration: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> bool {
    if *cancel.borrow() {
        return false;
    }
    if duration.is_zero() {
        return true;
    }
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        changed = cancel.changed() => changed.is_ok() && !*cancel.borrow(),
    }
}

/// Size the pool from the relay's connection grant, holding back a safety
/// margin for relay-side bookkeeping connections.
///
/// A quarter of the grant (rounded up) is held back when the grant allows
/// it; small grants keep a fixed margin of two, and very small grants run
/// with no margin at all. The shrunken margins come with a warning.
pub(crate) fn pool_size(grant: u32) -> (usize, Option<Warning>) {
    if grant >= 7 {
        let margin = grant.div_ceil(4);
        ((grant - margin) as usize, None)
    } else if grant >= 5 {
        (
            (grant - 2) as usize,
            Some(Warning::new(
                WarningKind::LowConnectionGrant,
                format!("relay granted only {grant} connections, keeping a reduced safety margin"),
            )),
        )
    } else {
        (
            grant.max(1) as usize,
            Some(Warning::new(
                WarningKind::VeryLowConnectionGrant,
                format!("relay granted only {grant} connections, running with no safety margin"),
            )),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_holds_back_a_quarter_of_large_grants() {
        let (size, warning) = pool_size(10);
        assert_eq!(size, 7);
        assert!(warning.is_none());

        let (size, warning) = pool_size(8);
        assert_eq!(size, 6);
        assert!(warning.is_none());
    }

    #[test]
    fn small_grants_keep_a_fixed_margin_and_warn() {
        let (size, warning) = pool_size(6);
        assert_eq!(size, 4);
        assert_eq!(warning.unwrap().kind, WarningKind::LowConnectionGrant);
    }

    #[test]
    fn very_small_grants_run_without_margin_and_warn() {
        let (size, warning) = pool_size(3);
        assert_eq!(size, 3);
        assert_eq!(warning.unwrap().kind, WarningKind::VeryLowConnectionGrant);

        let (size, _) = pool_size(1);
        assert_eq!(size, 1);
    }

    fn client_with_grant(grant: u32) -> TunnelClient {
        let config = TunnelConfig::resolve(ClientOptions::new("http://localhost:3000")).unwrap();
        let lease = TunnelLease {
            id: "lease-1".into(),
            tunnel_url: Url::parse("https://abc.relay.example").unwrap(),
            cached_url: Some(Url::parse("https://abc.cdn.example").unwrap()),
            remote_target: "127.0.0.1".into(),
            remote_port: 35000,
            max_connections: grant,
            client_ip: Some("203.0.113.7".into()),
        };
        TunnelClient::from_parts(config, lease, Vec::new()).unwrap()
    }

    #[test]
    fn accessors_reflect_the_lease() {
        let client = client_with_grant(10);
        assert_eq!(client.status(), ClientStatus::Idle);
        assert_eq!(client.url().as_str(), "https://abc.relay.example/");
        assert_eq!(
            client.cached_url().unwrap().as_str(),
            "https://abc.cdn.example/"
        );
        assert_eq!(client.local_address(), "http://localhost:3000");
        assert_eq!(client.password().as_deref(), Some("203.0.113.7"));
    }

    #[tokio::test]
    async fn dropped_cancel_sender_counts_as_cancellation() {
        let (cancel, mut rx) = watch::channel(false);
        drop(cancel);
        let proceed = tokio::time::timeout(
            Duration::from_secs(1),
            sleep_unless_cancelled(Duration::from_secs(30), &mut rx),
        )
        .await
        .unwrap();
        assert!(!proceed);
    }

    #[tokio::test]
    async fn supervisors_stop_promptly_on_cancel() {
        let config =
            Arc::new(TunnelConfig::resolve(ClientOptions::new("http://127.0.0.1:1")).unwrap());
        // Refusing relay target keeps the supervisor in its retry loop.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_port = listener.local_addr().unwrap().port();
        drop(listener);
        let lease = Arc::new(TunnelLease {
            id: "lease-1".into(),
            tunnel_url: Url::parse("https://abc.relay.example").unwrap(),
            cached_url: None,
            remote_target: "127.0.0.1".into(),
            remote_port: relay_port,
            max_connections: 1,
            client_ip: None,
        });
        let events = events::channel(1);
        let fallback = Arc::new(
            FallbackServer::start(&config, &lease, reqwest::Client::new(), events.clone())
                .await
                .unwrap(),
        );
        let unit = Arc::new(TunnelUnit::new(0, config, lease, events));

        let (cancel, cancel_rx) = watch::channel(false);
        let (ready_tx, mut ready_rx) = mpsc::channel(1);
        let handle = spawn_supervisor(unit, Arc::clone(&fallback), cancel_rx, ready_tx);

        ready_rx.recv().await.unwrap();
        cancel.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .unwrap()
            .unwrap();
        fallback.shutdown().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_emits_closed_once() {
        let client = client_with_grant(10);
        let mut rx = client.subscribe();

        client.close().await;
        assert_eq!(client.status(), ClientStatus::Closed);
        assert!(matches!(rx.recv().await.unwrap(), TunnelEvent::Closed));

        client.close().await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            TunnelEvent::Warning(w) if w.kind == WarningKind::DuplicateCall
        ));
        assert!(rx.try_recv().is_err());
    }
}
