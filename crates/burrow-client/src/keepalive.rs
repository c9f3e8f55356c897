//! Keep-alive task defeating idle-connection reclamation.
//!
//! Relays and intermediaries reap tunnels that look idle; a periodic no-op
//! `OPTIONS` probe against the public tunnel URL keeps them off. Probe
//! failures are diagnostic noise, never propagated.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::lease::TunnelLease;

/// Fixed probe period. Aggressive on purpose: some relays reap within
/// seconds of the last byte.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);

/// Header suppressing the relay's interstitial reminder page, keyed by the
/// lease id.
const BYPASS_REMINDER_HEADER: &str = "Bypass-Tunnel-Reminder";

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "@", env!("CARGO_PKG_VERSION"));

/// Spawn the keep-alive probe task for one open tunnel session.
///
/// The task stops permanently when `shutdown` fires.
pub fn spawn_keepalive_task(
    http: reqwest::Client,
    lease: Arc<TunnelLease>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut probe_url = lease.tunnel_url.clone();
        probe_url.set_query(Some("keepalive"));

        let mut timer = tokio::time::interval(KEEPALIVE_INTERVAL);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let result = http
                        .request(reqwest::Method::OPTIONS, probe_url.clone())
                        .header(BYPASS_REMINDER_HEADER, &lease.id)
                        .header(reqwest::header::USER_AGENT, USER_AGENT)
                        .send()
                        .await;
                    // Any response or error is ignored.
                    if let Err(e) = result {
                        debug!(error = %e.without_url(), "keep-alive probe failed");
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped sender means the session is gone too.
                    if changed.is_err() || *shutdown.borrow() {
                        info!("keep-alive task shutting down");
                        return;
                    }
                }
            }
        }
    })
}
