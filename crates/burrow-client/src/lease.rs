//! Lease acquisition from the relay.
//!
//! A lease is the relay's grant of a public URL, a connection quota, and a
//! routing target for one tunnel session. It is acquired once per session
//! and immutable afterwards.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::TunnelConfig;
use crate::error::{LeaseError, error_chain};
use crate::events::{Warning, WarningKind};

/// Best-effort public-IP echo service. The discovered IP doubles as a
/// low-security tunnel password on relays that support it.
const DEFAULT_IP_ECHO: &str = "https://api.ipify.org";

/// Path sentinel asking the relay to assign any free subdomain.
const ASSIGN_ANY: &str = "?new";

/// Timeout for the non-essential IP discovery; it must never hold up
/// `open()` for long.
const IP_ECHO_TIMEOUT: Duration = Duration::from_secs(3);

/// Relay-issued grant for one tunnel session.
#[derive(Debug, Clone)]
pub struct TunnelLease {
    /// Opaque token, also used to suppress relay-side reminder pages.
    pub id: String,
    /// Public URL the tunnel is reachable at.
    pub tunnel_url: Url,
    /// CDN-style alias that outlives the lease. Informational only.
    pub cached_url: Option<Url>,
    /// Host or IP to open upstream connections against.
    pub remote_target: String,
    pub remote_port: u16,
    /// Maximum concurrent upstream connections granted.
    pub max_connections: u32,
    /// Discovered public IP, absent when discovery failed.
    pub client_ip: Option<String>,
}

/// Wire format of the relay's lease response.
#[derive(Debug, Deserialize)]
struct LeaseResponse {
    id: String,
    ip: Option<String>,
    port: u16,
    url: String,
    cached_url: Option<String>,
    max_conn_count: Option<u32>,
}

/// HTTP client for the relay's lease endpoint.
#[derive(Debug, Clone)]
pub struct LeaseClient {
    http: reqwest::Client,
    ip_echo: String,
}

impl LeaseClient {
    pub fn new() -> Result<Self, LeaseError> {
        // reqwest is built with rustls-no-provider; install ring once.
        // The Err case just means it was already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| LeaseError::FetchRejected {
                reason: e.to_string(),
            })?;
        Ok(Self {
            http,
            ip_echo: DEFAULT_IP_ECHO.into(),
        })
    }

    /// Override the IP echo endpoint (used by tests).
    pub fn with_ip_echo(mut self, endpoint: impl Into<String>) -> Self {
        self.ip_echo = endpoint.into();
        self
    }

    /// The underlying HTTP client, shared with the keep-alive probe and
    /// the fallback responder's forwarding path.
    pub(crate) fn http(&self) -> reqwest::Client {
        self.http.clone()
    }

    /// Request a lease from the relay.
    ///
    /// Transport failures and non-success responses are fatal. Failure of
    /// the separate public-IP discovery is downgraded to a buffered
    /// warning; the password is simply left absent.
    pub async fn acquire(
        &self,
        config: &TunnelConfig,
    ) -> Result<(TunnelLease, Vec<Warning>), LeaseError> {
        let url = lease_url(config);
        debug!(%url, "requesting tunnel lease");

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| LeaseError::FetchRejected {
                reason: error_chain(&e),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(LeaseError::ResponseStatus {
                status: status.as_u16(),
                text: status.canonical_reason().unwrap_or("Unknown").into(),
            });
        }

        let body: LeaseResponse = response
            .json()
            .await
            .map_err(|e| LeaseError::ResponseInvalid(e.without_url().to_string()))?;

        let tunnel_url =
            Url::parse(&body.url).map_err(|e| LeaseError::ResponseInvalid(e.to_string()))?;
        let cached_url = body
            .cached_url
            .as_deref()
            .and_then(|cached| Url::parse(cached).ok());

        let mut warnings = Vec::new();
        let client_ip = self.discover_public_ip().await;
        if client_ip.is_none() {
            warnings.push(Warning::new(
                WarningKind::PasswordUnavailable,
                "unable to determine the public IP, the tunnel will have no password",
            ));
        }

        let lease = TunnelLease {
            id: body.id,
            tunnel_url,
            cached_url,
            // Prefer the ip if returned by the relay.
            remote_target: body.ip.unwrap_or_else(|| relay_host(config)),
            remote_port: body.port,
            max_connections: body.max_conn_count.filter(|&c| c > 0).unwrap_or(1),
            client_ip,
        };

        info!(
            url = %lease.tunnel_url,
            max_connections = lease.max_connections,
            "tunnel lease acquired"
        );
        Ok((lease, warnings))
    }

    /// Best-effort lookup of the caller's public IP.
    async fn discover_public_ip(&self) -> Option<String> {
        let result = self
            .http
            .get(&self.ip_echo)
            .timeout(IP_ECHO_TIMEOUT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);

        match result {
            Ok(response) => match response.text().await {
                Ok(ip) if !ip.trim().is_empty() => Some(ip.trim().to_string()),
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e.without_url(), "public IP echo returned an unreadable body");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e.without_url(), "public IP discovery failed");
                None
            }
        }
    }
}

/// `{relayOrigin}/{subdomain-or-"?new"}`.
fn lease_url(config: &TunnelConfig) -> String {
    let origin = config.relay_origin.as_str().trim_end_matches('/');
    let slug = config.subdomain.as_deref().unwrap_or(ASSIGN_ANY);
    format!("{origin}/{slug}")
}

fn relay_host(config: &TunnelConfig) -> String {
    config
        .relay_origin
        .host_str()
        .unwrap_or_default()
        .to_string()
}
