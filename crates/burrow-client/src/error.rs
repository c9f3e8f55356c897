//! Error taxonomy for the tunnel client.
//!
//! Raw socket failures are classified into a single tagged error type:
//! a leg discriminator, a severity discriminator, and a stable reason code.
//! Classification is a pure function of the OS error, so it can be tested
//! without constructing real sockets.

use std::io;

use serde::Serialize;
use thiserror::Error;

/// Which leg of the tunnel a failure occurred on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelLeg {
    /// The connection from this client to the relay.
    Upstream,
    /// The connection from this client to the local service.
    Downstream,
    /// The connection from this client to its own fallback responder.
    Proxy,
    /// The lease handshake with the relay.
    Lease,
}

impl std::fmt::Display for TunnelLeg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upstream => write!(f, "upstream"),
            Self::Downstream => write!(f, "downstream"),
            Self::Proxy => write!(f, "proxy"),
            Self::Lease => write!(f, "lease"),
        }
    }
}

/// Whether the underlying condition was an expected rejection or an
/// unexpected fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Expected, recoverable (connection refused/reset class).
    Rejected,
    /// Anything else; always reported so it can be investigated.
    Unknown,
}

/// A classified tunnel failure.
///
/// `reason` is a stable errno-style code (`ECONNREFUSED`, `ETIMEDOUT`, ...)
/// or an HTTP status pair for lease-response errors. `detail` carries
/// address/port context and is only populated in debug builds.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelError {
    pub leg: TunnelLeg,
    pub severity: Severity,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl std::fmt::Display for TunnelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let verdict = match self.severity {
            Severity::Rejected => "rejected the connection",
            Severity::Unknown => "failed unexpectedly",
        };
        write!(f, "{} leg {verdict}: {}", self.leg, self.reason)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

impl std::error::Error for TunnelError {}

impl TunnelError {
    /// Classify an I/O error for the given leg.
    pub fn from_io(leg: TunnelLeg, err: &io::Error) -> Self {
        let severity = if is_rejected_kind(err.kind()) {
            Severity::Rejected
        } else {
            Severity::Unknown
        };
        Self {
            leg,
            severity,
            reason: reason_code(err),
            detail: redacted_detail(&err.to_string()),
        }
    }

    /// Classify a reqwest error for the given leg.
    ///
    /// Walks the source chain looking for the underlying I/O error so the
    /// reason reflects the actual socket failure rather than the HTTP layer.
    pub fn from_reqwest(leg: TunnelLeg, err: &reqwest::Error) -> Self {
        if let Some(io_err) = find_io_source(err) {
            let mut classified = Self::from_io(leg, io_err);
            // reqwest wraps connect-time refusals in a generic connect error;
            // keep the rejected classification even when the io kind is lost.
            if err.is_connect() && classified.severity == Severity::Unknown {
                classified.severity = Severity::Rejected;
            }
            return classified;
        }
        if err.is_timeout() {
            return Self {
                leg,
                severity: Severity::Unknown,
                reason: "ETIMEDOUT".into(),
                detail: redacted_detail(&err.to_string()),
            };
        }
        Self {
            leg,
            severity: if err.is_connect() {
                Severity::Rejected
            } else {
                Severity::Unknown
            },
            reason: if err.is_connect() {
                "ECONNREFUSED".into()
            } else {
                "UNKNOWN".into()
            },
            detail: redacted_detail(&err.to_string()),
        }
    }

    /// Whether this error is of the expected, recoverable class.
    pub fn is_rejected(&self) -> bool {
        self.severity == Severity::Rejected
    }

    /// JSON rendering used for the `${errorDetails}` diagnostic dump.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Errors acquiring a lease from the relay. All of these are fatal to
/// `open()`; a tunnel cannot be established without a lease.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// The lease request never got a response (transport failure).
    #[error("the relay rejected the lease request: {reason}")]
    FetchRejected { reason: String },

    /// The relay answered with a non-success status.
    #[error("the relay refused the lease request with status {status} {text}")]
    ResponseStatus { status: u16, text: String },

    /// The lease body could not be parsed.
    #[error("the relay returned an unparsable lease: {0}")]
    ResponseInvalid(String),
}

impl LeaseError {
    /// Stable reason code, mirroring [`TunnelError::reason`].
    pub fn reason(&self) -> String {
        match self {
            Self::FetchRejected { reason } => reason.clone(),
            Self::ResponseStatus { status, text } => format!("{status} {text}"),
            Self::ResponseInvalid(_) => "EBADMSG".into(),
        }
    }
}

/// Configuration errors, raised once at the boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("local origin URL could not be parsed: {0}")]
    InvalidUrl(String),

    #[error("local origin URL must use http or https, got {0}")]
    UnsupportedScheme(String),

    #[error("local origin URL must not carry a path, query, or fragment")]
    NonRootOrigin,

    #[error("local origin URL is missing a host")]
    MissingHost,

    #[error("TLS options were provided for a plain-http local origin")]
    TlsForPlainOrigin,
}

/// Top-level errors surfaced by the client façade.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    /// Without the fallback responder there is no graceful-degradation
    /// path, so failing to bind it is fatal to `open()`.
    #[error("failed to bind the fallback responder: {0}")]
    FallbackBind(io::Error),
}

fn is_rejected_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}

/// Map an I/O error to an errno-style reason code.
fn reason_code(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => "ECONNREFUSED".into(),
        io::ErrorKind::ConnectionReset => "ECONNRESET".into(),
        io::ErrorKind::ConnectionAborted => "ECONNABORTED".into(),
        io::ErrorKind::NotConnected => "ENOTCONN".into(),
        io::ErrorKind::BrokenPipe => "EPIPE".into(),
        io::ErrorKind::TimedOut => "ETIMEDOUT".into(),
        io::ErrorKind::AddrNotAvailable => "EADDRNOTAVAIL".into(),
        io::ErrorKind::HostUnreachable => "EHOSTUNREACH".into(),
        io::ErrorKind::NetworkUnreachable => "ENETUNREACH".into(),
        io::ErrorKind::UnexpectedEof => "ECONNCLOSED".into(),
        _ => err
            .raw_os_error()
            .map_or_else(|| "UNKNOWN".into(), |code| format!("OS_{code}")),
    }
}

/// Address/port context is stripped outside of debug builds so logs do not
/// leak topology.
fn redacted_detail(detail: &str) -> Option<String> {
    if cfg!(debug_assertions) {
        Some(detail.to_string())
    } else {
        None
    }
}

/// Walk an error's `source()` chain looking for an `io::Error`.
fn find_io_source(err: &dyn std::error::Error) -> Option<&io::Error> {
    let mut current = err.source();
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return Some(io_err);
        }
        current = e.source();
    }
    None
}

/// Walk the `source()` chain of an error and join into a single string.
pub(crate) fn error_chain(err: &dyn std::error::Error) -> String {
    let mut chain = Vec::new();
    let mut current = err.source();
    while let Some(e) = current {
        chain.push(e.to_string());
        current = e.source();
    }
    if chain.is_empty() {
        String::from("(no further details)")
    } else {
        chain.join(" -> ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_refused_is_rejected() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let classified = TunnelError::from_io(TunnelLeg::Downstream, &err);
        assert_eq!(classified.severity, Severity::Rejected);
        assert_eq!(classified.reason, "ECONNREFUSED");
        assert_eq!(classified.leg, TunnelLeg::Downstream);
        assert!(classified.is_rejected());
    }

    #[test]
    fn connection_reset_is_rejected() {
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let classified = TunnelError::from_io(TunnelLeg::Upstream, &err);
        assert_eq!(classified.severity, Severity::Rejected);
        assert_eq!(classified.reason, "ECONNRESET");
    }

    #[test]
    fn other_kinds_are_unknown() {
        let err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        let classified = TunnelError::from_io(TunnelLeg::Proxy, &err);
        assert_eq!(classified.severity, Severity::Unknown);
        assert_eq!(classified.reason, "EPIPE");
        assert!(!classified.is_rejected());
    }

    #[test]
    fn unmapped_kind_without_errno_is_unknown_code() {
        let err = io::Error::other("weird");
        let classified = TunnelError::from_io(TunnelLeg::Upstream, &err);
        assert_eq!(classified.reason, "UNKNOWN");
    }

    #[test]
    fn display_names_the_leg_and_reason() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let classified = TunnelError::from_io(TunnelLeg::Downstream, &err);
        let rendered = classified.to_string();
        assert!(rendered.contains("downstream leg"));
        assert!(rendered.contains("ECONNREFUSED"));
    }

    #[test]
    fn json_dump_carries_the_taxonomy_fields() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let classified = TunnelError::from_io(TunnelLeg::Downstream, &err);
        let json = classified.to_json();
        assert!(json.contains("\"leg\": \"downstream\""));
        assert!(json.contains("\"severity\": \"rejected\""));
        assert!(json.contains("\"reason\": \"ECONNREFUSED\""));
    }

    #[tokio::test]
    async fn reqwest_connect_errors_classify_through_a_reference() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = reqwest::get(format!("http://127.0.0.1:{port}/"))
            .await
            .unwrap_err();
        let classified = TunnelError::from_reqwest(TunnelLeg::Lease, &err);
        assert!(classified.is_rejected());
        assert_eq!(classified.reason, "ECONNREFUSED");
        assert_eq!(classified.leg, TunnelLeg::Lease);
    }

    #[test]
    fn lease_status_reason_pairs_status_and_text() {
        let err = LeaseError::ResponseStatus {
            status: 503,
            text: "Service Unavailable".into(),
        };
        assert_eq!(err.reason(), "503 Service Unavailable");
    }
}
