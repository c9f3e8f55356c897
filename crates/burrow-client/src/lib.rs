//! Burrow Client Library
//!
//! Exposes a local HTTP service through a public relay URL:
//! - Lease acquisition against a localtunnel-compatible relay
//! - A pool of bidirectional tunnel units with automatic reconnect
//! - Streaming Host-header rewrite on the upstream-to-local path
//! - A local fallback responder for when the service is down

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod keepalive;
pub mod lease;
pub mod logging;
pub mod transform;
pub mod tunnel;

pub use config::{CertPaths, ClientOptions, TlsOptions, TunnelConfig};
pub use error::{ClientError, ConfigError, LeaseError, Severity, TunnelError, TunnelLeg};
pub use events::{TunnelEvent, Warning, WarningKind};
pub use lease::{LeaseClient, TunnelLease};
pub use tunnel::{ClientStatus, TunnelClient};
