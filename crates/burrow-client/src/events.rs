//! Typed event surface for the tunnel client.
//!
//! A closed union of event kinds replaces the string-keyed listener
//! registry of older tunnel clients: subscribers receive every event over
//! one broadcast channel and match on the variant they care about.

use tokio::sync::broadcast;

use crate::error::TunnelError;

/// Events observable while a tunnel session is running.
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// All tunnel units completed their first connect; the session is up.
    Open,
    /// The session was closed. Emitted exactly once per session.
    Closed,
    /// A non-fatal advisory.
    Warning(Warning),
    /// A classified failure on the relay leg.
    UpstreamError(TunnelError),
    /// A classified failure on the local-service leg.
    DownstreamError(TunnelError),
    /// A classified failure on the fallback-responder leg.
    ProxyError(TunnelError),
    /// A request observed flowing through a tunnel unit.
    Request { method: String, path: String },
}

/// Non-fatal advisory kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    /// `open()`/`close()` called while already in that state.
    DuplicateCall,
    /// The relay granted fewer connections than the pool would like.
    LowConnectionGrant,
    /// The grant is too small to keep any safety margin at all.
    VeryLowConnectionGrant,
    /// Public-IP discovery failed; no tunnel password is available.
    PasswordUnavailable,
}

/// A non-fatal advisory with a human-readable message.
#[derive(Debug, Clone)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Events sent per connection slot are bounded in practice; this factor
/// sizes the broadcast channel from the lease's connection grant instead of
/// leaving it unbounded.
const EVENTS_PER_CONNECTION: usize = 32;
const MIN_CAPACITY: usize = 64;

/// Build the shared event channel, sized from the lease grant.
pub(crate) fn channel(max_connections: u32) -> broadcast::Sender<TunnelEvent> {
    let capacity = (max_connections as usize * EVENTS_PER_CONNECTION).max(MIN_CAPACITY);
    broadcast::channel(capacity).0
}
