//! Connection factories for the three legs of a tunnel unit.
//!
//! All three share one shape: open a transport-level connection, classify
//! connect-time failures through the error taxonomy, and leave steady-state
//! errors to the pipe loop that owns the socket.

pub mod downstream;
pub mod fallback;
pub mod upstream;

pub use downstream::DownstreamStream;
pub use fallback::FallbackServer;
