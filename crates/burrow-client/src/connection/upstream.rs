//! Upstream connection factory: this client to the relay.

use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{TunnelError, TunnelLeg};
use crate::lease::TunnelLease;

/// Open one upstream socket against the lease's relay target.
///
/// Failures are classified but not emitted here: the tunnel unit decides
/// whether a failed connect is retried or surfaced, so the factory stays a
/// pure `Result`.
pub async fn connect(lease: &TunnelLease) -> Result<TcpStream, TunnelError> {
    let target = (lease.remote_target.as_str(), lease.remote_port);
    debug!(host = target.0, port = target.1, "establishing upstream connection");

    let stream = TcpStream::connect(target)
        .await
        .map_err(|e| TunnelError::from_io(TunnelLeg::Upstream, &e))?;
    stream
        .set_nodelay(true)
        .map_err(|e| TunnelError::from_io(TunnelLeg::Upstream, &e))?;

    debug!(host = target.0, port = target.1, "upstream connection up");
    Ok(stream)
}
