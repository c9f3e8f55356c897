//! Tunnel session management: the unit pool and the client façade.

pub mod client;
pub mod unit;

pub use client::{ClientStatus, TunnelClient};
pub use unit::{TunnelUnit, UnitStatus};
