//! Tunnels: named conduits that spawn connections.
//!
//! On the relay a tunnel is a public entry point (a TCP listener or a
//! subdomain). On the client it is a factory that opens the matching local
//! connection when the relay announces one.

mod client;
mod listener;
mod web;

pub use client::{ClientTunnel, LocalTarget};
pub use listener::TcpListenerTunnel;
pub use web::WebTunnel;
