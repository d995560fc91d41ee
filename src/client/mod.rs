//! Tunnel client.
//!
//! - [`TunnelClient`] keeps a session to the relay alive and reconnects with backoff
//! - [`TunnelSpec`] describes one tunnel requested on the command line

mod connection;
mod spec;

pub use connection::TunnelClient;
pub use spec::TunnelSpec;
