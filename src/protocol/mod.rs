//! Wire protocol spoken over the session's WebSocket.
//!
//! Two kinds of frames share the socket:
//! - text frames carry a JSON [`Message`] (requests, responses, notifications)
//! - binary frames carry a [`DataFrame`] addressed to one connection
//!
//! Also provides type-safe ID wrappers for compile-time safety.

mod frame;
mod ids;
mod messages;

pub use frame::*;
pub use ids::*;
pub use messages::*;
