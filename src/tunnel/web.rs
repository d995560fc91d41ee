use std::sync::{Arc, Weak};

use crate::protocol::TunnelId;
use crate::session::ServerSession;

/// A subdomain on the relay's public HTTP listener.
pub struct WebTunnel {
    id: TunnelId,
    subdomain: String,
    session: Weak<ServerSession>,
}

impl WebTunnel {
    pub fn new(id: TunnelId, subdomain: &str, session: Weak<ServerSession>) -> Self {
        Self {
            id,
            subdomain: subdomain.to_ascii_lowercase(),
            session,
        }
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    /// The session serving this tunnel, if it is still alive.
    pub fn session(&self) -> Option<Arc<ServerSession>> {
        self.session.upgrade()
    }
}
