//! Relay-wide lookup tables shared by every session.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

use crate::http::host_without_port;
use crate::protocol::TunnelId;
use crate::tunnel::WebTunnel;

/// Maps public subdomains to web tunnels.
pub struct DomainRegistry {
    domain: String,
    scheme: String,
    tunnels: DashMap<String, Arc<WebTunnel>>,
}

impl DomainRegistry {
    pub fn new(domain: impl Into<String>, scheme: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            scheme: scheme.into(),
            tunnels: DashMap::new(),
        }
    }

    /// Base domain that subdomains hang off.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn public_url(&self, subdomain: &str) -> String {
        format!("{}://{}.{}", self.scheme, subdomain, self.domain)
    }

    /// Claim the tunnel's subdomain; `false` if someone already holds it.
    pub fn add(&self, tunnel: Arc<WebTunnel>) -> bool {
        match self.tunnels.entry(tunnel.subdomain().to_ascii_lowercase()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(tunnel);
                true
            }
        }
    }

    /// Release the subdomain, but only if this exact tunnel still holds it.
    pub fn remove(&self, tunnel: &WebTunnel) {
        self.tunnels
            .remove_if(&tunnel.subdomain().to_ascii_lowercase(), |_, held| {
                held.id() == tunnel.id()
            });
    }

    pub fn find(&self, subdomain: &str) -> Option<Arc<WebTunnel>> {
        self.tunnels
            .get(&subdomain.to_ascii_lowercase())
            .map(|t| t.value().clone())
    }

    /// Resolve a `Host` header value to a tunnel by its first label.
    pub fn find_by_host(&self, host: &str) -> Option<Arc<WebTunnel>> {
        let subdomain = host_without_port(host).split('.').next()?;
        self.find(subdomain)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

/// Tracks which public TCP ports are held by which tunnel.
#[derive(Default)]
pub struct PortRegistry {
    ports: DashMap<u16, TunnelId>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, port: u16, tunnel_id: TunnelId) -> bool {
        match self.ports.entry(port) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(tunnel_id);
                true
            }
        }
    }

    pub fn release(&self, port: u16, tunnel_id: TunnelId) {
        self.ports.remove_if(&port, |_, held| *held == tunnel_id);
    }

    #[cfg(test)]
    pub fn is_claimed(&self, port: u16) -> bool {
        self.ports.contains_key(&port)
    }
}

/// A single DNS label: letters, digits and inner hyphens.
pub fn is_valid_subdomain(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}
