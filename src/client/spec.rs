use std::fmt;

use crate::tunnel::LocalTarget;

/// One tunnel requested on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelSpec {
    /// Relay port that reflects every byte back.
    Echo { port: u16 },
    /// Relay port forwarded to a local TCP service.
    Tcp { port: u16, target: LocalTarget },
    /// Public subdomain forwarded to a local web server.
    Web { subdomain: String, target: LocalTarget },
}

impl TunnelSpec {
    /// `<port>`
    pub fn parse_echo(s: &str) -> Result<Self, String> {
        Ok(TunnelSpec::Echo {
            port: parse_port(s)?,
        })
    }

    /// `<relay port>:<host>:<port>`
    pub fn parse_tcp(s: &str) -> Result<Self, String> {
        let (port, target) = s
            .split_once(':')
            .ok_or_else(|| format!("expected <port>:<host>:<port>, got '{}'", s))?;
        Ok(TunnelSpec::Tcp {
            port: parse_port(port)?,
            target: parse_target(target, false)?,
        })
    }

    /// `<subdomain>:<host>:<port>` served over plain HTTP locally.
    pub fn parse_http(s: &str) -> Result<Self, String> {
        Self::parse_web(s, false)
    }

    /// `<subdomain>:<host>:<port>` served over TLS locally.
    pub fn parse_https(s: &str) -> Result<Self, String> {
        Self::parse_web(s, true)
    }

    fn parse_web(s: &str, tls: bool) -> Result<Self, String> {
        let (subdomain, target) = s
            .split_once(':')
            .ok_or_else(|| format!("expected <subdomain>:<host>:<port>, got '{}'", s))?;
        if subdomain.is_empty() {
            return Err(format!("missing subdomain in '{}'", s));
        }
        Ok(TunnelSpec::Web {
            subdomain: subdomain.to_ascii_lowercase(),
            target: parse_target(target, tls)?,
        })
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelSpec::Echo { port } => write!(f, "echo on port {}", port),
            TunnelSpec::Tcp { port, target } => write!(f, "port {} -> {}", port, target),
            TunnelSpec::Web { subdomain, target } => write!(f, "{} -> {}", subdomain, target),
        }
    }
}

fn parse_port(s: &str) -> Result<u16, String> {
    s.trim()
        .parse()
        .map_err(|_| format!("invalid port '{}'", s))
}

fn parse_target(s: &str, tls: bool) -> Result<LocalTarget, String> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("expected <host>:<port>, got '{}'", s))?;
    if host.is_empty() {
        return Err(format!("missing host in '{}'", s));
    }
    Ok(LocalTarget::new(host, parse_port(port)?, tls))
}
