use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::fmt;
use std::io;
use std::sync::{Arc, OnceLock, Weak};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::connection::{BoxedStream, Connection, ConnectionOwner, EchoConnection, TcpConnection};
use crate::error::Result;
use crate::protocol::{ConnectionId, TunnelId};

static TLS_CONNECTOR: OnceLock<TlsConnector> = OnceLock::new();

/// A local service the client forwards to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTarget {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl LocalTarget {
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }

    /// Value for the `Host` header, omitting the scheme's default port.
    pub fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    async fn connect(&self) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let _ = stream.set_nodelay(true);
        if !self.tls {
            return Ok(Box::new(stream));
        }

        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let stream = tls_connector()?.connect(server_name, stream).await?;
        Ok(Box::new(stream))
    }
}

impl fmt::Display for LocalTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

fn tls_connector() -> io::Result<TlsConnector> {
    if let Some(connector) = TLS_CONNECTOR.get() {
        return Ok(connector.clone());
    }

    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        warn!("Skipping native certificate: {}", e);
    }
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    debug!("Loaded {} root certificates ({} ignored)", added, ignored);

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    .with_root_certificates(roots)
    .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    Ok(TLS_CONNECTOR.get_or_init(|| connector).clone())
}

#[derive(Debug, Clone)]
enum Kind {
    Echo,
    Tcp(LocalTarget),
    Web(LocalTarget),
}

/// Client-side tunnel: knows how to open the local end of a connection.
#[derive(Debug, Clone)]
pub struct ClientTunnel {
    id: TunnelId,
    kind: Kind,
}

impl ClientTunnel {
    /// Bytes are reflected back to the relay.
    pub fn echo(id: TunnelId) -> Self {
        Self { id, kind: Kind::Echo }
    }

    /// Raw bytes to a local TCP service.
    pub fn tcp(id: TunnelId, target: LocalTarget) -> Self {
        Self {
            id,
            kind: Kind::Tcp(target),
        }
    }

    /// HTTP requests to a local web server, with `Host` rewritten.
    pub fn web(id: TunnelId, target: LocalTarget) -> Self {
        Self {
            id,
            kind: Kind::Web(target),
        }
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn target(&self) -> Option<&LocalTarget> {
        match &self.kind {
            Kind::Echo => None,
            Kind::Tcp(target) | Kind::Web(target) => Some(target),
        }
    }

    pub async fn create_connection(
        &self,
        connection_id: ConnectionId,
        owner: Weak<dyn ConnectionOwner>,
    ) -> Result<Arc<dyn Connection>> {
        let connection: Arc<dyn Connection> = match &self.kind {
            Kind::Echo => Arc::new(EchoConnection::new(connection_id, self.id, owner)),
            Kind::Tcp(target) => {
                let stream = target.connect().await?;
                TcpConnection::new(connection_id, self.id, stream, owner)
            }
            Kind::Web(target) => {
                let stream = target.connect().await?;
                TcpConnection::web_client(
                    connection_id,
                    self.id,
                    stream,
                    owner,
                    &target.host_header(),
                )
            }
        };
        Ok(connection)
    }

    /// Client tunnels hold no local resources of their own.
    pub fn close_local(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::RecordingOwner;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_host_header_omits_default_port() {
        assert_eq!(LocalTarget::new("localhost", 80, false).host_header(), "localhost");
        assert_eq!(LocalTarget::new("localhost", 443, true).host_header(), "localhost");
        assert_eq!(LocalTarget::new("localhost", 3000, false).host_header(), "localhost:3000");
        assert_eq!(LocalTarget::new("api.local", 80, true).host_header(), "api.local:80");
    }

    #[tokio::test]
    async fn test_tcp_tunnel_dials_target() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = target.local_addr().unwrap().port();

        let owner = Arc::new(RecordingOwner::default());
        let tunnel = ClientTunnel::tcp(TunnelId::new(), LocalTarget::new("127.0.0.1", port, false));
        let connection = tunnel
            .create_connection(ConnectionId::new(), owner.weak())
            .await
            .unwrap();
        assert_eq!(connection.tunnel_id(), tunnel.id());

        let (mut accepted, _) = target.accept().await.unwrap();
        connection
            .send_to_local(bytes::Bytes::from_static(b"hello"))
            .await
            .unwrap();
        let mut buf = [0u8; 5];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        connection.start().await.unwrap();
        accepted.write_all(b"back").await.unwrap();
        crate::connection::testing::eventually(|| owner.sent_to(connection.id()) == b"back").await;
    }

    #[tokio::test]
    async fn test_unreachable_target_fails() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = target.local_addr().unwrap().port();
        drop(target);

        let owner = Arc::new(RecordingOwner::default());
        let tunnel = ClientTunnel::tcp(TunnelId::new(), LocalTarget::new("127.0.0.1", port, false));
        assert!(tunnel
            .create_connection(ConnectionId::new(), owner.weak())
            .await
            .is_err());
    }
}
