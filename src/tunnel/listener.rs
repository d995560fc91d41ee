use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::net::{TcpListener, TcpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{Connection, TcpConnection};
use crate::protocol::{ConnectionId, TunnelId};
use crate::session::ServerSession;

const LISTEN_BACKLOG: u32 = 1024;

/// A public TCP port on the relay. Every accepted socket becomes a
/// connection announced to the client.
pub struct TcpListenerTunnel {
    id: TunnelId,
    port: u16,
    listener: Mutex<Option<TcpListener>>,
    session: Weak<ServerSession>,
    cancel: CancellationToken,
}

impl TcpListenerTunnel {
    /// Bind on all interfaces with address reuse. Port `0` picks a free port.
    pub async fn bind(
        id: TunnelId,
        port: u16,
        session: Weak<ServerSession>,
    ) -> std::io::Result<Arc<Self>> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?;
        let listener = socket.listen(LISTEN_BACKLOG)?;
        let port = listener.local_addr()?.port();

        Ok(Arc::new(Self {
            id,
            port,
            listener: Mutex::new(Some(listener)),
            session,
            cancel: CancellationToken::new(),
        }))
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    /// The port actually bound.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Start accepting. Does nothing if already started or closed.
    pub fn start(self: &Arc<Self>) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            tokio::spawn(self.clone().accept_loop(listener));
        }
    }

    /// Stop listening. Established connections are left to the session.
    pub fn close_local(&self) {
        self.cancel.cancel();
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        info!(tunnel_id = %self.id, "Accepting on port {}", self.port);
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let Some(session) = self.session.upgrade() else {
                break;
            };

            match accepted {
                Ok((socket, peer)) => {
                    debug!("Accepted {} on port {}", peer, self.port);
                    let _ = socket.set_nodelay(true);
                    let connection = TcpConnection::new(
                        ConnectionId::new(),
                        self.id,
                        Box::new(socket),
                        session.owner(),
                    );
                    let cancel = self.cancel.clone();
                    tokio::spawn(async move {
                        if session.add_connection(connection.clone(), &cancel).await.is_ok() {
                            if let Err(e) = connection.start().await {
                                warn!("Could not start connection from {}: {}", peer, e);
                            }
                        }
                    });
                }
                Err(e) => {
                    if !self.cancel.is_cancelled() {
                        warn!("Accept failed on port {}: {}", self.port, e);
                        session.remove_tunnel(self.id, true).await;
                    }
                    break;
                }
            }
        }
        debug!("Listener on port {} stopped", self.port);
    }
}
