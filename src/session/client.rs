use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Dispatch, Session, SessionOptions};
use crate::connection::{Connection, ConnectionOwner};
use crate::error::{Result, SubwayError};
use crate::protocol::{keys, ConnectionId, Message, MessageCode, Response, TunnelId};
use crate::tunnel::ClientTunnel;

/// The tunnel-owner end of a session.
///
/// Asks the relay for tunnels and, when the relay announces a new public
/// connection, opens the matching local connection.
pub struct ClientSession {
    core: Session,
    tunnels: DashMap<TunnelId, Arc<ClientTunnel>>,
    this: Weak<ClientSession>,
}

impl ClientSession {
    pub fn new(options: SessionOptions) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            core: Session::new(options),
            tunnels: DashMap::new(),
            this: this.clone(),
        })
    }

    pub fn session(&self) -> &Session {
        &self.core
    }

    fn owner(&self) -> Weak<dyn ConnectionOwner> {
        let owner: Weak<dyn ConnectionOwner> = self.this.clone();
        owner
    }

    pub async fn run<S>(&self, transport: WebSocketStream<S>, cancel: &CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let result = self.core.run(transport, self, cancel).await;
        self.teardown().await;
        result
    }

    /// Close the transport, then drop every tunnel without notifying.
    pub async fn close(&self) {
        self.core.close();
        self.teardown().await;
    }

    async fn teardown(&self) {
        let ids: Vec<TunnelId> = self.tunnels.iter().map(|t| *t.key()).collect();
        for id in ids {
            self.remove_tunnel(id, false).await;
        }
    }

    /// Ask the relay for `<subdomain>.<domain>`; returns the tunnel id and public URL.
    pub async fn request_web_tunnel(
        &self,
        subdomain: &str,
        cancel: &CancellationToken,
    ) -> Result<(TunnelId, String)> {
        let request = Message::request(MessageCode::CreateWebTunnel).with(keys::DOMAIN, subdomain);
        let response = self.core.send_message(request, cancel).await?.into_result()?;
        let url = response.text(keys::URL).unwrap_or_default();
        info!("{}", response.message());
        Ok((response.id_value(keys::TUNNEL_ID), url))
    }

    /// Ask the relay to listen on `port` (`0` for any); returns the tunnel id and bound port.
    pub async fn request_tcp_tunnel(
        &self,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<(TunnelId, u16)> {
        let request = Message::request(MessageCode::CreateTcpTunnel).with(keys::PORT, port);
        let response = self.core.send_message(request, cancel).await?.into_result()?;
        let bound = u16::try_from(response.int(keys::PORT)).map_err(|_| {
            SubwayError::Protocol(format!("relay reported invalid port {}", response.int(keys::PORT)))
        })?;
        info!("{}", response.message());
        Ok((response.id_value(keys::TUNNEL_ID), bound))
    }

    pub fn add_tunnel(&self, tunnel: ClientTunnel) -> bool {
        match self.tunnels.entry(tunnel.id()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(tunnel));
                true
            }
        }
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    pub fn add_connection(&self, connection: Arc<dyn Connection>) -> Result<()> {
        if !self.tunnels.contains_key(&connection.tunnel_id()) {
            return Err(SubwayError::Protocol(format!(
                "unknown tunnel {}",
                connection.tunnel_id()
            )));
        }
        if !self.core.insert_connection(connection.clone()) {
            return Err(SubwayError::Protocol(format!(
                "duplicate connection {}",
                connection.id()
            )));
        }
        Ok(())
    }

    /// Remove a connection; with `notify_peer` the relay is told to drop its side.
    pub async fn remove_connection(&self, connection_id: ConnectionId, notify_peer: bool) {
        let Some(connection) = self.core.take_connection(connection_id) else {
            return;
        };

        if let Err(e) = connection.close_local().await {
            debug!("Closing connection {} failed: {}", connection_id, e);
        }

        if notify_peer {
            let message = Message::request(MessageCode::CloseConnection)
                .with(keys::CONNECTION_ID, connection_id);
            let cancel = CancellationToken::new();
            if let Err(e) = self.core.send_message(message, &cancel).await {
                debug!("Relay did not confirm closing {}: {}", connection_id, e);
            }
        }
    }

    /// Remove a tunnel and every connection it carries.
    pub async fn remove_tunnel(&self, tunnel_id: TunnelId, notify_peer: bool) {
        let Some((_, tunnel)) = self.tunnels.remove(&tunnel_id) else {
            return;
        };

        if notify_peer {
            let message =
                Message::request(MessageCode::CloseTunnel).with(keys::TUNNEL_ID, tunnel_id);
            let cancel = CancellationToken::new();
            if let Err(e) = self.core.send_message(message, &cancel).await {
                debug!("Relay did not confirm closing tunnel {}: {}", tunnel_id, e);
            }
        }

        for connection_id in self.core.connections_of(tunnel_id) {
            self.remove_connection(connection_id, false).await;
        }
        tunnel.close_local();
        info!(tunnel_id = %tunnel_id, "Tunnel closed");
    }

    async fn new_connection(&self, message: &Message) -> Response {
        let tunnel_id: TunnelId = message.id_value(keys::TUNNEL_ID);
        let connection_id: ConnectionId = message.id_value(keys::CONNECTION_ID);

        let tunnel = self.tunnels.get(&tunnel_id).map(|t| t.value().clone());
        let Some(tunnel) = tunnel else {
            return Response::failed(message.id, "Tunnel not found.");
        };

        let opened = async {
            let connection = tunnel.create_connection(connection_id, self.owner()).await?;
            self.add_connection(connection.clone())?;
            if let Err(e) = connection.start().await {
                self.core.take_connection(connection_id);
                let _ = connection.close_local().await;
                return Err(e);
            }
            Ok::<_, SubwayError>(())
        };

        match opened.await {
            Ok(()) => {
                debug!("Connection {} ready on tunnel {}", connection_id, tunnel_id);
                Response::ok(message.id, "Connection ready.")
            }
            Err(e) => {
                warn!("Could not open connection for tunnel {}: {}", tunnel_id, e);
                Response::failed(message.id, e.to_string())
            }
        }
    }
}

#[async_trait]
impl Dispatch for ClientSession {
    async fn process_message(&self, message: Message) {
        match message.code {
            MessageCode::NewConnection => {
                let response = self.new_connection(&message).await;
                if let Err(e) = self.core.send_response(response) {
                    debug!("Could not answer NewConnection: {}", e);
                }
            }
            MessageCode::ConnectionClosedNotification => {
                self.remove_connection(message.id_value(keys::CONNECTION_ID), false)
                    .await;
            }
            MessageCode::TunnelClosedNotification => {
                self.remove_tunnel(message.id_value(keys::TUNNEL_ID), false)
                    .await;
            }
            other => debug!("Ignoring message {:?}", other),
        }
    }

    fn connection_failed(&self, connection_id: ConnectionId) {
        if let Some(this) = self.this.upgrade() {
            tokio::spawn(async move { this.remove_connection(connection_id, true).await });
        }
    }
}

#[async_trait]
impl ConnectionOwner for ClientSession {
    fn send_data(&self, connection_id: ConnectionId, data: Bytes) -> Result<()> {
        self.core.send_data(connection_id, data)
    }

    async fn remove_connection(&self, connection_id: ConnectionId) {
        ClientSession::remove_connection(self, connection_id, true).await
    }
}
