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
use crate::registry::{DomainRegistry, PortRegistry};
use crate::tunnel::{TcpListenerTunnel, WebTunnel};

/// A tunnel hosted by the relay.
#[derive(Clone)]
pub enum ServerTunnel {
    Tcp(Arc<TcpListenerTunnel>),
    Web(Arc<WebTunnel>),
}

impl ServerTunnel {
    pub fn id(&self) -> TunnelId {
        match self {
            ServerTunnel::Tcp(tunnel) => tunnel.id(),
            ServerTunnel::Web(tunnel) => tunnel.id(),
        }
    }

    fn close_local(&self) {
        match self {
            ServerTunnel::Tcp(tunnel) => tunnel.close_local(),
            ServerTunnel::Web(_) => {}
        }
    }
}

/// The relay end of a session.
///
/// Creates public listeners on request and announces every public
/// connection to the client before any of its bytes are forwarded.
pub struct ServerSession {
    core: Session,
    tunnels: DashMap<TunnelId, ServerTunnel>,
    domains: Arc<DomainRegistry>,
    ports: Arc<PortRegistry>,
    this: Weak<ServerSession>,
}

impl ServerSession {
    pub fn new(
        options: SessionOptions,
        domains: Arc<DomainRegistry>,
        ports: Arc<PortRegistry>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            core: Session::new(options),
            tunnels: DashMap::new(),
            domains,
            ports,
            this: this.clone(),
        })
    }

    pub fn session(&self) -> &Session {
        &self.core
    }

    pub fn owner(&self) -> Weak<dyn ConnectionOwner> {
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

    /// Close the transport first, then release every tunnel without notifying.
    pub async fn close(&self) {
        self.core.close();
        self.teardown().await;
    }

    async fn teardown(&self) {
        let ids: Vec<TunnelId> = self.tunnels.iter().map(|t| *t.key()).collect();
        for id in ids {
            self.drop_tunnel(id, false, false).await;
        }
    }

    pub fn add_tunnel(&self, tunnel: ServerTunnel) -> bool {
        match self.tunnels.entry(tunnel.id()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tunnel);
                true
            }
        }
    }

    pub fn tunnel(&self, tunnel_id: TunnelId) -> Option<ServerTunnel> {
        self.tunnels.get(&tunnel_id).map(|t| t.value().clone())
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    /// Register a public connection and wait for the client to accept it.
    pub async fn add_connection(
        &self,
        connection: Arc<dyn Connection>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let connection_id = connection.id();
        let tunnel_id = connection.tunnel_id();

        if !self.tunnels.contains_key(&tunnel_id) {
            return Err(SubwayError::Protocol(format!("unknown tunnel {}", tunnel_id)));
        }
        if !self.core.insert_connection(connection.clone()) {
            return Err(SubwayError::Protocol(format!(
                "duplicate connection {}",
                connection_id
            )));
        }

        let announce = Message::request(MessageCode::NewConnection)
            .with(keys::CONNECTION_ID, connection_id)
            .with(keys::TUNNEL_ID, tunnel_id);

        let accepted = self
            .core
            .send_message(announce, cancel)
            .await
            .and_then(Response::into_result);

        match accepted {
            Ok(_) => {
                debug!("Connection {} accepted on tunnel {}", connection_id, tunnel_id);
                Ok(())
            }
            Err(e) => {
                warn!("Could not add connection {}: {}", connection_id, e);
                if let Some(connection) = self.core.take_connection(connection_id) {
                    let _ = connection.close_local().await;
                }
                Err(SubwayError::Rejected(format!("Could not add connection. {}", e)))
            }
        }
    }

    /// Remove a connection and tell the client it is gone.
    pub async fn remove_connection(&self, connection_id: ConnectionId) {
        self.drop_connection(connection_id, true).await;
    }

    async fn drop_connection(&self, connection_id: ConnectionId, notify_peer: bool) {
        let Some(connection) = self.core.take_connection(connection_id) else {
            return;
        };

        if notify_peer {
            let notification = Message::notification(MessageCode::ConnectionClosedNotification)
                .with(keys::CONNECTION_ID, connection_id);
            if let Err(e) = self.core.send_notification(notification) {
                debug!("Could not notify close of {}: {}", connection_id, e);
            }
        }

        if let Err(e) = connection.close_local().await {
            debug!("Closing connection {} failed: {}", connection_id, e);
        }
    }

    /// Remove a tunnel, its listener or domain, and every connection it carries.
    pub async fn remove_tunnel(&self, tunnel_id: TunnelId, notify_peer: bool) {
        self.drop_tunnel(tunnel_id, notify_peer, notify_peer).await;
    }

    async fn drop_tunnel(&self, tunnel_id: TunnelId, notify_tunnel: bool, notify_connections: bool) {
        let Some((_, tunnel)) = self.tunnels.remove(&tunnel_id) else {
            return;
        };

        match &tunnel {
            ServerTunnel::Web(web) => self.domains.remove(web),
            ServerTunnel::Tcp(tcp) => self.ports.release(tcp.port(), tunnel_id),
        }

        for connection_id in self.core.connections_of(tunnel_id) {
            self.drop_connection(connection_id, notify_connections).await;
        }
        tunnel.close_local();

        if notify_tunnel {
            let notification = Message::notification(MessageCode::TunnelClosedNotification)
                .with(keys::TUNNEL_ID, tunnel_id);
            if let Err(e) = self.core.send_notification(notification) {
                debug!("Could not notify close of tunnel {}: {}", tunnel_id, e);
            }
        }
        info!(tunnel_id = %tunnel_id, "Tunnel closed");
    }

    fn create_web_tunnel(&self, message: &Message) -> Response {
        let subdomain = message.text(keys::DOMAIN).unwrap_or_default();
        if !crate::registry::is_valid_subdomain(&subdomain) {
            return Response::failed(message.id, "Invalid tunnel domain.");
        }

        let tunnel = Arc::new(WebTunnel::new(TunnelId::new(), &subdomain, self.this.clone()));
        if !self.domains.add(tunnel.clone()) {
            return Response::failed(message.id, "Tunnel domain already in use.");
        }
        self.add_tunnel(ServerTunnel::Web(tunnel.clone()));

        let url = self.domains.public_url(tunnel.subdomain());
        info!(tunnel_id = %tunnel.id(), "Web tunnel created at {}", url);
        Response::ok(message.id, format!("Tunnel created at {}", url))
            .with(keys::TUNNEL_ID, tunnel.id())
            .with(keys::URL, url)
    }

    async fn create_tcp_tunnel(&self, message: &Message) -> Response {
        let Ok(port) = u16::try_from(message.int(keys::PORT)) else {
            return Response::failed(message.id, "Invalid port.");
        };
        let tunnel_id = TunnelId::new();

        if port != 0 && !self.ports.claim(port, tunnel_id) {
            return Response::failed(message.id, "Port already in use.");
        }

        let tunnel = match TcpListenerTunnel::bind(tunnel_id, port, self.this.clone()).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                self.ports.release(port, tunnel_id);
                return Response::failed(message.id, e.to_string());
            }
        };

        let bound = tunnel.port();
        if port == 0 && !self.ports.claim(bound, tunnel_id) {
            tunnel.close_local();
            return Response::failed(message.id, "Port already in use.");
        }

        self.add_tunnel(ServerTunnel::Tcp(tunnel.clone()));
        tunnel.start();

        info!(tunnel_id = %tunnel_id, "TCP tunnel listening on port {}", bound);
        Response::ok(message.id, format!("Tunnel created on port {}.", bound))
            .with(keys::TUNNEL_ID, tunnel_id)
            .with(keys::PORT, bound)
    }

    async fn close_tunnel(&self, message: &Message) -> Response {
        let tunnel_id: TunnelId = message.id_value(keys::TUNNEL_ID);
        if !self.tunnels.contains_key(&tunnel_id) {
            return Response::failed(message.id, "Tunnel not found.");
        }
        self.drop_tunnel(tunnel_id, false, true).await;
        Response::ok(message.id, "Tunnel closed.")
    }

    async fn close_connection(&self, message: &Message) -> Response {
        let connection_id: ConnectionId = message.id_value(keys::CONNECTION_ID);
        let Some(connection) = self.core.take_connection(connection_id) else {
            return Response::failed(message.id, "Connection not found.");
        };
        match connection.close_local().await {
            Ok(()) => Response::ok(message.id, "Connection closed."),
            Err(e) => Response::failed(message.id, e.to_string()),
        }
    }
}

#[async_trait]
impl Dispatch for ServerSession {
    async fn process_message(&self, message: Message) {
        let response = match message.code {
            MessageCode::CreateWebTunnel => self.create_web_tunnel(&message),
            MessageCode::CreateTcpTunnel => self.create_tcp_tunnel(&message).await,
            MessageCode::CloseTunnel => self.close_tunnel(&message).await,
            MessageCode::CloseConnection => self.close_connection(&message).await,
            other => {
                warn!("Unknown command {:?}", other);
                Response::failed(message.id, "Unknown command code.")
            }
        };

        if let Err(e) = self.core.send_response(response) {
            debug!("Could not answer {:?}: {}", message.code, e);
        }
    }

    fn connection_failed(&self, connection_id: ConnectionId) {
        if let Some(this) = self.this.upgrade() {
            tokio::spawn(async move { this.remove_connection(connection_id).await });
        }
    }
}

#[async_trait]
impl ConnectionOwner for ServerSession {
    fn send_data(&self, connection_id: ConnectionId, data: Bytes) -> Result<()> {
        self.core.send_data(connection_id, data)
    }

    async fn remove_connection(&self, connection_id: ConnectionId) {
        ServerSession::remove_connection(self, connection_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::RecordingOwner;
    use crate::connection::EchoConnection;
    use crate::protocol::MessageType;
    use crate::session::testing::{fast_options, ws_pair};
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    fn registries() -> (Arc<DomainRegistry>, Arc<PortRegistry>) {
        (
            Arc::new(DomainRegistry::new("subwayapp.dev", "https")),
            Arc::new(PortRegistry::new()),
        )
    }

    async fn request(peer: &mut WebSocketStream<DuplexStream>, message: Message) -> Response {
        peer.send(WsMessage::Text(message.to_json().unwrap()))
            .await
            .unwrap();
        loop {
            match peer.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let reply = Message::from_json(&text).unwrap();
                    if reply.kind == MessageType::Response && reply.id == message.id {
                        return Response::try_from(reply).unwrap();
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    fn spawn_session(
        session: &Arc<ServerSession>,
        transport: WebSocketStream<DuplexStream>,
        cancel: &CancellationToken,
    ) -> tokio::task::JoinHandle<Result<()>> {
        let session = session.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { session.run(transport, &cancel).await })
    }

    #[tokio::test]
    async fn test_duplicate_subdomain_rejected_across_sessions() {
        let (domains, ports) = registries();
        let cancel = CancellationToken::new();

        let (client_a, relay_a) = ws_pair().await;
        let (client_b, relay_b) = ws_pair().await;
        let mut client_a = client_a;
        let mut client_b = client_b;

        let first = ServerSession::new(fast_options(), domains.clone(), ports.clone());
        let second = ServerSession::new(fast_options(), domains.clone(), ports.clone());
        let runners = [
            spawn_session(&first, relay_a, &cancel),
            spawn_session(&second, relay_b, &cancel),
        ];

        let create = || Message::request(MessageCode::CreateWebTunnel).with(keys::DOMAIN, "demo");

        let ok = request(&mut client_a, create()).await;
        assert!(ok.success());
        assert_eq!(ok.message(), "Tunnel created at https://demo.subwayapp.dev");
        assert_eq!(ok.text(keys::URL).as_deref(), Some("https://demo.subwayapp.dev"));
        assert!(!ok.id_value::<TunnelId>(keys::TUNNEL_ID).is_nil());

        let taken = request(&mut client_b, create()).await;
        assert!(!taken.success());
        assert_eq!(taken.message(), "Tunnel domain already in use.");
        assert_eq!(second.tunnel_count(), 0);

        let tunnel_id: TunnelId = ok.id_value(keys::TUNNEL_ID);
        let closed = request(
            &mut client_a,
            Message::request(MessageCode::CloseTunnel).with(keys::TUNNEL_ID, tunnel_id),
        )
        .await;
        assert_eq!(closed.message(), "Tunnel closed.");
        assert!(domains.find("demo").is_none());

        let again = request(&mut client_b, create()).await;
        assert!(again.success());

        cancel.cancel();
        for runner in runners {
            runner.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_unknown_code_and_missing_targets() {
        let (domains, ports) = registries();
        let cancel = CancellationToken::new();
        let (mut client, relay) = ws_pair().await;
        let session = ServerSession::new(fast_options(), domains, ports);
        let runner = spawn_session(&session, relay, &cancel);

        let unknown = request(&mut client, Message::request(MessageCode::Unknown)).await;
        assert!(!unknown.success());
        assert_eq!(unknown.message(), "Unknown command code.");

        let missing_tunnel = request(
            &mut client,
            Message::request(MessageCode::CloseTunnel).with(keys::TUNNEL_ID, TunnelId::new()),
        )
        .await;
        assert_eq!(missing_tunnel.message(), "Tunnel not found.");

        let missing_connection = request(
            &mut client,
            Message::request(MessageCode::CloseConnection)
                .with(keys::CONNECTION_ID, ConnectionId::new()),
        )
        .await;
        assert_eq!(missing_connection.message(), "Connection not found.");

        cancel.cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_tunnel_notifies_only_its_connections() {
        let (domains, ports) = registries();
        let cancel = CancellationToken::new();
        let (mut client, relay) = ws_pair().await;
        let session = ServerSession::new(fast_options(), domains, ports);
        let runner = spawn_session(&session, relay, &cancel);

        let mut tunnel_ids = Vec::new();
        for domain in ["first", "second"] {
            let created = request(
                &mut client,
                Message::request(MessageCode::CreateWebTunnel).with(keys::DOMAIN, domain),
            )
            .await;
            assert!(created.success());
            tunnel_ids.push(created.id_value::<TunnelId>(keys::TUNNEL_ID));
        }
        let (closing, kept) = (tunnel_ids[0], tunnel_ids[1]);

        let owner = Arc::new(RecordingOwner::default());
        let mut swept = Vec::new();
        for tunnel_id in [closing, closing, kept] {
            let id = ConnectionId::new();
            let connection = Arc::new(EchoConnection::new(id, tunnel_id, owner.weak()));
            assert!(session.core.insert_connection(connection));
            if tunnel_id == closing {
                swept.push(id);
            }
        }
        let survivor = session.core.connections_of(kept)[0];

        let close = Message::request(MessageCode::CloseTunnel).with(keys::TUNNEL_ID, closing);
        let close_id = close.id;
        client.send(WsMessage::Text(close.to_json().unwrap())).await.unwrap();

        let mut notified = Vec::new();
        let response = loop {
            let text = match client.next().await {
                Some(Ok(WsMessage::Text(text))) => text,
                Some(Ok(_)) => continue,
                other => panic!("unexpected {:?}", other),
            };
            let message = Message::from_json(&text).unwrap();
            match message.code {
                MessageCode::ConnectionClosedNotification => {
                    notified.push(message.id_value::<ConnectionId>(keys::CONNECTION_ID));
                }
                MessageCode::TunnelClosedNotification => panic!("tunnel close was echoed"),
                _ if message.kind == MessageType::Response && message.id == close_id => {
                    break Response::try_from(message).unwrap();
                }
                _ => {}
            }
        };

        assert_eq!(response.message(), "Tunnel closed.");
        notified.sort();
        swept.sort();
        assert_eq!(notified, swept);
        assert!(session.core.connection(survivor).is_some());
        assert!(session.tunnel(kept).is_some());
        assert_eq!(session.tunnel_count(), 1);

        cancel.cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_teardown_releases_registries() {
        let (domains, ports) = registries();
        let cancel = CancellationToken::new();
        let (mut client, relay) = ws_pair().await;
        let session = ServerSession::new(fast_options(), domains.clone(), ports.clone());
        let runner = spawn_session(&session, relay, &cancel);

        let web = request(
            &mut client,
            Message::request(MessageCode::CreateWebTunnel).with(keys::DOMAIN, "gone"),
        )
        .await;
        assert!(web.success());

        let tcp = request(
            &mut client,
            Message::request(MessageCode::CreateTcpTunnel).with(keys::PORT, 0u16),
        )
        .await;
        assert!(tcp.success());
        let port = u16::try_from(tcp.int(keys::PORT)).unwrap();
        assert_ne!(port, 0);
        assert_eq!(tcp.message(), format!("Tunnel created on port {}.", port));
        assert!(ports.is_claimed(port));

        drop(client);
        runner.await.unwrap().ok();

        assert_eq!(session.tunnel_count(), 0);
        assert!(domains.find("gone").is_none());
        assert!(!ports.is_claimed(port));
    }
}
