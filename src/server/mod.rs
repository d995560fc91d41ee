//! The relay host.
//!
//! One HTTP/1 listener does two jobs. Requests whose `Host` names a
//! registered subdomain are replayed through that web tunnel. Otherwise
//! `/connect` is upgraded to a WebSocket and becomes a [`ServerSession`].

mod auth;

pub use auth::{provider_for, AuthProvider, Authentication};
#[cfg(test)]
pub use auth::AllowAll;

use bytes::Bytes;
use http::header::{
    CONNECTION, HOST, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE,
};
use http::{HeaderName, HeaderValue, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, PublicRequest, WebServerConnection};
use crate::error::Result;
use crate::http::{is_hop_by_hop, HeaderCollection};
use crate::registry::{DomainRegistry, PortRegistry};
use crate::session::{ServerSession, SessionOptions};
use crate::tunnel::WebTunnel;

/// Path that upgrades into a session.
pub const CONNECT_PATH: &str = "/connect";

pub type RelayBody = UnsyncBoxBody<Bytes, Infallible>;

pub struct RelayServer {
    domains: Arc<DomainRegistry>,
    ports: Arc<PortRegistry>,
    auth: Arc<dyn AuthProvider>,
    options: SessionOptions,
    shutdown: CancellationToken,
}

impl RelayServer {
    pub fn new(
        domain: &str,
        public_scheme: &str,
        auth: Arc<dyn AuthProvider>,
        options: SessionOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            domains: Arc::new(DomainRegistry::new(domain, public_scheme)),
            ports: Arc::new(PortRegistry::new()),
            auth,
            options,
            shutdown: CancellationToken::new(),
        })
    }

    #[cfg(test)]
    pub fn domains(&self) -> &DomainRegistry {
        &self.domains
    }

    /// Cancelling this stops the accept loop and every session.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        info!("Relay listening on {} for *.{}", local, self.domains.domain());

        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };

            let relay = self.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let relay = relay.clone();
                    async move { Ok::<_, Infallible>(relay.handle(req, peer, local.port()).await) }
                });

                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await
                {
                    debug!("Connection from {} ended: {}", peer, e);
                }
            });
        }

        info!("Relay stopped");
        Ok(())
    }

    async fn handle(
        self: &Arc<Self>,
        req: Request<Incoming>,
        peer: SocketAddr,
        local_port: u16,
    ) -> Response<RelayBody> {
        let host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| req.uri().host())
            .map(str::to_string);

        if let Some(tunnel) = host.as_deref().and_then(|h| self.domains.find_by_host(h)) {
            return self.proxy(tunnel, req, peer, local_port).await;
        }

        if req.uri().path() == CONNECT_PATH {
            return self.accept_session(req, peer);
        }

        text_response(StatusCode::NOT_FOUND, "Not Found")
    }

    fn accept_session(self: &Arc<Self>, req: Request<Incoming>, peer: SocketAddr) -> Response<RelayBody> {
        if !is_websocket_upgrade(&req) {
            return text_response(StatusCode::BAD_REQUEST, "Expected a WebSocket upgrade");
        }

        if let Authentication::Denied(reason) = self.auth.authenticate(req.headers()) {
            warn!("Rejected session from {}: {}", peer, reason);
            return text_response(StatusCode::UNAUTHORIZED, "Unauthorized");
        }

        let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY) else {
            return text_response(StatusCode::BAD_REQUEST, "Missing Sec-WebSocket-Key");
        };
        let Ok(accept) = HeaderValue::from_str(&derive_accept_key(key.as_bytes())) else {
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        };

        let relay = self.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                        .await;
                    relay.run_session(ws, peer).await;
                }
                Err(e) => warn!("Upgrade from {} failed: {}", peer, e),
            }
        });

        let mut response = Response::new(empty_body());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        let headers = response.headers_mut();
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
        response
    }

    async fn run_session<S>(&self, ws: WebSocketStream<S>, peer: SocketAddr)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
    {
        let session = ServerSession::new(self.options.clone(), self.domains.clone(), self.ports.clone());
        info!(%peer, "Session opened");
        match session.run(ws, &self.shutdown).await {
            Ok(()) => info!(%peer, "Session closed"),
            Err(e) => error!(%peer, "Session failed: {}", e),
        }
    }

    async fn proxy(
        &self,
        tunnel: Arc<WebTunnel>,
        req: Request<Incoming>,
        peer: SocketAddr,
        local_port: u16,
    ) -> Response<RelayBody> {
        let Some(session) = tunnel.session() else {
            return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
        };

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!("Could not read request body from {}: {}", peer, e);
                return text_response(StatusCode::BAD_REQUEST, "Bad Request");
            }
        };

        let mut headers = HeaderCollection::new();
        for (name, value) in &parts.headers {
            if !is_hop_by_hop(name.as_str()) {
                headers.add(name.as_str(), String::from_utf8_lossy(value.as_bytes()));
            }
        }
        if !body.is_empty() || headers.contains("Content-Length") {
            headers.set("Content-Length", body.len().to_string());
        }

        let mut request = PublicRequest {
            method: parts.method.to_string(),
            target: parts
                .uri
                .path_and_query()
                .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string()),
            version: format!("{:?}", parts.version),
            headers,
            body,
        };
        request.add_forwarding_headers(peer.ip(), "http", local_port);

        let (connection, pending) = WebServerConnection::new(tunnel.id(), session.owner());
        let connection_id = connection.id();

        let aborted = CancellationToken::new();
        {
            let session = session.clone();
            let aborted = aborted.clone();
            tokio::spawn(async move {
                aborted.cancelled().await;
                session.remove_connection(connection_id).await;
            });
        }
        let guard = aborted.drop_guard();

        if let Err(e) = session.add_connection(connection.clone(), &self.shutdown).await {
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
        debug!(
            connection_id = %connection_id,
            tunnel_id = %tunnel.id(),
            "{} {} from {}",
            request.method,
            request.target,
            peer
        );

        if let Err(e) = connection.send_request(&request) {
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }

        let Ok(head) = pending.head.await else {
            return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
        };
        let Ok(status) = StatusCode::from_u16(head.status) else {
            warn!("Tunnel {} answered with status {}", tunnel.subdomain(), head.status);
            return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
        };

        let mut response = Response::new(
            TunnelBody {
                rx: pending.body,
                _guard: guard,
            }
            .boxed_unsync(),
        );
        *response.status_mut() = status;
        for (name, value) in head.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    response.headers_mut().append(name, value);
                }
                _ => debug!("Dropping unrepresentable response header {}", name),
            }
        }
        response
    }
}

/// Streams a relayed response body; dropping it aborts the connection.
struct TunnelBody {
    rx: mpsc::Receiver<Bytes>,
    _guard: DropGuard,
}

impl Body for TunnelBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, Infallible>>> {
        self.rx
            .poll_recv(cx)
            .map(|chunk| chunk.map(|data| Ok(Frame::data(data))))
    }
}

fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    let has_token = |name: HeaderName, token: &str| {
        req.headers().get_all(name).iter().any(|value| {
            value
                .to_str()
                .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
                .unwrap_or(false)
        })
    };
    has_token(CONNECTION, "upgrade") && has_token(UPGRADE, "websocket")
}

fn empty_body() -> RelayBody {
    Empty::new().boxed_unsync()
}

fn text_response(status: StatusCode, text: impl Into<String>) -> Response<RelayBody> {
    let mut response = Response::new(Full::new(Bytes::from(text.into())).boxed_unsync());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(http::header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::fast_options;
    use crate::session::ClientSession;
    use crate::tunnel::{ClientTunnel, LocalTarget};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    async fn start_relay(auth: Arc<dyn AuthProvider>) -> (Arc<RelayServer>, u16) {
        let relay = RelayServer::new("subwayapp.dev", "http", auth, fast_options());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(relay.clone().serve(listener));
        (relay, port)
    }

    async fn connect_client(relay_port: u16) -> Arc<ClientSession> {
        let (ws, _) = connect_async(format!("ws://127.0.0.1:{}{}", relay_port, CONNECT_PATH))
            .await
            .unwrap();
        let client = ClientSession::new(fast_options());
        let runner = client.clone();
        tokio::spawn(async move {
            let _ = runner.run(ws, &CancellationToken::new()).await;
        });
        client
    }

    /// Accept one request on `listener`, return its head and answer `hello`.
    async fn serve_once(listener: TcpListener) -> String {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "request ended early");
            head.extend_from_slice(&buf[..n]);
        }
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
        socket.shutdown().await.unwrap();
        String::from_utf8(head).unwrap()
    }

    #[tokio::test]
    async fn test_tcp_tunnel_end_to_end() {
        let (_relay, relay_port) = start_relay(Arc::new(AllowAll)).await;
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_port = target.local_addr().unwrap().port();

        let client = connect_client(relay_port).await;
        let (tunnel_id, public_port) = client
            .request_tcp_tunnel(0, &CancellationToken::new())
            .await
            .unwrap();
        assert_ne!(public_port, 0);
        assert!(client.add_tunnel(ClientTunnel::tcp(
            tunnel_id,
            LocalTarget::new("127.0.0.1", target_port, false)
        )));

        let mut public = TcpStream::connect(("127.0.0.1", public_port)).await.unwrap();
        let (mut local, _) = target.accept().await.unwrap();

        public.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        local.write_all(b"pong").await.unwrap();
        public.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(public);
        let n = tokio::time::timeout(Duration::from_secs(5), local.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_web_tunnel_end_to_end() {
        let (relay, relay_port) = start_relay(Arc::new(AllowAll)).await;
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_port = target.local_addr().unwrap().port();
        let served = tokio::spawn(serve_once(target));

        let client = connect_client(relay_port).await;
        let (tunnel_id, url) = client
            .request_web_tunnel("demo", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(url, "http://demo.subwayapp.dev");
        assert!(relay.domains().find("demo").is_some());
        client.add_tunnel(ClientTunnel::web(
            tunnel_id,
            LocalTarget::new("127.0.0.1", target_port, false),
        ));

        let response = reqwest::Client::new()
            .get(format!("http://127.0.0.1:{}/path?x=1", relay_port))
            .header("Host", "demo.subwayapp.dev")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "hello");

        let head = served.await.unwrap().to_ascii_lowercase();
        assert!(head.starts_with("get /path?x=1 http/1.1\r\n"));
        assert!(head.contains(&format!("host: 127.0.0.1:{}\r\n", target_port)));
        assert!(head.contains("connection: close\r\n"));
        assert!(head.contains("x-forwarded-for: 127.0.0.1\r\n"));
        assert!(head.contains("x-forwarded-host: demo.subwayapp.dev\r\n"));
    }

    #[tokio::test]
    async fn test_unknown_host_is_not_found() {
        let (_relay, relay_port) = start_relay(Arc::new(AllowAll)).await;
        let response = reqwest::Client::new()
            .get(format!("http://127.0.0.1:{}/", relay_port))
            .header("Host", "nobody.subwayapp.dev")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
        assert_eq!(response.text().await.unwrap(), "Not Found");
    }

    #[tokio::test]
    async fn test_unreachable_local_service_is_server_error() {
        let (_relay, relay_port) = start_relay(Arc::new(AllowAll)).await;
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let client = connect_client(relay_port).await;
        let (tunnel_id, _) = client
            .request_web_tunnel("down", &CancellationToken::new())
            .await
            .unwrap();
        client.add_tunnel(ClientTunnel::web(
            tunnel_id,
            LocalTarget::new("127.0.0.1", dead_port, false),
        ));

        let response = reqwest::Client::new()
            .get(format!("http://127.0.0.1:{}/", relay_port))
            .header("Host", "down.subwayapp.dev")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 500);
        assert!(response.text().await.unwrap().starts_with("Could not add connection."));
    }

    #[tokio::test]
    async fn test_session_requires_token() {
        let (_relay, relay_port) = start_relay(provider_for(&["secret".to_string()])).await;
        let url = format!("ws://127.0.0.1:{}{}", relay_port, CONNECT_PATH);

        match connect_async(url.as_str()).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), 401)
            }
            other => panic!("expected 401, got {:?}", other.map(|_| ())),
        }

        let mut request = url.as_str().into_client_request().unwrap();
        request
            .headers_mut()
            .insert(http::header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        assert!(connect_async(request).await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_releases_tunnels() {
        let (relay, relay_port) = start_relay(Arc::new(AllowAll)).await;
        let client = connect_client(relay_port).await;
        client
            .request_web_tunnel("gone", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(relay.domains().len(), 1);

        relay.shutdown_token().cancel();
        crate::connection::testing::eventually(|| relay.domains().is_empty()).await;
    }
}
