use http::header::AUTHORIZATION;
use http::HeaderValue;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

use super::spec::TunnelSpec;
use crate::error::{Result, SubwayError};
use crate::session::{ClientSession, SessionOptions};
use crate::tunnel::ClientTunnel;

const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Keeps a session to the relay alive and re-creates the configured
/// tunnels every time it reconnects.
pub struct TunnelClient {
    server: Url,
    token: Option<String>,
    tunnels: Vec<TunnelSpec>,
    options: SessionOptions,
}

impl TunnelClient {
    pub fn new(
        server: Url,
        token: Option<String>,
        tunnels: Vec<TunnelSpec>,
        options: SessionOptions,
    ) -> Self {
        Self {
            server,
            token,
            tunnels,
            options,
        }
    }

    /// Run until `shutdown` fires or the relay refuses us outright.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut retry_delay = INITIAL_RETRY_DELAY;

        loop {
            info!("Connecting to {}...", self.server);

            match self.connect_and_run(&shutdown).await {
                Ok(()) => {
                    info!("Connection closed normally");
                    break;
                }
                Err(e) if is_fatal(&e) => {
                    error!("Relay refused the session: {}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    error!("Connection error: {}", e);
                    info!("Reconnecting in {:?}...", retry_delay);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(retry_delay) => {}
                    }
                    retry_delay = std::cmp::min(retry_delay * 2, MAX_RETRY_DELAY);
                }
            }

            if shutdown.is_cancelled() {
                break;
            }
        }

        info!("Shutdown requested");
        Ok(())
    }

    async fn connect_and_run(&self, shutdown: &CancellationToken) -> Result<()> {
        let mut request = self.server.as_str().into_client_request()?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| SubwayError::Protocol("token is not a valid header value".to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, _) = connect_async(request).await?;
        info!("Connected to {}", self.server);

        let session = ClientSession::new(self.options.clone());
        let running = session.run(ws, shutdown);
        tokio::pin!(running);

        let opened = tokio::select! {
            result = &mut running => return result.and_then(|()| self.ended(shutdown)),
            opened = self.open_tunnels(&session, shutdown) => opened,
        };
        if let Err(e) = opened {
            session.close().await;
            let _ = running.await;
            return Err(e);
        }

        running.await?;
        self.ended(shutdown)
    }

    /// A session that ends without a shutdown request was lost.
    fn ended(&self, shutdown: &CancellationToken) -> Result<()> {
        if shutdown.is_cancelled() {
            Ok(())
        } else {
            Err(SubwayError::SessionClosed)
        }
    }

    async fn open_tunnels(&self, session: &ClientSession, cancel: &CancellationToken) -> Result<()> {
        println!();
        println!("=== Tunnels Active ===");
        for spec in &self.tunnels {
            match spec {
                TunnelSpec::Echo { port } => {
                    let (id, bound) = session.request_tcp_tunnel(*port, cancel).await?;
                    session.add_tunnel(ClientTunnel::echo(id));
                    println!("  tcp://{}:{} -> echo", self.relay_host(), bound);
                }
                TunnelSpec::Tcp { port, target } => {
                    let (id, bound) = session.request_tcp_tunnel(*port, cancel).await?;
                    session.add_tunnel(ClientTunnel::tcp(id, target.clone()));
                    println!("  tcp://{}:{} -> {}", self.relay_host(), bound, target);
                }
                TunnelSpec::Web { subdomain, target } => {
                    let (id, url) = session.request_web_tunnel(subdomain, cancel).await?;
                    session.add_tunnel(ClientTunnel::web(id, target.clone()));
                    println!("  {} -> {}", url, target);
                }
            }
        }
        println!("======================");
        println!();

        if self.tunnels.is_empty() {
            warn!("No tunnels configured; the session will stay idle");
        }
        Ok(())
    }

    fn relay_host(&self) -> &str {
        self.server.host_str().unwrap_or("localhost")
    }
}

/// Errors a reconnect cannot fix.
fn is_fatal(error: &SubwayError) -> bool {
    match error {
        SubwayError::Rejected(_) => true,
        SubwayError::WebSocket(WsError::Http(response)) => {
            response.status() == http::StatusCode::UNAUTHORIZED
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{AllowAll, RelayServer};
    use crate::session::testing::fast_options;
    use crate::tunnel::LocalTarget;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn relay() -> (Arc<RelayServer>, Url) {
        let relay = RelayServer::new("subwayapp.dev", "http", Arc::new(AllowAll), fast_options());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("ws://{}/connect", listener.local_addr().unwrap())).unwrap();
        tokio::spawn(relay.clone().serve(listener));
        (relay, url)
    }

    #[tokio::test]
    async fn test_client_opens_configured_tunnels() {
        let (relay, url) = relay().await;
        let free = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_port = free.local_addr().unwrap().port();
        drop(free);

        let client = TunnelClient::new(
            url,
            None,
            vec![
                TunnelSpec::Echo { port: echo_port },
                TunnelSpec::Web {
                    subdomain: "app".to_string(),
                    target: LocalTarget::new("127.0.0.1", 1, false),
                },
            ],
            fast_options(),
        );
        let shutdown = CancellationToken::new();
        let running = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { client.run(shutdown).await })
        };

        crate::connection::testing::eventually(|| relay.domains().find("app").is_some()).await;

        let mut echo = loop {
            if let Ok(stream) = TcpStream::connect(("127.0.0.1", echo_port)).await {
                break stream;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        echo.write_all(b"marco").await.unwrap();
        let mut buf = [0u8; 5];
        echo.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"marco");

        shutdown.cancel();
        running.await.unwrap().unwrap();
        crate::connection::testing::eventually(|| relay.domains().is_empty()).await;
    }

    #[tokio::test]
    async fn test_rejected_tunnel_stops_client() {
        let (relay, url) = relay().await;
        let holder = TunnelClient::new(
            url.clone(),
            None,
            vec![TunnelSpec::Web {
                subdomain: "taken".to_string(),
                target: LocalTarget::new("127.0.0.1", 1, false),
            }],
            fast_options(),
        );
        let shutdown = CancellationToken::new();
        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { holder.run(shutdown).await });
        }
        crate::connection::testing::eventually(|| relay.domains().find("taken").is_some()).await;

        let late = TunnelClient::new(
            url,
            None,
            vec![TunnelSpec::Web {
                subdomain: "taken".to_string(),
                target: LocalTarget::new("127.0.0.1", 1, false),
            }],
            fast_options(),
        );
        let err = late.run(CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("Tunnel domain already in use."));
        shutdown.cancel();
    }

    #[test]
    fn test_unauthorized_is_fatal() {
        let response = http::Response::builder().status(401).body(None).unwrap();
        assert!(is_fatal(&SubwayError::WebSocket(WsError::Http(response.into()))));
        assert!(is_fatal(&SubwayError::Rejected("no".to_string())));
        assert!(!is_fatal(&SubwayError::SessionClosed));
    }
}
