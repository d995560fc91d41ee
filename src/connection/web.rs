use async_trait::async_trait;
use bytes::Bytes;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::{Connection, ConnectionOwner, LocalWriter};
use crate::error::{Result, SubwayError};
use crate::http::{
    host_without_port, is_hop_by_hop, ChunkedDecoder, HeadSink, HeaderCollection, HttpHead, ResponseInterceptor,
    StatusLine,
};
use crate::protocol::{ConnectionId, TunnelId};

/// Size of the data frames a public request is cut into.
pub const REQUEST_CHUNK_SIZE: usize = 4096;

const BODY_QUEUE_DEPTH: usize = 32;

/// A public HTTP request, flattened for replay over a tunnel.
#[derive(Debug, Clone)]
pub struct PublicRequest {
    pub method: String,
    /// Path plus query string.
    pub target: String,
    pub version: String,
    pub headers: HeaderCollection,
    pub body: Bytes,
}

impl PublicRequest {
    /// Add `X-Forwarded-*` headers, leaving any the caller already sent.
    pub fn add_forwarding_headers(&mut self, client: IpAddr, scheme: &str, port: u16) {
        if !self.headers.contains("X-Forwarded-For") {
            self.headers.add("X-Forwarded-For", client.to_string());
        }
        if !self.headers.contains("X-Forwarded-Proto") {
            self.headers.add("X-Forwarded-Proto", scheme);
        }
        if !self.headers.contains("X-Forwarded-Port") {
            self.headers.add("X-Forwarded-Port", port.to_string());
        }
        if !self.headers.contains("X-Forwarded-Host") {
            if let Some(host) = self.headers.first("Host").map(|h| host_without_port(h).to_string()) {
                self.headers.add("X-Forwarded-Host", host);
            }
        }
    }

    /// Serialize as an HTTP/1.x request: start line, headers, blank line, body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!("{} {} {}\r\n", self.method, self.target, self.version);
        self.headers.write_to(&mut head);
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// Status and headers of the local service's response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

/// The public side of a response still being relayed.
pub struct PendingResponse {
    pub head: oneshot::Receiver<ResponseHead>,
    pub body: mpsc::Receiver<Bytes>,
}

/// Feeds a parsed response head and body into [`PendingResponse`].
///
/// Hop-by-hop headers are dropped; a chunked body is decoded so the public
/// listener can re-frame it.
struct ResponseSink {
    head: Option<oneshot::Sender<ResponseHead>>,
    body: Option<mpsc::Sender<Bytes>>,
    chunked: Option<ChunkedDecoder>,
}

impl ResponseSink {
    async fn forward(&mut self, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let body = self.body.as_ref().ok_or(SubwayError::ConnectionClosed)?;
        body.send(data)
            .await
            .map_err(|_| SubwayError::ConnectionClosed)
    }
}

#[async_trait]
impl HeadSink<StatusLine> for ResponseSink {
    async fn write_head(&mut self, head: &HttpHead<StatusLine>) -> Result<()> {
        if head.headers.has_token("Transfer-Encoding", "chunked") {
            self.chunked = Some(ChunkedDecoder::new());
        }

        let response = ResponseHead {
            status: head.start.status,
            headers: head
                .headers
                .iter()
                .filter(|(name, _)| !is_hop_by_hop(name))
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        };

        let tx = self.head.take().ok_or_else(|| {
            SubwayError::Protocol("response head already sent".to_string())
        })?;
        tx.send(response).map_err(|_| SubwayError::ConnectionClosed)
    }

    async fn write_body(&mut self, data: &[u8]) -> Result<()> {
        let data = match self.chunked.as_mut() {
            Some(decoder) => {
                let mut decoded = Vec::with_capacity(data.len());
                decoder.decode(data, &mut decoded)?;
                Bytes::from(decoded)
            }
            None => Bytes::copy_from_slice(data),
        };
        self.forward(data).await
    }

    async fn close(&mut self) {
        self.head.take();
        self.body.take();
    }
}

/// Relay-side connection serving one public HTTP request.
pub struct WebServerConnection {
    id: ConnectionId,
    tunnel_id: TunnelId,
    writer: LocalWriter,
    owner: Weak<dyn ConnectionOwner>,
}

impl WebServerConnection {
    pub fn new(tunnel_id: TunnelId, owner: Weak<dyn ConnectionOwner>) -> (Arc<Self>, PendingResponse) {
        let id = ConnectionId::new();
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(BODY_QUEUE_DEPTH);

        let sink = ResponseSink {
            head: Some(head_tx),
            body: Some(body_tx),
            chunked: None,
        };
        let writer = LocalWriter::spawn(id, ResponseInterceptor::new(sink), owner.clone());

        let connection = Arc::new(Self {
            id,
            tunnel_id,
            writer,
            owner,
        });
        let pending = PendingResponse {
            head: head_rx,
            body: body_rx,
        };
        (connection, pending)
    }

    /// Replay the public request to the remote peer.
    pub fn send_request(&self, request: &PublicRequest) -> Result<()> {
        let owner = self.owner.upgrade().ok_or(SubwayError::SessionClosed)?;
        let bytes = Bytes::from(request.to_bytes());
        for chunk in bytes.chunks(REQUEST_CHUNK_SIZE) {
            owner.send_data(self.id, bytes.slice_ref(chunk))?;
        }
        debug!(
            "{} {} -> connection {} ({} bytes)",
            request.method,
            request.target,
            self.id,
            bytes.len()
        );
        Ok(())
    }
}

#[async_trait]
impl Connection for WebServerConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn tunnel_id(&self) -> TunnelId {
        self.tunnel_id
    }

    async fn send_to_local(&self, data: Bytes) -> Result<()> {
        self.writer.send(data).await
    }

    async fn close_local(&self) -> Result<()> {
        self.writer.close();
        Ok(())
    }
}
