use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::io::ReadHalf;
use tokio_util::sync::CancellationToken;

use super::{read_local, BoxedStream, Connection, ConnectionOwner, LocalWriter, PlainSink};
use crate::error::{Result, SubwayError};
use crate::http::{RequestInterceptor, StreamSink};
use crate::protocol::{ConnectionId, TunnelId};

/// A connection backed by a socket.
///
/// Used on both ends: the relay wraps an accepted public socket, the client
/// wraps the socket it dialed towards its local target. A web-client
/// connection is the same thing with an HTTP request rewriter in front of
/// the write half.
pub struct TcpConnection {
    id: ConnectionId,
    tunnel_id: TunnelId,
    reader: Mutex<Option<ReadHalf<BoxedStream>>>,
    writer: LocalWriter,
    owner: Weak<dyn ConnectionOwner>,
    cancel: CancellationToken,
}

impl TcpConnection {
    pub fn new(
        id: ConnectionId,
        tunnel_id: TunnelId,
        stream: BoxedStream,
        owner: Weak<dyn ConnectionOwner>,
    ) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(stream);
        let writer = LocalWriter::spawn(id, PlainSink(writer), owner.clone());
        Self::assemble(id, tunnel_id, reader, writer, owner)
    }

    /// Forces `Host` to `host` and `Connection: close` on every request head.
    pub fn web_client(
        id: ConnectionId,
        tunnel_id: TunnelId,
        stream: BoxedStream,
        owner: Weak<dyn ConnectionOwner>,
        host: &str,
    ) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(stream);
        let interceptor = RequestInterceptor::new(StreamSink::new(writer))
            .force_header("Host", host)
            .force_header("Connection", "close");
        let writer = LocalWriter::spawn(id, interceptor, owner.clone());
        Self::assemble(id, tunnel_id, reader, writer, owner)
    }

    fn assemble(
        id: ConnectionId,
        tunnel_id: TunnelId,
        reader: ReadHalf<BoxedStream>,
        writer: LocalWriter,
        owner: Weak<dyn ConnectionOwner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            tunnel_id,
            reader: Mutex::new(Some(reader)),
            writer,
            owner,
            cancel: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn tunnel_id(&self) -> TunnelId {
        self.tunnel_id
    }

    async fn start(&self) -> Result<()> {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| SubwayError::Protocol(format!("connection {} already started", self.id)))?;

        tokio::spawn(read_local(
            self.id,
            reader,
            self.owner.clone(),
            self.cancel.clone(),
        ));
        Ok(())
    }

    async fn send_to_local(&self, data: Bytes) -> Result<()> {
        self.writer.send(data).await
    }

    async fn close_local(&self) -> Result<()> {
        self.cancel.cancel();
        self.writer.close();
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::{eventually, RecordingOwner};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_pumps_both_directions() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let owner = Arc::new(RecordingOwner::default());
        let connection = TcpConnection::new(
            ConnectionId::new(),
            TunnelId::new(),
            Box::new(local),
            owner.weak(),
        );
        connection.start().await.unwrap();

        remote.write_all(b"from local").await.unwrap();
        eventually(|| owner.sent_to(connection.id()) == b"from local").await;

        connection.send_to_local(Bytes::from_static(b"to local")).await.unwrap();
        let mut buf = [0u8; 8];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to local");
    }

    #[tokio::test]
    async fn test_eof_removes_connection_once() {
        let (local, remote) = tokio::io::duplex(1024);
        let owner = Arc::new(RecordingOwner::default());
        let connection = TcpConnection::new(
            ConnectionId::new(),
            TunnelId::new(),
            Box::new(local),
            owner.weak(),
        );
        connection.start().await.unwrap();

        drop(remote);
        eventually(|| owner.removal_count() == 1).await;
        assert_eq!(owner.removed.lock().unwrap()[0], connection.id());
    }

    #[tokio::test]
    async fn test_close_local_stops_without_removal() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let owner = Arc::new(RecordingOwner::default());
        let connection = TcpConnection::new(
            ConnectionId::new(),
            TunnelId::new(),
            Box::new(local),
            owner.weak(),
        );
        connection.start().await.unwrap();
        connection.close_local().await.unwrap();

        let mut buf = Vec::new();
        remote.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        assert_eq!(owner.removal_count(), 0);
        assert!(connection.send_to_local(Bytes::from_static(b"late")).await.is_err());
    }

    #[tokio::test]
    async fn test_web_client_rewrites_request_head() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let owner = Arc::new(RecordingOwner::default());
        let connection = TcpConnection::web_client(
            ConnectionId::new(),
            TunnelId::new(),
            Box::new(local),
            owner.weak(),
            "localhost:3000",
        );

        connection
            .send_to_local(Bytes::from_static(b"GET / HTTP/1.1\r\nHost: demo.subwayapp.dev\r\n"))
            .await
            .unwrap();
        connection
            .send_to_local(Bytes::from_static(b"Connection: keep-alive\r\n\r\n"))
            .await
            .unwrap();
        connection.close_local().await.unwrap();

        let mut received = String::new();
        remote.read_to_string(&mut received).await.unwrap();
        assert_eq!(
            received,
            "GET / HTTP/1.1\r\nHost: localhost:3000\r\nConnection: close\r\n\r\n"
        );
    }
}
