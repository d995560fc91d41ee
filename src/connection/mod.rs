//! Connections: one multiplexed byte stream per tunnel client.
//!
//! A connection only ever talks to its owning session through
//! [`ConnectionOwner`], held weakly so that a torn-down session is not kept
//! alive by a lingering read loop.

mod echo;
mod tcp;
mod web;

pub use echo::EchoConnection;
pub use tcp::TcpConnection;
pub use web::{PublicRequest, WebServerConnection};

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Mutex, PoisonError, Weak};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, SubwayError};
use crate::http::{HeadSink, HttpInterceptor, StartLine};
use crate::protocol::{ConnectionId, TunnelId};

/// Bytes read from a local socket per data frame.
pub const READ_CHUNK_SIZE: usize = 4096;

const LOCAL_QUEUE_DEPTH: usize = 64;

pub trait AsyncStream: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

#[async_trait]
pub trait Connection: Send + Sync + 'static {
    fn id(&self) -> ConnectionId;

    fn tunnel_id(&self) -> TunnelId;

    /// Begin pumping local bytes towards the session.
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Deliver bytes that arrived from the remote peer.
    async fn send_to_local(&self, data: Bytes) -> Result<()>;

    /// Tear down the local side. Does not notify the remote peer.
    async fn close_local(&self) -> Result<()>;
}

/// What a connection needs from the session that owns it.
#[async_trait]
pub trait ConnectionOwner: Send + Sync {
    /// Queue bytes for the remote peer.
    fn send_data(&self, connection_id: ConnectionId, data: Bytes) -> Result<()>;

    /// Remove the connection, telling the remote peer.
    async fn remove_connection(&self, connection_id: ConnectionId);
}

/// Destination a [`LocalWriter`] drains into.
#[async_trait]
pub trait LocalSink: Send + 'static {
    async fn write(&mut self, data: &[u8]) -> Result<()>;
    async fn close(&mut self);
}

/// Raw write half of a local socket.
pub struct PlainSink<W>(pub W);

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> LocalSink for PlainSink<W> {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.0.write_all(data).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.0.shutdown().await;
    }
}

#[async_trait]
impl<L, S> LocalSink for HttpInterceptor<L, S>
where
    L: StartLine + 'static,
    S: HeadSink<L> + 'static,
{
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        HttpInterceptor::write(self, data).await
    }

    async fn close(&mut self) {
        self.dispose().await
    }
}

/// Serializes writes towards a local sink on a dedicated task.
///
/// A failed write removes the connection through its owner. Closing the
/// writer lets already-queued bytes drain before the sink is closed.
pub struct LocalWriter {
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl LocalWriter {
    pub fn spawn(
        connection_id: ConnectionId,
        mut sink: impl LocalSink,
        owner: Weak<dyn ConnectionOwner>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<Bytes>(LOCAL_QUEUE_DEPTH);

        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(e) = sink.write(&data).await {
                    warn!("Local write failed for {}: {}", connection_id, e);
                    // Senders blocked on a full queue must fail now, not after removal.
                    drop(rx);
                    sink.close().await;
                    if let Some(owner) = owner.upgrade() {
                        owner.remove_connection(connection_id).await;
                    }
                    return;
                }
            }
            sink.close().await;
            debug!("Local writer for {} finished", connection_id);
        });

        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    pub async fn send(&self, data: Bytes) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match tx {
            Some(tx) => tx
                .send(data)
                .await
                .map_err(|_| SubwayError::ConnectionClosed),
            None => Err(SubwayError::ConnectionClosed),
        }
    }

    pub fn close(&self) {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Pump a local read half into data frames until EOF, error or cancellation.
pub(crate) async fn read_local(
    connection_id: ConnectionId,
    mut reader: ReadHalf<BoxedStream>,
    owner: Weak<dyn ConnectionOwner>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read(&mut buf) => read,
        };

        let Some(owner) = owner.upgrade() else {
            return;
        };

        match read {
            Ok(0) => {
                debug!("Local side of {} closed", connection_id);
                owner.remove_connection(connection_id).await;
                return;
            }
            Ok(n) => {
                if let Err(e) = owner.send_data(connection_id, Bytes::copy_from_slice(&buf[..n])) {
                    debug!("Dropping read loop for {}: {}", connection_id, e);
                    return;
                }
            }
            Err(e) => {
                debug!("Local read error on {}: {}", connection_id, e);
                owner.remove_connection(connection_id).await;
                return;
            }
        }
    }
}
