//! Sessions: one WebSocket multiplexing control messages and connection data.
//!
//! [`Session`] owns the transport loops, the outbound queue, the table of
//! pending requests and the connection table. [`ClientSession`] and
//! [`ServerSession`] add the tunnel table and the role-specific handling of
//! incoming messages.

mod client;
mod server;

pub use client::ClientSession;
pub use server::ServerSession;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::connection::Connection;
use crate::error::{Result, SubwayError};
use crate::protocol::{
    Compression, ConnectionId, DataFrame, Message, MessageCode, MessageId, MessageType, Response,
    TunnelId, MAX_FRAME_PAYLOAD,
};

/// Input chunk size when deflating.
const DEFLATE_CHUNK_SIZE: usize = 60 * 1024;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// How often the send loop flushes the outbound queue.
    pub send_tick: Duration,
    /// Default time to wait for a response.
    pub request_timeout: Duration,
    /// Compression applied to outgoing data frames.
    pub compression: Compression,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            send_tick: Duration::from_millis(20),
            request_timeout: Duration::from_secs(30),
            compression: Compression::None,
        }
    }
}

enum Outbound {
    Message(Message),
    Data(DataFrame),
}

struct PendingRequest {
    code: MessageCode,
    sent_at: DateTime<Utc>,
    reply: oneshot::Sender<Response>,
}

/// Role-specific handling of incoming traffic.
#[async_trait]
pub(crate) trait Dispatch: Send + Sync {
    /// Handle a request or notification from the peer.
    async fn process_message(&self, message: Message);

    /// A connection could not accept bytes from the peer.
    fn connection_failed(&self, connection_id: ConnectionId);
}

pub struct Session {
    options: SessionOptions,
    outbound: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    pending: DashMap<MessageId, PendingRequest>,
    connections: DashMap<ConnectionId, Arc<dyn Connection>>,
    shutdown: CancellationToken,
}

impl Session {
    pub fn new(options: SessionOptions) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        Self {
            options,
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            pending: DashMap::new(),
            connections: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop both loops. The send loop flushes and emits a Close frame first.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    fn enqueue(&self, item: Outbound) -> Result<()> {
        if self.is_closed() {
            return Err(SubwayError::SessionClosed);
        }
        self.outbound
            .send(item)
            .map_err(|_| SubwayError::SessionClosed)
    }

    pub fn send_notification(&self, message: Message) -> Result<()> {
        debug_assert_eq!(message.kind, MessageType::Notification);
        self.enqueue(Outbound::Message(message))
    }

    pub fn send_response(&self, response: Response) -> Result<()> {
        self.enqueue(Outbound::Message(response.into_message()))
    }

    /// Send a request and wait for its response using the default timeout.
    pub async fn send_message(&self, message: Message, cancel: &CancellationToken) -> Result<Response> {
        self.send_message_with_timeout(message, self.options.request_timeout, cancel)
            .await
    }

    pub async fn send_message_with_timeout(
        &self,
        message: Message,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let id = message.id;
        let (reply, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingRequest {
                code: message.code,
                sent_at: Utc::now(),
                reply,
            },
        );

        if let Err(e) = self.enqueue(Outbound::Message(message)) {
            self.pending.remove(&id);
            return Err(e);
        }

        let outcome = tokio::select! {
            reply = tokio::time::timeout(timeout, rx) => match reply {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(_)) => Err(SubwayError::SessionClosed),
                Err(_) => Err(SubwayError::Timeout(timeout)),
            },
            _ = cancel.cancelled() => Err(SubwayError::Cancelled),
            _ = self.shutdown.cancelled() => Err(SubwayError::SessionClosed),
        };

        if outcome.is_err() {
            self.pending.remove(&id);
        }
        outcome
    }

    /// Queue connection bytes, split into frames the codec can carry.
    pub fn send_data(&self, connection_id: ConnectionId, data: Bytes) -> Result<()> {
        match self.options.compression {
            Compression::None => {
                for chunk in data.chunks(MAX_FRAME_PAYLOAD) {
                    let frame = DataFrame::new(connection_id, data.slice_ref(chunk));
                    self.enqueue(Outbound::Data(frame))?;
                }
            }
            Compression::Deflate => {
                for chunk in data.chunks(DEFLATE_CHUNK_SIZE) {
                    let mut frame = DataFrame::deflated(connection_id, chunk)?;
                    // Incompressible chunks go out raw.
                    if frame.payload.len() >= chunk.len() {
                        frame = DataFrame::new(connection_id, data.slice_ref(chunk));
                    }
                    self.enqueue(Outbound::Data(frame))?;
                }
            }
        }
        Ok(())
    }

    /// Insert unless a connection with the same id is already present.
    pub(crate) fn insert_connection(&self, connection: Arc<dyn Connection>) -> bool {
        match self.connections.entry(connection.id()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(connection);
                true
            }
        }
    }

    pub(crate) fn connection(&self, id: ConnectionId) -> Option<Arc<dyn Connection>> {
        self.connections.get(&id).map(|c| c.value().clone())
    }

    /// Remove-if-present; only one caller ever gets the connection back.
    pub(crate) fn take_connection(&self, id: ConnectionId) -> Option<Arc<dyn Connection>> {
        self.connections.remove(&id).map(|(_, c)| c)
    }

    pub(crate) fn connections_of(&self, tunnel_id: TunnelId) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|c| c.value().tunnel_id() == tunnel_id)
            .map(|c| *c.key())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Drive the transport until the peer closes, an error occurs or `cancel`
    /// fires. Pending requests fail with [`SubwayError::SessionClosed`] on exit.
    pub(crate) async fn run<S>(
        &self,
        transport: WebSocketStream<S>,
        dispatch: &dyn Dispatch,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let rx = self
            .outbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| SubwayError::Protocol("session already started".to_string()))?;

        let stop = self.shutdown.child_token();
        let _link = {
            let stop = stop.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => stop.cancel(),
                    _ = stop.cancelled() => {}
                }
            })
        };

        let (sink, stream) = transport.split();
        let (sent, received) = tokio::join!(
            async {
                let _guard = stop.clone().drop_guard();
                self.send_loop(sink, rx, &stop).await
            },
            async {
                let _guard = stop.clone().drop_guard();
                self.receive_loop(stream, dispatch, &stop).await
            },
        );

        self.shutdown.cancel();
        self.fail_pending();
        sent.and(received)
    }

    async fn send_loop<K>(
        &self,
        mut sink: K,
        mut rx: mpsc::UnboundedReceiver<Outbound>,
        stop: &CancellationToken,
    ) -> Result<()>
    where
        K: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
    {
        let mut tick = tokio::time::interval(self.options.send_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let stopping = tokio::select! {
                _ = tick.tick() => false,
                _ = stop.cancelled() => true,
            };

            let mut batch = 0usize;
            while let Ok(item) = rx.try_recv() {
                let frame = match item {
                    Outbound::Message(message) => WsMessage::Text(message.to_json()?),
                    Outbound::Data(frame) => WsMessage::Binary(frame.encode()?),
                };
                sink.feed(frame).await?;
                batch += 1;
            }
            if batch > 0 {
                sink.flush().await?;
                trace!("Flushed {} frames", batch);
            }

            if stopping {
                rx.close();
                let _ = sink.send(WsMessage::Close(None)).await;
                debug!("Send loop stopped");
                return Ok(());
            }
        }
    }

    async fn receive_loop<T>(
        &self,
        mut stream: T,
        dispatch: &dyn Dispatch,
        stop: &CancellationToken,
    ) -> Result<()>
    where
        T: Stream<Item = std::result::Result<WsMessage, tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                frame = stream.next() => frame,
            };

            match frame {
                Some(Ok(WsMessage::Text(text))) => self.receive_message(&text, dispatch).await,
                Some(Ok(WsMessage::Binary(data))) => {
                    if let Err(e) = self.receive_data(&data, dispatch).await {
                        if e.is_framing() {
                            warn!("Ending session on bad data frame: {}", e);
                        }
                        return Err(e);
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!("Peer closed session: {:?}", frame.map(|f| f.reason.to_string()));
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            }
        }
    }

    async fn receive_message(&self, text: &str, dispatch: &dyn Dispatch) {
        let message = match Message::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping undecodable message: {}", e);
                return;
            }
        };

        if message.kind != MessageType::Response {
            dispatch.process_message(message).await;
            return;
        }

        match self.pending.remove(&message.id) {
            Some((id, pending)) => {
                let elapsed = Utc::now().signed_duration_since(pending.sent_at);
                debug!(
                    "Response to {:?} {} after {}ms",
                    pending.code,
                    id,
                    elapsed.num_milliseconds()
                );
                let _ = pending.reply.send(Response::try_from(message).unwrap_or_else(|_| {
                    Response::failed(id, "invalid response")
                }));
            }
            None => debug!("Ignoring response to unknown request {}", message.id),
        }
    }

    async fn receive_data(&self, data: &[u8], dispatch: &dyn Dispatch) -> Result<()> {
        let frame = DataFrame::decode(data)?;
        let connection_id = frame.connection_id;
        let payload = frame.into_data()?;

        let Some(connection) = self.connection(connection_id) else {
            trace!("Dropping {} bytes for unknown connection {}", payload.len(), connection_id);
            return Ok(());
        };

        if let Err(e) = connection.send_to_local(payload).await {
            debug!("Connection {} rejected data: {}", connection_id, e);
            dispatch.connection_failed(connection_id);
        }
        Ok(())
    }

    /// Fail every waiter; dropping the reply senders wakes them.
    fn fail_pending(&self) {
        let outstanding = self.pending.len();
        self.pending.clear();
        if outstanding > 0 {
            debug!("Failed {} pending requests", outstanding);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    /// Two WebSocket ends joined by an in-memory pipe.
    pub async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(1 << 20);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (client, server)
    }

    pub fn fast_options() -> SessionOptions {
        SessionOptions {
            send_tick: Duration::from_millis(5),
            request_timeout: Duration::from_secs(5),
            compression: Compression::None,
        }
    }
}
