use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Weak;

use super::{Connection, ConnectionOwner};
use crate::error::{Result, SubwayError};
use crate::protocol::{ConnectionId, TunnelId};

/// Sends every byte it receives straight back to the remote peer.
pub struct EchoConnection {
    id: ConnectionId,
    tunnel_id: TunnelId,
    owner: Weak<dyn ConnectionOwner>,
}

impl EchoConnection {
    pub fn new(id: ConnectionId, tunnel_id: TunnelId, owner: Weak<dyn ConnectionOwner>) -> Self {
        Self {
            id,
            tunnel_id,
            owner,
        }
    }
}

#[async_trait]
impl Connection for EchoConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn tunnel_id(&self) -> TunnelId {
        self.tunnel_id
    }

    async fn send_to_local(&self, data: Bytes) -> Result<()> {
        let owner = self.owner.upgrade().ok_or(SubwayError::SessionClosed)?;
        owner.send_data(self.id, data)
    }

    async fn close_local(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::RecordingOwner;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_echoes_back_to_owner() {
        let owner = Arc::new(RecordingOwner::default());
        let connection = EchoConnection::new(ConnectionId::new(), TunnelId::new(), owner.weak());

        connection.send_to_local(Bytes::from_static(b"ping")).await.unwrap();
        connection.send_to_local(Bytes::from_static(b"pong")).await.unwrap();

        assert_eq!(owner.sent_to(connection.id()), b"pingpong");
    }

    #[tokio::test]
    async fn test_fails_once_owner_is_gone() {
        let owner = Arc::new(RecordingOwner::default());
        let connection = EchoConnection::new(ConnectionId::new(), TunnelId::new(), owner.weak());
        drop(owner);

        let err = connection.send_to_local(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, SubwayError::SessionClosed));
    }
}
