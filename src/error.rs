use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SubwayError {
    #[error("unsupported data frame version {0}")]
    BadFrameVersion(u8),

    #[error("truncated data frame: need {needed} bytes, have {available}")]
    TruncatedFrame { needed: usize, available: usize },

    #[error("payload of {0} bytes does not fit in a data frame")]
    PayloadTooLarge(usize),

    #[error("could not inflate data frame: {0}")]
    Compression(std::io::Error),

    #[error("malformed HTTP head: {0}")]
    MalformedHttp(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request cancelled")]
    Cancelled,

    #[error("session closed")]
    SessionClosed,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("{0}")]
    Rejected(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl SubwayError {
    /// Errors that end the whole session rather than a single connection.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            SubwayError::BadFrameVersion(_)
                | SubwayError::TruncatedFrame { .. }
                | SubwayError::PayloadTooLarge(_)
                | SubwayError::Compression(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SubwayError>;
