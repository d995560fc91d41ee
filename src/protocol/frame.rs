//! Binary data frames carrying connection payload.
//!
//! Layout (little-endian):
//!
//! ```text
//! | version: u8 = 1 | connection id: 16 bytes | compressed: u8 | length: u16 | payload |
//! ```

use bytes::{Buf, BufMut, Bytes};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use super::ConnectionId;
use crate::error::{Result, SubwayError};

pub const FRAME_VERSION: u8 = 1;
pub const FRAME_HEADER_LEN: usize = 1 + 16 + 1 + 2;
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Deflate,
}

impl Compression {
    fn flag(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Deflate => 1,
        }
    }

    fn from_flag(flag: u8) -> Self {
        if flag == 0 {
            Compression::None
        } else {
            Compression::Deflate
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub connection_id: ConnectionId,
    pub compression: Compression,
    pub payload: Bytes,
}

impl DataFrame {
    pub fn new(connection_id: ConnectionId, payload: impl Into<Bytes>) -> Self {
        Self {
            connection_id,
            compression: Compression::None,
            payload: payload.into(),
        }
    }

    /// Build a frame whose payload is `data` deflated.
    pub fn deflated(connection_id: ConnectionId, data: &[u8]) -> Result<Self> {
        let mut encoder = DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data)?;
        Ok(Self {
            connection_id,
            compression: Compression::Deflate,
            payload: Bytes::from(encoder.finish()?),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = self.payload.len();
        if len > MAX_FRAME_PAYLOAD {
            return Err(SubwayError::PayloadTooLarge(len));
        }

        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + len);
        buf.put_u8(FRAME_VERSION);
        buf.put_slice(self.connection_id.as_bytes());
        buf.put_u8(self.compression.flag());
        buf.put_u16_le(len as u16);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(SubwayError::TruncatedFrame {
                needed: FRAME_HEADER_LEN,
                available: 0,
            });
        }

        let version = buf.get_u8();
        if version != FRAME_VERSION {
            return Err(SubwayError::BadFrameVersion(version));
        }

        if buf.remaining() < FRAME_HEADER_LEN - 1 {
            return Err(SubwayError::TruncatedFrame {
                needed: FRAME_HEADER_LEN,
                available: buf.remaining() + 1,
            });
        }

        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);
        let compression = Compression::from_flag(buf.get_u8());
        let len = buf.get_u16_le() as usize;

        if buf.remaining() < len {
            return Err(SubwayError::TruncatedFrame {
                needed: FRAME_HEADER_LEN + len,
                available: FRAME_HEADER_LEN + buf.remaining(),
            });
        }

        Ok(Self {
            connection_id: ConnectionId::from_bytes(id),
            compression,
            payload: Bytes::copy_from_slice(&buf[..len]),
        })
    }

    /// The payload as the connection should see it, inflated if needed.
    pub fn into_data(self) -> Result<Bytes> {
        match self.compression {
            Compression::None => Ok(self.payload),
            Compression::Deflate => {
                let mut data = Vec::new();
                DeflateDecoder::new(&self.payload[..])
                    .read_to_end(&mut data)
                    .map_err(SubwayError::Compression)?;
                Ok(Bytes::from(data))
            }
        }
    }
}
