//! # Frame Codec
//!
//! Length-prefixed framing over an arbitrary byte stream.
//!
//! ## Wire Format
//! ```text
//! [Length(W)] [Payload(N)]      W ∈ {1, 2, 4}, N = Length
//! ```
//!
//! The header width and byte order are fixed per server instance. A header
//! announcing more than `max_payload_size` bytes is rejected as soon as the
//! header itself is readable: the stream offset can no longer be trusted, so
//! the connection is aborted instead of resynchronized.
//!
//! `FrameCodec` plugs into `tokio_util::codec::Framed`, and [`FrameCodec::feed`]
//! exposes the same algorithm as a plain buffer operation.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::config::MAX_PAYLOAD_SIZE;
use crate::error::{ProtocolError, Result};

/// Width of the length header in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum HeaderWidth {
    One,
    Two,
    #[default]
    Four,
}

impl HeaderWidth {
    /// Number of header bytes on the wire
    pub fn bytes(self) -> usize {
        match self {
            HeaderWidth::One => 1,
            HeaderWidth::Two => 2,
            HeaderWidth::Four => 4,
        }
    }

    /// Largest payload length the header can express
    pub fn max_len(self) -> usize {
        match self {
            HeaderWidth::One => u8::MAX as usize,
            HeaderWidth::Two => u16::MAX as usize,
            HeaderWidth::Four => u32::MAX as usize,
        }
    }
}

impl TryFrom<u8> for HeaderWidth {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(HeaderWidth::One),
            2 => Ok(HeaderWidth::Two),
            4 => Ok(HeaderWidth::Four),
            other => Err(format!("unsupported header width: {other} (expected 1, 2 or 4)")),
        }
    }
}

impl From<HeaderWidth> for u8 {
    fn from(width: HeaderWidth) -> Self {
        width.bytes() as u8
    }
}

/// Byte order of the length header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

/// Framing parameters, fixed for the lifetime of a server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameConfig {
    pub header_width: HeaderWidth,
    pub byte_order: ByteOrder,
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            header_width: HeaderWidth::Four,
            byte_order: ByteOrder::Big,
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

/// Length-prefixed frame codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec {
    config: FrameConfig,
}

impl FrameCodec {
    pub fn new(config: FrameConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    /// Append `incoming` to `buffer` and drain every complete frame, in order.
    ///
    /// Leftover bytes of a partial frame stay in `buffer` for the next call.
    /// An oversized header fails immediately and emits no frame.
    pub fn feed(&self, buffer: &mut BytesMut, incoming: &[u8]) -> Result<Vec<Bytes>> {
        buffer.extend_from_slice(incoming);
        let mut frames = Vec::new();
        while let Some(frame) = self.split_frame(buffer)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Prefix `payload` with its length header.
    pub fn encode_frame(&self, payload: &[u8]) -> Result<Bytes> {
        let mut dst = BytesMut::with_capacity(self.config.header_width.bytes() + payload.len());
        self.write_frame(payload, &mut dst)?;
        Ok(dst.freeze())
    }

    fn read_len(&self, src: &[u8]) -> usize {
        let mut header = &src[..self.config.header_width.bytes()];
        match (self.config.header_width, self.config.byte_order) {
            (HeaderWidth::One, _) => header.get_u8() as usize,
            (HeaderWidth::Two, ByteOrder::Big) => header.get_u16() as usize,
            (HeaderWidth::Two, ByteOrder::Little) => header.get_u16_le() as usize,
            (HeaderWidth::Four, ByteOrder::Big) => header.get_u32() as usize,
            (HeaderWidth::Four, ByteOrder::Little) => header.get_u32_le() as usize,
        }
    }

    fn write_frame(&self, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
        let len = payload.len();
        if len > self.config.max_payload_size || len > self.config.header_width.max_len() {
            return Err(ProtocolError::OversizedPacket(len));
        }

        dst.reserve(self.config.header_width.bytes() + len);
        match (self.config.header_width, self.config.byte_order) {
            (HeaderWidth::One, _) => dst.put_u8(len as u8),
            (HeaderWidth::Two, ByteOrder::Big) => dst.put_u16(len as u16),
            (HeaderWidth::Two, ByteOrder::Little) => dst.put_u16_le(len as u16),
            (HeaderWidth::Four, ByteOrder::Big) => dst.put_u32(len as u32),
            (HeaderWidth::Four, ByteOrder::Little) => dst.put_u32_le(len as u32),
        }
        dst.extend_from_slice(payload);
        Ok(())
    }

    /// Split one complete frame off the front of `src`, if there is one.
    fn split_frame(&self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        let header_len = self.config.header_width.bytes();
        if src.len() < header_len {
            return Ok(None);
        }

        let payload_len = self.read_len(src);
        if payload_len > self.config.max_payload_size {
            warn!(
                payload_len,
                max = self.config.max_payload_size,
                "Frame header exceeds maximum payload size"
            );
            return Err(ProtocolError::OversizedPacket(payload_len));
        }

        if src.len() < header_len + payload_len {
            src.reserve(header_len + payload_len - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        Ok(Some(src.split_to(payload_len).freeze()))
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.split_frame(src)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !src.is_empty() {
                    debug!(
                        remaining = src.len(),
                        "Peer closed with a partial frame buffered"
                    );
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        self.write_frame(&item, dst)
    }
}
