use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use super::Encoder;
use crate::Error;

/// Number of bytes in a gRPC message frame header: one flag byte plus a
/// 4-byte big-endian payload length.
pub(crate) const HEADER_SIZE: usize = 5;

/// Default cap on a single message payload.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

const BUFFER_SIZE: usize = 8 * 1024;

// Bit 0 of the flag byte; all other bits are reserved and must be zero.
const COMPRESSED_FLAG: u8 = 0b0000_0001;

/// Encode one message as a gRPC frame: `flags(1) || length(4, BE) || payload`.
///
/// The header is reserved up front and back-filled once the payload length is
/// known, so the encoder writes straight into the output buffer.
pub(crate) fn encode_frame<E: Encoder + ?Sized>(
    encoder: &mut E,
    item: E::Item,
    buf: &mut BytesMut,
    limit: usize,
) -> Result<Bytes, Error> {
    buf.reserve(HEADER_SIZE + BUFFER_SIZE);
    buf.put_bytes(0, HEADER_SIZE);

    encoder
        .encode(item, buf)
        .map_err(|status| Error::Transport(Box::new(status)))?;

    let len = buf.len() - HEADER_SIZE;
    if len > limit {
        return Err(Error::MessageTooLarge { len, limit });
    }
    assert!(len <= u32::MAX as usize);
    {
        let mut header = &mut buf[..HEADER_SIZE];
        header.put_u8(0);
        header.put_u32(len as u32);
    }

    Ok(buf.split_to(HEADER_SIZE + len).freeze())
}

/// Frame an already-encoded payload. The caller has checked the size limit.
pub(crate) fn frame_payload(payload: Bytes) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u8(0);
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    buf.freeze()
}

/// Splits an arbitrary byte stream back into whole gRPC message payloads.
///
/// Incoming chunks are appended onto an internal buffer holding at most one
/// partial frame; [`Deframer::next`] yields complete payloads in order.
pub struct Deframer {
    buf: BytesMut,
    state: State,
    limit: usize,
    #[cfg(feature = "gzip")]
    encoding: Option<super::compression::CompressionEncoding>,
}

#[derive(Debug)]
enum State {
    ReadHeader,
    ReadBody { compressed: bool, len: usize },
}

impl Deframer {
    pub fn new(limit: usize) -> Self {
        Deframer {
            buf: BytesMut::with_capacity(BUFFER_SIZE),
            state: State::ReadHeader,
            limit,
            #[cfg(feature = "gzip")]
            encoding: None,
        }
    }

    /// Configure the deframer from a negotiated `grpc-encoding` value.
    /// `identity` (or no header) leaves frames uncompressed; `gzip` installs
    /// the decompressor; anything else fails with `CompressionUnsupported`.
    #[cfg(feature = "gzip")]
    pub fn negotiate_encoding(&mut self, value: Option<&str>) -> Result<(), Error> {
        if let Some(value) = value {
            self.encoding = super::compression::CompressionEncoding::from_encoding_value(value)?;
        }
        Ok(())
    }

    /// Configure the deframer from a negotiated `grpc-encoding` value. With
    /// compression support compiled out, only `identity` is accepted.
    #[cfg(not(feature = "gzip"))]
    pub fn negotiate_encoding(&mut self, value: Option<&str>) -> Result<(), Error> {
        match value {
            None | Some("identity") => Ok(()),
            Some(_) => Err(Error::CompressionUnsupported),
        }
    }

    /// Append raw bytes received from the transport.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pull the next complete payload, or `None` if more bytes are needed.
    pub fn next(&mut self) -> Result<Option<Bytes>, Error> {
        if let State::ReadHeader = self.state {
            if self.buf.remaining() < HEADER_SIZE {
                return Ok(None);
            }

            let flags = self.buf.get_u8();
            if flags & !COMPRESSED_FLAG != 0 {
                trace!("unexpected frame flags {:#04x}", flags);
                return Err(Error::Protocol(format!(
                    "invalid message flags: {} (valid flags are 0 and 1)",
                    flags
                )));
            }
            let compressed = flags == COMPRESSED_FLAG;
            if compressed && !self.can_decompress() {
                return Err(Error::CompressionUnsupported);
            }

            let len = self.buf.get_u32() as usize;
            if len > self.limit {
                return Err(Error::MessageTooLarge {
                    len,
                    limit: self.limit,
                });
            }
            self.buf.reserve(len);

            self.state = State::ReadBody { compressed, len };
        }

        if let State::ReadBody { compressed, len } = self.state {
            if self.buf.len() < len {
                return Ok(None);
            }

            let payload = self.buf.split_to(len).freeze();
            self.state = State::ReadHeader;

            if compressed {
                return self.decompress(payload).map(Some);
            }
            return Ok(Some(payload));
        }

        Ok(None)
    }

    /// Whether the buffer holds a partial frame. Used at end of stream: any
    /// leftover bytes mean the peer truncated a message.
    pub fn is_partial(&self) -> bool {
        !self.buf.is_empty() || matches!(self.state, State::ReadBody { .. })
    }

    #[cfg(feature = "gzip")]
    fn can_decompress(&self) -> bool {
        self.encoding.is_some()
    }

    #[cfg(not(feature = "gzip"))]
    fn can_decompress(&self) -> bool {
        false
    }

    #[cfg(feature = "gzip")]
    fn decompress(&mut self, payload: Bytes) -> Result<Bytes, Error> {
        let encoding = self.encoding.expect("checked while reading the header");
        let out = super::compression::decompress(encoding, &payload, self.limit)?;
        Ok(out)
    }

    #[cfg(not(feature = "gzip"))]
    fn decompress(&mut self, _payload: Bytes) -> Result<Bytes, Error> {
        unreachable!("compressed frames are rejected while reading the header")
    }
}

impl std::fmt::Debug for Deframer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deframer")
            .field("buffered", &self.buf.len())
            .field("state", &self.state)
            .finish()
    }
}
