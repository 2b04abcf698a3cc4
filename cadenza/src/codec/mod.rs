//! Generic message encoding and decoding.
//!
//! This module contains the generic [`Codec`] trait, the length-prefixed
//! gRPC message framer and deframer, and a protobuf codec based on prost
//! (cargo feature `prost`, enabled by default).

#[cfg(feature = "gzip")]
pub(crate) mod compression;
mod frame;
#[cfg(feature = "prost")]
mod prost;

pub use self::frame::{Deframer, DEFAULT_MAX_MESSAGE_SIZE};
pub(crate) use self::frame::{encode_frame, frame_payload, HEADER_SIZE};
#[cfg(feature = "gzip")]
pub use self::compression::CompressionEncoding;
#[cfg(feature = "prost")]
pub use self::prost::{ProstCodec, ProstDecoder, ProstEncoder};

use bytes::{Bytes, BytesMut};

use crate::Status;

/// Trait that knows how to encode and decode gRPC messages.
pub trait Codec: Default {
    /// The encodable message.
    type Encode: Send + 'static;
    /// The decodable message.
    type Decode: Send + 'static;

    /// The encoder that can encode a message.
    type Encoder: Encoder<Item = Self::Encode> + Send + 'static;
    /// The encoder that can decode a message.
    type Decoder: Decoder<Item = Self::Decode> + Send + 'static;

    /// Fetch the encoder.
    fn encoder(&mut self) -> Self::Encoder;
    /// Fetch the decoder.
    fn decoder(&mut self) -> Self::Decoder;
}

/// Encodes messages into the payload portion of a gRPC frame.
pub trait Encoder {
    /// The message type to encode.
    type Item;

    /// Encode one message onto the end of `dst`.
    fn encode(&mut self, item: Self::Item, dst: &mut BytesMut) -> Result<(), Status>;
}

/// Decodes messages out of complete gRPC frame payloads.
pub trait Decoder {
    /// The message type produced.
    type Item;

    /// Decode one message from a complete frame payload.
    fn decode(&mut self, src: &mut Bytes) -> Result<Self::Item, Status>;
}
