use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use prost::Message;

use super::{Codec, Decoder, Encoder};
use crate::{Code, Status};

/// A [`Codec`] that implements `application/grpc+proto` via the prost
/// library.
#[derive(Debug, Clone)]
pub struct ProstCodec<T, U> {
    _pd: PhantomData<(T, U)>,
}

impl<T, U> ProstCodec<T, U> {
    pub fn new() -> Self {
        Self { _pd: PhantomData }
    }
}

impl<T, U> Default for ProstCodec<T, U> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, U> Codec for ProstCodec<T, U>
where
    T: Message + Send + 'static,
    U: Message + Default + Send + 'static,
{
    type Encode = T;
    type Decode = U;

    type Encoder = ProstEncoder<T>;
    type Decoder = ProstDecoder<U>;

    fn encoder(&mut self) -> Self::Encoder {
        ProstEncoder { _pd: PhantomData }
    }

    fn decoder(&mut self) -> Self::Decoder {
        ProstDecoder { _pd: PhantomData }
    }
}

/// An [`Encoder`] that knows how to encode `T`.
#[derive(Debug, Clone, Default)]
pub struct ProstEncoder<T> {
    _pd: PhantomData<T>,
}

impl<T: Message> Encoder for ProstEncoder<T> {
    type Item = T;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Status> {
        item.encode(dst)
            .expect("Message only errors if not enough space");

        Ok(())
    }
}

/// A [`Decoder`] that knows how to decode `U`.
#[derive(Debug, Clone, Default)]
pub struct ProstDecoder<U> {
    _pd: PhantomData<U>,
}

impl<U: Message + Default> Decoder for ProstDecoder<U> {
    type Item = U;

    fn decode(&mut self, src: &mut Bytes) -> Result<U, Status> {
        U::decode(src).map_err(from_decode_error)
    }
}

fn from_decode_error(error: prost::DecodeError) -> Status {
    // Map protobuf parse errors to an INTERNAL status to match the gRPC
    // status code mapping guidance.
    Status::new(Code::Internal, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_frame, Deframer, DEFAULT_MAX_MESSAGE_SIZE};

    #[derive(Clone, PartialEq, prost::Message)]
    struct Msg {
        #[prost(bytes = "vec", tag = "1")]
        data: Vec<u8>,
    }

    #[test]
    fn prost_frame_round_trip() {
        let mut codec = ProstCodec::<Msg, Msg>::default();
        let msg = Msg {
            data: vec![7u8; 10_000],
        };

        let mut buf = BytesMut::new();
        let framed = encode_frame(
            &mut codec.encoder(),
            msg.clone(),
            &mut buf,
            DEFAULT_MAX_MESSAGE_SIZE,
        )
        .unwrap();

        let mut deframer = Deframer::new(DEFAULT_MAX_MESSAGE_SIZE);
        deframer.push(&framed);
        let mut payload = deframer.next().unwrap().unwrap();
        let decoded = codec.decoder().decode(&mut payload).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn garbage_is_internal() {
        let mut decoder = ProstCodec::<Msg, Msg>::default().decoder();
        let mut payload = Bytes::from_static(&[0xff, 0xff, 0xff]);
        let status = decoder.decode(&mut payload).unwrap_err();
        assert_eq!(status.code(), Code::Internal);
    }
}
