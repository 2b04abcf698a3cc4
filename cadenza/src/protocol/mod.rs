//! The gRPC wire protocol above HTTP/2: header and trailer codecs and the
//! per-stream event vocabulary shared by both peers.

mod events;
mod timeout;

pub use self::events::{Event, RequestHead, ResponseHead};
pub(crate) use self::events::{
    is_trailers_only, parse_response_trailers, response_head, trailers_only_response,
    CONTENT_TYPE_GRPC,
};
