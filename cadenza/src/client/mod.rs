//! The gRPC client: connection management and the call-shape adapters.

mod channel;
mod grpc;

pub use self::channel::Channel;
pub use self::grpc::{CallOptions, Grpc};
