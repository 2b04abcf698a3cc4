//! A gRPC over HTTP/2 runtime built directly on the [`h2`] connection
//! primitives.
//!
//! Given a service description — service name, method names, the
//! unary-vs-streaming cardinality of each side and a message [`codec`] — a
//! [`Server`] dispatches inbound RPCs to handlers and a [`Channel`] opens
//! RPCs against a remote peer, interoperating on the wire with any
//! conforming gRPC implementation.
//!
//! The pieces layer bottom-up:
//!
//! - [`codec`]: the `Codec` trait, the length-prefixed message framer and
//!   deframer, and the default prost codec.
//! - [`protocol`]: the gRPC header, trailer and timeout codecs, and the
//!   per-stream [`protocol::Event`] vocabulary.
//! - [`stream`]: the role-aware per-RPC state machine and the
//!   [`RpcStream`] handle with its typed halves.
//! - [`server`] / [`client`]: the connection engines, the dispatch
//!   registry and the four cardinality adapters on each side.
//!
//! # Feature flags
//!
//! - `prost` *(default)*: protobuf codec via [`prost`].
//! - `gzip`: decompress inbound messages negotiated as `gzip`.
//! - `tls`: rustls-backed TLS for servers and channels.

#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod client;
pub mod codec;
pub mod metadata;
pub mod protocol;
pub mod server;
pub mod stream;
#[cfg(feature = "tls")]
pub mod tls;

mod config;
mod error;
mod status;

pub use crate::client::{CallOptions, Channel, Grpc};
pub use crate::error::{BoxError, Error};
pub use crate::metadata::{Metadata, MetadataValue};
pub use crate::protocol::Event;
pub use crate::server::{Server, Service};
pub use crate::status::{Code, Status};
pub use crate::stream::{RpcStream, Streaming};
