use std::fmt;

use crate::Status;

/// A boxed error, used at handler boundaries and transport seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the runtime's user-facing operations.
///
/// Peer-visible failures (a handler error, a missing method) travel the wire
/// as a [`Status`] and come back out of `receive_message` as [`Error::Rpc`];
/// everything else here is local to this process.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The peer sent bytes or headers that do not conform to the gRPC
    /// protocol. The offending stream is closed with `INTERNAL`; the
    /// connection survives.
    Protocol(String),
    /// The local side attempted an operation the stream state machine does
    /// not allow. Only the offending call fails; the stream continues.
    InvalidState(&'static str),
    /// The remote peer finished the RPC with a non-zero `grpc-status`.
    Rpc(Status),
    /// The RPC was cancelled locally, or the peer reset the stream with
    /// `CANCEL`.
    Cancelled,
    /// The `grpc-timeout` deadline elapsed.
    DeadlineExceeded,
    /// Transport failure before response headers were received.
    Unavailable(String),
    /// An inbound message exceeded the configured size limit.
    MessageTooLarge { len: usize, limit: usize },
    /// The peer negotiated a message encoding with no decompressor
    /// configured, or sent a compressed frame without one.
    CompressionUnsupported,
    /// An HTTP/2 or I/O level failure on an established stream.
    Transport(BoxError),
}

impl Error {
    /// The `grpc-status` a server closes the stream with when this error is
    /// hit while servicing an RPC.
    pub(crate) fn to_closing_status(&self) -> Status {
        match self {
            Error::Protocol(msg) => Status::internal(msg.clone()),
            Error::MessageTooLarge { len, limit } => Status::resource_exhausted(format!(
                "message of {} bytes exceeds limit of {} bytes",
                len, limit
            )),
            Error::CompressionUnsupported => {
                Status::unimplemented("message encoding not supported")
            }
            Error::DeadlineExceeded => Status::deadline_exceeded("deadline exceeded"),
            Error::Cancelled => Status::cancelled("request cancelled"),
            Error::Rpc(status) => status.clone(),
            other => Status::internal(other.to_string()),
        }
    }

    pub(crate) fn from_h2(err: h2::Error) -> Error {
        if err.reason() == Some(h2::Reason::CANCEL) {
            return Error::Cancelled;
        }
        if err.is_io() {
            return Error::Unavailable(err.to_string());
        }
        Error::Transport(Box::new(err))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::InvalidState(msg) => write!(f, "invalid stream state: {}", msg),
            Error::Rpc(status) => write!(f, "rpc failed: {}", status),
            Error::Cancelled => f.write_str("rpc cancelled"),
            Error::DeadlineExceeded => f.write_str("deadline exceeded"),
            Error::Unavailable(msg) => write!(f, "transport unavailable: {}", msg),
            Error::MessageTooLarge { len, limit } => {
                write!(f, "message of {} bytes exceeds limit of {} bytes", len, limit)
            }
            Error::CompressionUnsupported => f.write_str("message encoding not supported"),
            Error::Transport(err) => write!(f, "transport error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Rpc(status) => Some(status),
            Error::Transport(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<h2::Error> for Error {
    fn from(err: h2::Error) -> Self {
        Error::from_h2(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(Box::new(err))
    }
}
