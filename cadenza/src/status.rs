use std::{error::Error as StdError, fmt};

use bytes::Bytes;
use http::header::HeaderValue;
use http::HeaderMap;
use percent_encoding::{percent_decode, percent_encode, AsciiSet, CONTROLS};
use tracing::{debug, trace};

use crate::metadata::Metadata;

pub(crate) const GRPC_STATUS_HEADER: &str = "grpc-status";
pub(crate) const GRPC_MESSAGE_HEADER: &str = "grpc-message";

/// `grpc-message` values are truncated to this many bytes before they are
/// percent-encoded onto the wire.
const MAX_MESSAGE_BYTES: usize = 4096;

/// The encode set for `grpc-message`: everything outside the printable ASCII
/// range, plus `%` itself. `CONTROLS` already covers non-ASCII bytes.
const GRPC_MESSAGE_ENCODE_SET: &AsciiSet = &CONTROLS.add(b'%');

/// A gRPC status describing the result of an RPC, carried in the
/// `grpc-status` / `grpc-message` trailers together with any trailing
/// metadata.
#[derive(Clone)]
pub struct Status {
    code: Code,
    message: String,
    metadata: Metadata,
}

/// The canonical gRPC status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

// ===== impl Status =====

impl Status {
    /// Create a new `Status` with the associated code and message.
    pub fn new(code: Code, message: impl Into<String>) -> Status {
        Status {
            code,
            message: message.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn ok() -> Status {
        Status::new(Code::Ok, "")
    }

    pub fn cancelled(message: impl Into<String>) -> Status {
        Status::new(Code::Cancelled, message)
    }

    pub fn unknown(message: impl Into<String>) -> Status {
        Status::new(Code::Unknown, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Status {
        Status::new(Code::InvalidArgument, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Status {
        Status::new(Code::DeadlineExceeded, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Status {
        Status::new(Code::ResourceExhausted, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Status {
        Status::new(Code::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Status {
        Status::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Status {
        Status::new(Code::Unavailable, message)
    }

    /// Get the gRPC `Code` of this `Status`.
    pub fn code(&self) -> Code {
        self.code
    }

    /// Get the text error message of this `Status`.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the trailing metadata carried with this `Status`.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Get a mutable reference to the trailing metadata.
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Attach trailing metadata to this `Status`.
    pub fn with_metadata(mut self, metadata: Metadata) -> Status {
        self.metadata = metadata;
        self
    }

    /// Recover a `Status` from an error raised by a handler.
    ///
    /// Walks the source chain looking for a `Status` or a [`crate::Error`]
    /// that maps onto one; anything else becomes `UNKNOWN` carrying the
    /// error's display form.
    pub fn from_error(err: &(dyn StdError + 'static)) -> Status {
        Status::try_from_error(err).unwrap_or_else(|| Status::new(Code::Unknown, err.to_string()))
    }

    fn try_from_error(err: &(dyn StdError + 'static)) -> Option<Status> {
        let mut cause = Some(err);

        while let Some(err) = cause {
            if let Some(status) = err.downcast_ref::<Status>() {
                return Some(status.clone());
            }

            if let Some(err) = err.downcast_ref::<crate::Error>() {
                return Some(err.to_closing_status());
            }

            if let Some(h2) = err.downcast_ref::<h2::Error>() {
                return Some(Status::from_h2_error(h2));
            }

            cause = err.source();
        }

        None
    }

    // See https://github.com/grpc/grpc/blob/master/doc/PROTOCOL-HTTP2.md#errors
    fn from_h2_error(err: &h2::Error) -> Status {
        let code = match err.reason() {
            Some(h2::Reason::NO_ERROR)
            | Some(h2::Reason::PROTOCOL_ERROR)
            | Some(h2::Reason::INTERNAL_ERROR)
            | Some(h2::Reason::FLOW_CONTROL_ERROR)
            | Some(h2::Reason::SETTINGS_TIMEOUT)
            | Some(h2::Reason::COMPRESSION_ERROR)
            | Some(h2::Reason::CONNECT_ERROR) => Code::Internal,
            Some(h2::Reason::REFUSED_STREAM) => Code::Unavailable,
            Some(h2::Reason::CANCEL) => Code::Cancelled,
            Some(h2::Reason::ENHANCE_YOUR_CALM) => Code::ResourceExhausted,
            Some(h2::Reason::INADEQUATE_SECURITY) => Code::PermissionDenied,
            _ => Code::Unknown,
        };

        Status::new(code, format!("h2 protocol error: {}", err))
    }

    /// Whether this status would be reported as success by a peer.
    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }

    /// Append `grpc-status`, `grpc-message` and the trailing metadata to a
    /// trailer map, in that order.
    pub(crate) fn add_trailers(&self, trailers: &mut HeaderMap) -> Result<(), crate::Error> {
        trailers.insert(GRPC_STATUS_HEADER, self.code.to_header_value());

        if !self.message.is_empty() {
            let encoded = encode_grpc_message(&self.message);
            let value = HeaderValue::from_maybe_shared(Bytes::from(encoded)).map_err(|err| {
                debug!("invalid grpc-message header: {}", err);
                crate::Error::Protocol("could not serialize grpc-message".into())
            })?;
            trailers.insert(GRPC_MESSAGE_HEADER, value);
        }

        self.metadata.append_to_headers(trailers)?;
        Ok(())
    }
}

/// Truncate to the wire limit on a character boundary, then percent-encode.
pub(crate) fn encode_grpc_message(message: &str) -> String {
    let mut end = message.len().min(MAX_MESSAGE_BYTES);
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    percent_encode(message[..end].as_bytes(), GRPC_MESSAGE_ENCODE_SET).to_string()
}

/// Percent-decode a `grpc-message` value; invalid UTF-8 falls back to a
/// lossy decode rather than failing the RPC.
pub(crate) fn decode_grpc_message(value: &[u8]) -> String {
    percent_decode(value).decode_utf8_lossy().into_owned()
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("Status");

        builder.field("code", &self.code);

        if !self.message.is_empty() {
            builder.field("message", &self.message);
        }

        if !self.metadata.is_empty() {
            builder.field("metadata", &self.metadata);
        }

        builder.finish()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status: {:?}, message: {:?}",
            self.code(),
            self.message()
        )
    }
}

impl StdError for Status {}

// ===== impl Code =====

impl Code {
    /// Get the `Code` that represents the integer, if known.
    ///
    /// If not known, returns `Code::Unknown`.
    pub fn from_i32(i: i32) -> Code {
        Code::from(i)
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Option<Code> {
        let code = match bytes.len() {
            1 => match bytes[0] {
                b'0' => Code::Ok,
                b'1' => Code::Cancelled,
                b'2' => Code::Unknown,
                b'3' => Code::InvalidArgument,
                b'4' => Code::DeadlineExceeded,
                b'5' => Code::NotFound,
                b'6' => Code::AlreadyExists,
                b'7' => Code::PermissionDenied,
                b'8' => Code::ResourceExhausted,
                b'9' => Code::FailedPrecondition,
                _ => return Code::parse_fallback(bytes),
            },
            2 => match (bytes[0], bytes[1]) {
                (b'1', b'0') => Code::Aborted,
                (b'1', b'1') => Code::OutOfRange,
                (b'1', b'2') => Code::Unimplemented,
                (b'1', b'3') => Code::Internal,
                (b'1', b'4') => Code::Unavailable,
                (b'1', b'5') => Code::DataLoss,
                (b'1', b'6') => Code::Unauthenticated,
                _ => return Code::parse_fallback(bytes),
            },
            _ => return Code::parse_fallback(bytes),
        };
        Some(code)
    }

    // Codes outside 0..=16 are valid ASCII integers a newer peer may send;
    // anything non-numeric is a protocol violation handled by the caller.
    fn parse_fallback(bytes: &[u8]) -> Option<Code> {
        let s = std::str::from_utf8(bytes).ok()?;
        let _: u32 = s.parse().ok()?;
        trace!("unrecognized grpc-status value {:?}", s);
        Some(Code::Unknown)
    }

    pub(crate) fn to_header_value(self) -> HeaderValue {
        match self {
            Code::Ok => HeaderValue::from_static("0"),
            Code::Cancelled => HeaderValue::from_static("1"),
            Code::Unknown => HeaderValue::from_static("2"),
            Code::InvalidArgument => HeaderValue::from_static("3"),
            Code::DeadlineExceeded => HeaderValue::from_static("4"),
            Code::NotFound => HeaderValue::from_static("5"),
            Code::AlreadyExists => HeaderValue::from_static("6"),
            Code::PermissionDenied => HeaderValue::from_static("7"),
            Code::ResourceExhausted => HeaderValue::from_static("8"),
            Code::FailedPrecondition => HeaderValue::from_static("9"),
            Code::Aborted => HeaderValue::from_static("10"),
            Code::OutOfRange => HeaderValue::from_static("11"),
            Code::Unimplemented => HeaderValue::from_static("12"),
            Code::Internal => HeaderValue::from_static("13"),
            Code::Unavailable => HeaderValue::from_static("14"),
            Code::DataLoss => HeaderValue::from_static("15"),
            Code::Unauthenticated => HeaderValue::from_static("16"),
        }
    }
}

impl From<i32> for Code {
    fn from(i: i32) -> Self {
        match i {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }
}
