use std::fmt;
use std::io::Read;

use bytes::Bytes;
use flate2::read::GzDecoder;
use tracing::trace;

use crate::Error;

/// A message encoding negotiated through `grpc-encoding` /
/// `grpc-accept-encoding`.
///
/// Outbound messages are always sent identity; this only selects the
/// decompressor applied to inbound frames with the compressed flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionEncoding {
    Gzip,
}

impl CompressionEncoding {
    /// Resolve a `grpc-encoding` value. `identity` maps to `None`; unknown
    /// encodings fail with `CompressionUnsupported`, which closes the
    /// stream with `UNIMPLEMENTED`.
    pub(crate) fn from_encoding_value(value: &str) -> Result<Option<CompressionEncoding>, Error> {
        match value {
            "identity" => Ok(None),
            "gzip" => Ok(Some(CompressionEncoding::Gzip)),
            other => {
                trace!("unsupported message encoding {:?}", other);
                Err(Error::CompressionUnsupported)
            }
        }
    }

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            CompressionEncoding::Gzip => "gzip",
        }
    }
}

impl fmt::Display for CompressionEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decompress one frame payload, enforcing the configured message limit on
/// the inflated size.
pub(crate) fn decompress(
    encoding: CompressionEncoding,
    payload: &[u8],
    limit: usize,
) -> Result<Bytes, Error> {
    match encoding {
        CompressionEncoding::Gzip => {
            let mut out = Vec::with_capacity(payload.len().saturating_mul(2));
            let mut decoder = GzDecoder::new(payload).take(limit as u64 + 1);
            decoder
                .read_to_end(&mut out)
                .map_err(|err| Error::Protocol(format!("error decompressing message: {}", err)))?;
            if out.len() > limit {
                return Err(Error::MessageTooLarge {
                    len: out.len(),
                    limit,
                });
            }
            Ok(out.into())
        }
    }
}
