//! User-supplied metadata carried alongside the gRPC control headers.
//!
//! Metadata is an ordered mapping from lowercase ASCII keys to values. Keys
//! ending in `-bin` carry binary values, transparently base64-encoded on the
//! wire (emitted without padding, accepted with or without). Reserved header
//! names are never surfaced here and are rejected on insert.

use std::fmt;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::status::{GRPC_MESSAGE_HEADER, GRPC_STATUS_HEADER};
use crate::Error;

// The gRPC spec requires binary metadata to be emitted without padding but
// accepted either way.
const BASE64_ENCODE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_encode_padding(false),
);
const BASE64_DECODE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const BINARY_SUFFIX: &str = "-bin";

/// An ordered set of user metadata entries.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
}

/// A single metadata value, ASCII or binary per the key's `-bin` suffix.
#[derive(Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Ascii(String),
    Binary(Bytes),
}

/// Error returned when a key or value cannot be stored as metadata.
#[derive(Debug)]
pub struct InvalidMetadata(&'static str);

impl Metadata {
    pub fn new() -> Metadata {
        Metadata::default()
    }

    /// Insert an entry, replacing any previous entries for the key. The
    /// original position is kept when replacing.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<MetadataValue>,
    ) -> Result<(), InvalidMetadata> {
        let key = key.into();
        let value = value.into();
        validate(&key, &value)?;

        match self.entries.iter().position(|(k, _)| *k == key) {
            Some(idx) => {
                self.entries[idx].1 = value;
                let mut seen = 0;
                self.entries.retain(|(k, _)| {
                    if *k == key {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.entries.push((key, value)),
        }
        Ok(())
    }

    /// Append an entry, keeping any previous entries for the key.
    pub fn append(
        &mut self,
        key: impl Into<String>,
        value: impl Into<MetadataValue>,
    ) -> Result<(), InvalidMetadata> {
        let key = key.into();
        let value = value.into();
        validate(&key, &value)?;
        self.entries.push((key, value));
        Ok(())
    }

    /// Get the first value for a key.
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Iterate every value stored under `key`, in insertion order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a MetadataValue> {
        self.entries
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Remove every entry for a key, returning the first removed value.
    pub fn remove(&mut self, key: &str) -> Option<MetadataValue> {
        let first = self
            .entries
            .iter()
            .position(|(k, _)| k == key)
            .map(|idx| self.entries[idx].1.clone());
        self.entries.retain(|(k, _)| k != key);
        first
    }

    /// Iterate all entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append all entries onto an outgoing header map, base64-encoding
    /// binary values.
    pub(crate) fn append_to_headers(&self, headers: &mut HeaderMap) -> Result<(), Error> {
        for (key, value) in &self.entries {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| Error::Protocol(format!("invalid metadata key {:?}", key)))?;
            let value = match value {
                MetadataValue::Ascii(s) => HeaderValue::from_str(s)
                    .map_err(|_| Error::Protocol(format!("invalid metadata value for {:?}", key)))?,
                MetadataValue::Binary(b) => {
                    let encoded = BASE64_ENCODE.encode(b);
                    HeaderValue::from_maybe_shared(Bytes::from(encoded))
                        .expect("base64 output is a valid header value")
                }
            };
            headers.append(name, value);
        }
        Ok(())
    }

    /// Drain every header left in `residue` into user metadata. The caller
    /// has already popped the recognized control headers; what remains maps
    /// exactly to custom metadata.
    pub(crate) fn from_residue(residue: &mut HeaderMap) -> Result<Metadata, Error> {
        Metadata::from_residue_skipping(residue, &[])
    }

    /// Like [`Metadata::from_residue`], but leaves the named keys in place.
    /// Used when parsing response headers, where `grpc-status` and
    /// `grpc-message` belong to the trailer parser.
    pub(crate) fn from_residue_skipping(
        residue: &mut HeaderMap,
        skip: &[&str],
    ) -> Result<Metadata, Error> {
        let mut metadata = Metadata::new();
        let keys: Vec<HeaderName> = residue.keys().cloned().collect();

        for name in keys {
            if skip.iter().any(|s| name.as_str() == *s) {
                continue;
            }
            let values: Vec<HeaderValue> = residue.get_all(&name).iter().cloned().collect();
            residue.remove(&name);

            for value in values {
                let entry = if name.as_str().ends_with(BINARY_SUFFIX) {
                    let decoded = BASE64_DECODE.decode(value.as_bytes()).map_err(|_| {
                        Error::Protocol(format!("invalid base64 in {:?} metadata", name.as_str()))
                    })?;
                    MetadataValue::Binary(decoded.into())
                } else {
                    let s = value.to_str().map_err(|_| {
                        Error::Protocol(format!(
                            "non-ASCII value in {:?} metadata",
                            name.as_str()
                        ))
                    })?;
                    MetadataValue::Ascii(s.to_owned())
                };
                metadata.entries.push((name.as_str().to_owned(), entry));
            }
        }

        Ok(metadata)
    }
}

/// Header names that carry protocol meaning and are never user metadata.
pub(crate) fn is_reserved(key: &str) -> bool {
    key.starts_with(':')
        || key.starts_with("grpc-")
        || matches!(key, "te" | "content-type" | "user-agent")
}

fn validate(key: &str, value: &MetadataValue) -> Result<(), InvalidMetadata> {
    if key.is_empty() {
        return Err(InvalidMetadata("empty metadata key"));
    }
    if !key
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'-' | b'_' | b'.'))
    {
        return Err(InvalidMetadata(
            "metadata keys must be lowercase ASCII letters, digits, '-', '_' or '.'",
        ));
    }
    if is_reserved(key) {
        return Err(InvalidMetadata("reserved header name"));
    }
    match (key.ends_with(BINARY_SUFFIX), value) {
        (true, MetadataValue::Ascii(_)) => {
            Err(InvalidMetadata("keys ending in -bin require binary values"))
        }
        (false, MetadataValue::Binary(_)) => {
            Err(InvalidMetadata("binary values require a -bin key suffix"))
        }
        _ => Ok(()),
    }
}

// grpc-status / grpc-message are reserved names, so they can never collide
// with user metadata; named here for the response-header skip list.
pub(crate) const TRAILER_RESIDUE_SKIP: &[&str] = &[GRPC_STATUS_HEADER, GRPC_MESSAGE_HEADER];

// ===== impl MetadataValue =====

impl MetadataValue {
    /// The value as a string, if ASCII.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Ascii(s) => Some(s),
            MetadataValue::Binary(_) => None,
        }
    }

    /// The raw value bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            MetadataValue::Ascii(s) => s.as_bytes(),
            MetadataValue::Binary(b) => b,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Ascii(s.to_owned())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Ascii(s)
    }
}

impl From<Bytes> for MetadataValue {
    fn from(b: Bytes) -> Self {
        MetadataValue::Binary(b)
    }
}

impl From<Vec<u8>> for MetadataValue {
    fn from(b: Vec<u8>) -> Self {
        MetadataValue::Binary(b.into())
    }
}

impl fmt::Debug for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Ascii(s) => fmt::Debug::fmt(s, f),
            MetadataValue::Binary(b) => write!(f, "b{:?}", &b[..]),
        }
    }
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, v)| (k, v)))
            .finish()
    }
}

impl fmt::Display for InvalidMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl std::error::Error for InvalidMetadata {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        let mut metadata = Metadata::new();
        metadata.insert("x-request-id", "abc123").unwrap();
        metadata
            .insert("x-trace-bin", Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]))
            .unwrap();
        metadata.append("x-tag", "one").unwrap();
        metadata.append("x-tag", "two").unwrap();

        let mut headers = HeaderMap::new();
        metadata.append_to_headers(&mut headers).unwrap();

        // Binary values never carry padding on the wire.
        assert_eq!(headers.get("x-trace-bin").unwrap(), "3q2+7w");

        let parsed = Metadata::from_residue(&mut headers).unwrap();
        assert!(headers.is_empty());
        assert_eq!(parsed.get("x-request-id"), metadata.get("x-request-id"));
        assert_eq!(parsed.get("x-trace-bin"), metadata.get("x-trace-bin"));
        let tags: Vec<_> = parsed.get_all("x-tag").collect();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].as_str(), Some("one"));
        assert_eq!(tags[1].as_str(), Some("two"));
    }

    #[test]
    fn padded_base64_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-trace-bin", HeaderValue::from_static("3q2+7w=="));
        let parsed = Metadata::from_residue(&mut headers).unwrap();
        assert_eq!(
            parsed.get("x-trace-bin").unwrap().as_bytes(),
            &[0xde, 0xad, 0xbe, 0xef]
        );
    }

    #[test]
    fn reserved_keys_rejected() {
        let mut metadata = Metadata::new();
        assert!(metadata.insert("grpc-timeout", "1S").is_err());
        assert!(metadata.insert("te", "trailers").is_err());
        assert!(metadata.insert("content-type", "text/plain").is_err());
        assert!(metadata.insert("user-agent", "x").is_err());
        assert!(metadata.insert("X-Upper", "x").is_err());
    }

    #[test]
    fn binary_suffix_enforced() {
        let mut metadata = Metadata::new();
        assert!(metadata.insert("x-bin", "ascii").is_err());
        assert!(metadata
            .insert("x-data", Bytes::from_static(b"raw"))
            .is_err());
        assert!(metadata.insert("x-bin", Bytes::from_static(b"raw")).is_ok());
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut metadata = Metadata::new();
        metadata.insert("a", "1").unwrap();
        metadata.insert("b", "2").unwrap();
        metadata.insert("a", "3").unwrap();

        let entries: Vec<_> = metadata.iter().collect();
        assert_eq!(entries[0].0, "a");
        assert_eq!(entries[0].1.as_str(), Some("3"));
        assert_eq!(entries[1].0, "b");
    }

    #[test]
    fn skip_list_leaves_trailer_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("grpc-status", HeaderValue::from_static("0"));
        headers.insert("x-meta", HeaderValue::from_static("v"));
        let parsed = Metadata::from_residue_skipping(&mut headers, TRAILER_RESIDUE_SKIP).unwrap();
        assert_eq!(parsed.len(), 1);
        assert!(headers.contains_key("grpc-status"));
    }
}
