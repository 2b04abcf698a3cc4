use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, CONTENT_TYPE, TE, USER_AGENT};
use http::{Method, Request, Response, StatusCode, Uri, Version};

use crate::metadata::{Metadata, TRAILER_RESIDUE_SKIP};
use crate::protocol::timeout::{format_grpc_timeout, parse_grpc_timeout};
use crate::status::{decode_grpc_message, GRPC_MESSAGE_HEADER, GRPC_STATUS_HEADER};
use crate::{Code, Error, Status};

pub(crate) const CONTENT_TYPE_GRPC: &str = "application/grpc";

const TIMEOUT_HEADER: &str = "grpc-timeout";
const ENCODING_HEADER: &str = "grpc-encoding";
const ACCEPT_ENCODING_HEADER: &str = "grpc-accept-encoding";
const MESSAGE_TYPE_HEADER: &str = "grpc-message-type";

#[cfg(feature = "gzip")]
const ACCEPT_ENCODING_VALUE: &str = "identity,gzip";
#[cfg(not(feature = "gzip"))]
const ACCEPT_ENCODING_VALUE: &str = "identity";

/// A protocol event observed on one RPC stream.
///
/// The connection engine linearizes these per stream: a server observes
/// `RequestReceived, MessageReceived*, RequestEnded`; a client observes
/// `ResponseReceived, MessageReceived*, ResponseEnded`.
#[derive(Debug, Clone)]
pub enum Event {
    RequestReceived(RequestHead),
    ResponseReceived(ResponseHead),
    MessageReceived { stream_id: u32, data: Bytes },
    RequestEnded { stream_id: u32 },
    ResponseEnded { stream_id: u32, status: Status },
}

impl Event {
    pub fn stream_id(&self) -> u32 {
        match self {
            Event::RequestReceived(head) => head.stream_id,
            Event::ResponseReceived(head) => head.stream_id,
            Event::MessageReceived { stream_id, .. } => *stream_id,
            Event::RequestEnded { stream_id } => *stream_id,
            Event::ResponseEnded { stream_id, .. } => *stream_id,
        }
    }

    /// Whether this event closes the remote half of the stream.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(
            self,
            Event::RequestEnded { .. } | Event::ResponseEnded { .. }
        )
    }
}

/// The parsed head of an inbound request (server side), or the coordinates
/// of an outbound one (client side).
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub stream_id: u32,
    pub scheme: String,
    pub service: String,
    pub method: String,
    pub content_type: String,
    pub authority: Option<String>,
    pub timeout: Option<Duration>,
    pub message_encoding: Option<String>,
    pub message_accept_encoding: Vec<String>,
    pub user_agent: Option<String>,
    pub message_type: Option<String>,
    pub metadata: Metadata,
}

impl RequestHead {
    /// Parse request headers destructively: every recognized header is
    /// popped so that the residue maps exactly to user metadata.
    pub(crate) fn parse(stream_id: u32, mut parts: http::request::Parts) -> Result<Self, Error> {
        if parts.method != Method::POST {
            return Err(Error::Protocol(format!(
                "unsupported method {}",
                parts.method
            )));
        }

        let scheme = match parts.uri.scheme_str() {
            Some(scheme @ ("http" | "https")) => scheme.to_owned(),
            _ => {
                return Err(Error::Protocol(
                    "scheme should be either http or https".into(),
                ))
            }
        };

        let (service, method) = split_path(parts.uri.path())?;

        match parts.headers.remove(TE) {
            Some(te) if te == "trailers" => {}
            _ => {
                return Err(Error::Protocol(
                    "te header not found or not equal to 'trailers', using incompatible proxy?"
                        .into(),
                ))
            }
        }

        let content_type = required_grpc_content_type(&mut parts.headers)?;

        let authority = parts.uri.authority().map(|a| a.as_str().to_owned());

        let timeout = match parts.headers.remove(TIMEOUT_HEADER) {
            Some(value) => {
                let value = value
                    .to_str()
                    .map_err(|_| Error::Protocol("malformed grpc-timeout header".into()))?;
                Some(parse_grpc_timeout(value)?)
            }
            None => None,
        };

        let message_encoding = remove_ascii(&mut parts.headers, ENCODING_HEADER)?;
        let message_accept_encoding = remove_comma_list(&mut parts.headers, ACCEPT_ENCODING_HEADER)?;
        let user_agent = remove_ascii(&mut parts.headers, USER_AGENT.as_str())?;
        let message_type = remove_ascii(&mut parts.headers, MESSAGE_TYPE_HEADER)?;

        let metadata = Metadata::from_residue(&mut parts.headers)?;

        Ok(RequestHead {
            stream_id,
            scheme,
            service,
            method,
            content_type,
            authority,
            timeout,
            message_encoding,
            message_accept_encoding,
            user_agent,
            message_type,
            metadata,
        })
    }

    /// Emit the request as HTTP/2 headers: pseudo-headers first, then the
    /// gRPC control headers, then user metadata in insertion order.
    pub(crate) fn to_http(&self) -> Result<Request<()>, Error> {
        let authority = self
            .authority
            .as_deref()
            .ok_or_else(|| Error::Protocol("request authority is required".into()))?;

        let uri = Uri::builder()
            .scheme(&*self.scheme)
            .authority(authority)
            .path_and_query(format!("/{}/{}", self.service, self.method))
            .build()
            .map_err(|err| Error::Protocol(format!("invalid request uri: {}", err)))?;

        let mut request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .version(Version::HTTP_2)
            .body(())
            .expect("request head is valid");

        let headers = request.headers_mut();
        headers.insert(TE, HeaderValue::from_static("trailers"));
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(&self.content_type)
                .map_err(|_| Error::Protocol("invalid content-type".into()))?,
        );
        if let Some(user_agent) = &self.user_agent {
            headers.insert(
                USER_AGENT,
                HeaderValue::from_str(user_agent)
                    .map_err(|_| Error::Protocol("invalid user-agent".into()))?,
            );
        }
        if let Some(timeout) = self.timeout {
            headers.insert(
                TIMEOUT_HEADER,
                HeaderValue::from_str(&format_grpc_timeout(timeout))
                    .expect("formatted timeout is a valid header value"),
            );
        }
        headers.insert(
            ACCEPT_ENCODING_HEADER,
            HeaderValue::from_static(ACCEPT_ENCODING_VALUE),
        );
        if let Some(message_type) = &self.message_type {
            headers.insert(
                MESSAGE_TYPE_HEADER,
                HeaderValue::from_str(message_type)
                    .map_err(|_| Error::Protocol("invalid grpc-message-type".into()))?,
            );
        }

        self.metadata.append_to_headers(headers)?;

        Ok(request)
    }
}

/// The parsed head of an inbound response (client side).
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub stream_id: u32,
    pub content_type: String,
    pub message_encoding: Option<String>,
    pub message_accept_encoding: Vec<String>,
    pub metadata: Metadata,
}

impl ResponseHead {
    /// Parse response headers destructively. `grpc-status` and
    /// `grpc-message` are left in place for the trailer parser: a
    /// trailers-only response carries them on this same header block.
    pub(crate) fn parse(
        stream_id: u32,
        parts: &mut http::response::Parts,
    ) -> Result<Self, Error> {
        if parts.status != StatusCode::OK {
            return Err(Error::Protocol(format!(
                "http status is not 200 (got {})",
                parts.status.as_u16()
            )));
        }

        let content_type = required_grpc_content_type(&mut parts.headers)?;
        let message_encoding = remove_ascii(&mut parts.headers, ENCODING_HEADER)?;
        let message_accept_encoding =
            remove_comma_list(&mut parts.headers, ACCEPT_ENCODING_HEADER)?;

        let metadata = Metadata::from_residue_skipping(&mut parts.headers, TRAILER_RESIDUE_SKIP)?;

        Ok(ResponseHead {
            stream_id,
            content_type,
            message_encoding,
            message_accept_encoding,
            metadata,
        })
    }
}

/// Build the response head a server sends before its first message.
pub(crate) fn response_head(initial_metadata: &Metadata) -> Result<Response<()>, Error> {
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .body(())
        .expect("response head is valid");

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_GRPC));
    headers.insert(
        ACCEPT_ENCODING_HEADER,
        HeaderValue::from_static(ACCEPT_ENCODING_VALUE),
    );
    initial_metadata.append_to_headers(headers)?;

    Ok(response)
}

/// Build a trailers-only response: the terminal status carried directly on
/// the HEADERS frame with END_STREAM, no message phase at all.
pub(crate) fn trailers_only_response(status: &Status) -> Result<Response<()>, Error> {
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .body(())
        .expect("response head is valid");

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_GRPC));
    status.add_trailers(headers)?;

    Ok(response)
}

/// Parse a trailer block into `ResponseEnded`. `grpc-status` is required.
pub(crate) fn parse_response_trailers(
    stream_id: u32,
    trailers: &mut HeaderMap,
) -> Result<Event, Error> {
    let raw = trailers
        .remove(GRPC_STATUS_HEADER)
        .ok_or_else(|| Error::Protocol("expected grpc-status in trailers".into()))?;

    let code = Code::from_bytes(raw.as_bytes()).ok_or_else(|| {
        Error::Protocol(format!(
            "grpc-status is not an ASCII integer: {:?}",
            String::from_utf8_lossy(raw.as_bytes())
        ))
    })?;

    let message = trailers
        .remove(GRPC_MESSAGE_HEADER)
        .map(|value| decode_grpc_message(value.as_bytes()))
        .unwrap_or_default();

    let metadata = Metadata::from_residue(trailers)?;

    Ok(Event::ResponseEnded {
        stream_id,
        status: Status::new(code, message).with_metadata(metadata),
    })
}

/// Whether a response header block is a trailers-only response.
pub(crate) fn is_trailers_only(headers: &HeaderMap) -> bool {
    headers.contains_key(GRPC_STATUS_HEADER)
}

fn split_path(path: &str) -> Result<(String, String), Error> {
    let malformed = || {
        Error::Protocol(format!(
            "path should be /<service>/<method>, got {:?}",
            path
        ))
    };

    let rest = path.strip_prefix('/').ok_or_else(malformed)?;
    let mut segments = rest.split('/');
    match (segments.next(), segments.next(), segments.next()) {
        (Some(service), Some(method), None) if !service.is_empty() && !method.is_empty() => {
            Ok((service.to_owned(), method.to_owned()))
        }
        _ => Err(malformed()),
    }
}

fn required_grpc_content_type(headers: &mut HeaderMap) -> Result<String, Error> {
    let content_type = headers
        .remove(CONTENT_TYPE)
        .ok_or_else(|| Error::Protocol("missing content-type header".into()))?;
    let content_type = content_type
        .to_str()
        .map_err(|_| Error::Protocol("malformed content-type header".into()))?;
    if !content_type.starts_with(CONTENT_TYPE_GRPC) {
        return Err(Error::Protocol(format!(
            "content type should start with {}, got {:?}",
            CONTENT_TYPE_GRPC, content_type
        )));
    }
    Ok(content_type.to_owned())
}

fn remove_ascii(headers: &mut HeaderMap, name: &str) -> Result<Option<String>, Error> {
    match headers.remove(name) {
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| Error::Protocol(format!("malformed {} header", name)))?;
            Ok(Some(value.to_owned()))
        }
        None => Ok(None),
    }
}

fn remove_comma_list(headers: &mut HeaderMap, name: &str) -> Result<Vec<String>, Error> {
    Ok(remove_ascii(headers, name)?
        .map(|value| {
            value
                .split(',')
                .map(|item| item.trim().to_owned())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default())
}
