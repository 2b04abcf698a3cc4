//! The server half of the connection engine: pumps one HTTP/2 connection,
//! turning accepted streams into dispatched RPCs and shepherding graceful
//! shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::codec::Deframer;
use crate::config::Config;
use crate::protocol::{self, RequestHead};
use crate::server::service::Registry;
use crate::stream::{pump_server_request, RpcStream};
use crate::{Error, Status};

/// Live streams on one connection, keyed by stream id. A stream id is
/// inserted at most once for the lifetime of the id.
type StreamMap = Arc<Mutex<HashMap<u32, AbortHandle>>>;

pub(crate) async fn serve_connection<IO>(
    io: IO,
    registry: Arc<Registry>,
    config: Arc<Config>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut connection: h2::server::Connection<IO, Bytes> = h2::server::Builder::new()
        .max_concurrent_streams(config.max_concurrent_streams)
        .handshake(io)
        .await?;

    let streams: StreamMap = Arc::new(Mutex::new(HashMap::new()));

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = connection.accept() => {
                match accepted {
                    Some(Ok((request, respond))) => {
                        accept_stream(request, respond, &registry, &config, &streams);
                    }
                    Some(Err(err)) => return Err(Error::from_h2(err)),
                    None => return Ok(()),
                }
            }
        }
    }

    // GOAWAY: no new streams; let live ones run out the drain deadline.
    debug!("draining connection");
    connection.graceful_shutdown();

    let drained = async {
        loop {
            match connection.accept().await {
                // Streams that raced the GOAWAY are still dispatched.
                Some(Ok((request, respond))) => {
                    accept_stream(request, respond, &registry, &config, &streams);
                }
                Some(Err(err)) => return Err(Error::from_h2(err)),
                None => return Ok(()),
            }
        }
    };

    match tokio::time::timeout(config.drain_timeout, drained).await {
        Ok(result) => result,
        Err(_) => {
            let handles: Vec<AbortHandle> = streams.lock().unwrap().drain().map(|(_, h)| h).collect();
            warn!(streams = handles.len(), "drain deadline hit, resetting remaining streams");
            for handle in handles {
                handle.abort();
            }
            Ok(())
        }
    }
}

fn accept_stream(
    request: http::Request<h2::RecvStream>,
    mut respond: h2::server::SendResponse<Bytes>,
    registry: &Arc<Registry>,
    config: &Arc<Config>,
    streams: &StreamMap,
) {
    let stream_id = u32::from(request.body().stream_id());
    let (parts, body) = request.into_parts();

    // A malformed head closes this stream with INTERNAL; the connection
    // itself is untouched.
    let head = match RequestHead::parse(stream_id, parts) {
        Ok(head) => head,
        Err(err) => {
            debug!(id = stream_id, "rejecting request: {}", err);
            reject(&mut respond, &err.to_closing_status());
            return;
        }
    };

    let descriptor = match registry.lookup(&head.service, &head.method) {
        Some(descriptor) => descriptor,
        None => {
            debug!(id = stream_id, service = %head.service, method = %head.method, "method not found");
            reject(
                &mut respond,
                &Status::unimplemented(format!(
                    "method /{}/{} is not implemented",
                    head.service, head.method
                )),
            );
            return;
        }
    };

    let mut deframer = Deframer::new(config.max_message_size);
    if let Err(err) = deframer.negotiate_encoding(head.message_encoding.as_deref()) {
        debug!(id = stream_id, "rejecting request: {}", err);
        reject(&mut respond, &err.to_closing_status());
        return;
    }

    trace!(
        id = stream_id,
        service = %head.service,
        method = %head.method,
        kind = ?descriptor.kind,
        "dispatching request"
    );

    // Use the shorter of the client's header and the server default.
    let deadline = match (head.timeout, config.default_timeout) {
        (Some(header), Some(server)) => Some(header.min(server)),
        (header, server) => header.or(server),
    };
    let head = Arc::new(head);

    let (tx, rx) = mpsc::channel(config.inbound_queue);
    let rpc = RpcStream::server(head, respond, rx, config.max_message_size);

    let pump = tokio::spawn(pump_server_request(body, tx, deframer, stream_id));

    let call = (descriptor.call.as_ref())(rpc, deadline);
    let streams_done = streams.clone();
    let handle = tokio::spawn(async move {
        call.await;
        // The adapter has closed (or reset) the stream; stop reading.
        pump.abort();
        streams_done.lock().unwrap().remove(&stream_id);
    });

    let previous = streams
        .lock()
        .unwrap()
        .insert(stream_id, handle.abort_handle());
    debug_assert!(previous.is_none(), "stream id {} reused", stream_id);
    if handle.is_finished() {
        // The task beat the insert; drop the stale entry.
        streams.lock().unwrap().remove(&stream_id);
    }
}

fn reject(respond: &mut h2::server::SendResponse<Bytes>, status: &Status) {
    match protocol::trailers_only_response(status) {
        Ok(response) => {
            if let Err(err) = respond.send_response(response, true) {
                debug!("failed to send trailers-only response: {}", err);
            }
        }
        Err(err) => debug!("failed to build trailers-only response: {}", err),
    }
}
