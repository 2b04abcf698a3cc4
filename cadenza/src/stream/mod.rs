//! Per-RPC streams.
//!
//! An [`RpcStream`] is one in-flight RPC on either peer: a send half wired
//! to the HTTP/2 stream's send handle and a receive half fed protocol
//! events by the connection engine. The two halves share the stream's state
//! machine and can be split so a client pumps outbound messages while
//! consuming inbound ones on the same RPC.

mod state;

use std::future::poll_fn;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use http::HeaderMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub use self::state::{Role, StreamState};
pub(crate) use self::state::StateMachine;

use crate::codec::{encode_frame, frame_payload, Codec, Decoder, Deframer, Encoder};
use crate::metadata::Metadata;
use crate::protocol::{self, Event, RequestHead, ResponseHead};
use crate::{Error, Status};

/// One entry in a stream's inbound queue.
pub(crate) enum Inbound {
    Event(Event),
    Failed(Error),
}

/// State shared between the two halves of one stream.
pub(crate) struct Shared {
    id: u32,
    role: Role,
    state: Mutex<StateMachine>,
    terminal: Mutex<Option<Event>>,
    request: Option<Arc<RequestHead>>,
}

/// One in-flight RPC. Owned by user code; the connection engine holds only
/// the inbound queue's sending side and looks the stream up by id.
pub struct RpcStream {
    send: SendHalf,
    recv: RecvHalf,
}

impl RpcStream {
    pub(crate) fn server(
        head: Arc<RequestHead>,
        respond: h2::server::SendResponse<Bytes>,
        rx: mpsc::Receiver<Inbound>,
        max_message_size: usize,
    ) -> RpcStream {
        let shared = Arc::new(Shared {
            id: head.stream_id,
            role: Role::Server,
            state: Mutex::new(StateMachine::server()),
            terminal: Mutex::new(None),
            request: Some(head),
        });
        RpcStream {
            send: SendHalf {
                shared: shared.clone(),
                inner: SendInner::Server {
                    respond,
                    stream: None,
                    initial_metadata: Metadata::new(),
                },
                max_message_size,
            },
            recv: RecvHalf {
                shared,
                rx,
                response: None,
                done: false,
            },
        }
    }

    /// A client stream whose request headers are already on the wire.
    pub(crate) fn client(
        id: u32,
        stream: h2::SendStream<Bytes>,
        rx: mpsc::Receiver<Inbound>,
        max_message_size: usize,
    ) -> RpcStream {
        let mut sm = StateMachine::client();
        sm.send_headers().expect("fresh stream accepts headers");
        let shared = Arc::new(Shared {
            id,
            role: Role::Client,
            state: Mutex::new(sm),
            terminal: Mutex::new(None),
            request: None,
        });
        RpcStream {
            send: SendHalf {
                shared: shared.clone(),
                inner: SendInner::Client { stream },
                max_message_size,
            },
            recv: RecvHalf {
                shared,
                rx,
                response: None,
                done: false,
            },
        }
    }

    /// The HTTP/2 stream id carrying this RPC (odd for client-initiated).
    pub fn id(&self) -> u32 {
        self.send.shared.id
    }

    pub fn role(&self) -> Role {
        self.send.shared.role
    }

    /// The current state of the stream's state machine.
    pub fn state(&self) -> StreamState {
        self.send.shared.state.lock().unwrap().state()
    }

    /// The parsed request head, on server streams.
    pub fn request_head(&self) -> Option<&RequestHead> {
        self.send.shared.request.as_deref()
    }

    /// The parsed response head, once received (client streams).
    pub fn response_head(&self) -> Option<&ResponseHead> {
        self.recv.response_head()
    }

    /// Send one message, already encoded, as a gRPC frame.
    pub async fn send_message(&mut self, payload: Bytes) -> Result<(), Error> {
        self.send.send_message(payload).await
    }

    /// Receive the next message payload, or `None` once the remote half is
    /// closed. After `None`, inspect [`RpcStream::end_stream_event`].
    pub async fn receive_message(&mut self) -> Result<Option<Bytes>, Error> {
        self.recv.receive_message().await
    }

    /// Half-close the local side (client): END_STREAM with no payload.
    pub async fn close(&mut self) -> Result<(), Error> {
        self.send.close().await
    }

    /// Close the local side with a terminal status (server): trailers, or a
    /// trailers-only response if no headers were sent yet.
    pub async fn close_with_status(&mut self, status: Status) -> Result<(), Error> {
        self.send.close_with_status(status).await
    }

    /// Reset the stream with `CANCEL` and close both halves locally.
    pub fn cancel(&mut self) {
        self.send.cancel();
    }

    /// The terminal event, once observed by `receive_message`.
    pub fn end_stream_event(&self) -> Option<Event> {
        self.recv.end_stream_event()
    }

    /// Attach initial metadata to the response headers (server, before the
    /// first message).
    pub fn set_initial_metadata(&mut self, metadata: Metadata) -> Result<(), Error> {
        self.send.set_initial_metadata(metadata)
    }

    /// Split into independently owned send and receive halves.
    pub fn split(self) -> (SendHalf, RecvHalf) {
        (self.send, self.recv)
    }

    /// Split into typed halves that run every message through `codec`.
    pub fn split_typed<C: Codec>(
        self,
        codec: &mut C,
    ) -> (MessageSender<C::Encode>, Streaming<C::Decode>) {
        let (send, recv) = self.split();
        (
            MessageSender {
                inner: send,
                encoder: Box::new(codec.encoder()),
                buf: BytesMut::new(),
            },
            Streaming {
                inner: recv,
                decoder: Box::new(codec.decoder()),
                terminated: false,
            },
        )
    }
}

impl std::fmt::Debug for RpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcStream")
            .field("id", &self.id())
            .field("role", &self.role())
            .field("state", &self.state())
            .finish()
    }
}

// ===== SendHalf =====

/// The sending side of an [`RpcStream`].
pub struct SendHalf {
    shared: Arc<Shared>,
    inner: SendInner,
    max_message_size: usize,
}

enum SendInner {
    Server {
        respond: h2::server::SendResponse<Bytes>,
        stream: Option<h2::SendStream<Bytes>>,
        initial_metadata: Metadata,
    },
    Client {
        stream: h2::SendStream<Bytes>,
    },
}

impl SendHalf {
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// See [`RpcStream::set_initial_metadata`].
    pub fn set_initial_metadata(&mut self, metadata: Metadata) -> Result<(), Error> {
        match &mut self.inner {
            SendInner::Server {
                stream: None,
                initial_metadata,
                ..
            } => {
                *initial_metadata = metadata;
                Ok(())
            }
            SendInner::Server { .. } => {
                Err(Error::InvalidState("response headers already sent"))
            }
            SendInner::Client { .. } => Err(Error::InvalidState(
                "initial metadata travels with the request headers",
            )),
        }
    }

    /// See [`RpcStream::send_message`].
    pub async fn send_message(&mut self, payload: Bytes) -> Result<(), Error> {
        let len = payload.len();
        if len > self.max_message_size {
            return Err(Error::MessageTooLarge {
                len,
                limit: self.max_message_size,
            });
        }
        self.send_frame(frame_payload(payload)).await
    }

    pub(crate) async fn send_frame(&mut self, frame: Bytes) -> Result<(), Error> {
        self.ensure_headers()?;
        self.shared.state.lock().unwrap().send_message()?;
        let stream = self.stream_mut()?;
        send_data_flow(stream, frame, false).await
    }

    /// See [`RpcStream::close`].
    pub async fn close(&mut self) -> Result<(), Error> {
        match &mut self.inner {
            SendInner::Client { stream } => {
                self.shared.state.lock().unwrap().close_local()?;
                trace!(id = self.shared.id, "half-closing request");
                send_data_flow(stream, Bytes::new(), true).await
            }
            SendInner::Server { .. } => {
                Err(Error::InvalidState("server streams close with a status"))
            }
        }
    }

    /// See [`RpcStream::close_with_status`].
    pub async fn close_with_status(&mut self, status: Status) -> Result<(), Error> {
        match &mut self.inner {
            SendInner::Server {
                respond, stream, ..
            } => {
                self.shared.state.lock().unwrap().close_local()?;
                trace!(id = self.shared.id, code = ?status.code(), "closing stream");
                match stream {
                    Some(send) => {
                        let mut trailers = HeaderMap::new();
                        status.add_trailers(&mut trailers)?;
                        send.send_trailers(trailers).map_err(Error::from_h2)
                    }
                    None => {
                        let response = protocol::trailers_only_response(&status)?;
                        respond
                            .send_response(response, true)
                            .map_err(Error::from_h2)?;
                        Ok(())
                    }
                }
            }
            SendInner::Client { .. } => Err(Error::InvalidState(
                "client streams half-close without a status",
            )),
        }
    }

    /// See [`RpcStream::cancel`].
    pub fn cancel(&mut self) {
        self.shared.state.lock().unwrap().cancel();
        match &mut self.inner {
            SendInner::Server {
                respond, stream, ..
            } => match stream {
                Some(send) => send.send_reset(h2::Reason::CANCEL),
                None => respond.send_reset(h2::Reason::CANCEL),
            },
            SendInner::Client { stream } => stream.send_reset(h2::Reason::CANCEL),
        }
    }

    // Server response headers go out lazily, before the first message.
    fn ensure_headers(&mut self) -> Result<(), Error> {
        if let SendInner::Server {
            respond,
            stream,
            initial_metadata,
        } = &mut self.inner
        {
            if stream.is_none() {
                self.shared.state.lock().unwrap().send_headers()?;
                trace!(id = self.shared.id, "sending response headers");
                let head = protocol::response_head(initial_metadata)?;
                let send = respond.send_response(head, false).map_err(Error::from_h2)?;
                *stream = Some(send);
            }
        }
        Ok(())
    }

    fn stream_mut(&mut self) -> Result<&mut h2::SendStream<Bytes>, Error> {
        match &mut self.inner {
            SendInner::Server {
                stream: Some(stream),
                ..
            } => Ok(stream),
            SendInner::Server { .. } => Err(Error::InvalidState("response headers not sent")),
            SendInner::Client { stream } => Ok(stream),
        }
    }
}

impl std::fmt::Debug for SendHalf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendHalf")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .finish()
    }
}

/// Wait for send window, then hand the frame to h2, which serializes all
/// outbound bytes for the stream in submission order.
async fn send_data_flow(
    stream: &mut h2::SendStream<Bytes>,
    data: Bytes,
    end_of_stream: bool,
) -> Result<(), Error> {
    if !data.is_empty() {
        stream.reserve_capacity(data.len());
        if stream.capacity() == 0 {
            loop {
                match poll_fn(|cx| stream.poll_capacity(cx)).await {
                    Some(Ok(0)) => continue,
                    Some(Ok(_)) => break,
                    Some(Err(err)) => return Err(Error::from_h2(err)),
                    None => return Err(Error::Unavailable("connection closed".into())),
                }
            }
        }
    }
    stream.send_data(data, end_of_stream).map_err(Error::from_h2)
}

// ===== RecvHalf =====

/// The receiving side of an [`RpcStream`].
pub struct RecvHalf {
    shared: Arc<Shared>,
    rx: mpsc::Receiver<Inbound>,
    response: Option<ResponseHead>,
    done: bool,
}

impl RecvHalf {
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub(crate) fn poll_receive(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Bytes>, Error>> {
        loop {
            if self.done {
                return Poll::Ready(Ok(None));
            }
            match self.rx.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    // The engine dropped the queue without a terminal event:
                    // the connection is gone.
                    self.done = true;
                    self.shared.state.lock().unwrap().cancel();
                    return Poll::Ready(Err(Error::Unavailable(
                        "stream closed before completion".into(),
                    )));
                }
                Poll::Ready(Some(Inbound::Event(event))) => match event {
                    Event::ResponseReceived(head) => {
                        self.shared.state.lock().unwrap().recv_headers();
                        self.response = Some(head);
                    }
                    Event::MessageReceived { data, .. } => return Poll::Ready(Ok(Some(data))),
                    event @ (Event::RequestEnded { .. } | Event::ResponseEnded { .. }) => {
                        self.done = true;
                        self.shared.state.lock().unwrap().close_remote();
                        *self.shared.terminal.lock().unwrap() = Some(event);
                        return Poll::Ready(Ok(None));
                    }
                    Event::RequestReceived(head) => {
                        debug!(id = head.stream_id, "spurious RequestReceived on live stream");
                    }
                },
                Poll::Ready(Some(Inbound::Failed(err))) => {
                    self.done = true;
                    self.shared.state.lock().unwrap().close_remote();
                    return Poll::Ready(Err(err));
                }
            }
        }
    }

    /// See [`RpcStream::receive_message`].
    pub async fn receive_message(&mut self) -> Result<Option<Bytes>, Error> {
        poll_fn(|cx| self.poll_receive(cx)).await
    }

    /// See [`RpcStream::end_stream_event`].
    pub fn end_stream_event(&self) -> Option<Event> {
        self.shared.terminal.lock().unwrap().clone()
    }

    pub fn response_head(&self) -> Option<&ResponseHead> {
        self.response.as_ref()
    }
}

impl std::fmt::Debug for RecvHalf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecvHalf")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .finish()
    }
}

// ===== typed layer =====

/// The typed sending half: encodes each message with the stream's codec and
/// frames it onto the wire.
pub struct MessageSender<T> {
    inner: SendHalf,
    encoder: Box<dyn Encoder<Item = T> + Send>,
    buf: BytesMut,
}

impl<T> MessageSender<T> {
    pub async fn send(&mut self, message: T) -> Result<(), Error> {
        let frame = encode_frame(
            &mut *self.encoder,
            message,
            &mut self.buf,
            self.inner.max_message_size,
        )?;
        self.inner.send_frame(frame).await
    }

    pub async fn close(&mut self) -> Result<(), Error> {
        self.inner.close().await
    }

    pub async fn close_with_status(&mut self, status: Status) -> Result<(), Error> {
        self.inner.close_with_status(status).await
    }

    pub fn set_initial_metadata(&mut self, metadata: Metadata) -> Result<(), Error> {
        self.inner.set_initial_metadata(metadata)
    }

    pub fn cancel(&mut self) {
        self.inner.cancel()
    }

    pub fn id(&self) -> u32 {
        self.inner.id()
    }
}

impl<T> std::fmt::Debug for MessageSender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSender").field("id", &self.id()).finish()
    }
}

/// The typed receiving half: a stream of decoded messages.
///
/// On client streams, a terminal `ResponseEnded` with a non-zero status is
/// surfaced once as [`Error::Rpc`] after the last message.
pub struct Streaming<T> {
    inner: RecvHalf,
    decoder: Box<dyn Decoder<Item = T> + Send>,
    terminated: bool,
}

impl<T> Streaming<T> {
    /// Fetch the next message from this stream.
    pub async fn message(&mut self) -> Result<Option<T>, Error> {
        match poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    /// See [`RpcStream::end_stream_event`].
    pub fn end_stream_event(&self) -> Option<Event> {
        self.inner.end_stream_event()
    }

    /// The response head with its initial metadata, once received.
    pub fn response_head(&self) -> Option<&ResponseHead> {
        self.inner.response_head()
    }
}

impl<T> futures_core::Stream for Streaming<T> {
    type Item = Result<T, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.terminated {
            return Poll::Ready(None);
        }
        match std::task::ready!(this.inner.poll_receive(cx)) {
            Ok(Some(mut payload)) => match this.decoder.decode(&mut payload) {
                Ok(message) => Poll::Ready(Some(Ok(message))),
                Err(status) => {
                    this.terminated = true;
                    Poll::Ready(Some(Err(Error::Protocol(format!(
                        "failed to decode message: {}",
                        status.message()
                    )))))
                }
            },
            Ok(None) => {
                this.terminated = true;
                match this.inner.end_stream_event() {
                    Some(Event::ResponseEnded { status, .. }) if !status.is_ok() => {
                        Poll::Ready(Some(Err(Error::Rpc(status))))
                    }
                    _ => Poll::Ready(None),
                }
            }
            Err(err) => {
                this.terminated = true;
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}

impl<T> std::fmt::Debug for Streaming<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Streaming").finish()
    }
}

/// Await exactly one message on a stream whose cardinality is unary.
pub(crate) async fn single_message<T>(streaming: &mut Streaming<T>) -> Result<T, Error> {
    match streaming.message().await? {
        Some(message) => {
            if streaming.message().await?.is_some() {
                return Err(Error::Protocol("expected one message, got multiple".into()));
            }
            Ok(message)
        }
        None => Err(Error::Protocol("expected one message, got zero".into())),
    }
}

// ===== inbound pumps =====

/// Feed one h2 receive stream through a deframer into a stream's inbound
/// queue. Connection-level flow control is released only after the chunk's
/// messages are queued, so a full queue withholds capacity from the peer.
async fn pump_inbound_data(
    body: &mut h2::RecvStream,
    deframer: &mut Deframer,
    tx: &mpsc::Sender<Inbound>,
    stream_id: u32,
) -> Result<(), ()> {
    while let Some(chunk) = body.data().await {
        match chunk {
            Ok(data) => {
                deframer.push(&data);
                loop {
                    match deframer.next() {
                        Ok(Some(payload)) => {
                            trace!(id = stream_id, len = payload.len(), "message received");
                            let event = Event::MessageReceived {
                                stream_id,
                                data: payload,
                            };
                            if tx.send(Inbound::Event(event)).await.is_err() {
                                return Err(());
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            let _ = tx.send(Inbound::Failed(err)).await;
                            return Err(());
                        }
                    }
                }
                let _ = body.flow_control().release_capacity(data.len());
            }
            Err(err) => {
                let _ = tx.send(Inbound::Failed(Error::from_h2(err))).await;
                return Err(());
            }
        }
    }

    if deframer.is_partial() {
        let _ = tx
            .send(Inbound::Failed(Error::Protocol(
                "stream ended inside a message frame".into(),
            )))
            .await;
        return Err(());
    }

    Ok(())
}

/// Server-side inbound task: request body bytes, then `RequestEnded`.
pub(crate) async fn pump_server_request(
    mut body: h2::RecvStream,
    tx: mpsc::Sender<Inbound>,
    mut deframer: Deframer,
    stream_id: u32,
) {
    if pump_inbound_data(&mut body, &mut deframer, &tx, stream_id).await.is_err() {
        return;
    }

    // gRPC clients do not send trailers, but h2 requires the poll to
    // observe end of stream.
    match body.trailers().await {
        Ok(_) => {
            trace!(id = stream_id, "request ended");
            let _ = tx
                .send(Inbound::Event(Event::RequestEnded { stream_id }))
                .await;
        }
        Err(err) => {
            let _ = tx.send(Inbound::Failed(Error::from_h2(err))).await;
        }
    }
}

#[cfg(test)]
static_assertions::assert_impl_all!(RpcStream: Send);
#[cfg(test)]
static_assertions::assert_impl_all!(Streaming<()>: Send);

/// Client-side inbound task: response head, body bytes, then the trailers
/// carrying `grpc-status`.
pub(crate) async fn pump_client_response(
    response: h2::client::ResponseFuture,
    tx: mpsc::Sender<Inbound>,
    mut deframer: Deframer,
    stream_id: u32,
) {
    let response = match response.await {
        Ok(response) => response,
        Err(err) => {
            // Failures before response headers surface as Unavailable,
            // except an explicit peer cancel.
            let err = match Error::from_h2(err) {
                Error::Cancelled => Error::Cancelled,
                other => Error::Unavailable(other.to_string()),
            };
            let _ = tx.send(Inbound::Failed(err)).await;
            return;
        }
    };

    let (mut parts, mut body) = response.into_parts();
    let trailers_only = protocol::is_trailers_only(&parts.headers);

    let head = match ResponseHead::parse(stream_id, &mut parts) {
        Ok(head) => head,
        Err(err) => {
            let _ = tx.send(Inbound::Failed(err)).await;
            return;
        }
    };

    if let Err(err) = deframer.negotiate_encoding(head.message_encoding.as_deref()) {
        let _ = tx.send(Inbound::Failed(err)).await;
        return;
    }

    if tx
        .send(Inbound::Event(Event::ResponseReceived(head)))
        .await
        .is_err()
    {
        return;
    }

    if trailers_only {
        let item = match protocol::parse_response_trailers(stream_id, &mut parts.headers) {
            Ok(event) => Inbound::Event(event),
            Err(err) => Inbound::Failed(err),
        };
        let _ = tx.send(item).await;
        return;
    }

    if pump_inbound_data(&mut body, &mut deframer, &tx, stream_id).await.is_err() {
        return;
    }

    match body.trailers().await {
        Ok(Some(mut trailers)) => {
            let item = match protocol::parse_response_trailers(stream_id, &mut trailers) {
                Ok(event) => Inbound::Event(event),
                Err(err) => Inbound::Failed(err),
            };
            let _ = tx.send(item).await;
        }
        Ok(None) => {
            let _ = tx
                .send(Inbound::Failed(Error::Protocol(
                    "stream ended without grpc-status trailers".into(),
                )))
                .await;
        }
        Err(err) => {
            let _ = tx.send(Inbound::Failed(Error::from_h2(err))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;

    fn recv_half(role: Role) -> (mpsc::Sender<Inbound>, RecvHalf) {
        let sm = match role {
            Role::Client => {
                let mut sm = StateMachine::client();
                sm.send_headers().unwrap();
                sm
            }
            Role::Server => StateMachine::server(),
        };
        let shared = Arc::new(Shared {
            id: 1,
            role,
            state: Mutex::new(sm),
            terminal: Mutex::new(None),
            request: None,
        });
        let (tx, rx) = mpsc::channel(16);
        (
            tx,
            RecvHalf {
                shared,
                rx,
                response: None,
                done: false,
            },
        )
    }

    struct RawDecoder;

    impl Decoder for RawDecoder {
        type Item = Bytes;

        fn decode(&mut self, src: &mut Bytes) -> Result<Bytes, Status> {
            Ok(src.clone())
        }
    }

    fn typed(role: Role) -> (mpsc::Sender<Inbound>, Streaming<Bytes>) {
        let (tx, rx) = recv_half(role);
        (
            tx,
            Streaming {
                inner: rx,
                decoder: Box::new(RawDecoder),
                terminated: false,
            },
        )
    }

    #[tokio::test]
    async fn receive_linearizes_events() {
        let (tx, mut rx) = recv_half(Role::Server);
        tx.send(Inbound::Event(Event::MessageReceived {
            stream_id: 1,
            data: Bytes::from_static(b"a"),
        }))
        .await
        .unwrap();
        tx.send(Inbound::Event(Event::RequestEnded { stream_id: 1 }))
            .await
            .unwrap();

        assert_eq!(
            rx.receive_message().await.unwrap().unwrap(),
            Bytes::from_static(b"a")
        );
        assert!(rx.receive_message().await.unwrap().is_none());
        assert!(matches!(
            rx.end_stream_event(),
            Some(Event::RequestEnded { stream_id: 1 })
        ));
        // Terminal observed; every further receive is None.
        assert!(rx.receive_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failure_surfaces_once() {
        let (tx, mut rx) = recv_half(Role::Server);
        tx.send(Inbound::Failed(Error::Protocol("broken frame".into())))
            .await
            .unwrap();

        assert!(matches!(
            rx.receive_message().await,
            Err(Error::Protocol(_))
        ));
        assert!(rx.receive_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dropped_engine_is_unavailable() {
        let (tx, mut rx) = recv_half(Role::Client);
        drop(tx);
        assert!(matches!(
            rx.receive_message().await,
            Err(Error::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn client_stream_surfaces_rpc_failure_once() {
        let (tx, mut stream) = typed(Role::Client);
        tx.send(Inbound::Event(Event::ResponseReceived(ResponseHead {
            stream_id: 1,
            content_type: "application/grpc".into(),
            message_encoding: None,
            message_accept_encoding: Vec::new(),
            metadata: Metadata::new(),
        })))
        .await
        .unwrap();
        tx.send(Inbound::Event(Event::MessageReceived {
            stream_id: 1,
            data: Bytes::from_static(b"ok"),
        }))
        .await
        .unwrap();
        tx.send(Inbound::Event(Event::ResponseEnded {
            stream_id: 1,
            status: Status::new(Code::Unknown, "oops"),
        }))
        .await
        .unwrap();

        assert_eq!(
            stream.message().await.unwrap().unwrap(),
            Bytes::from_static(b"ok")
        );
        match stream.message().await {
            Err(Error::Rpc(status)) => {
                assert_eq!(status.code(), Code::Unknown);
                assert_eq!(status.message(), "oops");
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert!(stream.message().await.unwrap().is_none());
        assert!(stream.response_head().is_some());
    }

    #[tokio::test]
    async fn server_stream_ends_cleanly() {
        let (tx, mut stream) = typed(Role::Server);
        tx.send(Inbound::Event(Event::RequestEnded { stream_id: 1 }))
            .await
            .unwrap();
        assert!(stream.message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn single_message_rejects_multiple() {
        let (tx, mut stream) = typed(Role::Server);
        for _ in 0..2 {
            tx.send(Inbound::Event(Event::MessageReceived {
                stream_id: 1,
                data: Bytes::from_static(b"m"),
            }))
            .await
            .unwrap();
        }
        tx.send(Inbound::Event(Event::RequestEnded { stream_id: 1 }))
            .await
            .unwrap();

        assert!(matches!(
            single_message(&mut stream).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn single_message_rejects_zero() {
        let (tx, mut stream) = typed(Role::Server);
        tx.send(Inbound::Event(Event::RequestEnded { stream_id: 1 }))
            .await
            .unwrap();

        assert!(matches!(
            single_message(&mut stream).await,
            Err(Error::Protocol(_))
        ));
    }
}
