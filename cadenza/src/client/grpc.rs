use std::time::Duration;

use futures_core::Stream;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::client::Channel;
use crate::codec::Codec;
use crate::metadata::Metadata;
use crate::stream::{single_message, MessageSender, Streaming};
use crate::Error;

/// Per-call options: metadata, an explicit deadline and the advertised
/// `grpc-message-type`.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub metadata: Metadata,
    pub timeout: Option<Duration>,
    pub message_type: Option<String>,
}

/// A gRPC client dispatcher.
///
/// Wraps a connected [`Channel`] and adapts the four call cardinalities
/// between user message values and the underlying [`crate::RpcStream`].
/// Methods take the service and method names plus a codec; generated stubs
/// would bind these, but nothing stops calling them directly:
///
/// ```no_run
/// # use cadenza::{Channel, Grpc, CallOptions};
/// # use cadenza::codec::ProstCodec;
/// # #[derive(Clone, PartialEq, prost::Message)]
/// # struct HelloRequest {}
/// # #[derive(Clone, PartialEq, prost::Message)]
/// # struct HelloReply {}
/// # async fn run() -> Result<(), cadenza::Error> {
/// let mut channel = Channel::new("localhost", 50051);
/// channel.connect().await?;
/// let mut client = Grpc::new(channel);
/// let reply: HelloReply = client
///     .unary(
///         ProstCodec::<HelloRequest, HelloReply>::default(),
///         "greeter.Greeter",
///         "SayHello",
///         HelloRequest {},
///         CallOptions::default(),
///     )
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Grpc {
    channel: Channel,
}

impl Grpc {
    pub fn new(channel: Channel) -> Grpc {
        Grpc { channel }
    }

    /// Send a single unary gRPC request.
    pub async fn unary<C>(
        &mut self,
        mut codec: C,
        service: &str,
        method: &str,
        request: C::Encode,
        options: CallOptions,
    ) -> Result<C::Decode, Error>
    where
        C: Codec,
    {
        let stream = self
            .channel
            .open_stream(
                service,
                method,
                options.metadata,
                options.timeout,
                options.message_type,
            )
            .await?;
        let (mut tx, mut rx) = stream.split_typed(&mut codec);

        send_unary_request(&mut tx, request).await?;

        single_message(&mut rx).await
    }

    /// Send a client side streaming gRPC request. The outbound pump runs
    /// concurrently with awaiting the single response.
    pub async fn client_streaming<C, S>(
        &mut self,
        mut codec: C,
        service: &str,
        method: &str,
        requests: S,
        options: CallOptions,
    ) -> Result<C::Decode, Error>
    where
        C: Codec,
        S: Stream<Item = C::Encode> + Send + 'static,
    {
        let stream = self
            .channel
            .open_stream(
                service,
                method,
                options.metadata,
                options.timeout,
                options.message_type,
            )
            .await?;
        let (tx, mut rx) = stream.split_typed(&mut codec);

        tokio::spawn(send_all(tx, requests));

        single_message(&mut rx).await
    }

    /// Send a server side streaming gRPC request.
    pub async fn server_streaming<C>(
        &mut self,
        mut codec: C,
        service: &str,
        method: &str,
        request: C::Encode,
        options: CallOptions,
    ) -> Result<Streaming<C::Decode>, Error>
    where
        C: Codec,
    {
        let stream = self
            .channel
            .open_stream(
                service,
                method,
                options.metadata,
                options.timeout,
                options.message_type,
            )
            .await?;
        let (mut tx, rx) = stream.split_typed(&mut codec);

        send_unary_request(&mut tx, request).await?;

        Ok(rx)
    }

    /// Send a bi-directional streaming gRPC request.
    pub async fn streaming<C, S>(
        &mut self,
        mut codec: C,
        service: &str,
        method: &str,
        requests: S,
        options: CallOptions,
    ) -> Result<Streaming<C::Decode>, Error>
    where
        C: Codec,
        S: Stream<Item = C::Encode> + Send + 'static,
    {
        let stream = self
            .channel
            .open_stream(
                service,
                method,
                options.metadata,
                options.timeout,
                options.message_type,
            )
            .await?;
        let (tx, rx) = stream.split_typed(&mut codec);

        tokio::spawn(send_all(tx, requests));

        Ok(rx)
    }
}

/// Send the one request of a unary-in call and half-close.
///
/// Wire-level send failures race the server's terminal status (it may have
/// rejected the RPC before reading the request), so they are not propagated:
/// the receive side reports the authoritative outcome. Local size violations
/// fail immediately.
async fn send_unary_request<T>(tx: &mut MessageSender<T>, request: T) -> Result<(), Error> {
    match tx.send(request).await {
        Ok(()) => {
            if let Err(err) = tx.close().await {
                debug!(id = tx.id(), "failed to half-close request: {}", err);
            }
            Ok(())
        }
        Err(err @ Error::MessageTooLarge { .. }) => Err(err),
        Err(err) => {
            debug!(id = tx.id(), "request not fully sent: {}", err);
            Ok(())
        }
    }
}

/// Pump a user-supplied request sequence onto the stream, then half-close.
/// Runs as its own task for the streaming-out cardinalities.
async fn send_all<T, S>(mut tx: MessageSender<T>, requests: S)
where
    S: Stream<Item = T>,
{
    tokio::pin!(requests);
    while let Some(message) = requests.next().await {
        if let Err(err) = tx.send(message).await {
            debug!(id = tx.id(), "stopping request pump: {}", err);
            break;
        }
    }
    // Half-close even if a send failed.
    if let Err(err) = tx.close().await {
        debug!(id = tx.id(), "failed to half-close request: {}", err);
    }
}
