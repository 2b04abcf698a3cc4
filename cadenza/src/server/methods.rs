//! Cardinality adapters: glue between a generic [`RpcStream`] and the four
//! handler shapes.
//!
//! Every adapter drives the same skeleton: pull the request side at the
//! cardinality's arity, run the handler, push the response side, close with
//! status 0. A handler error closes the stream with the error's status
//! (`UNKNOWN` for plain errors); a deadline closes it with
//! `DEADLINE_EXCEEDED` without tearing down the connection.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_core::Stream;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::codec::Codec;
use crate::stream::{single_message, MessageSender, RpcStream, Streaming};
use crate::{BoxError, Error, Status};

pub(crate) async fn unary<C, F, Fut>(
    mut codec: C,
    stream: RpcStream,
    handler: Arc<F>,
    deadline: Option<Duration>,
) where
    C: Codec,
    F: Fn(C::Decode) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C::Encode, BoxError>> + Send + 'static,
{
    let (mut tx, mut rx) = stream.split_typed(&mut codec);

    let timed_out = with_deadline(deadline, async {
        let request = match single_message(&mut rx).await {
            Ok(request) => request,
            Err(err) => return fail(&mut tx, &err).await,
        };

        match (*handler)(request).await {
            Ok(reply) => send_single(&mut tx, reply).await,
            Err(err) => close_with_handler_error(&mut tx, err).await,
        }
    })
    .await;

    if timed_out {
        expire(&mut tx).await;
    }
}

pub(crate) async fn server_streaming<C, F, S>(
    mut codec: C,
    stream: RpcStream,
    handler: Arc<F>,
    deadline: Option<Duration>,
) where
    C: Codec,
    F: Fn(C::Decode) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<C::Encode, BoxError>> + Send + 'static,
{
    let (mut tx, mut rx) = stream.split_typed(&mut codec);

    let timed_out = with_deadline(deadline, async {
        let request = match single_message(&mut rx).await {
            Ok(request) => request,
            Err(err) => return fail(&mut tx, &err).await,
        };

        let responses = (*handler)(request);
        tokio::pin!(responses);
        send_streaming(&mut tx, responses).await;
    })
    .await;

    if timed_out {
        expire(&mut tx).await;
    }
}

pub(crate) async fn client_streaming<C, F, Fut>(
    mut codec: C,
    stream: RpcStream,
    handler: Arc<F>,
    deadline: Option<Duration>,
) where
    C: Codec,
    F: Fn(Streaming<C::Decode>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C::Encode, BoxError>> + Send + 'static,
{
    let (mut tx, rx) = stream.split_typed(&mut codec);

    let timed_out = with_deadline(deadline, async {
        match (*handler)(rx).await {
            Ok(reply) => send_single(&mut tx, reply).await,
            Err(err) => close_with_handler_error(&mut tx, err).await,
        }
    })
    .await;

    if timed_out {
        expire(&mut tx).await;
    }
}

pub(crate) async fn streaming<C, F, S>(
    mut codec: C,
    stream: RpcStream,
    handler: Arc<F>,
    deadline: Option<Duration>,
) where
    C: Codec,
    F: Fn(Streaming<C::Decode>) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<C::Encode, BoxError>> + Send + 'static,
{
    let (mut tx, rx) = stream.split_typed(&mut codec);

    let timed_out = with_deadline(deadline, async {
        let responses = (*handler)(rx);
        tokio::pin!(responses);
        send_streaming(&mut tx, responses).await;
    })
    .await;

    if timed_out {
        expire(&mut tx).await;
    }
}

/// Run `work` under the stream's deadline. Returns whether it expired; the
/// caller still owns the stream's send half and closes it with status 4.
async fn with_deadline<F>(deadline: Option<Duration>, work: F) -> bool
where
    F: Future<Output = ()>,
{
    match deadline {
        Some(deadline) => tokio::time::timeout(deadline, work).await.is_err(),
        None => {
            work.await;
            false
        }
    }
}

async fn expire<T>(tx: &mut MessageSender<T>) {
    debug!(id = tx.id(), "stream deadline exceeded");
    let _ = tx
        .close_with_status(Status::deadline_exceeded("deadline exceeded"))
        .await;
}

/// Send one response message and close with status 0.
async fn send_single<T>(tx: &mut MessageSender<T>, reply: T) {
    match tx.send(reply).await {
        Ok(()) => {
            if let Err(err) = tx.close_with_status(Status::ok()).await {
                debug!(id = tx.id(), "failed to close stream: {}", err);
            }
        }
        Err(err) => fail(tx, &err).await,
    }
}

/// Iterate the handler's lazy response sequence until exhaustion or error.
async fn send_streaming<T, S>(tx: &mut MessageSender<T>, mut responses: Pin<&mut S>)
where
    S: Stream<Item = Result<T, BoxError>>,
{
    loop {
        match responses.next().await {
            Some(Ok(reply)) => {
                if let Err(err) = tx.send(reply).await {
                    return fail(tx, &err).await;
                }
            }
            Some(Err(err)) => return close_with_handler_error(tx, err).await,
            None => {
                if let Err(err) = tx.close_with_status(Status::ok()).await {
                    debug!(id = tx.id(), "failed to close stream: {}", err);
                }
                return;
            }
        }
    }
}

/// Close after a local failure, mapping the error onto its wire status.
async fn fail<T>(tx: &mut MessageSender<T>, err: &Error) {
    debug!(id = tx.id(), "rpc failed: {}", err);
    let _ = tx.close_with_status(err.to_closing_status()).await;
}

/// Close after a handler error: its `Status` if one is buried in the source
/// chain, `UNKNOWN` carrying the display form otherwise.
async fn close_with_handler_error<T>(tx: &mut MessageSender<T>, err: BoxError) {
    let status = Status::from_error(&*err);
    debug!(id = tx.id(), code = ?status.code(), "handler failed: {}", err);
    let _ = tx.close_with_status(status).await;
}
