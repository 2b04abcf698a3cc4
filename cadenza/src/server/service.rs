use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_core::Stream;
use tracing::warn;

use crate::codec::Codec;
use crate::server::methods;
use crate::stream::{RpcStream, Streaming};
use crate::BoxError;

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// The type-erased entry point for one method: builds the cardinality
/// adapter around a stream and runs it to completion.
pub(crate) type CallFn = Arc<dyn Fn(RpcStream, Option<Duration>) -> BoxFuture + Send + Sync>;

/// The four RPC shapes: (unary|stream) × (unary|stream).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Unary,
    ClientStreaming,
    ServerStreaming,
    Streaming,
}

pub(crate) struct MethodDescriptor {
    pub(crate) kind: MethodKind,
    pub(crate) call: CallFn,
}

/// A named service: a set of method descriptors a [`crate::Server`]
/// dispatches to by `(service, method)`.
///
/// Handlers are plain functions or closures; the typed-to-erased wrapping
/// happens here at registration, so the dispatch table holds one uniform
/// entry shape per method.
pub struct Service {
    name: String,
    methods: HashMap<String, MethodDescriptor>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Service {
        Service {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a unary-unary method.
    pub fn unary<C, F, Fut>(mut self, method: impl Into<String>, codec: C, handler: F) -> Self
    where
        C: Codec + Clone + Send + Sync + 'static,
        F: Fn(C::Decode) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C::Encode, BoxError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let call: CallFn = Arc::new(move |stream, deadline| {
            Box::pin(methods::unary(
                codec.clone(),
                stream,
                handler.clone(),
                deadline,
            ))
        });
        self.insert(method.into(), MethodKind::Unary, call);
        self
    }

    /// Register a unary-stream method: one request in, a lazy sequence of
    /// responses out.
    pub fn server_streaming<C, F, S>(
        mut self,
        method: impl Into<String>,
        codec: C,
        handler: F,
    ) -> Self
    where
        C: Codec + Clone + Send + Sync + 'static,
        F: Fn(C::Decode) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<C::Encode, BoxError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let call: CallFn = Arc::new(move |stream, deadline| {
            Box::pin(methods::server_streaming(
                codec.clone(),
                stream,
                handler.clone(),
                deadline,
            ))
        });
        self.insert(method.into(), MethodKind::ServerStreaming, call);
        self
    }

    /// Register a stream-unary method: the handler consumes the inbound
    /// message stream and produces a single response.
    pub fn client_streaming<C, F, Fut>(
        mut self,
        method: impl Into<String>,
        codec: C,
        handler: F,
    ) -> Self
    where
        C: Codec + Clone + Send + Sync + 'static,
        F: Fn(Streaming<C::Decode>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C::Encode, BoxError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let call: CallFn = Arc::new(move |stream, deadline| {
            Box::pin(methods::client_streaming(
                codec.clone(),
                stream,
                handler.clone(),
                deadline,
            ))
        });
        self.insert(method.into(), MethodKind::ClientStreaming, call);
        self
    }

    /// Register a stream-stream method.
    pub fn streaming<C, F, S>(mut self, method: impl Into<String>, codec: C, handler: F) -> Self
    where
        C: Codec + Clone + Send + Sync + 'static,
        F: Fn(Streaming<C::Decode>) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<C::Encode, BoxError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let call: CallFn = Arc::new(move |stream, deadline| {
            Box::pin(methods::streaming(
                codec.clone(),
                stream,
                handler.clone(),
                deadline,
            ))
        });
        self.insert(method.into(), MethodKind::Streaming, call);
        self
    }

    fn insert(&mut self, method: String, kind: MethodKind, call: CallFn) {
        if self
            .methods
            .insert(method.clone(), MethodDescriptor { kind, call })
            .is_some()
        {
            warn!(service = %self.name, %method, "replacing existing method registration");
        }
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The server dispatch table, keyed by `(service, method)`.
#[derive(Default)]
pub(crate) struct Registry {
    services: HashMap<String, HashMap<String, MethodDescriptor>>,
}

impl Registry {
    pub(crate) fn add(&mut self, service: Service) {
        if self
            .services
            .insert(service.name.clone(), service.methods)
            .is_some()
        {
            warn!(service = %service.name, "replacing existing service registration");
        }
    }

    pub(crate) fn lookup(&self, service: &str, method: &str) -> Option<&MethodDescriptor> {
        self.services.get(service)?.get(method)
    }
}
