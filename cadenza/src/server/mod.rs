//! The gRPC server: a dispatch registry plus the accept loop that hands
//! each connection to the engine.

mod conn;
mod methods;
mod service;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::Error;

pub use self::service::{MethodKind, Service};
use self::service::Registry;

/// A gRPC server.
///
/// Constructed with a port, loaded with [`Service`] registrations, then run
/// with one of the `serve` methods until shutdown:
///
/// ```no_run
/// # use cadenza::{Server, Service};
/// # async fn run(greeter: Service) -> Result<(), cadenza::Error> {
/// Server::new(50051).add_service(greeter).serve().await
/// # }
/// ```
pub struct Server {
    port: u16,
    registry: Registry,
    config: Config,
    #[cfg(feature = "tls")]
    tls: Option<crate::tls::ServerTlsConfig>,
}

impl Server {
    pub fn new(port: u16) -> Server {
        Server {
            port,
            registry: Registry::default(),
            config: Config::default(),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Register a service. Later registrations under the same name replace
    /// earlier ones.
    pub fn add_service(mut self, service: Service) -> Self {
        self.registry.add(service);
        self
    }

    /// Cap on a single message payload in either direction. Defaults to
    /// 4 MiB.
    pub fn max_message_size(mut self, limit: usize) -> Self {
        self.config.max_message_size = limit;
        self
    }

    /// Cap on concurrently active streams per connection. Defaults to 100.
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.config.max_concurrent_streams = max;
        self
    }

    /// Deadline applied to RPCs that do not carry a `grpc-timeout` header.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = Some(timeout);
        self
    }

    /// How long live streams get to finish after shutdown begins. Defaults
    /// to 30 seconds.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    /// Serve TLS with the given identity.
    #[cfg(feature = "tls")]
    pub fn tls_config(mut self, tls: crate::tls::ServerTlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Bind `0.0.0.0:<port>` and serve until the process is killed.
    pub async fn serve(self) -> Result<(), Error> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Bind `0.0.0.0:<port>` and serve until `signal` resolves, then drain.
    pub async fn serve_with_shutdown(self, signal: impl Future<Output = ()>) -> Result<(), Error> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr).await?;
        self.serve_with_listener_shutdown(listener, signal).await
    }

    /// Serve on an already-bound listener (useful for ephemeral ports).
    pub async fn serve_with_listener(self, listener: TcpListener) -> Result<(), Error> {
        self.serve_with_listener_shutdown(listener, std::future::pending())
            .await
    }

    /// Serve on an already-bound listener until `signal` resolves.
    pub async fn serve_with_listener_shutdown(
        self,
        listener: TcpListener,
        signal: impl Future<Output = ()>,
    ) -> Result<(), Error> {
        let registry = Arc::new(self.registry);
        let config = Arc::new(self.config);

        #[cfg(feature = "tls")]
        let acceptor = match &self.tls {
            Some(tls) => Some(tls.build_acceptor()?),
            None => None,
        };

        debug!(addr = %listener.local_addr()?, "server listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => {
                    debug!("shutdown signal received");
                    let _ = shutdown_tx.send(true);
                    break;
                }
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            debug!("accept error: {}", err);
                            continue;
                        }
                    };
                    let _ = socket.set_nodelay(true);
                    trace!(%peer, "connection accepted");

                    let registry = registry.clone();
                    let config = config.clone();
                    let shutdown = shutdown_rx.clone();
                    #[cfg(feature = "tls")]
                    let acceptor = acceptor.clone();

                    connections.spawn(async move {
                        #[cfg(feature = "tls")]
                        if let Some(acceptor) = acceptor {
                            match acceptor.accept(socket).await {
                                Ok(tls) => {
                                    if let Err(err) =
                                        conn::serve_connection(tls, registry, config, shutdown).await
                                    {
                                        debug!(%peer, "connection terminated: {}", err);
                                    }
                                }
                                Err(err) => debug!(%peer, "tls handshake failed: {}", err),
                            }
                            return;
                        }

                        if let Err(err) =
                            conn::serve_connection(socket, registry, config, shutdown).await
                        {
                            debug!(%peer, "connection terminated: {}", err);
                        }
                    });
                }
            }
        }

        // Each connection drains itself against `drain_timeout`; allow a
        // little slack for the teardown.
        let drain = async {
            while connections.join_next().await.is_some() {}
        };
        let budget = config.drain_timeout + Duration::from_secs(1);
        if tokio::time::timeout(budget, drain).await.is_err() {
            warn!("connections outlived the drain deadline, aborting");
            connections.abort_all();
        }

        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").field("port", &self.port).finish()
    }
}
