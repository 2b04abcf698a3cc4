//! Shared fixtures for the socket-level tests: the greeter message types
//! and helpers that stand a server up on an ephemeral port.

use std::net::SocketAddr;

use cadenza::codec::ProstCodec;
use cadenza::{Channel, Server, Service};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub mod pb {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct HelloRequest {
        #[prost(string, tag = "1")]
        pub name: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct HelloReply {
        #[prost(string, tag = "1")]
        pub message: String,
    }
}

pub const GREETER: &str = "greeter.Greeter";

/// The codec a client uses for greeter methods.
pub fn client_codec() -> ProstCodec<pb::HelloRequest, pb::HelloReply> {
    ProstCodec::default()
}

/// The codec the greeter service registers with.
pub fn server_codec() -> ProstCodec<pb::HelloReply, pb::HelloRequest> {
    ProstCodec::default()
}

pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<(), cadenza::Error>>,
}

impl TestServer {
    /// Trigger graceful shutdown and wait for the server task to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.handle.await.expect("server task panicked").unwrap();
    }
}

/// Serve one service on `127.0.0.1:0`.
pub async fn start_server(service: Service) -> TestServer {
    start_configured(Server::new(0).add_service(service)).await
}

/// Serve a fully configured server on `127.0.0.1:0`. The configured port is
/// ignored in favor of an ephemeral one.
pub async fn start_configured(server: Server) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    let handle = tokio::spawn(async move {
        server
            .serve_with_listener_shutdown(listener, async {
                let _ = rx.await;
            })
            .await
    });

    TestServer {
        addr,
        shutdown: Some(tx),
        handle,
    }
}

/// Connect a channel to a test server.
pub async fn connect(addr: SocketAddr) -> Channel {
    let mut channel = Channel::new("127.0.0.1", addr.port());
    channel.connect().await.expect("failed to connect");
    channel
}
