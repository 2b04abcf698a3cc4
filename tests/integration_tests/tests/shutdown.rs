//! Graceful shutdown: in-flight RPCs finish, new ones are refused.

use std::time::Duration;

use cadenza::{BoxError, CallOptions, Grpc, Service};
use integration_tests::pb::{HelloReply, HelloRequest};
use integration_tests::{client_codec, connect, server_codec, start_server, GREETER};

fn slow_greeter() -> Service {
    Service::new(GREETER).unary("SayHello", server_codec(), |request: HelloRequest| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok::<_, BoxError>(HelloReply {
            message: format!("Hello, {}", request.name),
        })
    })
}

#[tokio::test]
async fn inflight_rpc_completes_during_drain() {
    let server = start_server(slow_greeter()).await;
    let mut client = Grpc::new(connect(server.addr).await);

    let call = tokio::spawn(async move {
        client
            .unary(
                client_codec(),
                GREETER,
                "SayHello",
                HelloRequest {
                    name: "drain".into(),
                },
                CallOptions::default(),
            )
            .await
    });

    // Let the request reach the handler, then begin the drain.
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.shutdown().await;

    let reply = call.await.unwrap().unwrap();
    assert_eq!(reply.message, "Hello, drain");
}

#[tokio::test]
async fn calls_fail_after_shutdown() {
    let server = start_server(slow_greeter()).await;
    let channel = connect(server.addr).await;
    let mut client = Grpc::new(channel);

    let reply = client
        .unary(
            client_codec(),
            GREETER,
            "SayHello",
            HelloRequest {
                name: "first".into(),
            },
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(reply.message, "Hello, first");

    server.shutdown().await;

    let result = client
        .unary(
            client_codec(),
            GREETER,
            "SayHello",
            HelloRequest {
                name: "second".into(),
            },
            CallOptions::default(),
        )
        .await;
    assert!(result.is_err());
}
