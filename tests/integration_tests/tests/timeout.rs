//! Deadline handling: `grpc-timeout` headers and server defaults.

use std::time::{Duration, Instant};

use cadenza::{BoxError, CallOptions, Code, Error, Grpc, Server, Service};
use integration_tests::pb::{HelloReply, HelloRequest};
use integration_tests::{client_codec, connect, server_codec, start_configured, start_server, GREETER};

fn sleepy_greeter() -> Service {
    Service::new(GREETER).unary("SayHello", server_codec(), |_request: HelloRequest| async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok::<_, BoxError>(HelloReply {
            message: "too late".into(),
        })
    })
}

#[tokio::test]
async fn client_timeout_expires_with_deadline_exceeded() {
    let server = start_server(sleepy_greeter()).await;
    let mut client = Grpc::new(connect(server.addr).await);

    let options = CallOptions {
        timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    };

    let start = Instant::now();
    let err = client
        .unary(
            client_codec(),
            GREETER,
            "SayHello",
            HelloRequest::default(),
            options,
        )
        .await
        .unwrap_err();

    match err {
        Error::Rpc(status) => assert_eq!(status.code(), Code::DeadlineExceeded),
        other => panic!("expected Error::Rpc, got {:?}", other),
    }
    // Expired at the deadline, not at the handler's pace.
    assert!(start.elapsed() < Duration::from_millis(900));
}

#[tokio::test]
async fn server_default_timeout_applies_without_header() {
    let server = start_configured(
        Server::new(0)
            .default_timeout(Duration::from_millis(100))
            .add_service(sleepy_greeter()),
    )
    .await;
    let mut client = Grpc::new(connect(server.addr).await);

    let err = client
        .unary(
            client_codec(),
            GREETER,
            "SayHello",
            HelloRequest::default(),
            CallOptions::default(),
        )
        .await
        .unwrap_err();

    match err {
        Error::Rpc(status) => assert_eq!(status.code(), Code::DeadlineExceeded),
        other => panic!("expected Error::Rpc, got {:?}", other),
    }
}

#[tokio::test]
async fn fast_handler_beats_the_deadline() {
    let service = Service::new(GREETER).unary(
        "SayHello",
        server_codec(),
        |request: HelloRequest| async move {
            Ok::<_, BoxError>(HelloReply {
                message: format!("Hello, {}", request.name),
            })
        },
    );
    let server = start_server(service).await;
    let mut client = Grpc::new(connect(server.addr).await);

    let options = CallOptions {
        timeout: Some(Duration::from_secs(5)),
        ..Default::default()
    };
    let reply = client
        .unary(
            client_codec(),
            GREETER,
            "SayHello",
            HelloRequest {
                name: "deadline".into(),
            },
            options,
        )
        .await
        .unwrap();

    assert_eq!(reply.message, "Hello, deadline");
}
