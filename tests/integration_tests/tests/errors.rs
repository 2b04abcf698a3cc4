//! Error propagation: handler failures, registry misses, protocol
//! violations and message-size enforcement.

use bytes::Bytes;
use cadenza::{BoxError, CallOptions, Code, Error, Grpc, Server, Service, Status, Streaming};
use integration_tests::pb::{HelloReply, HelloRequest};
use integration_tests::{client_codec, connect, server_codec, start_configured, start_server, GREETER};

fn failing_greeter() -> Service {
    Service::new(GREETER)
        .unary("SayHello", server_codec(), |_request: HelloRequest| async move {
            Err::<HelloReply, BoxError>("oops my bad".into())
        })
        .streaming(
            "SayHelloToMany",
            server_codec(),
            |mut requests: Streaming<HelloRequest>| {
                async_stream::stream! {
                    let mut idx = 1u32;
                    while let Ok(Some(_)) = requests.message().await {
                        yield Ok::<_, BoxError>(HelloReply { message: idx.to_string() });
                        if idx == 7 {
                            yield Err::<HelloReply, BoxError>("Lucky 7".into());
                            return;
                        }
                        idx += 1;
                    }
                }
            },
        )
        .unary("Precise", server_codec(), |_request: HelloRequest| async move {
            let mut status = Status::new(Code::InvalidArgument, "name must not be empty");
            status
                .metadata_mut()
                .insert("x-detail-bin", Bytes::from_static(&[1, 2]))
                .unwrap();
            Err::<HelloReply, BoxError>(Box::new(status))
        })
        .unary("Echo", server_codec(), |request: HelloRequest| async move {
            Ok::<_, BoxError>(HelloReply {
                message: request.name,
            })
        })
}

fn expect_rpc(err: Error) -> Status {
    match err {
        Error::Rpc(status) => status,
        other => panic!("expected Error::Rpc, got {:?}", other),
    }
}

#[tokio::test]
async fn unary_handler_error_surfaces_as_unknown() {
    let server = start_server(failing_greeter()).await;
    let mut client = Grpc::new(connect(server.addr).await);

    let err = client
        .unary(
            client_codec(),
            GREETER,
            "SayHello",
            HelloRequest {
                name: "World".into(),
            },
            CallOptions::default(),
        )
        .await
        .unwrap_err();

    let status = expect_rpc(err);
    assert_eq!(status.code(), Code::Unknown);
    assert!(status.message().contains("oops my bad"));
}

#[tokio::test]
async fn stream_fails_after_seven_replies() {
    let server = start_server(failing_greeter()).await;
    let mut client = Grpc::new(connect(server.addr).await);

    let requests = tokio_stream::iter((0..10).map(|_| HelloRequest::default()));
    let mut replies = client
        .streaming(
            client_codec(),
            GREETER,
            "SayHelloToMany",
            requests,
            CallOptions::default(),
        )
        .await
        .unwrap();

    for i in 1..=7 {
        let reply = replies.message().await.unwrap().unwrap();
        assert_eq!(reply.message, i.to_string());
    }

    let status = expect_rpc(replies.message().await.unwrap_err());
    assert_eq!(status.code(), Code::Unknown);
    assert!(status.message().contains("Lucky 7"));

    // The terminal event is surfaced exactly once.
    assert!(matches!(replies.message().await, Ok(None)));
}

#[tokio::test]
async fn status_metadata_round_trips() {
    let server = start_server(failing_greeter()).await;
    let mut client = Grpc::new(connect(server.addr).await);

    let err = client
        .unary(
            client_codec(),
            GREETER,
            "Precise",
            HelloRequest::default(),
            CallOptions::default(),
        )
        .await
        .unwrap_err();

    let status = expect_rpc(err);
    assert_eq!(status.code(), Code::InvalidArgument);
    assert_eq!(status.message(), "name must not be empty");
    assert_eq!(
        status.metadata().get("x-detail-bin").unwrap().as_bytes(),
        &[1, 2]
    );
}

#[tokio::test]
async fn unknown_method_is_unimplemented() {
    let server = start_server(failing_greeter()).await;
    let mut client = Grpc::new(connect(server.addr).await);

    let err = client
        .unary(
            client_codec(),
            GREETER,
            "NoSuchMethod",
            HelloRequest::default(),
            CallOptions::default(),
        )
        .await
        .unwrap_err();

    assert_eq!(expect_rpc(err).code(), Code::Unimplemented);
}

#[tokio::test]
async fn unknown_service_is_unimplemented() {
    let server = start_server(failing_greeter()).await;
    let mut client = Grpc::new(connect(server.addr).await);

    let err = client
        .unary(
            client_codec(),
            "greeter.Nothing",
            "SayHello",
            HelloRequest::default(),
            CallOptions::default(),
        )
        .await
        .unwrap_err();

    assert_eq!(expect_rpc(err).code(), Code::Unimplemented);
}

// A path with a single segment violates `/<service>/<method>`; the server
// must answer grpc-status 13 without tearing the connection down.
#[tokio::test]
async fn missing_method_segment_closes_with_internal() {
    let server = start_server(failing_greeter()).await;

    let tcp = tokio::net::TcpStream::connect(server.addr).await.unwrap();
    let (send_request, connection) = h2::client::handshake(tcp).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let request = http::Request::builder()
        .method("POST")
        .uri(format!("http://{}/{}", server.addr, GREETER))
        .header("te", "trailers")
        .header("content-type", "application/grpc")
        .body(())
        .unwrap();

    let mut send_request = send_request.ready().await.unwrap();
    let (response, _body) = send_request.send_request(request, true).unwrap();
    let response = response.await.unwrap();

    assert_eq!(response.status(), http::StatusCode::OK);
    assert_eq!(response.headers().get("grpc-status").unwrap(), "13");

    // The connection survives: a well-formed call on the same connection
    // still works.
    let request = http::Request::builder()
        .method("POST")
        .uri(format!("http://{}/{}/Echo", server.addr, GREETER))
        .header("te", "trailers")
        .header("content-type", "application/grpc")
        .body(())
        .unwrap();
    let mut send_request = send_request.ready().await.unwrap();
    let (response, mut body) = send_request.send_request(request, false).unwrap();

    // A zero-length protobuf message framed by hand.
    body.send_data(Bytes::from_static(&[0, 0, 0, 0, 0]), true)
        .unwrap();

    let response = response.await.unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);
    assert!(response.headers().get("grpc-status").is_none());
}

#[tokio::test]
async fn oversized_inbound_message_is_resource_exhausted() {
    let server = start_configured(
        Server::new(0)
            .max_message_size(1024)
            .add_service(failing_greeter()),
    )
    .await;
    let mut client = Grpc::new(connect(server.addr).await);

    let err = client
        .unary(
            client_codec(),
            GREETER,
            "Echo",
            HelloRequest {
                name: "z".repeat(8 * 1024),
            },
            CallOptions::default(),
        )
        .await
        .unwrap_err();

    assert_eq!(expect_rpc(err).code(), Code::ResourceExhausted);
}

#[tokio::test]
async fn oversized_outbound_message_fails_locally() {
    let server = start_server(failing_greeter()).await;

    let mut channel = cadenza::Channel::new("127.0.0.1", server.addr.port()).max_message_size(64);
    channel.connect().await.unwrap();
    let mut client = Grpc::new(channel);

    let err = client
        .unary(
            client_codec(),
            GREETER,
            "Echo",
            HelloRequest {
                name: "z".repeat(1024),
            },
            CallOptions::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::MessageTooLarge { .. }));
}
