//! Happy-path scenarios over real sockets.

use std::time::Duration;

use cadenza::{BoxError, CallOptions, Grpc, Service, Streaming};
use integration_tests::pb::{HelloReply, HelloRequest};
use integration_tests::{client_codec, connect, server_codec, start_server, GREETER};

fn greeter() -> Service {
    Service::new(GREETER)
        .unary("SayHello", server_codec(), |request: HelloRequest| async move {
            Ok::<_, BoxError>(HelloReply {
                message: format!("Hello, {}", request.name),
            })
        })
        .unary("Echo", server_codec(), |request: HelloRequest| async move {
            Ok::<_, BoxError>(HelloReply {
                message: request.name,
            })
        })
        .streaming(
            "SayHelloToMany",
            server_codec(),
            |mut requests: Streaming<HelloRequest>| {
                async_stream::stream! {
                    let mut idx = 1u32;
                    loop {
                        match requests.message().await {
                            Ok(Some(_)) => {
                                yield Ok::<_, BoxError>(HelloReply { message: idx.to_string() });
                                idx += 1;
                            }
                            Ok(None) => break,
                            Err(err) => {
                                yield Err(Box::new(err) as BoxError);
                                break;
                            }
                        }
                    }
                }
            },
        )
        .server_streaming("CountTo", server_codec(), |request: HelloRequest| {
            async_stream::stream! {
                let n: u32 = request.name.parse().unwrap_or(0);
                for i in 1..=n {
                    yield Ok::<_, BoxError>(HelloReply { message: i.to_string() });
                }
            }
        })
        .client_streaming(
            "JoinNames",
            server_codec(),
            |mut requests: Streaming<HelloRequest>| async move {
                let mut names = Vec::new();
                while let Some(request) = requests.message().await? {
                    names.push(request.name);
                }
                Ok::<_, BoxError>(HelloReply {
                    message: names.join(", "),
                })
            },
        )
}

#[tokio::test]
async fn unary_happy_path() {
    let server = start_server(greeter()).await;
    let mut client = Grpc::new(connect(server.addr).await);

    let reply = client
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
        .unwrap();

    assert_eq!(reply.message, "Hello, World");
}

#[tokio::test]
async fn unary_with_metadata_and_message_type() {
    let server = start_server(greeter()).await;
    let mut client = Grpc::new(connect(server.addr).await);

    let mut options = CallOptions {
        message_type: Some("greeter.HelloRequest".into()),
        ..Default::default()
    };
    options.metadata.insert("x-request-id", "abc-123").unwrap();
    options
        .metadata
        .insert("x-trace-bin", bytes::Bytes::from_static(&[1, 2, 3]))
        .unwrap();

    let reply = client
        .unary(
            client_codec(),
            GREETER,
            "SayHello",
            HelloRequest {
                name: "metadata".into(),
            },
            options,
        )
        .await
        .unwrap();

    assert_eq!(reply.message, "Hello, metadata");
}

#[tokio::test]
async fn bidi_streaming_yields_ten_replies() {
    let server = start_server(greeter()).await;
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

    let mut got = Vec::new();
    while let Some(reply) = replies.message().await.unwrap() {
        got.push(reply.message);
    }

    let want: Vec<String> = (1..=10).map(|i| i.to_string()).collect();
    assert_eq!(got, want);
}

#[tokio::test]
async fn server_streaming_counts() {
    let server = start_server(greeter()).await;
    let mut client = Grpc::new(connect(server.addr).await);

    let mut replies = client
        .server_streaming(
            client_codec(),
            GREETER,
            "CountTo",
            HelloRequest { name: "5".into() },
            CallOptions::default(),
        )
        .await
        .unwrap();

    let mut got = Vec::new();
    while let Some(reply) = replies.message().await.unwrap() {
        got.push(reply.message);
    }
    assert_eq!(got, vec!["1", "2", "3", "4", "5"]);
}

#[tokio::test]
async fn client_streaming_joins() {
    let server = start_server(greeter()).await;
    let mut client = Grpc::new(connect(server.addr).await);

    let requests = tokio_stream::iter(
        ["a", "b", "c"]
            .into_iter()
            .map(|name| HelloRequest { name: name.into() }),
    );
    let reply = client
        .client_streaming(
            client_codec(),
            GREETER,
            "JoinNames",
            requests,
            CallOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(reply.message, "a, b, c");
}

#[tokio::test]
async fn large_message_round_trip() {
    let server = start_server(greeter()).await;
    let mut client = Grpc::new(connect(server.addr).await);

    // Spans many HTTP/2 DATA frames and exercises the deframer's partial
    // buffering on the way back.
    let name = "x".repeat(1024 * 1024);
    let reply = client
        .unary(
            client_codec(),
            GREETER,
            "Echo",
            HelloRequest { name: name.clone() },
            CallOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(reply.message, name);
}

#[tokio::test]
async fn streaming_larger_than_connection_window() {
    let server = start_server(greeter()).await;
    let mut client = Grpc::new(connect(server.addr).await);

    // 100 x 8 KiB is far past the default 64 KiB connection window, so this
    // only completes if flow-control capacity is released as messages are
    // consumed.
    let count = 100usize;
    let requests = tokio_stream::iter(
        std::iter::repeat(HelloRequest {
            name: "y".repeat(8 * 1024),
        })
        .take(count),
    );
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

    let drain = async {
        let mut seen = 0usize;
        while let Some(_reply) = replies.message().await.unwrap() {
            seen += 1;
        }
        seen
    };
    let seen = tokio::time::timeout(Duration::from_secs(30), drain)
        .await
        .expect("streaming stalled");
    assert_eq!(seen, count);
}

#[tokio::test]
async fn concurrent_unary_calls_multiplex() {
    let server = start_server(greeter()).await;
    let client = Grpc::new(connect(server.addr).await);

    let mut tasks = Vec::new();
    for i in 0..20 {
        let mut client = client.clone();
        tasks.push(tokio::spawn(async move {
            client
                .unary(
                    client_codec(),
                    GREETER,
                    "SayHello",
                    HelloRequest {
                        name: i.to_string(),
                    },
                    CallOptions::default(),
                )
                .await
        }));
    }

    for (i, task) in tasks.into_iter().enumerate() {
        let reply = task.await.unwrap().unwrap();
        assert_eq!(reply.message, format!("Hello, {}", i));
    }
}
