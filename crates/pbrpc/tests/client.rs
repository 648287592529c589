mod common;

use {
    bytes::Bytes,
    common::*,
    futures::future::join_all,
    pbrpc::{
        Auth, Client, ClientOptions, ClientStats, ErrorType, Frame, PosixErrno, ResponseFuture,
        SslOptions, UserCredentials, testsrv::DROP_NEW_CONNECTION,
    },
    std::{
        collections::HashSet,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::{Duration, Instant},
    },
    tokio::net::TcpListener,
};

fn options(request_timeout: Duration, linger_timeout: Duration) -> ClientOptions {
    ClientOptions {
        connect_timeout: Duration::from_secs(5),
        request_timeout,
        linger_timeout,
        ..Default::default()
    }
}

fn call(
    client: &Client,
    address: &str,
    proc_id: u32,
    request: &EchoRequest,
) -> ResponseFuture<EchoResponse> {
    call_with_data(client, address, proc_id, request, Bytes::new())
}

fn call_with_data(
    client: &Client,
    address: &str,
    proc_id: u32,
    request: &EchoRequest,
    data: Bytes,
) -> ResponseFuture<EchoResponse> {
    client.send_request(
        address,
        INTERFACE_ID,
        proc_id,
        &UserCredentials::new("test", vec!["test".to_owned()]),
        &Auth::none(),
        request,
        data,
    )
}

#[tokio::test]
async fn echo_with_data() {
    init_logging();
    let server = start_server().await;
    let client = Client::start(ClientOptions::default()).unwrap();

    let response = call_with_data(
        &client,
        &server.address(),
        PROC_ECHO,
        &echo("hello"),
        Bytes::from_static(b"payload"),
    )
    .await
    .unwrap();
    assert_eq!(response.message.text, "hello");
    assert_eq!(&response.data[..], b"payload");
    assert!(response.header.error_response.is_none());

    let received = server.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].call_id, response.header.call_id);
    assert_eq!(received[0].proc_id, PROC_ECHO);
    assert_eq!(received[0].data_len, 7);

    client.shutdown().await;
}

#[tokio::test]
async fn server_error_response() {
    init_logging();
    let server = start_server().await;
    let client = Client::start(ClientOptions::default()).unwrap();

    let err = call(&client, &server.address(), PROC_DENIED, &echo("x"))
        .await
        .unwrap_err();
    assert_eq!(err.error_type(), ErrorType::Errno);
    assert_eq!(err.posix_errno(), PosixErrno::PosixErrorEacces);
    assert!(err.to_string().contains("permission denied"), "{}", err);

    let err = call(&client, &server.address(), 99, &echo("x"))
        .await
        .unwrap_err();
    assert_eq!(err.error_type(), ErrorType::InvalidProcId);

    // Error responses leave the connection usable.
    let response = call(&client, &server.address(), PROC_ECHO, &echo("still there"))
        .await
        .unwrap();
    assert_eq!(response.message.text, "still there");
    assert_eq!(client.stats().await.unwrap().connections, 1);

    client.shutdown().await;
}

#[tokio::test]
async fn requests_are_sent_in_submission_order() {
    init_logging();
    let server = start_server().await;
    let client = Client::start(ClientOptions::default()).unwrap();
    let address = server.address();

    let futures: Vec<_> = (0..20)
        .map(|i| call(&client, &address, PROC_ECHO, &echo(&format!("request {}", i))))
        .collect();
    let responses = join_all(futures).await;
    for (i, response) in responses.into_iter().enumerate() {
        assert_eq!(response.unwrap().message.text, format!("request {}", i));
    }

    let call_ids: Vec<u32> = server.received().iter().map(|r| r.call_id).collect();
    assert_eq!(call_ids.len(), 20);
    assert!(call_ids.windows(2).all(|w| w[0] < w[1]), "{:?}", call_ids);
    assert_eq!(client.stats().await.unwrap().pending_requests, 0);

    client.shutdown().await;
}

#[tokio::test]
async fn dropped_request_times_out() {
    init_logging();
    let server = start_server().await;
    let client = Client::start(options(
        Duration::from_millis(300),
        Duration::from_secs(60),
    ))
    .unwrap();
    let address = server.address();

    call(&client, &address, PROC_ECHO, &echo("warm up"))
        .await
        .unwrap();

    server.drop_next_requests(1);
    let started = Instant::now();
    let err = call(&client, &address, PROC_ECHO, &echo("lost"))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();
    assert!(err.to_string().contains("Request timed out"), "{}", err);
    assert_eq!(err.error_type(), ErrorType::IoError);
    assert!(elapsed >= Duration::from_millis(300), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);

    // The connection survives a timeout.
    let response = call(&client, &address, PROC_ECHO, &echo("after"))
        .await
        .unwrap();
    assert_eq!(response.message.text, "after");
    assert!(server.received().iter().any(|r| r.dropped));

    client.shutdown().await;
}

#[tokio::test]
async fn dropped_request_is_retried_by_caller() {
    init_logging();
    let server = start_server().await;
    let client = Client::start(options(
        Duration::from_millis(300),
        Duration::from_secs(60),
    ))
    .unwrap();
    let address = server.address();

    call(&client, &address, PROC_DENIED, &echo("warm up"))
        .await
        .unwrap_err();
    server.drop_request_by_proc_id(PROC_ECHO);

    let mut attempts = 0;
    for text in ["first", "second"] {
        let response = loop {
            attempts += 1;
            match call(&client, &address, PROC_ECHO, &echo(text)).await {
                Ok(response) => break response,
                Err(e) if attempts < 5 => assert!(e.to_string().contains("Request timed out")),
                Err(e) => panic!("giving up: {}", e),
            }
        };
        assert_eq!(response.message.text, text);
    }
    assert_eq!(attempts, 3);

    let received: Vec<_> = server
        .received()
        .into_iter()
        .filter(|r| r.proc_id == PROC_ECHO)
        .collect();
    assert_eq!(received.len(), 3);
    assert!(received[0].dropped);
    assert!(!received[1].dropped && !received[2].dropped);
    assert!(received.windows(2).all(|w| w[0].call_id < w[1].call_id));

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_response_after_timeout_is_discarded() {
    init_logging();
    let server = start_server().await;
    let client = Client::start(options(
        Duration::from_millis(200),
        Duration::from_secs(60),
    ))
    .unwrap();
    let address = server.address();

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = tokio::sync::oneshot::channel();
    {
        let calls = calls.clone();
        client.send_request_with_callback::<_, EchoResponse, _>(
            &address,
            INTERFACE_ID,
            PROC_SLOW_ECHO,
            &UserCredentials::default(),
            &Auth::none(),
            &EchoRequest {
                text: "slow".to_owned(),
                delay_ms: 600,
            },
            Bytes::new(),
            move |result| {
                calls.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(result.map(|response| response.message.text));
            },
        );
    }

    let err = rx.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("Request timed out"), "{}", err);

    // Let the late response arrive and get discarded.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let response = call(&client, &address, PROC_ECHO, &echo("next"))
        .await
        .unwrap();
    assert_eq!(response.message.text, "next");

    client.shutdown().await;
}

#[tokio::test]
async fn reconnect_is_blocked_after_failure() {
    init_logging();
    let address = format!("127.0.0.1:{}", unused_port().await);
    let client = Client::start(ClientOptions::default()).unwrap();

    let err = call(&client, &address, PROC_ECHO, &echo("a"))
        .await
        .unwrap_err();
    assert_eq!(err.error_type(), ErrorType::IoError);
    assert!(err.to_string().contains("could not connect"), "{}", err);

    let err = call(&client, &address, PROC_ECHO, &echo("b"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("reconnect blocked locally"), "{}", err);
    assert_eq!(err.posix_errno(), PosixErrno::PosixErrorEio);

    client.shutdown().await;
}

#[tokio::test]
async fn reconnects_after_backoff() {
    init_logging();
    let server = start_server().await;
    let client = Client::start(ClientOptions::default()).unwrap();
    let address = server.address();

    server.drop_request_by_proc_id(DROP_NEW_CONNECTION);
    let err = call(&client, &address, PROC_ECHO, &echo("refused"))
        .await
        .unwrap_err();
    assert_eq!(err.error_type(), ErrorType::IoError);

    let err = call(&client, &address, PROC_ECHO, &echo("too early"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("reconnect blocked locally"), "{}", err);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let response = call(&client, &address, PROC_ECHO, &echo("again"))
        .await
        .unwrap();
    assert_eq!(response.message.text, "again");

    client.shutdown().await;
}

#[tokio::test]
async fn idle_connection_is_closed_after_linger() {
    init_logging();
    let server = start_server().await;
    let client = Client::start(options(
        Duration::from_secs(2),
        Duration::from_millis(200),
    ))
    .unwrap();
    let address = server.address();

    call(&client, &address, PROC_ECHO, &echo("a")).await.unwrap();
    assert_eq!(client.stats().await.unwrap().connections, 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(client.stats().await.unwrap().connections, 0);

    // A new request opens a new connection.
    call(&client, &address, PROC_ECHO, &echo("b")).await.unwrap();
    assert_eq!(client.stats().await.unwrap().connections, 1);

    client.shutdown().await;
}

#[tokio::test]
async fn server_going_away_fails_outstanding_requests() {
    init_logging();
    let mut server = start_server().await;
    let client = Client::start(ClientOptions::default()).unwrap();
    let address = server.address();

    call(&client, &address, PROC_ECHO, &echo("warm up"))
        .await
        .unwrap();

    server.drop_next_requests(1);
    let pending = call(&client, &address, PROC_ECHO, &echo("never answered"));
    while server.received().len() < 2 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    server.stop().await;

    let err = pending.await.unwrap_err();
    assert_eq!(err.error_type(), ErrorType::IoError);
    assert!(err.to_string().contains("could not read response"), "{}", err);

    client.shutdown().await;
}

#[tokio::test]
async fn garbage_header_fails_all_requests_of_connection() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let client = Client::start(ClientOptions::default()).unwrap();

    let first = call(&client, &address, PROC_ECHO, &echo("one"));
    let second = call(&client, &address, PROC_ECHO, &echo("two"));

    let mut peer = RawPeer::accept(&listener).await;
    peer.read_requests(2).await;
    peer.send(Frame::new(
        Bytes::from_static(&[0xff, 0xff, 0xff]),
        Bytes::new(),
        Bytes::new(),
    ))
    .await;

    for future in [first, second] {
        let err = future.await.unwrap_err();
        assert_eq!(err.error_type(), ErrorType::GarbageArgs);
        assert_eq!(err.posix_errno(), PosixErrno::PosixErrorEinval);
    }
    assert_eq!(client.stats().await.unwrap().pending_requests, 0);

    client.shutdown().await;
}

#[tokio::test]
async fn header_without_required_fields_fails_all_requests_of_connection() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let client = Client::start(options(
        Duration::from_secs(30),
        Duration::from_secs(60),
    ))
    .unwrap();

    let first = call(&client, &address, PROC_ECHO, &echo("one"));
    let second = call(&client, &address, PROC_ECHO, &echo("two"));

    let mut peer = RawPeer::accept(&listener).await;
    peer.read_requests(2).await;
    let started = Instant::now();
    peer.send(Frame::new(Bytes::new(), Bytes::new(), Bytes::new()))
        .await;

    for future in [first, second] {
        let err = future.await.unwrap_err();
        assert_eq!(err.error_type(), ErrorType::GarbageArgs);
        assert_eq!(err.posix_errno(), PosixErrno::PosixErrorEinval);
        assert!(err.to_string().contains("garbage header"), "{}", err);
    }
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(client.stats().await.unwrap().pending_requests, 0);

    client.shutdown().await;
}

#[tokio::test]
async fn response_for_unknown_call_id_is_ignored() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let client = Client::start(ClientOptions::default()).unwrap();

    let future = call(&client, &address, PROC_ECHO, &echo("hello"));
    let mut peer = RawPeer::accept(&listener).await;
    let requests = peer.read_requests(1).await;
    let call_id = requests[0].0.call_id;

    peer.send(response_frame(call_id.wrapping_add(1000), "bogus"))
        .await;
    peer.send(response_frame(call_id, "hello")).await;

    let response = future.await.unwrap();
    assert_eq!(response.header.call_id, call_id);
    assert_eq!(response.message.text, "hello");

    client.shutdown().await;
}

#[tokio::test]
async fn responses_in_reverse_order() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let client = Client::start(ClientOptions::default()).unwrap();

    let futures: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|text| call(&client, &address, PROC_ECHO, &echo(text)))
        .collect();

    let mut peer = RawPeer::accept(&listener).await;
    let requests = peer.read_requests(3).await;
    for (header, message) in requests.iter().rev() {
        peer.send(response_frame(header.call_id, &message.text))
            .await;
    }

    let texts: Vec<String> = join_all(futures)
        .await
        .into_iter()
        .map(|response| response.unwrap().message.text)
        .collect();
    assert_eq!(texts, vec!["a", "b", "c"]);

    client.shutdown().await;
}

#[tokio::test]
async fn shutdown_fails_outstanding_requests() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let client = Client::start(ClientOptions::default()).unwrap();

    let future = call(&client, &address, PROC_ECHO, &echo("pending"));
    let mut peer = RawPeer::accept(&listener).await;
    peer.read_requests(1).await;

    client.shutdown().await;
    let err = future.await.unwrap_err();
    assert!(err.to_string().contains("closed locally"), "{}", err);

    let err = call(&client, &address, PROC_ECHO, &echo("late"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("client is shut down"), "{}", err);
}

#[tokio::test]
async fn invalid_address_fails_immediately() {
    init_logging();
    let client = Client::start(ClientOptions::default()).unwrap();

    for address in ["localhost", "localhost:notaport", ":32636"] {
        let err = call(&client, address, PROC_ECHO, &echo("x"))
            .await
            .unwrap_err();
        assert_eq!(err.posix_errno(), PosixErrno::PosixErrorEinval);
        assert!(err.to_string().contains("invalid address"), "{}", err);
    }
    assert_eq!(client.stats().await.unwrap().connections, 0);

    client.shutdown().await;
}

/// A listener that completes the TCP handshake and then stays silent.
async fn silent_listener() -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let task = tokio::spawn(async move {
        let mut streams = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            streams.push(stream);
        }
    });
    (address, task)
}

#[tokio::test]
async fn tls_handshake_without_answer_times_out() {
    init_logging();
    let (address, listener) = silent_listener().await;
    let client = Client::start(ClientOptions {
        connect_timeout: Duration::from_millis(500),
        request_timeout: Duration::from_secs(30),
        linger_timeout: Duration::from_secs(60),
        ssl: Some(SslOptions::default()),
        ..Default::default()
    })
    .unwrap();

    let started = Instant::now();
    let err = call(&client, &address, PROC_ECHO, &echo("hello"))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();
    assert_eq!(err.error_type(), ErrorType::IoError);
    assert!(
        err.to_string()
            .contains(&format!("connection to '{}' timed out", address)),
        "{}",
        err
    );
    assert!(elapsed >= Duration::from_millis(500), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "{:?}", elapsed);

    client.shutdown().await;
    listener.abort();
}

#[tokio::test]
async fn linger_eviction_during_connect_ignores_late_timeout() {
    init_logging();
    let (address, listener) = silent_listener().await;
    let client = Client::start(ClientOptions {
        connect_timeout: Duration::from_millis(800),
        request_timeout: Duration::from_secs(30),
        linger_timeout: Duration::from_millis(200),
        ssl: Some(SslOptions::default()),
        ..Default::default()
    })
    .unwrap();

    let err = call(&client, &address, PROC_ECHO, &echo("hello"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("closed locally"), "{}", err);
    assert_eq!(client.stats().await.unwrap(), ClientStats::default());

    // Past the connect timeout of the evicted connection.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(client.stats().await.unwrap(), ClientStats::default());

    client.shutdown().await;
    listener.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn call_ids_are_unique_across_submitting_threads() {
    init_logging();
    let server = start_server().await;
    let client = Arc::new(Client::start(ClientOptions::default()).unwrap());
    let address = server.address();

    let threads: Vec<_> = (0..4)
        .map(|thread| {
            let client = Arc::clone(&client);
            let address = address.clone();
            std::thread::spawn(move || {
                (0..25)
                    .map(|i| {
                        let text = format!("{}-{}", thread, i);
                        call(&client, &address, PROC_ECHO, &echo(&text))
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let futures: Vec<_> = threads
        .into_iter()
        .flat_map(|thread| thread.join().unwrap())
        .collect();

    let responses = join_all(futures).await;
    let mut response_ids = HashSet::new();
    for response in responses {
        assert!(response_ids.insert(response.unwrap().header.call_id));
    }

    let received = server.received();
    assert_eq!(received.len(), 100);
    let call_ids: HashSet<u32> = received.iter().map(|r| r.call_id).collect();
    assert_eq!(call_ids.len(), 100);
    assert_eq!(call_ids, response_ids);

    client.shutdown().await;
}
