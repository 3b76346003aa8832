mod common;
use common::{init_tracing, recv_within, start, test_server};

use bytes::Bytes;
use murmur::{
    wire::ErrorCode, AsyncRpcClient, Error, HandlerError, Message, RpcClient, Server,
};
use std::{
    sync::{mpsc, Arc},
    time::{Duration, Instant},
};

fn sync_client(addr: std::net::SocketAddr) -> RpcClient {
    let client = RpcClient::new().connect(addr);
    client.codecs().register_json("person_info_req");
    client.codecs().register_json("person_info_rsp");
    client
}

#[test]
fn raw_echo_round_trip() {
    init_tracing();
    let (_server, addr) = start(test_server());

    let client = sync_client(addr);
    let reply = client.call_raw("echo", &b"hello"[..]).unwrap();
    assert_eq!(&reply[..], b"hello");
}

#[test]
fn structured_call_over_async_client() {
    init_tracing();
    let (_server, addr) = start(test_server());

    let mut client = AsyncRpcClient::new().connect(addr);
    client.codecs().register_json("person_info_req");
    client.codecs().register_json("person_info_rsp");
    client.run().unwrap();

    let (tx, rx) = mpsc::channel();
    let request = Message::new("person_info_req", serde_json::json!({"name": "Jack", "age": 20}));
    client
        .async_call("request_person_info", request)
        .result(move |reply| {
            tx.send(reply).unwrap();
        })
        .unwrap();

    let reply = recv_within(&rx, Duration::from_secs(5), "async completion").unwrap();
    assert_eq!(reply.name, "person_info_rsp");
    assert_eq!(reply.value, serde_json::json!({"name": "Tom", "age": 21}));
    client.stop();
}

#[test]
fn unknown_protocol_fails_the_call() {
    init_tracing();
    let (_server, addr) = start(test_server());

    // Sync caller sees the failure as an error return.
    let client = sync_client(addr);
    let err = client.call_raw("does_not_exist", &b""[..]).unwrap_err();
    assert!(matches!(err, Error::Rpc(ErrorCode::RouteFailed)));

    // Async caller sees it in the completion's error slot.
    let mut client = AsyncRpcClient::new().connect(addr);
    client.run().unwrap();
    let (tx, rx) = mpsc::channel();
    client
        .async_call_raw("does_not_exist", &b""[..])
        .result(move |reply| {
            tx.send(reply).unwrap();
        })
        .unwrap();
    let reply = recv_within(&rx, Duration::from_secs(5), "async completion");
    assert!(matches!(reply, Err(Error::Rpc(ErrorCode::RouteFailed))));
    client.stop();
}

#[test]
fn sync_timeout_disconnects_and_the_next_call_recovers() {
    init_tracing();
    let (_server, addr) = start(test_server());

    let client = RpcClient::new().connect(addr).timeout(100);

    let started = Instant::now();
    let err = client.call_raw("slow", &b"x"[..]).unwrap_err();
    assert!(matches!(err, Error::Timeout));
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(90) && elapsed < Duration::from_millis(400),
        "timeout fired at {elapsed:?}"
    );

    // The connection was dropped; this call transparently reconnects.
    let reply = client.call_raw("echo", &b"again"[..]).unwrap();
    assert_eq!(&reply[..], b"again");
}

#[test]
fn sync_calls_from_two_threads_alternate() {
    init_tracing();
    let (_server, addr) = start(test_server());

    let client = Arc::new(RpcClient::new().connect(addr));
    let threads: Vec<_> = (0..2)
        .map(|t| {
            let client = client.clone();
            std::thread::spawn(move || {
                for i in 0..10 {
                    let body = format!("{t}-{i}");
                    let reply = client.call_raw("echo", body.clone().into_bytes()).unwrap();
                    assert_eq!(reply, body.as_bytes());
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().unwrap();
    }
}

#[test]
fn async_completions_correlate_by_call_id() {
    init_tracing();
    let (_server, addr) = start(test_server());

    let mut client = AsyncRpcClient::new().connect(addr);
    client.run().unwrap();

    const CALLS: usize = 32;
    let (tx, rx) = mpsc::channel();
    for i in 0..CALLS {
        let tx = tx.clone();
        let body = format!("payload-{i}");
        let expected = body.clone();
        client
            .async_call_raw("echo", body.into_bytes())
            .result(move |reply| {
                let reply = reply.unwrap();
                tx.send((expected, reply)).unwrap();
            })
            .unwrap();
    }
    drop(tx);

    let mut seen = 0;
    while let Ok((expected, reply)) = rx.recv_timeout(Duration::from_secs(5)) {
        assert_eq!(reply, expected.as_bytes(), "completion got the wrong body");
        seen += 1;
    }
    assert_eq!(seen, CALLS, "every completion fires exactly once");
    client.stop();
}

#[test]
fn structured_and_raw_bindings_coexist() {
    init_tracing();
    let server = Server::new()
        .bind("probe", |_req: Message, _session: &str| {
            Ok::<_, HandlerError>(Message::new("probe_rsp", serde_json::json!("structured")))
        })
        .bind_raw("probe", |_body: Bytes, _session: &str| {
            Ok::<_, HandlerError>(bytes::Bytes::from_static(b"raw"))
        })
        .listen([common::ephemeral_addr()]);
    server.codecs().register_json("probe_req");
    server.codecs().register_json("probe_rsp");
    let (_server, addr) = start(server);

    let client = RpcClient::new().connect(addr);
    client.codecs().register_json("probe_req");
    client.codecs().register_json("probe_rsp");

    let structured = client
        .call("probe", Message::new("probe_req", serde_json::json!({})))
        .unwrap();
    assert_eq!(structured.value, serde_json::json!("structured"));

    let raw = client.call_raw("probe", &b""[..]).unwrap();
    assert_eq!(&raw[..], b"raw");
}

#[test]
fn one_way_raw_call_reaches_the_handler_without_a_reply() {
    init_tracing();
    let (tx, rx) = mpsc::channel();
    let server = Server::new()
        .bind_raw("notify", move |body: bytes::Bytes, _session: &str| {
            tx.send(body).unwrap();
            Ok::<_, HandlerError>(())
        })
        .listen([common::ephemeral_addr()]);
    let (_server, addr) = start(server);

    let client = RpcClient::new().connect(addr);
    client.call_one_way_raw("notify", &b"ping"[..]).unwrap();

    let seen = recv_within(&rx, Duration::from_secs(5), "one-way delivery");
    assert_eq!(&seen[..], b"ping");
}

#[test]
fn handler_errors_surface_with_the_handler_failed_code() {
    init_tracing();
    let server = Server::new()
        .bind_raw("fail", |_body: Bytes, _session: &str| {
            Err::<bytes::Bytes, _>(HandlerError::new("nope"))
        })
        .listen([common::ephemeral_addr()]);
    let (_server, addr) = start(server);

    let client = RpcClient::new().connect(addr);
    let err = client.call_raw("fail", &b""[..]).unwrap_err();
    assert!(matches!(err, Error::Rpc(ErrorCode::HandlerFailed)));
}

#[test]
fn disconnect_notify_fires_after_close() {
    init_tracing();
    let (connect_tx, connect_rx) = mpsc::channel::<String>();
    let (disconnect_tx, disconnect_rx) = mpsc::channel::<String>();

    let server = Server::new()
        .bind_raw("echo", |body: Bytes, _session: &str| Ok::<_, HandlerError>(body))
        .set_client_connect_notify(move |session| {
            connect_tx.send(session.to_owned()).unwrap();
        })
        .set_client_disconnect_notify(move |session| {
            disconnect_tx.send(session.to_owned()).unwrap();
        })
        .listen([common::ephemeral_addr()]);
    let (_server, addr) = start(server);

    let mut client = RpcClient::new().connect(addr);
    client.call_raw("echo", &b"hi"[..]).unwrap();

    let connected = recv_within(&connect_rx, Duration::from_secs(5), "connect notify");
    client.stop();
    let disconnected = recv_within(&disconnect_rx, Duration::from_secs(5), "disconnect notify");
    assert_eq!(connected, disconnected, "one session, both notifications");
}
