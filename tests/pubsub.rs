mod common;
use common::{ephemeral_addr, init_tracing, recv_within, start};

use bytes::Bytes;
use murmur::{
    wire::{ClientRole, RequestFrame, HEARTBEAT_FLAG, SUBSCRIBE_FLAG},
    HandlerError, PubClient, Server, SubClient,
};
use std::{
    net::SocketAddr,
    sync::mpsc,
    time::{Duration, Instant},
};

// The default single worker thread is what serialises broker fan-out, so
// per-subscriber FIFO holds; these tests depend on it.
fn pubsub_server() -> Server {
    Server::new()
        .bind_raw("echo", |body: Bytes, _session: &str| Ok::<_, HandlerError>(body))
        .listen([ephemeral_addr()])
}

/// Give the broker a moment to process control frames already enqueued.
fn settle() {
    std::thread::sleep(Duration::from_millis(300));
}

#[test]
fn fan_out_preserves_order_and_survives_a_dropped_subscriber() {
    init_tracing();
    let (_server, addr) = start(pubsub_server());

    const MESSAGES: usize = 1000;

    let (tx1, rx1) = mpsc::channel::<Vec<u8>>();
    let mut sub1 = SubClient::new().connect(addr);
    sub1.run().unwrap();
    sub1.subscribe_raw("prices", move |body| {
        tx1.send(body.to_vec()).unwrap();
    })
    .unwrap();

    let (tx2, rx2) = mpsc::channel::<Vec<u8>>();
    let mut sub2 = SubClient::new().connect(addr);
    sub2.run().unwrap();
    sub2.subscribe_raw("prices", move |body| {
        tx2.send(body.to_vec()).unwrap();
    })
    .unwrap();

    settle();

    let mut publisher = PubClient::new().connect(addr);
    publisher.run().unwrap();
    let publish_thread = std::thread::spawn(move || {
        for i in 0..MESSAGES {
            publisher
                .publish_raw("prices", format!("m{i}").into_bytes())
                .unwrap();
        }
        publisher
    });

    // Drop the second subscriber mid-stream.
    let _ = recv_within(&rx2, Duration::from_secs(5), "first message on sub2");
    sub2.stop();

    let mut publisher = publish_thread.join().unwrap();

    // The surviving subscriber sees the whole stream, in publish order.
    for i in 0..MESSAGES {
        let body = recv_within(&rx1, Duration::from_secs(10), "ordered message");
        assert_eq!(body, format!("m{i}").into_bytes(), "message {i} out of order");
    }

    publisher.stop();
    sub1.stop();
}

#[test]
fn reconnect_replays_subscriptions_without_user_involvement() {
    init_tracing();
    let (mut server, addr) = start(pubsub_server());

    let (tx_a, rx_a) = mpsc::channel::<Vec<u8>>();
    let (tx_b, rx_b) = mpsc::channel::<Vec<u8>>();
    let mut sub = SubClient::new().connect(addr);
    sub.run().unwrap();
    sub.subscribe_raw("topic_a", move |body| {
        let _ = tx_a.send(body.to_vec());
    })
    .unwrap();
    sub.subscribe_raw("topic_b", move |body| {
        let _ = tx_b.send(body.to_vec());
    })
    .unwrap();
    settle();

    // Restart the server on the same endpoint. The subscriber's heartbeat
    // notices the dead connection and replays both subscriptions; the test
    // never calls subscribe again.
    server.stop();
    let (mut server, _) = start(pubsub_server().listen([addr]));

    let mut publisher = PubClient::new().connect(addr);
    publisher.run().unwrap();

    // Publish to A until the replayed subscription answers. Replay covers
    // both topics at once, so B is checked with a single publish after.
    let deadline = Instant::now() + Duration::from_secs(15);
    let mut delivered_a = false;
    while Instant::now() < deadline {
        publisher.publish_raw("topic_a", &b"after-restart"[..]).unwrap();
        if rx_a.recv_timeout(Duration::from_millis(250)).is_ok() {
            delivered_a = true;
            break;
        }
    }
    assert!(delivered_a, "subscription to topic_a was not replayed");

    publisher.publish_raw("topic_b", &b"after-restart"[..]).unwrap();
    recv_within(&rx_b, Duration::from_secs(5), "replayed topic_b delivery");

    publisher.stop();
    sub.stop();
    server.stop();
}

#[test]
fn cancelled_subscription_stops_delivery() {
    init_tracing();
    let (_server, addr) = start(pubsub_server());

    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let mut sub = SubClient::new().connect(addr);
    sub.run().unwrap();
    sub.subscribe_raw("ticks", move |body| {
        let _ = tx.send(body.to_vec());
    })
    .unwrap();
    assert!(sub.is_subscribed_raw("ticks"));
    settle();

    let mut publisher = PubClient::new().connect(addr);
    publisher.run().unwrap();
    publisher.publish_raw("ticks", &b"one"[..]).unwrap();
    recv_within(&rx, Duration::from_secs(5), "delivery before cancel");

    sub.cancel_subscribe_raw("ticks").unwrap();
    assert!(!sub.is_subscribed_raw("ticks"));
    settle();

    publisher.publish_raw("ticks", &b"two"[..]).unwrap();
    assert!(
        rx.recv_timeout(Duration::from_secs(1)).is_err(),
        "delivery after cancel"
    );

    publisher.stop();
    sub.stop();
}

/// Drive a [`SubClient`] against a hand-rolled acceptor so the raw control
/// frames are observable: the initial subscribes, the heartbeat emitted
/// after a silent period, and the replay that precedes everything else on a
/// reconnected socket.
#[test]
fn heartbeats_and_replay_on_the_wire() {
    init_tracing();

    let (addr_tx, addr_rx) = mpsc::channel::<SocketAddr>();
    let (frame_tx, frame_rx) = mpsc::channel::<(u64, RequestFrame)>();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            addr_tx.send(listener.local_addr().unwrap()).unwrap();

            // First connection: collect a few frames, then hang up.
            let (mut sock, _) = listener.accept().await.unwrap();
            for _ in 0..3 {
                match RequestFrame::read(&mut sock).await {
                    Ok(frame) => frame_tx.send((1, frame)).unwrap(),
                    Err(_) => break,
                }
            }
            drop(sock);

            // Second connection: the client reconnects on its own.
            let (mut sock, _) = listener.accept().await.unwrap();
            while let Ok(frame) = RequestFrame::read(&mut sock).await {
                if frame_tx.send((2, frame)).is_err() {
                    break;
                }
            }
        });
    });

    let addr = recv_within(&addr_rx, Duration::from_secs(5), "listener address");
    let mut sub = SubClient::new().connect(addr);
    sub.run().unwrap();
    sub.subscribe_raw("alpha", |_| {}).unwrap();
    sub.subscribe_raw("beta", |_| {}).unwrap();

    // Connection 1 carries the two subscribes, then a heartbeat once the
    // line has been silent past the heartbeat period.
    let deadline = Duration::from_secs(10);
    let (_, first) = recv_within(&frame_rx, deadline, "first subscribe");
    let (_, second) = recv_within(&frame_rx, deadline, "second subscribe");
    for frame in [&first, &second] {
        assert_eq!(frame.flag.role, ClientRole::Subscriber);
        assert_eq!(frame.body.as_ref(), SUBSCRIBE_FLAG.as_bytes());
    }
    let mut topics = vec![first.protocol.clone(), second.protocol.clone()];
    topics.sort();
    assert_eq!(topics, ["alpha", "beta"]);

    let (conn, heartbeat) = recv_within(&frame_rx, deadline, "heartbeat");
    assert_eq!(conn, 1);
    assert_eq!(heartbeat.protocol, HEARTBEAT_FLAG);
    assert_eq!(heartbeat.body.as_ref(), HEARTBEAT_FLAG.as_bytes());

    // The acceptor hangs up after the heartbeat; the next frames must be
    // the replayed subscribes on connection 2, before anything else.
    let (conn, third) = recv_within(&frame_rx, deadline, "replayed subscribe");
    assert_eq!(conn, 2);
    let (_, fourth) = recv_within(&frame_rx, deadline, "replayed subscribe");
    for frame in [&third, &fourth] {
        assert_eq!(frame.body.as_ref(), SUBSCRIBE_FLAG.as_bytes());
    }
    let mut replayed = vec![third.protocol.clone(), fourth.protocol.clone()];
    replayed.sort();
    assert_eq!(replayed, ["alpha", "beta"]);

    sub.stop();
}
