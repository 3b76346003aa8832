use bytes::Bytes;
use murmur::{HandlerError, Message, Server};
use std::net::SocketAddr;
use std::time::Duration;

/// Install a subscriber for `RUST_LOG`-driven debugging of failing tests.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A server with the standard test bindings, listening on an ephemeral
/// port.
pub fn test_server() -> Server {
    let server = Server::new()
        .bind_raw("echo", |body: Bytes, _session: &str| Ok::<_, HandlerError>(body))
        .bind("request_person_info", |_req: Message, _session: &str| {
            Ok::<_, HandlerError>(Message::new(
                "person_info_rsp",
                serde_json::json!({"name": "Tom", "age": 21}),
            ))
        })
        .bind_raw("slow", |body: Bytes, _session: &str| {
            std::thread::sleep(Duration::from_millis(500));
            Ok::<_, HandlerError>(body)
        })
        .listen([ephemeral_addr()])
        .work_threads(2);

    server.codecs().register_json("person_info_req");
    server.codecs().register_json("person_info_rsp");
    server
}

/// Run a server and return it with its bound address.
pub fn start(mut server: Server) -> (Server, SocketAddr) {
    server.run().expect("server failed to start");
    let addr = server.bound_addrs()[0];
    (server, addr)
}

pub fn ephemeral_addr() -> SocketAddr {
    "127.0.0.1:0".parse().expect("valid address")
}

/// Receive from a std channel with a deadline, panicking on silence.
pub fn recv_within<T>(rx: &std::sync::mpsc::Receiver<T>, deadline: Duration, what: &str) -> T {
    rx.recv_timeout(deadline)
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}
