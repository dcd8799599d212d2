//! End-to-end tests over loopback TCP.

use netx_client::{Client, ClientConfig};
use netx_core::{handler_async, handler_fn, NetxError, Request, Response, TextCodec, Uuid};
use netx_server::{Server, ServerConfig};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time;

fn loopback() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        ..Default::default()
    }
}

async fn start() -> (Arc<Server<TextCodec>>, SocketAddr) {
    let server = Arc::new(Server::new(loopback(), TextCodec));
    let addr = server.open().await.unwrap();
    (server, addr)
}

async fn connect(addr: SocketAddr) -> Client<TextCodec> {
    Client::connect(ClientConfig::new("127.0.0.1", addr.port()), TextCodec)
        .await
        .unwrap()
}

/// Poll until `check` holds or a second passes.
async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Poll until the server holds exactly `n` sessions.
async fn sessions_settle(server: &Server<TextCodec>, n: usize) -> bool {
    for _ in 0..100 {
        if server.session_count().await == n {
            return true;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_converges_on_session_id() {
    let (server, addr) = start().await;
    let connected = Arc::new(Mutex::new(Vec::new()));
    let sink = connected.clone();
    server.on_client_connect(move |id| sink.lock().unwrap().push(id));

    let client = connect(addr).await;
    let id = client.session_id();
    assert!(!id.is_nil());

    assert!(sessions_settle(&server, 1).await);
    assert_eq!(server.session_ids().await, vec![id]);
    assert!(eventually(|| connected.lock().unwrap().len() == 1).await);
    assert_eq!(*connected.lock().unwrap(), vec![id]);
    assert!(server.peer_addr(id).await.is_some());

    client.close().await;
    server.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn version_mismatch_is_never_registered() {
    let (server, addr) = start().await;
    let connects = Arc::new(Mutex::new(0usize));
    let counter = connects.clone();
    server.on_client_connect(move |_| *counter.lock().unwrap() += 1);

    let config = ClientConfig {
        protocol_version: netx_core::PROTOCOL_VERSION + 1,
        ..ClientConfig::new("127.0.0.1", addr.port())
    };
    let client = Client::connect(config, TextCodec).await.unwrap();

    // The server hangs up; the client's dispatch loop sees it.
    assert!(eventually(|| !client.is_open()).await);
    assert_eq!(server.session_count().await, 0);
    assert_eq!(*connects.lock().unwrap(), 0);

    server.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sequential_requests_get_their_own_responses() {
    let (server, addr) = start().await;
    server
        .register_handler(handler_fn(1, |req| Response::new(req, req.body().to_vec())))
        .await;
    let client = connect(addr).await;

    for i in 0..10u32 {
        let request = Request::with_body(1, &i).unwrap();
        let response = client.request(&request, None).await.unwrap().unwrap();
        assert_eq!(response.correlation_id(), request.correlation_id());
        assert_eq!(response.body_as::<u32>().unwrap(), i);
        assert_eq!(response.sender(), Some(client.session_id()));
    }

    client.close().await;
    server.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn prefilled_sender_is_replaced_by_session_id() {
    let (server, addr) = start().await;
    server
        .register_handler(handler_fn(3, |req| {
            let sender = req.sender().unwrap_or_else(Uuid::nil);
            Response::new(req, sender.as_bytes().to_vec())
        }))
        .await;
    let client = connect(addr).await;

    let mut request = Request::new(3, Vec::new());
    request.set_sender(Uuid::new_v4());
    let response = client.request(&request, None).await.unwrap().unwrap();

    assert_eq!(Uuid::from_slice(response.body()).unwrap(), client.session_id());
    assert_eq!(response.sender(), Some(client.session_id()));

    client.close().await;
    server.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_send_fails_locally_and_session_survives() {
    let server = Arc::new(Server::new(
        ServerConfig {
            max_frame_len: 64,
            ..loopback()
        },
        TextCodec,
    ));
    let addr = server.open().await.unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    server.on_packet_received(move |value, _| sink.lock().unwrap().push(value.clone()));

    let config = ClientConfig {
        max_frame_len: 64,
        ..ClientConfig::new("127.0.0.1", addr.port())
    };
    let client = Client::connect(config, TextCodec).await.unwrap();
    assert!(sessions_settle(&server, 1).await);

    let err = client.send(&"x".repeat(60)).await.unwrap_err();
    assert!(matches!(err, NetxError::Protocol(_)), "unexpected error: {err}");
    assert!(client.is_open());

    client.send(&"small".to_string()).await.unwrap();
    assert!(eventually(|| received.lock().unwrap().len() == 1).await);
    assert_eq!(*received.lock().unwrap(), vec!["small".to_string()]);
    assert_eq!(server.session_count().await, 1);

    client.close().await;
    server.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unrouted_request_times_out_and_session_survives() {
    let (server, addr) = start().await;
    server
        .register_handler(handler_fn(1, |req| Response::new(req, b"ok".to_vec())))
        .await;
    let client = connect(addr).await;

    let orphan = client
        .request(&Request::new(404, Vec::new()), Some(Duration::from_millis(100)))
        .await
        .unwrap();
    assert!(orphan.is_none());

    let served = client
        .request(&Request::new(1, Vec::new()), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(served.body(), b"ok");
    assert_eq!(server.session_count().await, 1);

    client.close().await;
    server.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_does_not_wedge_the_session() {
    let (server, addr) = start().await;
    server
        .register_handler(handler_async(2, |req: Request| async move {
            time::sleep(Duration::from_millis(300)).await;
            Response::new(&req, b"late".to_vec())
        }))
        .await;
    server
        .register_handler(handler_fn(1, |req| Response::new(req, b"fast".to_vec())))
        .await;
    let client = connect(addr).await;

    let slow = client
        .request(&Request::new(2, Vec::new()), Some(Duration::from_millis(50)))
        .await
        .unwrap();
    assert!(slow.is_none());

    let fast = client
        .request(&Request::new(1, Vec::new()), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fast.body(), b"fast");

    client.close().await;
    server.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_can_request_from_client() {
    let (server, addr) = start().await;
    let client = Client::connect_with_handlers(
        ClientConfig::new("127.0.0.1", addr.port()),
        TextCodec,
        vec![handler_fn(9, |req| Response::new(req, b"from client".to_vec()))],
    )
    .await
    .unwrap();
    let id = client.session_id();
    assert!(sessions_settle(&server, 1).await);

    let response = server
        .request(id, &Request::new(9, Vec::new()), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.body(), b"from client");
    assert_eq!(response.sender(), Some(id));

    client.close().await;
    server.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_and_await_answered_by_server() {
    let (server, addr) = start().await;
    let client = connect(addr).await;
    let id = client.session_id();
    assert!(sessions_settle(&server, 1).await);

    let responder = {
        let server = server.clone();
        tokio::spawn(async move {
            let text = server.await_next(id, None).await.unwrap().unwrap();
            server.send(id, &format!("re: {text}")).await.unwrap();
        })
    };
    // Let the server register its await first.
    time::sleep(Duration::from_millis(50)).await;

    let reply = client
        .send_and_await(&"hi".to_string(), Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(reply.as_deref(), Some("re: hi"));
    responder.await.unwrap();

    client.close().await;
    server.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broadcast_reaches_every_session() {
    let (server, addr) = start().await;
    let mut clients = Vec::new();
    let received = Arc::new(Mutex::new(Vec::<(Uuid, String)>::new()));
    for _ in 0..3 {
        let client = connect(addr).await;
        let sink = received.clone();
        let me = client.session_id();
        client.on_packet_received(move |text, _| sink.lock().unwrap().push((me, text.clone())));
        clients.push(client);
    }
    assert!(sessions_settle(&server, 3).await);

    let report = server.broadcast(&"all hands".to_string()).await.unwrap();
    assert_eq!(report.delivered.len(), 3);
    assert!(report.is_complete());

    assert!(eventually(|| received.lock().unwrap().len() == 3).await);
    for client in &clients {
        assert!(received
            .lock()
            .unwrap()
            .contains(&(client.session_id(), "all hands".to_string())));
    }

    for client in &clients {
        client.close().await;
    }
    server.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_close_fires_disconnect_once() {
    let (server, addr) = start().await;
    let disconnected = Arc::new(Mutex::new(Vec::new()));
    let sink = disconnected.clone();
    server.on_client_disconnect(move |id| sink.lock().unwrap().push(id));

    let client = connect(addr).await;
    let id = client.session_id();
    assert!(sessions_settle(&server, 1).await);

    assert!(client.close().await);
    assert!(!client.close().await);

    assert!(sessions_settle(&server, 0).await);
    assert!(eventually(|| disconnected.lock().unwrap().len() == 1).await);
    assert_eq!(*disconnected.lock().unwrap(), vec![id]);

    server.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kick_closes_the_client() {
    let (server, addr) = start().await;
    let disconnected = Arc::new(Mutex::new(0usize));
    let counter = disconnected.clone();
    server.on_client_disconnect(move |_| *counter.lock().unwrap() += 1);

    let client = connect(addr).await;
    let id = client.session_id();
    assert!(sessions_settle(&server, 1).await);

    server.kick(id).await.unwrap();
    assert!(matches!(server.kick(id).await, Err(NetxError::SessionNotFound(_))));
    assert_eq!(server.session_count().await, 0);
    assert!(eventually(|| !client.is_open()).await);
    assert_eq!(*disconnected.lock().unwrap(), 1);

    server.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_close_disconnects_everyone() {
    let (server, addr) = start().await;
    let a = connect(addr).await;
    let b = connect(addr).await;
    assert!(sessions_settle(&server, 2).await);

    assert!(server.close().await);
    assert_eq!(server.session_count().await, 0);
    assert!(eventually(|| !a.is_open() && !b.is_open()).await);
    assert!(Client::connect(ClientConfig::new("127.0.0.1", addr.port()), TextCodec)
        .await
        .is_err());
}
