// Client endpoint against a live server: send, receive, teardown.

use std::time::Duration;

use framewire::{
    encode_frame, Client, ClientError, ClientOptions, EventReceiver, Server, ServerEvent,
    ServerOptions,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn next_event(events: &EventReceiver) -> ServerEvent {
    events
        .recv_timeout(EVENT_TIMEOUT)
        .expect("timed out waiting for event")
}

fn start_server() -> (Server, EventReceiver, u16) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut server = Server::new(ServerOptions {
        host: "127.0.0.1".into(),
        ..ServerOptions::default()
    });
    let events = server.events();
    let addr = server.listen().unwrap();
    assert!(matches!(next_event(&events), ServerEvent::Listening { .. }));
    (server, events, addr.port)
}

#[test]
fn send_and_receive_through_client() {
    let (server, events, port) = start_server();

    let mut client = Client::connect(ClientOptions::new("127.0.0.1", port)).unwrap();
    assert!(client.is_connected());
    assert!(matches!(next_event(&events), ServerEvent::Connection { .. }));

    // Client -> server: the client is a raw pipe, so it frames explicitly.
    client.send(&encode_frame(b"ping")).unwrap();
    match next_event(&events) {
        ServerEvent::Message { data, .. } => assert_eq!(&data[..], b"ping"),
        other => panic!("expected message, got {other:?}"),
    }

    // Server -> client: broadcast arrives framed.
    server.broadcast(b"pong");
    let mut received = Vec::new();
    while received.len() < 8 {
        let chunk = client
            .recv_timeout(0, EVENT_TIMEOUT)
            .expect("timed out waiting for broadcast");
        received.extend_from_slice(&chunk);
    }
    assert_eq!(&received[..4], &[0, 0, 0, 4]);
    assert_eq!(&received[4..8], b"pong");

    // Empty sends are a no-op; polling with nothing pending yields an
    // empty buffer.
    client.send(&[]).unwrap();
    assert!(client.recv(0).is_empty());

    client.close();
    assert!(!client.is_connected());
    assert!(client.send(b"late").is_err());
    assert!(matches!(next_event(&events), ServerEvent::ClientClosed { .. }));
}

#[test]
fn recv_limit_truncates_chunk() {
    let (server, events, port) = start_server();

    let client = Client::connect(ClientOptions::new("127.0.0.1", port)).unwrap();
    assert!(matches!(next_event(&events), ServerEvent::Connection { .. }));

    server.broadcast(&[0x5A; 100]);
    let chunk = client.recv_timeout(10, EVENT_TIMEOUT).expect("broadcast");
    assert_eq!(chunk.len(), 10);
}

#[test]
fn server_disconnect_surfaces_to_client() {
    let (server, events, port) = start_server();

    let client = Client::connect(ClientOptions::new("127.0.0.1", port)).unwrap();
    let id = match next_event(&events) {
        ServerEvent::Connection { client } => client.id,
        other => panic!("expected connection, got {other:?}"),
    };

    assert!(server.close_connection(&id));
    assert!(matches!(next_event(&events), ServerEvent::ClientClosed { .. }));

    // The client's worker observes the close shortly after.
    let deadline = std::time::Instant::now() + EVENT_TIMEOUT;
    while client.is_connected() {
        assert!(std::time::Instant::now() < deadline, "client never noticed close");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn connect_error_is_synchronous() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    match Client::connect(ClientOptions::new("127.0.0.1", port)) {
        Err(ClientError::Connect(_)) => {}
        other => panic!("expected connect error, got {:?}", other.map(|_| "client")),
    }
}
