// End-to-end server scenarios over loopback sockets: framing, reassembly,
// oversize rejection, handshake gating (plain and attested), backpressure
// and drain, and the facade query surface.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use serde_json::json;

use framewire::{
    n_index, neg_hash, to_canonical_json, EventReceiver, Server, ServerEvent, ServerOptions,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = (payload.len() as u32).to_be_bytes().to_vec();
    buf.extend_from_slice(payload);
    buf
}

fn next_event(events: &EventReceiver) -> ServerEvent {
    events
        .recv_timeout(EVENT_TIMEOUT)
        .expect("timed out waiting for event")
}

fn start_server(options: ServerOptions) -> (Server, EventReceiver, u16) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut server = Server::new(ServerOptions {
        host: "127.0.0.1".into(),
        ..options
    });
    let events = server.events();
    let addr = server.listen().expect("listen failed");
    match next_event(&events) {
        ServerEvent::Listening { address, port, family } => {
            assert_eq!(address, "127.0.0.1");
            assert_eq!(port, addr.port);
            assert_eq!(family, "IPv4");
        }
        other => panic!("expected listening, got {other:?}"),
    }
    // Port 0 was requested; the OS-assigned port must have surfaced.
    assert_ne!(addr.port, 0);
    (server, events, addr.port)
}

#[test]
fn echo_round_trip() {
    let (server, events, port) = start_server(ServerOptions::default());

    let mut sock = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let client = match next_event(&events) {
        ServerEvent::Connection { client } => {
            assert_eq!(client.remote_address, "127.0.0.1");
            assert_ne!(client.remote_port, 0);
            assert!(client.handshake.is_none());
            client
        }
        other => panic!("expected connection, got {other:?}"),
    };

    sock.write_all(&[0x00, 0x00, 0x00, 0x03, b'h', b'i', b'!']).unwrap();
    match next_event(&events) {
        ServerEvent::Message { client: c, data } => {
            assert_eq!(c.id, client.id);
            assert_eq!(&data[..], &[0x68, 0x69, 0x21]);
        }
        other => panic!("expected message, got {other:?}"),
    }

    drop(sock);
    match next_event(&events) {
        ServerEvent::ClientClosed { client: c, had_error } => {
            assert_eq!(c.id, client.id);
            assert!(!had_error);
        }
        other => panic!("expected clientClosed, got {other:?}"),
    }
    drop(server);
}

#[test]
fn split_frame_reassembles_to_one_message() {
    let (_server, events, port) = start_server(ServerOptions::default());

    let mut sock = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(matches!(next_event(&events), ServerEvent::Connection { .. }));

    sock.write_all(&[0x00, 0x00, 0x00, 0x05, b'h', b'e']).unwrap();
    sock.flush().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    sock.write_all(&[b'l', b'l', b'o']).unwrap();

    match next_event(&events) {
        ServerEvent::Message { data, .. } => assert_eq!(&data[..], b"hello"),
        other => panic!("expected message, got {other:?}"),
    }
    // Exactly one message: nothing else pending.
    assert!(events.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn empty_frame_is_a_valid_message() {
    let (_server, events, port) = start_server(ServerOptions::default());

    let mut sock = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(matches!(next_event(&events), ServerEvent::Connection { .. }));

    sock.write_all(&[0, 0, 0, 0]).unwrap();
    match next_event(&events) {
        ServerEvent::Message { data, .. } => assert!(data.is_empty()),
        other => panic!("expected message, got {other:?}"),
    }
}

#[test]
fn oversize_frame_closes_with_error() {
    let (_server, events, port) = start_server(ServerOptions {
        max_frame_length: 16,
        ..ServerOptions::default()
    });

    // A frame of exactly the limit is fine.
    let mut sock = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(matches!(next_event(&events), ServerEvent::Connection { .. }));
    sock.write_all(&frame(&[0x11; 16])).unwrap();
    match next_event(&events) {
        ServerEvent::Message { data, .. } => assert_eq!(data.len(), 16),
        other => panic!("expected message, got {other:?}"),
    }

    // One byte past the limit is fatal.
    sock.write_all(&frame(&[0x22; 17])).unwrap();
    match next_event(&events) {
        ServerEvent::Error { message } => {
            assert!(message.contains("Frame length exceeded native limit"), "{message}");
        }
        other => panic!("expected error, got {other:?}"),
    }
    match next_event(&events) {
        ServerEvent::ClientClosed { had_error, .. } => assert!(!had_error),
        other => panic!("expected clientClosed, got {other:?}"),
    }
}

#[test]
fn handshake_gates_messages() {
    let (_server, events, port) = start_server(ServerOptions {
        protocol_version: "v1".into(),
        ..ServerOptions::default()
    });

    let mut sock = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let hello = json!({"type": "handshake", "version": "v1", "tags": {"role": "a"}});
    sock.write_all(&frame(hello.to_string().as_bytes())).unwrap();
    sock.write_all(&frame(&[0x01, 0x02])).unwrap();

    // No connection event fires before the handshake verifies.
    match next_event(&events) {
        ServerEvent::Connection { client } => {
            let hs = client.handshake.expect("handshake metadata");
            assert_eq!(hs.version.as_deref(), Some("v1"));
            assert_eq!(hs.tags.get("role"), Some(&json!("a")));
        }
        other => panic!("expected connection, got {other:?}"),
    }
    match next_event(&events) {
        ServerEvent::Message { client, data } => {
            assert_eq!(&data[..], &[0x01, 0x02]);
            assert!(client.handshake.is_some());
        }
        other => panic!("expected message, got {other:?}"),
    }
}

#[test]
fn non_handshake_first_frame_is_rejected() {
    let (_server, events, port) = start_server(ServerOptions {
        protocol_version: "v1".into(),
        ..ServerOptions::default()
    });

    let mut sock = TcpStream::connect(("127.0.0.1", port)).unwrap();
    sock.write_all(&frame(b"not json at all")).unwrap();

    // Error then clientClosed, and never a connection event.
    loop {
        match next_event(&events) {
            ServerEvent::Error { message } => {
                assert!(message.contains("handshake"), "{message}");
                break;
            }
            ServerEvent::Connection { .. } => panic!("gated connection was announced"),
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(matches!(next_event(&events), ServerEvent::ClientClosed { .. }));
}

#[test]
fn version_mismatch_is_rejected() {
    let (_server, events, port) = start_server(ServerOptions {
        protocol_version: "v1".into(),
        ..ServerOptions::default()
    });

    let mut sock = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let hello = json!({"type": "handshake", "version": "v9"});
    sock.write_all(&frame(hello.to_string().as_bytes())).unwrap();

    match next_event(&events) {
        ServerEvent::Error { message } => {
            assert!(message.contains("version mismatch"), "{message}")
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert!(matches!(next_event(&events), ServerEvent::ClientClosed { .. }));
}

fn attested_handshake(key: &SigningKey) -> serde_json::Value {
    let public_key = key.verifying_key().to_bytes();
    let index = n_index(&public_key);
    let hash = neg_hash(&public_key, index);
    let mut value = json!({
        "type": "handshake",
        "version": "v1",
        "tags": {"role": "attested"},
        "publicKey": BASE64.encode(public_key),
        "nIndex": index,
        "negHash": hash,
    });
    let signature = key.sign(to_canonical_json(&value).as_bytes());
    value["signature"] = json!(BASE64.encode(signature.to_bytes()));
    value
}

#[test]
fn attested_handshake_verifies_and_tampering_fails() {
    let (_server, events, port) = start_server(ServerOptions {
        protocol_version: "v1".into(),
        ..ServerOptions::default()
    });
    let key = SigningKey::from_bytes(&[42u8; 32]);

    // Valid attestation announces the connection with derived metadata.
    let mut sock = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let hello = attested_handshake(&key);
    sock.write_all(&frame(hello.to_string().as_bytes())).unwrap();
    match next_event(&events) {
        ServerEvent::Connection { client } => {
            let hs = client.handshake.expect("handshake metadata");
            assert!(hs.n_index.is_some());
            assert_eq!(hs.neg_hash.as_deref().map(str::len), Some(64));
        }
        other => panic!("expected connection, got {other:?}"),
    }

    // Altered fingerprint: rejected before the signature check.
    let mut sock2 = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let mut bad = attested_handshake(&key);
    bad["negHash"] = json!("00".repeat(32));
    sock2.write_all(&frame(bad.to_string().as_bytes())).unwrap();
    match next_event(&events) {
        ServerEvent::Error { message } => assert!(message.contains("fingerprint"), "{message}"),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(matches!(next_event(&events), ServerEvent::ClientClosed { .. }));

    // Altered signature: rejected.
    let mut sock3 = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let mut bad = attested_handshake(&key);
    let mut sig = BASE64.decode(bad["signature"].as_str().unwrap()).unwrap();
    sig[0] ^= 0xFF;
    bad["signature"] = json!(BASE64.encode(sig));
    sock3.write_all(&frame(bad.to_string().as_bytes())).unwrap();
    match next_event(&events) {
        ServerEvent::Error { message } => assert!(message.contains("signature"), "{message}"),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(matches!(next_event(&events), ServerEvent::ClientClosed { .. }));
}

#[test]
fn backpressure_then_drain() {
    let (server, events, port) = start_server(ServerOptions {
        max_backpressure_bytes: 1024,
        ..ServerOptions::default()
    });

    let mut sock = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(matches!(next_event(&events), ServerEvent::Connection { .. }));

    let payload = vec![0xAB; 2048];
    server.broadcast(&payload);

    match next_event(&events) {
        ServerEvent::Backpressure { queued_bytes, threshold, .. } => {
            assert!(queued_bytes >= 1024);
            assert_eq!(threshold, 1024);
            // One framed blob: payload plus the 4-byte prefix.
            assert_eq!(queued_bytes, 2052);
        }
        other => panic!("expected backpressure, got {other:?}"),
    }
    match next_event(&events) {
        ServerEvent::Drain { .. } => {}
        other => panic!("expected drain, got {other:?}"),
    }

    // The peer receives the complete framed payload.
    let mut received = vec![0u8; 2052];
    sock.set_read_timeout(Some(EVENT_TIMEOUT)).unwrap();
    sock.read_exact(&mut received).unwrap();
    assert_eq!(&received[..4], &[0x00, 0x00, 0x08, 0x00]);
    assert!(received[4..].iter().all(|&b| b == 0xAB));
}

#[test]
fn broadcast_without_connections_is_a_no_op() {
    let (server, events, _port) = start_server(ServerOptions::default());
    server.broadcast(b"nobody home");
    assert!(events.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn query_and_disconnect_surface() {
    let (server, events, port) = start_server(ServerOptions::default());

    let _sock = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let client = match next_event(&events) {
        ServerEvent::Connection { client } => client,
        other => panic!("expected connection, got {other:?}"),
    };

    assert_eq!(server.connection_count(), 1);
    let looked_up = server.connection(&client.id).expect("known connection");
    assert_eq!(looked_up.remote_address, client.remote_address);
    assert_eq!(looked_up.remote_port, client.remote_port);
    assert!(server.connection("conn-0-0-deadbeef").is_none());

    assert!(server.close_connection(&client.id));
    assert!(matches!(next_event(&events), ServerEvent::ClientClosed { .. }));
    assert_eq!(server.connection_count(), 0);
    assert!(!server.close_connection(&client.id));
}

#[test]
fn close_emits_close_event_and_drops_connections() {
    let (mut server, events, port) = start_server(ServerOptions::default());

    let _sock = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(matches!(next_event(&events), ServerEvent::Connection { .. }));

    server.shutdown(1000);
    // Teardown is immediate; the terminal event is `Closed`.
    loop {
        match next_event(&events) {
            ServerEvent::Closed => break,
            ServerEvent::ClientClosed { .. } => continue,
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(server.connection_count(), 0);
    assert!(!server.is_listening());
}

#[test]
fn unframed_mode_passes_bytes_through() {
    let (_server, events, port) = start_server(ServerOptions {
        length_prefixed: false,
        ..ServerOptions::default()
    });

    let mut sock = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(matches!(next_event(&events), ServerEvent::Connection { .. }));

    sock.write_all(b"raw bytes, no prefix").unwrap();
    match next_event(&events) {
        ServerEvent::Message { data, .. } => assert_eq!(&data[..], b"raw bytes, no prefix"),
        other => panic!("expected message, got {other:?}"),
    }
}
