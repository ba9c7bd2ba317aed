//! End-to-end scenarios driving the relay over a real `tokio::net::TcpStream`,
//! exercising the concrete properties laid out for this protocol: a
//! successful handshake, strict sequence enforcement, and handshake-rate
//! limiting.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::net::TcpStream;

use securemsg_sdk::handshake::{self, RESPONDER_REPLY_LEN};
use securemsg_sdk::identity::{EphemeralKeyPair, IdentityKeyPair};
use securemsg_sdk::ratchet::{self, Role};
use securemsg_sdk::session::{ChannelEvent, DuplexChannel};
use securemsg_sdk::frame;
use securemsg_sdk::transport::TcpDuplexChannel;

use securemsg_server::config::ServerConfig;
use securemsg_server::server::Server;

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

fn test_config(port: u16) -> ServerConfig {
    ServerConfig {
        port,
        host: "127.0.0.1".to_string(),
        ..ServerConfig::default()
    }
}

async fn start_server() -> std::net::SocketAddr {
    let server = Server::new(test_config(0));
    let (addr, _handle) = server.start().await.unwrap();
    addr
}

/// S1 — a fresh initiator completes the handshake and gets back a
/// well-formed 116-byte responder reply.
#[tokio::test]
async fn happy_path_handshake_over_tcp() {
    let addr = start_server().await;
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut channel = TcpDuplexChannel::new(stream, 1 << 20);

    let identity = IdentityKeyPair::generate();
    let ephemeral = EphemeralKeyPair::generate();
    let now = now_ms() as u64;
    let init = handshake::build_initiator_init(identity.signing_key(), &ephemeral, now, [1u8; 16]);
    channel.send(init.to_vec()).await.unwrap();

    let event = channel.recv().await.unwrap();
    let reply_bytes = match event {
        ChannelEvent::Frame(bytes) => bytes,
        other => panic!("expected a responder reply, got {other:?}"),
    };
    assert_eq!(reply_bytes.len(), RESPONDER_REPLY_LEN);

    let result = handshake::process_responder_reply(&ephemeral, &reply_bytes, now as i64).unwrap();
    // Both sides must be able to build a ratchet from the agreed root key.
    ratchet::ratchet_initialize(Role::Initiator, result.root_key, ephemeral.secret, *result.server_ephemeral_pub.as_bytes()).unwrap();
}

/// S4 — after a handshake, three in-order messages are acked in sequence;
/// a fourth frame that skips ahead (sequence 4 instead of 3) is rejected
/// and the relay closes the connection.
#[tokio::test]
async fn out_of_sequence_message_closes_connection() {
    let addr = start_server().await;
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut channel = TcpDuplexChannel::new(stream, 1 << 20);

    let identity = IdentityKeyPair::generate();
    let client_ephemeral = EphemeralKeyPair::generate();
    let now = now_ms() as u64;
    let init = handshake::build_initiator_init(identity.signing_key(), &client_ephemeral, now, [2u8; 16]);
    channel.send(init.to_vec()).await.unwrap();

    let reply_bytes = match channel.recv().await.unwrap() {
        ChannelEvent::Frame(bytes) => bytes,
        other => panic!("expected a responder reply, got {other:?}"),
    };
    let result = handshake::process_responder_reply(&client_ephemeral, &reply_bytes, now as i64).unwrap();
    let mut ratchet_state = ratchet::ratchet_initialize(
        Role::Initiator,
        result.root_key,
        client_ephemeral.secret,
        *result.server_ephemeral_pub.as_bytes(),
    )
    .unwrap();

    for (sequence, plaintext) in [(0u32, &b"a"[..]), (1, &b"b"[..]), (2, &b"c"[..])] {
        let dh_pub = ratchet::sending_dh_public(&ratchet_state);
        let key = ratchet::ratchet_send(&mut ratchet_state).unwrap();
        let header = frame::PlainHeader {
            sequence,
            dh_pub,
            message_number: key.index,
            prev_chain_len: 0,
        };
        let encoded = frame::encode_frame(&key, header, plaintext, now_ms() as u64, 1).unwrap();
        channel.send(frame::serialize_frame(&encoded)).await.unwrap();

        let ack_event = channel.recv().await.unwrap();
        match ack_event {
            ChannelEvent::Frame(bytes) => {
                let ack = frame::decode_ack(&bytes).unwrap();
                assert!(ack.success);
            }
            other => panic!("expected an ack, got {other:?}"),
        }
    }

    // Inject a frame with sequence 4 instead of the expected 3.
    let dh_pub = ratchet::sending_dh_public(&ratchet_state);
    let key = ratchet::ratchet_send(&mut ratchet_state).unwrap();
    let header = frame::PlainHeader {
        sequence: 4,
        dh_pub,
        message_number: key.index,
        prev_chain_len: 0,
    };
    let encoded = frame::encode_frame(&key, header, b"d", now_ms() as u64, 1).unwrap();
    channel.send(frame::serialize_frame(&encoded)).await.unwrap();

    let event = channel.recv().await.unwrap();
    assert!(matches!(event, ChannelEvent::Closed(_, _)), "expected the relay to close the connection, got {event:?}");
}

/// S6 — eleven handshakes within the same rate-limit window from one
/// transport address; the eleventh is rejected.
#[tokio::test]
async fn eleventh_handshake_from_same_address_is_rate_limited() {
    let addr = start_server().await;

    for i in 0..10u8 {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut channel = TcpDuplexChannel::new(stream, 1 << 20);
        let identity = IdentityKeyPair::generate();
        let ephemeral = EphemeralKeyPair::generate();
        let now = now_ms() as u64;
        let init = handshake::build_initiator_init(identity.signing_key(), &ephemeral, now, [i; 16]);
        channel.send(init.to_vec()).await.unwrap();
        let event = channel.recv().await.unwrap();
        assert!(matches!(event, ChannelEvent::Frame(_)), "handshake {i} should succeed");
    }

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut channel = TcpDuplexChannel::new(stream, 1 << 20);
    let identity = IdentityKeyPair::generate();
    let ephemeral = EphemeralKeyPair::generate();
    let now = now_ms() as u64;
    let init = handshake::build_initiator_init(identity.signing_key(), &ephemeral, now, [99u8; 16]);
    channel.send(init.to_vec()).await.unwrap();
    let event = channel.recv().await.unwrap();
    assert!(matches!(event, ChannelEvent::Closed(_, _)), "eleventh handshake should be rejected");
}
