//! Per-channel state machine: `Accept -> Handshake -> Active -> Closed`.
//!
//! One state machine per accepted socket: admission control, length-bounded
//! frames, per-key rate limiting, and dispatch between handshake and
//! message frames. Errors never escape this module as `Result` — every
//! rejection becomes a coarse `OutboundEvent::Close` so a client can never
//! distinguish "bad signature" from "replayed nonce" from "rate limited".

use securemsg_sdk::error::CloseCode;
use securemsg_sdk::frame::{self, AckFrame, FrameError};
use securemsg_sdk::handshake::{self, HandshakeError, INITIATOR_INIT_LEN};
use securemsg_sdk::identity::EphemeralKeyPair;
use securemsg_sdk::nonce::{NonceOutcome, NonceTracker};
use securemsg_sdk::ratchet::{self, RatchetState, Role};
use securemsg_sdk::Error;

use crate::ratelimit::RateLimiter;
use crate::store::MessageStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Accept,
    Handshake,
    Active,
    Closed,
}

#[derive(Debug)]
pub enum OutboundEvent {
    Bytes(Vec<u8>),
    Close(u16, String),
}

/// Shared, process-wide relay state a connection consults on every frame.
pub struct SharedState {
    pub nonce_tracker: NonceTracker,
    pub handshake_limiter: RateLimiter,
    pub message_limiter: RateLimiter,
    pub message_store: MessageStore,
    pub max_message_size: usize,
}

pub struct Connection {
    state: ConnState,
    remote_addr: String,
    client_id: Option<String>,
    expected_sequence: u32,
    ratchet: Option<RatchetState>,
}

impl Connection {
    pub fn new(remote_addr: String) -> Self {
        Connection {
            state: ConnState::Accept,
            remote_addr,
            client_id: None,
            expected_sequence: 0,
            ratchet: None,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Admit the connection, rejecting if the server is already at
    /// `max_sessions`.
    pub fn admit(&mut self, current_sessions: usize, max_sessions: usize) -> Option<OutboundEvent> {
        if current_sessions >= max_sessions {
            self.state = ConnState::Closed;
            let code = Error::CapacityExceeded.close_code().as_u16();
            return Some(OutboundEvent::Close(code, "Capacity exceeded".to_string()));
        }
        None
    }

    /// Process one inbound byte frame, dispatching by current state.
    /// Returns every outbound event (replies, acks, delivered stored
    /// messages, or a close) produced by this frame.
    pub fn on_frame(&mut self, bytes: &[u8], shared: &SharedState, now_ms: i64) -> Vec<OutboundEvent> {
        match self.state {
            ConnState::Accept | ConnState::Handshake => self.on_handshake_frame(bytes, shared, now_ms),
            ConnState::Active => self.on_active_frame(bytes, shared, now_ms),
            ConnState::Closed => Vec::new(),
        }
    }

    fn close(&mut self, code: CloseCode, reason: &str) -> Vec<OutboundEvent> {
        self.state = ConnState::Closed;
        vec![OutboundEvent::Close(code.as_u16(), reason.to_string())]
    }

    /// Close with the code `err.close_code()` maps its error to, so every
    /// rejection routes through the one `Error` -> `CloseCode` policy
    /// instead of a hand-picked literal that can drift out of sync with it.
    fn close_for_error(&mut self, err: impl Into<Error>, reason: &str) -> Vec<OutboundEvent> {
        self.close(err.into().close_code(), reason)
    }

    fn on_handshake_frame(&mut self, bytes: &[u8], shared: &SharedState, now_ms: i64) -> Vec<OutboundEvent> {
        if bytes.len() != INITIATOR_INIT_LEN {
            let err = HandshakeError::InvalidLength { expected: INITIATOR_INIT_LEN, got: bytes.len() };
            return self.close_for_error(err, "Expected InitiatorInit");
        }

        if !shared.handshake_limiter.check(&self.remote_addr, now_ms) {
            return self.close_for_error(Error::RateLimited, "Handshake rate limit exceeded");
        }

        let parsed = match handshake::verify_initiator_init(bytes, &shared.nonce_tracker, now_ms) {
            Ok(parsed) => parsed,
            Err(e @ HandshakeError::ReplayDetected) => return self.close_for_error(e, "Replay detected"),
            Err(e) => return self.close_for_error(e, "Handshake failed"),
        };

        let reply = match handshake::build_responder_reply(&parsed.client_ephemeral_pub, now_ms as u64, parsed.nonce) {
            Ok(reply) => reply,
            Err(e) => return self.close_for_error(e, "Handshake failed"),
        };

        let ratchet_state = match ratchet::ratchet_initialize(
            Role::Responder,
            reply.root_key,
            reply.server_ephemeral.secret,
            *parsed.client_ephemeral_pub.as_bytes(),
        ) {
            Ok(state) => state,
            Err(e) => return self.close_for_error(e, "Handshake failed"),
        };

        self.ratchet = Some(ratchet_state);
        self.client_id = Some(hex::encode(parsed.client_identity_pub.as_bytes()));
        self.expected_sequence = 0;
        self.state = ConnState::Active;

        vec![OutboundEvent::Bytes(reply.wire_bytes.to_vec())]
    }

    fn on_active_frame(&mut self, bytes: &[u8], shared: &SharedState, now_ms: i64) -> Vec<OutboundEvent> {
        if bytes.len() < 16 {
            return self.close_for_error(FrameError::Truncated, "Frame too small");
        }
        if bytes.len() > shared.max_message_size {
            return self.close_for_error(FrameError::TooBig, "Frame too large");
        }

        let client_id = match &self.client_id {
            Some(id) => id.clone(),
            None => return self.close_for_error(Error::Internal("Active without identity".to_string()), "Active without identity"),
        };
        if !shared.message_limiter.check(&client_id, now_ms) {
            return self.close_for_error(Error::RateLimited, "Message rate limit exceeded");
        }

        let parsed = match frame::parse_frame(bytes, shared.max_message_size) {
            Ok(parsed) => parsed,
            Err(e) => return self.close_for_error(e, "Malformed frame"),
        };

        if parsed.preamble.sequence != self.expected_sequence {
            let err = FrameError::SequenceMismatch { outer: parsed.preamble.sequence, inner: self.expected_sequence };
            return self.close_for_error(err, "Sequence mismatch");
        }
        self.expected_sequence += 1;

        let mut events = Vec::new();
        let ack = AckFrame {
            message_id: parsed.message_id,
            received_at_ms: now_ms as u64,
            success: true,
        };
        events.push(OutboundEvent::Bytes(frame::encode_ack(ack).to_vec()));

        if self.expected_sequence == 1 {
            for stored in shared.message_store.drain(&client_id, now_ms) {
                events.push(OutboundEvent::Bytes(stored.bytes));
            }
        }

        events
    }

    /// Queue `bytes` for later delivery to `recipient_id` (used when the
    /// recipient is not currently connected).
    pub fn store_for_offline(shared: &SharedState, recipient_id: &str, bytes: Vec<u8>, sequence: u32, now_ms: i64) {
        shared.message_store.store(recipient_id, bytes, sequence, now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use securemsg_sdk::identity::IdentityKeyPair;

    fn shared() -> SharedState {
        SharedState {
            nonce_tracker: NonceTracker::new(Default::default()),
            handshake_limiter: RateLimiter::new(60_000, 10),
            message_limiter: RateLimiter::new(60_000, 100),
            message_store: MessageStore::new(7 * 24 * 60 * 60 * 1000, 10_000),
            max_message_size: 1 << 20,
        }
    }

    #[test]
    fn happy_path_handshake_transitions_to_active() {
        let shared = shared();
        let mut conn = Connection::new("127.0.0.1:1".to_string());
        let identity = IdentityKeyPair::generate();
        let eph = EphemeralKeyPair::generate();
        let now = 1_700_000_000_000i64;
        let init = handshake::build_initiator_init(identity.signing_key(), &eph, now as u64, [0u8; 16]);

        let events = conn.on_frame(&init, &shared, now);
        assert_eq!(conn.state(), ConnState::Active);
        assert_eq!(events.len(), 1);
        match &events[0] {
            OutboundEvent::Bytes(bytes) => assert_eq!(bytes.len(), handshake::RESPONDER_REPLY_LEN),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn replayed_nonce_closes_with_policy_code() {
        let shared = shared();
        let identity = IdentityKeyPair::generate();
        let eph = EphemeralKeyPair::generate();
        let now = 1_700_000_000_000i64;
        let init = handshake::build_initiator_init(identity.signing_key(), &eph, now as u64, [9u8; 16]);

        let mut first = Connection::new("addr-a".to_string());
        first.on_frame(&init, &shared, now);

        let mut second = Connection::new("addr-b".to_string());
        let events = second.on_frame(&init, &shared, now);
        assert_eq!(second.state(), ConnState::Closed);
        match &events[0] {
            OutboundEvent::Close(code, _) => assert_eq!(*code, CloseCode::Policy.as_u16()),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn stale_timestamp_closes_with_policy_code() {
        let shared = shared();
        let identity = IdentityKeyPair::generate();
        let eph = EphemeralKeyPair::generate();
        let now = 1_700_000_000_000i64;
        let stale = (now - 6 * 60 * 1000) as u64;
        let init = handshake::build_initiator_init(identity.signing_key(), &eph, stale, [1u8; 16]);

        let mut conn = Connection::new("addr".to_string());
        let events = conn.on_frame(&init, &shared, now);
        assert_eq!(conn.state(), ConnState::Closed);
        match &events[0] {
            OutboundEvent::Close(code, _) => assert_eq!(*code, CloseCode::Policy.as_u16()),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn handshake_flood_rejected_after_limit() {
        let shared = shared();
        let addr = "flooder".to_string();
        for i in 0..10u8 {
            let identity = IdentityKeyPair::generate();
            let eph = EphemeralKeyPair::generate();
            let mut conn = Connection::new(addr.clone());
            let init = handshake::build_initiator_init(identity.signing_key(), &eph, 1_700_000_000_000, [i; 16]);
            conn.on_frame(&init, &shared, 1_700_000_000_000);
            assert_eq!(conn.state(), ConnState::Active);
        }
        let identity = IdentityKeyPair::generate();
        let eph = EphemeralKeyPair::generate();
        let mut conn = Connection::new(addr);
        let init = handshake::build_initiator_init(identity.signing_key(), &eph, 1_700_000_000_000, [99u8; 16]);
        let events = conn.on_frame(&init, &shared, 1_700_000_000_000);
        assert_eq!(conn.state(), ConnState::Closed);
        match &events[0] {
            OutboundEvent::Close(code, _) => assert_eq!(*code, CloseCode::Policy.as_u16()),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
