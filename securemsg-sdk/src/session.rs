//! Client-side session: drives the handshake, owns per-peer ratchet state,
//! and queues outbound messages with ack-timeout + exponential-backoff
//! retry.
//!
//! [`ClientSession::run_with_reconnect`] is the driver: it (re)establishes a
//! channel through a caller-supplied factory, runs the handshake, and then
//! services inbound frames and ack-timeout retries until a fatal close.
//! The transport itself is factored behind [`DuplexChannel`] so the core
//! never assumes a concrete socket type; a TCP/TLS stream, a WebSocket, or
//! an in-memory pair can all implement it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::error::{CloseCode, Error};
use crate::frame::{self, AckFrame, EncryptedFrame, PlainHeader, ACK_FRAME_LEN, MESSAGE_ID_LEN};
use crate::handshake::{self, NONCE_LEN};
use crate::identity::{EphemeralKeyPair, IdentityKeyPair};
use crate::ratchet::{self, RatchetState, Role};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const MAX_RETRIES: u32 = 10;
const ACK_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const FRAME_VERSION: u32 = 1;
/// Peer id this session's connection to the relay itself is ratcheted
/// under, distinct from any other party's identifier.
pub const SERVER_PEER_ID: &str = "server";
/// Default inbound frame size cap for [`ClientSession::run_with_reconnect`],
/// matching the relay's own default.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1 << 20;

/// An inbound frame from a duplex channel, or a close event.
#[derive(Debug)]
pub enum ChannelEvent {
    Frame(Vec<u8>),
    Closed(u16, String),
}

/// Transport abstraction the session drives. A `TcpDuplexChannel` adapter
/// over `tokio::net::TcpStream` is the canonical binding; WebSocket framing
/// is layered by a caller above this trait.
#[async_trait]
pub trait DuplexChannel: Send {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), Error>;
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), Error>;
    async fn recv(&mut self) -> Result<ChannelEvent, Error>;
}

/// Capability set a caller supplies to observe session events: message
/// arrival, errors, and connect/disconnect transitions.
pub trait SessionObserver: Send + Sync {
    fn on_message(&self, _peer_id: &str, _plaintext: &[u8]) {}
    fn on_error(&self, _err: &Error) {}
    fn on_connected(&self) {}
    fn on_disconnected(&self) {}
}

struct OutboundMessage {
    frame: EncryptedFrame,
    peer_id: String,
    retry_count: u32,
    next_retry: Instant,
}

/// Drives one connection's worth of handshake + ratcheted traffic.
pub struct ClientSession<C: DuplexChannel> {
    identity: IdentityKeyPair,
    channel: Option<C>,
    ratchets: HashMap<String, RatchetState>,
    outbound: VecDeque<OutboundMessage>,
    ack_waiters: HashMap<[u8; MESSAGE_ID_LEN], oneshot::Sender<bool>>,
    observer: Arc<dyn SessionObserver>,
    retry_count_for_reconnect: u32,
    sequence: u32,
    retry_tx: mpsc::UnboundedSender<[u8; MESSAGE_ID_LEN]>,
    retry_rx: mpsc::UnboundedReceiver<[u8; MESSAGE_ID_LEN]>,
}

impl<C: DuplexChannel> ClientSession<C> {
    pub fn new(identity: IdentityKeyPair, observer: Arc<dyn SessionObserver>) -> Self {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        ClientSession {
            identity,
            channel: None,
            ratchets: HashMap::new(),
            outbound: VecDeque::new(),
            ack_waiters: HashMap::new(),
            observer,
            retry_count_for_reconnect: 0,
            sequence: 0,
            retry_tx,
            retry_rx,
        }
    }

    pub fn party_id(&self) -> String {
        self.identity.party_id()
    }

    /// Perform the initiator side of the handshake over `channel`, install
    /// the ratchet for [`SERVER_PEER_ID`], and reset reconnect backoff.
    pub async fn connect(&mut self, mut channel: C, now_ms: u64) -> Result<(), Error> {
        let ephemeral = EphemeralKeyPair::generate();
        let mut nonce = [0u8; NONCE_LEN];
        crate::primitives::random_bytes(&mut nonce);
        let init = handshake::build_initiator_init(self.identity.signing_key(), &ephemeral, now_ms, nonce);

        channel.send(init.to_vec()).await?;

        let reply_bytes = tokio::time::timeout(HANDSHAKE_TIMEOUT, channel.recv())
            .await
            .map_err(|_| Error::HandshakeTimeout)??;
        let reply_bytes = match reply_bytes {
            ChannelEvent::Frame(bytes) => bytes,
            ChannelEvent::Closed(code, reason) => {
                return Err(Error::ChannelClosed { code, reason });
            }
        };

        let result = handshake::process_responder_reply(&ephemeral, &reply_bytes, now_ms as i64)?;
        let ratchet = ratchet::ratchet_initialize(
            Role::Initiator,
            result.root_key,
            ephemeral.secret,
            *result.server_ephemeral_pub.as_bytes(),
        )?;
        self.ratchets.insert(SERVER_PEER_ID.to_string(), ratchet);
        self.channel = Some(channel);
        self.retry_count_for_reconnect = 0;
        self.observer.on_connected();
        Ok(())
    }

    fn ratchet_for(&mut self, peer_id: &str) -> Result<&mut RatchetState, Error> {
        self.ratchets
            .get_mut(peer_id)
            .ok_or_else(|| Error::NoSession(peer_id.to_string()))
    }

    /// Encrypt `plaintext` for `peer_id`, enqueue it, and transmit
    /// immediately if connected.
    pub async fn send(&mut self, peer_id: &str, plaintext: &[u8], now_ms: u64) -> Result<[u8; MESSAGE_ID_LEN], Error> {
        let dh_pub = ratchet::sending_dh_public(self.ratchet_for(peer_id)?);
        let key = ratchet::ratchet_send(self.ratchet_for(peer_id)?)?;
        let sequence = self.sequence;
        self.sequence += 1;
        let header = PlainHeader {
            sequence,
            dh_pub,
            message_number: key.index,
            prev_chain_len: 0,
        };
        let frame = frame::encode_frame(&key, header, plaintext, now_ms, FRAME_VERSION)?;
        let message_id = frame.message_id;

        let outbound = OutboundMessage {
            frame: frame.clone(),
            peer_id: peer_id.to_string(),
            retry_count: 0,
            next_retry: Instant::now(),
        };

        if let Some(channel) = self.channel.as_mut() {
            channel.send(frame::serialize_frame(&frame)).await?;
        }
        self.outbound.push_back(outbound);

        // Arm the ack timeout in the background so `send` itself doesn't
        // block on delivery confirmation; an unacked message reports back
        // through `retry_tx` for the receive loop to reschedule.
        let ack_rx = self.wait_for_ack(message_id);
        let retry_tx = self.retry_tx.clone();
        tokio::spawn(async move {
            if tokio::time::timeout(ACK_TIMEOUT, ack_rx).await.is_err() {
                let _ = retry_tx.send(message_id);
            }
        });

        Ok(message_id)
    }

    /// Register a oneshot to be resolved when `message_id`'s ack arrives.
    pub fn wait_for_ack(&mut self, message_id: [u8; MESSAGE_ID_LEN]) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.ack_waiters.insert(message_id, tx);
        rx
    }

    /// Handle one inbound byte frame: dispatch acks vs. encrypted messages
    /// by length (acks are exactly 25 bytes; everything else is parsed as a
    /// message frame and decrypted against `peer_id`'s ratchet, selecting
    /// the key via the frame's cleartext preamble).
    pub fn handle_inbound(&mut self, bytes: &[u8], peer_id: &str, max_size: usize) -> Result<Option<Vec<u8>>, Error> {
        if bytes.len() == ACK_FRAME_LEN {
            let ack = frame::decode_ack(bytes)?;
            self.handle_ack(ack);
            return Ok(None);
        }
        let parsed = frame::parse_frame(bytes, max_size)?;
        let ratchet = self.ratchet_for(peer_id)?;
        let key = ratchet::ratchet_recv(
            ratchet,
            parsed.preamble.dh_pub,
            parsed.preamble.message_number,
            parsed.preamble.prev_chain_len,
        )?;
        let (_, plaintext) = frame::decode_frame(&key, &parsed)?;
        self.observer.on_message(peer_id, &plaintext);
        Ok(Some(plaintext))
    }

    fn handle_ack(&mut self, ack: AckFrame) {
        if let Some(tx) = self.ack_waiters.remove(&ack.message_id) {
            let _ = tx.send(ack.success);
        }
        self.outbound.retain(|m| m.frame.message_id != ack.message_id || !ack.success);
    }

    /// Reschedule an unacknowledged message for retry, dropping it after
    /// [`MAX_RETRIES`] attempts.
    pub fn schedule_retry(&mut self, message_id: [u8; MESSAGE_ID_LEN], now: Instant) {
        if let Some(msg) = self.outbound.iter_mut().find(|m| m.frame.message_id == message_id) {
            msg.retry_count += 1;
            if msg.retry_count > MAX_RETRIES {
                self.outbound.retain(|m| m.frame.message_id != message_id);
                return;
            }
            msg.next_retry = now + next_backoff(msg.retry_count);
        }
    }

    /// Whether `code` should prevent reconnection.
    pub fn is_fatal_close(code: u16) -> bool {
        CloseCode::is_fatal(code)
    }

    pub fn next_reconnect_delay(&mut self) -> Duration {
        self.retry_count_for_reconnect += 1;
        next_backoff(self.retry_count_for_reconnect)
    }

    pub fn reset_backoff(&mut self) {
        self.retry_count_for_reconnect = 0;
    }

    pub fn pending_outbound_count(&self) -> usize {
        self.outbound.len()
    }

    /// Drive `connect_fn` to (re)establish a channel, run the handshake, and
    /// service inbound frames plus ack-timeout retries until a fatal close
    /// is received. A non-fatal close or a failed `connect_fn` call backs
    /// off via [`Self::next_reconnect_delay`] and loops back to reconnect;
    /// a successful handshake resets that backoff.
    pub async fn run_with_reconnect<F, Fut>(&mut self, mut connect_fn: F, now_ms: impl Fn() -> u64) -> Result<(), Error>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<C, Error>>,
    {
        loop {
            let channel = match connect_fn().await {
                Ok(channel) => channel,
                Err(e) => {
                    self.observer.on_error(&e);
                    tokio::time::sleep(self.next_reconnect_delay()).await;
                    continue;
                }
            };

            if let Err(e) = self.connect(channel, now_ms()).await {
                self.observer.on_error(&e);
                tokio::time::sleep(self.next_reconnect_delay()).await;
                continue;
            }
            self.reset_backoff();

            let mut channel = self.channel.take().expect("connect() just populated self.channel");
            loop {
                tokio::select! {
                    event = channel.recv() => {
                        match event {
                            Ok(ChannelEvent::Frame(bytes)) => {
                                if let Err(e) = self.handle_inbound(&bytes, SERVER_PEER_ID, DEFAULT_MAX_MESSAGE_SIZE) {
                                    self.observer.on_error(&e);
                                }
                            }
                            Ok(ChannelEvent::Closed(code, reason)) => {
                                self.observer.on_disconnected();
                                if ClientSession::<C>::is_fatal_close(code) {
                                    return Err(Error::ChannelClosed { code, reason });
                                }
                                break;
                            }
                            Err(e) => {
                                self.observer.on_error(&e);
                                break;
                            }
                        }
                    }
                    Some(message_id) = self.retry_rx.recv() => {
                        self.schedule_retry(message_id, Instant::now());
                    }
                }
            }
        }
    }
}

/// `min(base * 2^(n-1), cap)` exponential backoff with a hardcoded
/// base/cap/retry-limit.
fn next_backoff(attempt: u32) -> Duration {
    let scaled = BACKOFF_BASE.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
    scaled.min(BACKOFF_CAP)
}

pub const ACK_WAIT_TIMEOUT: Duration = ACK_TIMEOUT;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        assert_eq!(next_backoff(1), Duration::from_secs(1));
        assert_eq!(next_backoff(2), Duration::from_secs(2));
        assert_eq!(next_backoff(3), Duration::from_secs(4));
        assert_eq!(next_backoff(10), Duration::from_secs(60));
        assert_eq!(next_backoff(20), Duration::from_secs(60));
    }

    #[test]
    fn fatal_close_codes_cover_every_close_code_variant() {
        for code in [1000, 1002, 1003, 1007, 1008, 1009, 1011] {
            assert!(ClientSession::<NoopChannel>::is_fatal_close(code));
        }
        assert!(!ClientSession::<NoopChannel>::is_fatal_close(1006));
    }

    struct NoopChannel;

    #[async_trait]
    impl DuplexChannel for NoopChannel {
        async fn send(&mut self, _bytes: Vec<u8>) -> Result<(), Error> {
            Ok(())
        }
        async fn close(&mut self, _code: u16, _reason: &str) -> Result<(), Error> {
            Ok(())
        }
        async fn recv(&mut self) -> Result<ChannelEvent, Error> {
            Ok(ChannelEvent::Closed(1000, "noop".into()))
        }
    }
}
