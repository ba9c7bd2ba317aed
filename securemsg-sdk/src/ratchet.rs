//! Symmetric Double-Ratchet state machine: root key, per-direction chain
//! keys, the local ephemeral DH keypair, the skipped-message-key cache, and
//! send/receive counters.
//!
//! Split into named `ratchet_send`/`ratchet_recv`/`ratchet_initialize`/
//! `ratchet_destroy` functions, rather than inlined into one opaque
//! `encrypt`/`decrypt` pair, so each rule of the receive-step algorithm is
//! independently testable.

use std::collections::{HashMap, VecDeque};

use x25519_dalek::{PublicKey as XPublicKey, StaticSecret as XStaticSecret};
use zeroize::Zeroize;

use crate::kdf::{self, ChainDirection, KdfError};
use crate::primitives::{self, KEY_LEN};

/// Skipped-message-key cache and general chain bookkeeping are capped here
/// to bound memory under a burst of out-of-order or dropped messages.
pub const MAX_SKIPPED_KEYS: usize = 1000;
const MAX_CHAIN_INDEX: u32 = u32::MAX;

#[derive(Debug, thiserror::Error)]
pub enum RatchetError {
    #[error(transparent)]
    Kdf(#[from] KdfError),
    #[error("sending chain exhausted at 2^32 - 1 messages; a new handshake is required")]
    ChainExhausted,
    #[error("more than {MAX_SKIPPED_KEYS} messages would need to be skipped")]
    TooManySkipped,
    #[error("message references a key from a superseded chain that is no longer cached")]
    OldChainKeyMissing,
    #[error("no sending chain is established")]
    NoSendingChain,
    #[error("no receiving chain is established")]
    NoReceivingChain,
}

/// A single derived, single-use message key. Every field is zeroized when
/// this value is dropped. Carries no IV of its own: the body IV a frame is
/// encrypted or decrypted under travels on the wire alongside the frame,
/// since ratchet key derivation has no way to predict it.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct MessageKeyMaterial {
    pub enc_key: [u8; KEY_LEN],
    pub mac_key: [u8; KEY_LEN],
    #[zeroize(skip)]
    pub index: u32,
}

impl std::fmt::Debug for MessageKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageKeyMaterial")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Zeroize)]
#[zeroize(drop)]
struct ChainKey {
    key: [u8; 32],
    #[zeroize(skip)]
    index: u32,
}

/// Which end of the handshake a ratchet belongs to; fixes which of the two
/// symmetric chain labels is this party's sending chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    fn sending_direction(self) -> ChainDirection {
        match self {
            Role::Initiator => ChainDirection::InitiatorToResponder,
            Role::Responder => ChainDirection::ResponderToInitiator,
        }
    }

    fn receiving_direction(self) -> ChainDirection {
        match self {
            Role::Initiator => ChainDirection::ResponderToInitiator,
            Role::Responder => ChainDirection::InitiatorToResponder,
        }
    }
}

pub struct RatchetState {
    role: Role,
    root_key: [u8; 32],
    sending_chain: Option<ChainKey>,
    receiving_chain: Option<ChainKey>,
    sending_ephemeral_secret: XStaticSecret,
    sending_ephemeral_public: XPublicKey,
    receiving_ephemeral_public: Option<[u8; 32]>,
    send_counter: u32,
    receive_counter: u32,
    previous_chain_length: u32,
    chain_step: u32,
    skipped: HashMap<([u8; 32], u32), MessageKeyMaterial>,
    skip_order: VecDeque<([u8; 32], u32)>,
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        ratchet_destroy(self);
    }
}

/// Initialize ratchet state from a handshake-derived root key. `local_eph`
/// is this party's ephemeral keypair (already used in the handshake);
/// `remote_eph_pub` is the peer's ephemeral public key from the handshake.
/// Both parties can derive identical initial sending/receiving chains
/// immediately since both ephemeral public keys are already exchanged.
pub fn ratchet_initialize(
    role: Role,
    root_key: [u8; 32],
    local_eph_secret: XStaticSecret,
    remote_eph_pub: [u8; 32],
) -> Result<RatchetState, RatchetError> {
    let local_eph_public = primitives::x25519_derive_public(&local_eph_secret);
    let sending_key = kdf::derive_chain(&root_key, role.sending_direction(), 0)?;
    let receiving_key = kdf::derive_chain(&root_key, role.receiving_direction(), 0)?;
    Ok(RatchetState {
        role,
        root_key,
        sending_chain: Some(ChainKey {
            key: sending_key,
            index: 0,
        }),
        receiving_chain: Some(ChainKey {
            key: receiving_key,
            index: 0,
        }),
        sending_ephemeral_secret: local_eph_secret,
        sending_ephemeral_public: local_eph_public,
        receiving_ephemeral_public: Some(remote_eph_pub),
        send_counter: 0,
        receive_counter: 0,
        previous_chain_length: 0,
        chain_step: 0,
        skipped: HashMap::new(),
        skip_order: VecDeque::new(),
    })
}

/// This party's current ephemeral public key, carried as `dh_pub` in every
/// outbound message header.
pub fn sending_dh_public(state: &RatchetState) -> [u8; 32] {
    *state.sending_ephemeral_public.as_bytes()
}

/// Derive and consume the next sending-chain message key.
pub fn ratchet_send(state: &mut RatchetState) -> Result<MessageKeyMaterial, RatchetError> {
    let chain = state
        .sending_chain
        .as_ref()
        .ok_or(RatchetError::NoSendingChain)?;
    if chain.index == MAX_CHAIN_INDEX {
        return Err(RatchetError::ChainExhausted);
    }
    let (enc_key, next_chain_key) = kdf::derive_message(&chain.key)?;
    let mac_key = kdf::derive_mac(&enc_key)?;
    let index = chain.index;

    state.sending_chain = Some(ChainKey {
        key: next_chain_key,
        index: index + 1,
    });
    state.send_counter = index + 1;

    Ok(MessageKeyMaterial { enc_key, mac_key, index })
}

fn cache_skipped(state: &mut RatchetState, dh_pub: [u8; 32], key: MessageKeyMaterial) {
    let cache_key = (dh_pub, key.index);
    if state.skipped.len() >= MAX_SKIPPED_KEYS {
        if let Some(oldest) = state.skip_order.pop_front() {
            state.skipped.remove(&oldest);
        }
    }
    state.skip_order.push_back(cache_key);
    state.skipped.insert(cache_key, key);
}

/// Consume a receiving-chain message key for `remote_dh_pub`/`msg_index`,
/// performing a DH ratchet step first if `remote_dh_pub` is new, and
/// deriving/caching any skipped intermediate keys.
pub fn ratchet_recv(
    state: &mut RatchetState,
    remote_dh_pub: [u8; 32],
    msg_index: u32,
    prev_chain_len: u32,
) -> Result<MessageKeyMaterial, RatchetError> {
    let needs_dh_step = match state.receiving_ephemeral_public {
        None => true,
        Some(current) => !primitives::constant_time_eq(&current, &remote_dh_pub),
    };

    if needs_dh_step {
        let current_chain_index = state.receiving_chain.as_ref().map(|c| c.index).unwrap_or(0);
        state.previous_chain_length = prev_chain_len.max(current_chain_index);

        let remote_public = XPublicKey::from(remote_dh_pub);
        let mut ss = primitives::x25519_shared_secret(&state.sending_ephemeral_secret, &remote_public);
        let mut ikm = state.root_key.to_vec();
        ikm.extend_from_slice(&ss);
        let new_root = kdf::derive_root(&ikm)?;
        ss.zeroize();
        ikm.zeroize();

        state.chain_step += 1;
        let new_receiving_key = kdf::derive_chain(&new_root, state.role.receiving_direction(), state.chain_step)?;
        state.root_key = new_root;
        state.receiving_chain = Some(ChainKey {
            key: new_receiving_key,
            index: 0,
        });
        state.receiving_ephemeral_public = Some(remote_dh_pub);
    }

    if msg_index < state.previous_chain_length {
        let cache_key = (remote_dh_pub, msg_index);
        return match state.skipped.remove(&cache_key) {
            Some(key) => {
                state.skip_order.retain(|k| *k != cache_key);
                Ok(key)
            }
            None => Err(RatchetError::OldChainKeyMissing),
        };
    }

    let chain = state
        .receiving_chain
        .as_ref()
        .ok_or(RatchetError::NoReceivingChain)?;

    if msg_index > chain.index {
        let skip_count = (msg_index - chain.index) as usize;
        if state.skipped.len() + skip_count > MAX_SKIPPED_KEYS {
            return Err(RatchetError::TooManySkipped);
        }
        let mut cursor = state.receiving_chain.take().unwrap();
        while cursor.index < msg_index {
            let (enc_key, next_chain_key) = kdf::derive_message(&cursor.key)?;
            let mac_key = kdf::derive_mac(&enc_key)?;
            let skipped_key = MessageKeyMaterial {
                enc_key,
                mac_key,
                index: cursor.index,
            };
            cache_skipped(state, remote_dh_pub, skipped_key);
            cursor = ChainKey {
                key: next_chain_key,
                index: cursor.index + 1,
            };
        }
        state.receiving_chain = Some(cursor);
    }

    let chain = state.receiving_chain.as_ref().ok_or(RatchetError::NoReceivingChain)?;
    let (enc_key, next_chain_key) = kdf::derive_message(&chain.key)?;
    let mac_key = kdf::derive_mac(&enc_key)?;
    let index = chain.index;
    state.receiving_chain = Some(ChainKey {
        key: next_chain_key,
        index: index + 1,
    });
    state.receive_counter = index + 1;

    Ok(MessageKeyMaterial { enc_key, mac_key, index })
}

/// Number of entries currently held in the skipped-key cache.
pub fn skipped_key_count(state: &RatchetState) -> usize {
    state.skipped.len()
}

/// Zeroize every key byte reachable from the state.
pub fn ratchet_destroy(state: &mut RatchetState) {
    state.root_key.zeroize();
    state.sending_chain = None;
    state.receiving_chain = None;
    state.skipped.clear();
    state.skip_order.clear();
}
