//! Three-message, byte-exact authenticated handshake.
//!
//! A Signal-style X3DH agreement simplified for the mutually-present case:
//! initiator and responder are both online for the duration of the
//! handshake, so there is no pre-key bundle to fetch out-of-band in advance.

use ed25519_dalek::{SigningKey, VerifyingKey};
use x25519_dalek::PublicKey as XPublicKey;
use zeroize::Zeroize;

use crate::identity::EphemeralKeyPair;
use crate::kdf::{self, KdfError};
use crate::nonce::{NonceError, NonceTracker};
use crate::primitives::{self, PrimitiveError};

pub const INITIATOR_INIT_LEN: usize = 152;
pub const RESPONDER_REPLY_LEN: usize = 116;
pub const NONCE_LEN: usize = 16;
const TIMESTAMP_SKEW_MS: i64 = 5 * 60 * 1000;
const PREKEY_AAD: &[u8] = b"handshake-prekey";

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Primitive(#[from] PrimitiveError),
    #[error(transparent)]
    Kdf(#[from] KdfError),
    #[error(transparent)]
    Nonce(#[from] NonceError),
    #[error("frame has the wrong length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("identity signature did not verify")]
    SignatureInvalid,
    #[error("timestamp is outside the +/-5 minute window")]
    TimestampOutOfRange,
    #[error("handshake nonce was already seen")]
    ReplayDetected,
    #[error("prekey decryption failed")]
    PrekeyDecryptFailed,
}

/// Parsed, verified `InitiatorInit`.
#[derive(Debug)]
pub struct InitiatorInit {
    pub client_ephemeral_pub: XPublicKey,
    pub client_identity_pub: VerifyingKey,
    pub timestamp_ms: u64,
    pub nonce: [u8; NONCE_LEN],
}

fn signed_transcript(
    client_ephemeral_pub: &[u8; 32],
    client_identity_pub: &[u8; 32],
    timestamp_ms: u64,
    nonce: &[u8; NONCE_LEN],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + 32 + 8 + NONCE_LEN);
    out.extend_from_slice(client_ephemeral_pub);
    out.extend_from_slice(client_identity_pub);
    out.extend_from_slice(&timestamp_ms.to_be_bytes());
    out.extend_from_slice(nonce);
    out
}

/// Build the 152-byte `InitiatorInit` frame.
pub fn build_initiator_init(
    identity_signing_key: &SigningKey,
    ephemeral: &EphemeralKeyPair,
    timestamp_ms: u64,
    nonce: [u8; NONCE_LEN],
) -> [u8; INITIATOR_INIT_LEN] {
    let client_ephemeral_pub = *ephemeral.public.as_bytes();
    let client_identity_pub = identity_signing_key.verifying_key().to_bytes();
    let transcript = signed_transcript(&client_ephemeral_pub, &client_identity_pub, timestamp_ms, &nonce);
    let signature = primitives::ed25519_sign(identity_signing_key, &transcript);

    let mut out = [0u8; INITIATOR_INIT_LEN];
    out[0..32].copy_from_slice(&client_ephemeral_pub);
    out[32..64].copy_from_slice(&client_identity_pub);
    out[64..128].copy_from_slice(&signature);
    out[128..136].copy_from_slice(&timestamp_ms.to_be_bytes());
    out[136..152].copy_from_slice(&nonce);
    out
}

/// Verify a received `InitiatorInit`: length, signature, timestamp skew, and
/// nonce uniqueness (via `tracker`). Returns the parsed fields on success.
pub fn verify_initiator_init(
    bytes: &[u8],
    tracker: &NonceTracker,
    now_ms: i64,
) -> Result<InitiatorInit, HandshakeError> {
    if bytes.len() != INITIATOR_INIT_LEN {
        return Err(HandshakeError::InvalidLength {
            expected: INITIATOR_INIT_LEN,
            got: bytes.len(),
        });
    }
    let mut client_ephemeral_pub = [0u8; 32];
    client_ephemeral_pub.copy_from_slice(&bytes[0..32]);
    let mut client_identity_pub = [0u8; 32];
    client_identity_pub.copy_from_slice(&bytes[32..64]);
    let signature = &bytes[64..128];
    let timestamp_ms = u64::from_be_bytes(bytes[128..136].try_into().unwrap());
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&bytes[136..152]);

    let verifying_key =
        VerifyingKey::from_bytes(&client_identity_pub).map_err(|_| HandshakeError::SignatureInvalid)?;
    let transcript = signed_transcript(&client_ephemeral_pub, &client_identity_pub, timestamp_ms, &nonce);
    primitives::ed25519_verify(&verifying_key, &transcript, signature)
        .map_err(|_| HandshakeError::SignatureInvalid)?;

    if (now_ms - timestamp_ms as i64).abs() > TIMESTAMP_SKEW_MS {
        return Err(HandshakeError::TimestampOutOfRange);
    }

    if tracker.check(nonce, now_ms) == crate::nonce::NonceOutcome::Replay {
        return Err(HandshakeError::ReplayDetected);
    }

    Ok(InitiatorInit {
        client_ephemeral_pub: XPublicKey::from(client_ephemeral_pub),
        client_identity_pub: verifying_key,
        timestamp_ms,
        nonce,
    })
}

/// Result of the responder building its reply: the wire bytes plus the
/// derived root key (needed to initialize the responder's ratchet).
pub struct ResponderReplyResult {
    pub wire_bytes: [u8; RESPONDER_REPLY_LEN],
    pub root_key: [u8; 32],
    pub server_ephemeral: EphemeralKeyPair,
}

/// Build the 116-byte `ResponderReply` in answer to a verified
/// `InitiatorInit`. Encrypts a fresh random 32-byte prekey under the
/// HKDF-derived root key.
pub fn build_responder_reply(
    client_ephemeral_pub: &XPublicKey,
    timestamp_ms: u64,
    nonce: [u8; NONCE_LEN],
) -> Result<ResponderReplyResult, HandshakeError> {
    let server_ephemeral = EphemeralKeyPair::generate();
    let mut ss = primitives::x25519_shared_secret(&server_ephemeral.secret, client_ephemeral_pub);
    let root_key = kdf::derive_root(&ss)?;
    ss.zeroize();

    let mut prekey = [0u8; 32];
    primitives::random_bytes(&mut prekey);
    let mut iv = [0u8; 12];
    primitives::random_bytes(&mut iv);
    let encrypted = primitives::aes_gcm_encrypt(&root_key, &iv, &prekey, PREKEY_AAD)?;
    prekey.zeroize();
    if encrypted.len() != 32 + primitives::TAG_LEN {
        return Err(HandshakeError::Primitive(PrimitiveError::InvalidLength {
            expected: 32 + primitives::TAG_LEN,
            got: encrypted.len(),
        }));
    }

    let mut wire_bytes = [0u8; RESPONDER_REPLY_LEN];
    wire_bytes[0..32].copy_from_slice(server_ephemeral.public.as_bytes());
    wire_bytes[32..64].copy_from_slice(&encrypted[..32]);
    wire_bytes[64..80].copy_from_slice(&encrypted[32..48]);
    wire_bytes[80..92].copy_from_slice(&iv);
    wire_bytes[92..100].copy_from_slice(&timestamp_ms.to_be_bytes());
    wire_bytes[100..116].copy_from_slice(&nonce);

    Ok(ResponderReplyResult {
        wire_bytes,
        root_key,
        server_ephemeral,
    })
}

/// Result of initiator-side processing of a `ResponderReply`.
pub struct InitiatorHandshakeResult {
    pub root_key: [u8; 32],
    pub server_ephemeral_pub: XPublicKey,
}

/// Recompute the shared secret, derive the root key, and decrypt/verify the
/// prekey. The clock-skew check is repeated here against the reply's own
/// timestamp field.
pub fn process_responder_reply(
    client_ephemeral: &EphemeralKeyPair,
    bytes: &[u8],
    now_ms: i64,
) -> Result<InitiatorHandshakeResult, HandshakeError> {
    if bytes.len() != RESPONDER_REPLY_LEN {
        return Err(HandshakeError::InvalidLength {
            expected: RESPONDER_REPLY_LEN,
            got: bytes.len(),
        });
    }
    let mut server_ephemeral_pub = [0u8; 32];
    server_ephemeral_pub.copy_from_slice(&bytes[0..32]);
    let mut encrypted = Vec::with_capacity(48);
    encrypted.extend_from_slice(&bytes[32..64]);
    encrypted.extend_from_slice(&bytes[64..80]);
    let mut iv = [0u8; 12];
    iv.copy_from_slice(&bytes[80..92]);
    let timestamp_ms = u64::from_be_bytes(bytes[92..100].try_into().unwrap());

    if (now_ms - timestamp_ms as i64).abs() > TIMESTAMP_SKEW_MS {
        return Err(HandshakeError::TimestampOutOfRange);
    }

    let server_pub = XPublicKey::from(server_ephemeral_pub);
    let mut ss = primitives::x25519_shared_secret(&client_ephemeral.secret, &server_pub);
    let root_key = kdf::derive_root(&ss)?;
    ss.zeroize();

    let prekey = primitives::aes_gcm_decrypt(&root_key, &iv, &encrypted, PREKEY_AAD)
        .map_err(|_| HandshakeError::PrekeyDecryptFailed)?;
    if prekey.len() != 32 {
        return Err(HandshakeError::PrekeyDecryptFailed);
    }

    Ok(InitiatorHandshakeResult {
        root_key,
        server_ephemeral_pub: server_pub,
    })
}
