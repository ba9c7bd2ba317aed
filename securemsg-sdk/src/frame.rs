//! Deterministic big-endian wire framing for encrypted messages and acks,
//! a dense binary layout suited to a raw duplex byte stream.
//!
//! Key-selection fields (`dh_pub`, `message_number`, `prev_chain_len`) and
//! the per-channel `sequence` counter travel twice: once in a cleartext
//! preamble a reader can check *before* it can derive any key — the ratchet
//! needs `dh_pub`/`message_number`/`prev_chain_len` to pick the right step,
//! and a relay that holds no message keys at all needs `sequence` to
//! enforce strict ordering — and once more inside the AEAD-encrypted
//! header, which binds all four to the body ciphertext as AAD.
//! `decode_frame` requires the two copies to match, so a tampered preamble
//! is caught even though it must be read in the clear. Encrypting the
//! *only* copy of fields a reader needs before it has a key would be
//! unrecoverable, hence the cleartext preamble exists at all.

use crate::primitives::{self, PrimitiveError, IV_LEN, TAG_LEN};
use crate::ratchet::MessageKeyMaterial;

pub const HEADER_PLAINTEXT_LEN: usize = 44;
pub const HEADER_CIPHERTEXT_LEN: usize = HEADER_PLAINTEXT_LEN + TAG_LEN;
pub const PREAMBLE_LEN: usize = 44;
pub const ACK_FRAME_LEN: usize = 25;
pub const MESSAGE_ID_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error(transparent)]
    Primitive(#[from] PrimitiveError),
    #[error("frame is shorter than the minimum required length")]
    Truncated,
    #[error("frame exceeds the configured maximum size")]
    TooBig,
    #[error("declared length field does not match actual remaining bytes")]
    LengthMismatch,
    #[error("outer MAC verification failed")]
    MacMismatch,
    #[error("sequence number in outer envelope does not match the encrypted header")]
    SequenceMismatch { outer: u32, inner: u32 },
    #[error("cleartext key-selection preamble does not match the authenticated header")]
    PreambleMismatch,
}

/// Fields a reader needs before it can derive any key: `dh_pub`,
/// `message_number` and `prev_chain_len` select the ratchet step; `sequence`
/// is the per-channel counter a relay holding no message keys at all still
/// needs to enforce strict ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    pub sequence: u32,
    pub dh_pub: [u8; 32],
    pub message_number: u32,
    pub prev_chain_len: u32,
}

impl Preamble {
    fn to_bytes(self) -> [u8; PREAMBLE_LEN] {
        let mut out = [0u8; PREAMBLE_LEN];
        out[0..4].copy_from_slice(&self.sequence.to_be_bytes());
        out[4..36].copy_from_slice(&self.dh_pub);
        out[36..40].copy_from_slice(&self.message_number.to_be_bytes());
        out[40..44].copy_from_slice(&self.prev_chain_len.to_be_bytes());
        out
    }

    fn from_bytes(buf: &[u8; PREAMBLE_LEN]) -> Self {
        let mut dh_pub = [0u8; 32];
        dh_pub.copy_from_slice(&buf[4..36]);
        Preamble {
            sequence: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            dh_pub,
            message_number: u32::from_be_bytes(buf[36..40].try_into().unwrap()),
            prev_chain_len: u32::from_be_bytes(buf[40..44].try_into().unwrap()),
        }
    }
}

/// The 44-byte authenticated header, encrypted once the message key is
/// known. Carries the same key-selection fields as the preamble plus the
/// outer sequence number, so the outer MAC's sequence binding and the
/// preamble's key-selection binding are both covered by one AEAD call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlainHeader {
    pub sequence: u32,
    pub dh_pub: [u8; 32],
    pub message_number: u32,
    pub prev_chain_len: u32,
}

impl PlainHeader {
    fn to_bytes(self) -> [u8; HEADER_PLAINTEXT_LEN] {
        let mut out = [0u8; HEADER_PLAINTEXT_LEN];
        out[0..4].copy_from_slice(&self.sequence.to_be_bytes());
        out[4..36].copy_from_slice(&self.dh_pub);
        out[36..40].copy_from_slice(&self.message_number.to_be_bytes());
        out[40..44].copy_from_slice(&self.prev_chain_len.to_be_bytes());
        out
    }

    fn from_bytes(buf: &[u8; HEADER_PLAINTEXT_LEN]) -> Self {
        let mut dh_pub = [0u8; 32];
        dh_pub.copy_from_slice(&buf[4..36]);
        PlainHeader {
            sequence: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            dh_pub,
            message_number: u32::from_be_bytes(buf[36..40].try_into().unwrap()),
            prev_chain_len: u32::from_be_bytes(buf[40..44].try_into().unwrap()),
        }
    }

    fn preamble(self) -> Preamble {
        Preamble {
            sequence: self.sequence,
            dh_pub: self.dh_pub,
            message_number: self.message_number,
            prev_chain_len: self.prev_chain_len,
        }
    }
}

/// A fully assembled on-wire encrypted message frame.
#[derive(Debug, Clone)]
pub struct EncryptedFrame {
    pub message_id: [u8; MESSAGE_ID_LEN],
    pub preamble: Preamble,
    pub body_iv: [u8; IV_LEN],
    pub encrypted_header: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub mac: [u8; 32],
    pub timestamp_ms: u64,
    pub version: u32,
}

/// Encrypt `plaintext` under `key` into a fully framed message. `sequence`
/// is the outer per-channel counter; `key`'s own `dh_pub`/`prev_chain_len`
/// come from the ratchet step that produced it.
///
/// The body IV travels in the clear alongside the preamble: it is not
/// secret, and the receiver needs it before it can run AES-GCM, so it
/// cannot be sourced from `key.iv` the way the sender's copy is (the
/// receiving side's `MessageKeyMaterial` carries no meaningful IV of its
/// own, since ratchet key derivation has no way to predict it).
pub fn encode_frame(
    key: &MessageKeyMaterial,
    header: PlainHeader,
    plaintext: &[u8],
    timestamp_ms: u64,
    version: u32,
) -> Result<EncryptedFrame, FrameError> {
    let mut message_id = [0u8; MESSAGE_ID_LEN];
    primitives::random_bytes(&mut message_id);

    let mut body_iv = [0u8; IV_LEN];
    primitives::random_bytes(&mut body_iv);
    let ciphertext = primitives::aes_gcm_encrypt(&key.enc_key, &body_iv, plaintext, b"")?;

    let mut header_iv = [0u8; IV_LEN];
    primitives::random_bytes(&mut header_iv);
    let header_plain = header.to_bytes();
    let header_ct = primitives::aes_gcm_encrypt(&key.enc_key, &header_iv, &header_plain, &ciphertext)?;

    let mut encrypted_header = Vec::with_capacity(IV_LEN + header_ct.len());
    encrypted_header.extend_from_slice(&header_iv);
    encrypted_header.extend_from_slice(&header_ct);

    let mut mac_input = Vec::with_capacity(4 + encrypted_header.len() + ciphertext.len());
    mac_input.extend_from_slice(&header.sequence.to_be_bytes());
    mac_input.extend_from_slice(&encrypted_header);
    mac_input.extend_from_slice(&ciphertext);
    let mac = primitives::hmac_sha256(&key.mac_key, &mac_input)?;

    Ok(EncryptedFrame {
        message_id,
        preamble: header.preamble(),
        body_iv,
        encrypted_header,
        ciphertext,
        mac,
        timestamp_ms,
        version,
    })
}

/// Decrypt a frame's header and body given the message key the caller
/// selected from `frame.preamble` via `ratchet_recv`. Verifies the outer
/// MAC, the preamble/header binding, and the outer/inner sequence binding
/// before returning plaintext.
pub fn decode_frame(key: &MessageKeyMaterial, frame: &EncryptedFrame) -> Result<(PlainHeader, Vec<u8>), FrameError> {
    if frame.encrypted_header.len() < IV_LEN + TAG_LEN {
        return Err(FrameError::Truncated);
    }

    let mut mac_input = Vec::with_capacity(4 + frame.encrypted_header.len() + frame.ciphertext.len());
    let header_iv: [u8; IV_LEN] = frame.encrypted_header[..IV_LEN].try_into().unwrap();
    let header_ct = &frame.encrypted_header[IV_LEN..];
    let header_plain_bytes = primitives::aes_gcm_decrypt(&key.enc_key, &header_iv, header_ct, &frame.ciphertext)?;
    if header_plain_bytes.len() != HEADER_PLAINTEXT_LEN {
        return Err(FrameError::LengthMismatch);
    }
    let header_array: [u8; HEADER_PLAINTEXT_LEN] = header_plain_bytes.try_into().unwrap();
    let header = PlainHeader::from_bytes(&header_array);

    if header.preamble() != frame.preamble {
        return Err(FrameError::PreambleMismatch);
    }

    mac_input.extend_from_slice(&header.sequence.to_be_bytes());
    mac_input.extend_from_slice(&frame.encrypted_header);
    mac_input.extend_from_slice(&frame.ciphertext);
    let expected_mac = primitives::hmac_sha256(&key.mac_key, &mac_input)?;
    if !primitives::constant_time_eq(&expected_mac, &frame.mac) {
        return Err(FrameError::MacMismatch);
    }

    if header.message_number != key.index {
        return Err(FrameError::SequenceMismatch {
            outer: key.index,
            inner: header.message_number,
        });
    }

    let plaintext = primitives::aes_gcm_decrypt(&key.enc_key, &frame.body_iv, &frame.ciphertext, b"")?;
    Ok((header, plaintext))
}

/// Serialize a frame to the length-prefixed wire layout: message_id,
/// preamble, body IV, length-prefixed encrypted header, length-prefixed
/// ciphertext, length-prefixed outer MAC, timestamp, version.
pub fn serialize_frame(frame: &EncryptedFrame) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        MESSAGE_ID_LEN
            + PREAMBLE_LEN
            + IV_LEN
            + 4
            + frame.encrypted_header.len()
            + 4
            + frame.ciphertext.len()
            + 4
            + frame.mac.len()
            + 12,
    );
    out.extend_from_slice(&frame.message_id);
    out.extend_from_slice(&frame.preamble.to_bytes());
    out.extend_from_slice(&frame.body_iv);
    out.extend_from_slice(&(frame.encrypted_header.len() as u32).to_be_bytes());
    out.extend_from_slice(&frame.encrypted_header);
    out.extend_from_slice(&(frame.ciphertext.len() as u32).to_be_bytes());
    out.extend_from_slice(&frame.ciphertext);
    out.extend_from_slice(&(frame.mac.len() as u32).to_be_bytes());
    out.extend_from_slice(&frame.mac);
    out.extend_from_slice(&frame.timestamp_ms.to_be_bytes());
    out.extend_from_slice(&frame.version.to_be_bytes());
    out
}

/// Parse the length-prefixed wire layout, validating every declared length
/// against the bytes actually present and against `max_size`. Does not
/// require any key: this is what a caller runs before selecting a message
/// key via `frame.preamble`.
pub fn parse_frame(bytes: &[u8], max_size: usize) -> Result<EncryptedFrame, FrameError> {
    if bytes.len() > max_size {
        return Err(FrameError::TooBig);
    }
    let mut pos = 0usize;
    let take = |pos: &mut usize, n: usize, bytes: &[u8]| -> Result<Vec<u8>, FrameError> {
        if bytes.len() < *pos + n {
            return Err(FrameError::Truncated);
        }
        let slice = bytes[*pos..*pos + n].to_vec();
        *pos += n;
        Ok(slice)
    };

    let message_id_v = take(&mut pos, MESSAGE_ID_LEN, bytes)?;
    let preamble_v = take(&mut pos, PREAMBLE_LEN, bytes)?;
    let preamble_array: [u8; PREAMBLE_LEN] = preamble_v.try_into().unwrap();
    let preamble = Preamble::from_bytes(&preamble_array);

    let body_iv_v = take(&mut pos, IV_LEN, bytes)?;
    let mut body_iv = [0u8; IV_LEN];
    body_iv.copy_from_slice(&body_iv_v);

    let hdr_len_v = take(&mut pos, 4, bytes)?;
    let hdr_len = u32::from_be_bytes(hdr_len_v.try_into().unwrap()) as usize;
    let encrypted_header = take(&mut pos, hdr_len, bytes)?;

    let ct_len_v = take(&mut pos, 4, bytes)?;
    let ct_len = u32::from_be_bytes(ct_len_v.try_into().unwrap()) as usize;
    let ciphertext = take(&mut pos, ct_len, bytes)?;

    let mac_len_v = take(&mut pos, 4, bytes)?;
    let mac_len = u32::from_be_bytes(mac_len_v.try_into().unwrap()) as usize;
    let mac_v = take(&mut pos, mac_len, bytes)?;
    if mac_len != 32 {
        return Err(FrameError::LengthMismatch);
    }

    let ts_v = take(&mut pos, 8, bytes)?;
    let version_v = take(&mut pos, 4, bytes)?;

    if pos != bytes.len() {
        return Err(FrameError::LengthMismatch);
    }

    let mut message_id = [0u8; MESSAGE_ID_LEN];
    message_id.copy_from_slice(&message_id_v);
    let mut mac = [0u8; 32];
    mac.copy_from_slice(&mac_v);

    Ok(EncryptedFrame {
        message_id,
        preamble,
        body_iv,
        encrypted_header,
        ciphertext,
        mac,
        timestamp_ms: u64::from_be_bytes(ts_v.try_into().unwrap()),
        version: u32::from_be_bytes(version_v.try_into().unwrap()),
    })
}

/// A 25-byte acknowledgment frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFrame {
    pub message_id: [u8; MESSAGE_ID_LEN],
    pub received_at_ms: u64,
    pub success: bool,
}

pub fn encode_ack(ack: AckFrame) -> [u8; ACK_FRAME_LEN] {
    let mut out = [0u8; ACK_FRAME_LEN];
    out[0..16].copy_from_slice(&ack.message_id);
    out[16..24].copy_from_slice(&ack.received_at_ms.to_be_bytes());
    out[24] = ack.success as u8;
    out
}

pub fn decode_ack(bytes: &[u8]) -> Result<AckFrame, FrameError> {
    if bytes.len() != ACK_FRAME_LEN {
        return Err(FrameError::Truncated);
    }
    let mut message_id = [0u8; MESSAGE_ID_LEN];
    message_id.copy_from_slice(&bytes[0..16]);
    Ok(AckFrame {
        message_id,
        received_at_ms: u64::from_be_bytes(bytes[16..24].try_into().unwrap()),
        success: bytes[24] != 0,
    })
}
