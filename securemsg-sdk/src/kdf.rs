//! Named key derivations. Every HKDF call in this crate goes through here so
//! the wire-visible info strings live in one place rather than scattered
//! across the ratchet and handshake modules.
//!
//! All derivations are HKDF-Extract-then-Expand over SHA-256 with a 32-byte
//! zero-block salt unless the caller supplies one. The per-transition chain
//! info string is built deterministically from a direction tag and a
//! transcript step counter rather than a wall-clock timestamp, so two
//! correctly-implemented endpoints that step at different real times still
//! agree on the derived key.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::primitives::PrimitiveError;

pub const INFO_ROOT: &[u8] = b"SecureMessenger-RootKey";
pub const INFO_CHAIN: &[u8] = b"SecureMessenger-ChainKey";
pub const INFO_MESSAGE: &[u8] = b"SecureMessenger-MessageKey";
pub const INFO_MAC: &[u8] = b"mac-key";

const ZERO_SALT: [u8; 32] = [0u8; 32];

#[derive(Debug, thiserror::Error)]
pub enum KdfError {
    #[error(transparent)]
    Primitive(#[from] PrimitiveError),
    #[error("HKDF expand failed: output too long")]
    ExpandTooLong,
}

/// Which party originates a chain, folded into its info string so the two
/// chains stepped from one root never collide. Labelled by role rather than
/// by "sending"/"receiving" so both the initiator and the responder derive
/// byte-identical keys for a given channel: the initiator's sending chain
/// and the responder's receiving chain are the same `InitiatorToResponder`
/// chain viewed from opposite ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainDirection {
    InitiatorToResponder,
    ResponderToInitiator,
}

fn hkdf_derive(salt: &[u8], ikm: &[u8], info: &[u8], out: &mut [u8]) -> Result<(), KdfError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    hk.expand(info, out).map_err(|_| KdfError::ExpandTooLong)
}

/// `HKDF(ikm, salt=0, info="SecureMessenger-RootKey", 32)`. Used both for the
/// handshake's initial root key (`ikm = ss`) and for a DH ratchet step
/// (`ikm = root_key || ss`).
pub fn derive_root(ikm: &[u8]) -> Result<[u8; 32], KdfError> {
    let mut root = [0u8; 32];
    hkdf_derive(&ZERO_SALT, ikm, INFO_ROOT, &mut root)?;
    Ok(root)
}

/// Derive a fresh chain key from a (just-updated) root key after a DH step,
/// or from the handshake's initial root key. The info string is the fixed
/// chain tag plus a direction byte and the big-endian transcript step
/// counter, making the derivation deterministic and reproducible by both
/// peers without relying on wall-clock agreement.
pub fn derive_chain(root_key: &[u8; 32], direction: ChainDirection, step: u32) -> Result<[u8; 32], KdfError> {
    let mut info = Vec::with_capacity(INFO_CHAIN.len() + 1 + 4);
    info.extend_from_slice(INFO_CHAIN);
    info.push(match direction {
        ChainDirection::InitiatorToResponder => 0x01,
        ChainDirection::ResponderToInitiator => 0x02,
    });
    info.extend_from_slice(&step.to_be_bytes());
    let mut chain = [0u8; 32];
    hkdf_derive(&ZERO_SALT, root_key, &info, &mut chain)?;
    Ok(chain)
}

/// `HKDF(chain_key, salt=0, info="SecureMessenger-MessageKey", 64)`, split as
/// `enc_key(32) || next_chain_key(32)`.
pub fn derive_message(chain_key: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), KdfError> {
    let mut okm = [0u8; 64];
    hkdf_derive(&ZERO_SALT, chain_key, INFO_MESSAGE, &mut okm)?;
    let mut enc_key = [0u8; 32];
    let mut next_chain = [0u8; 32];
    enc_key.copy_from_slice(&okm[..32]);
    next_chain.copy_from_slice(&okm[32..]);
    Ok((enc_key, next_chain))
}

/// `HKDF(enc_key, salt=0, info="mac-key", 32)`.
pub fn derive_mac(enc_key: &[u8; 32]) -> Result<[u8; 32], KdfError> {
    let mut mac = [0u8; 32];
    hkdf_derive(&ZERO_SALT, enc_key, INFO_MAC, &mut mac)?;
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_derivation_is_deterministic() {
        let ss = [5u8; 32];
        assert_eq!(derive_root(&ss).unwrap(), derive_root(&ss).unwrap());
    }

    #[test]
    fn root_step_changes_with_concatenated_ikm() {
        let root = [1u8; 32];
        let mut ikm_a = root.to_vec();
        ikm_a.extend_from_slice(&[2u8; 32]);
        let mut ikm_b = root.to_vec();
        ikm_b.extend_from_slice(&[3u8; 32]);
        assert_ne!(derive_root(&ikm_a).unwrap(), derive_root(&ikm_b).unwrap());
    }

    #[test]
    fn chain_derivation_separates_direction_and_step() {
        let root = [9u8; 32];
        let i2r = derive_chain(&root, ChainDirection::InitiatorToResponder, 0).unwrap();
        let r2i = derive_chain(&root, ChainDirection::ResponderToInitiator, 0).unwrap();
        let i2r_step1 = derive_chain(&root, ChainDirection::InitiatorToResponder, 1).unwrap();
        assert_ne!(i2r, r2i);
        assert_ne!(i2r, i2r_step1);
        assert_eq!(
            i2r,
            derive_chain(&root, ChainDirection::InitiatorToResponder, 0).unwrap()
        );
    }

    #[test]
    fn message_derivation_splits_enc_and_next_chain() {
        let chain = [3u8; 32];
        let (enc1, next1) = derive_message(&chain).unwrap();
        assert_ne!(enc1, next1);
        let (enc2, next2) = derive_message(&next1).unwrap();
        assert_ne!(enc1, enc2);
        assert_ne!(next1, next2);
    }

    #[test]
    fn mac_subkey_is_bound_to_enc_key() {
        let a = derive_mac(&[1u8; 32]).unwrap();
        let b = derive_mac(&[2u8; 32]).unwrap();
        assert_ne!(a, b);
    }
}
