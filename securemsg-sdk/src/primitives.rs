//! Cryptographic primitives: Ed25519, X25519, AES-256-GCM, HMAC-SHA-256,
//! CSPRNG, constant-time equality, and best-effort zeroization.
//!
//! Every size check here is enforced at the boundary and returns a typed
//! error rather than panicking.

use aes_gcm::aead::{Aead, KeyInit, OsRng as AeadOsRng, Payload};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce as GcmNonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rand_core::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret as XStaticSecret};
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

pub const TAG_LEN: usize = 16;
pub const IV_LEN: usize = 12;
pub const KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum PrimitiveError {
    #[error("invalid length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("AEAD authentication failed")]
    AuthFailure,
    #[error("HMAC key of invalid size")]
    BadMacKey,
}

/// Sign `message` with a long-lived Ed25519 identity key.
pub fn ed25519_sign(signing_key: &SigningKey, message: &[u8]) -> [u8; 64] {
    signing_key.sign(message).to_bytes()
}

/// Verify an Ed25519 signature. Returns `Ok(())` on success.
pub fn ed25519_verify(
    verifying_key: &VerifyingKey,
    message: &[u8],
    signature: &[u8],
) -> Result<(), PrimitiveError> {
    if signature.len() != 64 {
        return Err(PrimitiveError::InvalidLength {
            expected: 64,
            got: signature.len(),
        });
    }
    let sig = Signature::from_slice(signature).map_err(|_| PrimitiveError::SignatureInvalid)?;
    verifying_key
        .verify(message, &sig)
        .map_err(|_| PrimitiveError::SignatureInvalid)
}

/// Derive the X25519 public key for a secret.
pub fn x25519_derive_public(secret: &XStaticSecret) -> XPublicKey {
    XPublicKey::from(secret)
}

/// X25519 Diffie-Hellman, returning the raw 32-byte shared point.
pub fn x25519_shared_secret(secret: &XStaticSecret, public: &XPublicKey) -> [u8; 32] {
    secret.diffie_hellman(public).to_bytes()
}

/// AES-256-GCM encrypt. Returns ciphertext with the 16-byte tag appended.
pub fn aes_gcm_encrypt(
    key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, PrimitiveError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| PrimitiveError::BadMacKey)?;
    let nonce = GcmNonce::from_slice(iv);
    cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| PrimitiveError::AuthFailure)
}

/// AES-256-GCM decrypt. `ciphertext` must include the trailing 16-byte tag.
pub fn aes_gcm_decrypt(
    key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, PrimitiveError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| PrimitiveError::BadMacKey)?;
    let nonce = GcmNonce::from_slice(iv);
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| PrimitiveError::AuthFailure)
}

/// Generate a fresh random 12-byte AEAD IV.
pub fn random_iv() -> [u8; IV_LEN] {
    let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
    let mut out = [0u8; IV_LEN];
    out.copy_from_slice(&nonce);
    out
}

/// HMAC-SHA-256 over `data`, keyed by `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], PrimitiveError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| PrimitiveError::BadMacKey)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Fill `buf` with cryptographically secure random bytes.
pub fn random_bytes(buf: &mut [u8]) {
    AeadOsRng.fill_bytes(buf);
}

/// Constant-time equality over two equal-length byte slices. Unequal
/// lengths are never equal but the length check itself is not required to
/// be constant-time (the lengths of keys/MACs are public in this protocol).
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Best-effort zeroization: overwrite with random bytes, then zero.
/// The caller should prefer the target type's `Zeroize` impl when one
/// exists; this is for raw scratch buffers.
pub fn zeroize(buf: &mut [u8]) {
    random_bytes(buf);
    buf.zeroize();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn ed25519_roundtrip() {
        let key = SigningKey::generate(&mut OsRng);
        let msg = b"hello";
        let sig = ed25519_sign(&key, msg);
        ed25519_verify(&key.verifying_key(), msg, &sig).unwrap();
    }

    #[test]
    fn ed25519_tampered_signature_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let mut sig = ed25519_sign(&key, b"hello");
        sig[0] ^= 0xFF;
        assert!(ed25519_verify(&key.verifying_key(), b"hello", &sig).is_err());
    }

    #[test]
    fn x25519_agreement_matches() {
        let a = XStaticSecret::random_from_rng(OsRng);
        let b = XStaticSecret::random_from_rng(OsRng);
        let ap = x25519_derive_public(&a);
        let bp = x25519_derive_public(&b);
        assert_eq!(x25519_shared_secret(&a, &bp), x25519_shared_secret(&b, &ap));
    }

    #[test]
    fn aes_gcm_roundtrip() {
        let key = [7u8; KEY_LEN];
        let iv = random_iv();
        let ct = aes_gcm_encrypt(&key, &iv, b"plaintext", b"aad").unwrap();
        let pt = aes_gcm_decrypt(&key, &iv, &ct, b"aad").unwrap();
        assert_eq!(pt, b"plaintext");
    }

    #[test]
    fn aes_gcm_wrong_aad_fails() {
        let key = [7u8; KEY_LEN];
        let iv = random_iv();
        let ct = aes_gcm_encrypt(&key, &iv, b"plaintext", b"aad").unwrap();
        assert!(aes_gcm_decrypt(&key, &iv, &ct, b"other-aad").is_err());
    }

    #[test]
    fn constant_time_eq_behaves_like_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
