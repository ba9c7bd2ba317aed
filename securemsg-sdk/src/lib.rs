//! Cryptographic session engine for an end-to-end encrypted messaging
//! substrate: identity/ephemeral keys, a three-message authenticated
//! handshake, Double-Ratchet-style keying, deterministic message framing,
//! and a replay-resistant handshake nonce tracker.
//!
//! Transport, storage, and UI are external collaborators; this crate
//! assumes an ordered, length-preserving, reliable duplex byte stream and
//! exposes the primitives a relay or client builds that transport around.

pub mod error;
pub mod frame;
pub mod handshake;
pub mod identity;
pub mod kdf;
pub mod nonce;
pub mod primitives;
pub mod ratchet;
pub mod session;
pub mod transport;

pub use error::{CloseCode, Error};
