//! Typed errors for every core boundary.
//!
//! Each module owns a focused error enum; [`Error`] unifies them for callers
//! that cross module boundaries (e.g. [`crate::session::ClientSession`]).
//! None of these carry attacker-controlled detail across the wire — the
//! close reason strings sent by a relay are always coarser than what's
//! returned here in-process.

use thiserror::Error;

use crate::frame::FrameError;
use crate::handshake::HandshakeError;
use crate::nonce::NonceError;
use crate::primitives::PrimitiveError;
use crate::ratchet::RatchetError;

/// Close code a channel is shut with, reusing the WebSocket close-code
/// space as a cross-language signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    Protocol,
    Unsupported,
    InvalidPayload,
    Policy,
    TooBig,
    Internal,
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::InvalidPayload => 1007,
            CloseCode::Policy => 1008,
            CloseCode::TooBig => 1009,
            CloseCode::Internal => 1011,
        }
    }

    /// Whether a client session should treat this code as fatal (no
    /// reconnect).
    pub fn is_fatal(code: u16) -> bool {
        matches!(code, 1000 | 1002 | 1003 | 1007 | 1008 | 1009 | 1011)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Primitive(#[from] PrimitiveError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Ratchet(#[from] RatchetError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Nonce(#[from] NonceError),
    #[error("no session established with peer {0}")]
    NoSession(String),
    #[error("channel closed: code={code} reason={reason}")]
    ChannelClosed { code: u16, reason: String },
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("server is at capacity")]
    CapacityExceeded,
    #[error("internal invariant violated: {0}")]
    Internal(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Close code this error should terminate a channel with, when it
    /// originates on the responder/relay side of a boundary.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Error::Primitive(_) => CloseCode::Protocol,
            Error::Handshake(_) => CloseCode::Policy,
            Error::Ratchet(RatchetError::ChainExhausted) => CloseCode::Internal,
            Error::Ratchet(_) => CloseCode::Protocol,
            Error::Frame(FrameError::TooBig) => CloseCode::TooBig,
            Error::Frame(_) => CloseCode::Protocol,
            Error::Nonce(_) => CloseCode::Policy,
            Error::NoSession(_) => CloseCode::Protocol,
            Error::ChannelClosed { .. } => CloseCode::Normal,
            Error::HandshakeTimeout => CloseCode::Policy,
            Error::RateLimited => CloseCode::Policy,
            Error::CapacityExceeded => CloseCode::Policy,
            Error::Internal(_) => CloseCode::Internal,
            Error::Io(_) => CloseCode::Internal,
        }
    }
}
