//! Binary wire protocol for document synchronization.
//!
//! Every message is one bincode-encoded envelope:
//! ```text
//! ┌──────────┬───────────┬───────────┬──────────┬──────────┐
//! │ kind     │ doc_id    │ user_id   │ sequence │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes  │ 8 bytes  │ variable │
//! └──────────┴───────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! Payloads are strongly typed per kind: a `Delta` carries an opaque
//! versioned [`Delta`] encoding, `Presence` a [`PresenceUpdate`], `Handshake`
//! a [`StateVector`], `Hello` the caller's [`Identity`]. Malformed frames are
//! dropped and logged by the receiving side, never fatal.
//!
//! [`Delta`]: crate::replica::Delta
//! [`PresenceUpdate`]: crate::presence::PresenceUpdate
//! [`StateVector`]: crate::replica::StateVector

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::PresenceUpdate;
use crate::replica::{Delta, StateVector};

/// Frame kinds on the sync channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    /// First frame of a connection: identity + initial state vector.
    Hello = 1,
    /// State vector exchange; the peer answers with a `Delta` diff.
    Handshake = 2,
    /// One or more CRDT operations.
    Delta = 3,
    /// Ephemeral presence record (cursor, viewer identity).
    Presence = 4,
    /// Heartbeat ping.
    Ping = 5,
    /// Heartbeat pong.
    Pong = 6,
    /// Session-open refusal; payload is a human-readable reason.
    Reject = 7,
}

/// Verified identity supplied by the host application.
///
/// The sync core does not verify credentials; the host authenticates the
/// user and hands the result to [`open_session`].
///
/// [`open_session`]: crate::session::open_session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub display_name: String,
    /// RGBA cursor color assigned by the host.
    pub color: [f32; 4],
}

impl Identity {
    pub fn new(user_id: Uuid, display_name: impl Into<String>) -> Self {
        // Stable fallback color from the user id hash.
        let hash = user_id.as_u128();
        let r = (hash & 0xFF) as f32 / 255.0;
        let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
        let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
        Self {
            user_id,
            display_name: display_name.into(),
            color: [r, g, b, 1.0],
        }
    }
}

/// Hello payload: who is joining, and what they already have.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub identity: Identity,
    pub state_vector: StateVector,
}

/// Top-level protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncFrame {
    pub kind: FrameKind,
    pub doc_id: Uuid,
    pub user_id: Uuid,
    /// Per-sender frame counter; presence consumers use it for staleness
    /// checks, delta consumers ignore it (op ids carry the real ordering).
    pub sequence: u64,
    pub payload: Vec<u8>,
}

impl SyncFrame {
    pub fn hello(
        doc_id: Uuid,
        identity: &Identity,
        state_vector: &StateVector,
    ) -> Result<Self, ProtocolError> {
        let payload = HelloPayload {
            identity: identity.clone(),
            state_vector: state_vector.clone(),
        };
        Ok(Self {
            kind: FrameKind::Hello,
            doc_id,
            user_id: identity.user_id,
            sequence: 0,
            payload: encode_payload(&payload)?,
        })
    }

    pub fn handshake(
        doc_id: Uuid,
        user_id: Uuid,
        state_vector: &StateVector,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: FrameKind::Handshake,
            doc_id,
            user_id,
            sequence: 0,
            payload: encode_payload(state_vector)?,
        })
    }

    pub fn delta(
        doc_id: Uuid,
        user_id: Uuid,
        sequence: u64,
        delta: &Delta,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: FrameKind::Delta,
            doc_id,
            user_id,
            sequence,
            payload: delta
                .encode()
                .map_err(|e| ProtocolError::Serialization(e.to_string()))?,
        })
    }

    pub fn presence(
        doc_id: Uuid,
        sequence: u64,
        update: &PresenceUpdate,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: FrameKind::Presence,
            doc_id,
            user_id: update.user_id(),
            sequence,
            payload: encode_payload(update)?,
        })
    }

    pub fn ping(doc_id: Uuid, user_id: Uuid) -> Self {
        Self {
            kind: FrameKind::Ping,
            doc_id,
            user_id,
            sequence: 0,
            payload: Vec::new(),
        }
    }

    pub fn pong(doc_id: Uuid, user_id: Uuid) -> Self {
        Self {
            kind: FrameKind::Pong,
            doc_id,
            user_id,
            sequence: 0,
            payload: Vec::new(),
        }
    }

    pub fn reject(doc_id: Uuid, user_id: Uuid, reason: &str) -> Self {
        Self {
            kind: FrameKind::Reject,
            doc_id,
            user_id,
            sequence: 0,
            payload: reason.as_bytes().to_vec(),
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }

    /// Parse a `Hello` payload.
    pub fn hello_payload(&self) -> Result<HelloPayload, ProtocolError> {
        self.expect_kind(FrameKind::Hello)?;
        decode_payload(&self.payload)
    }

    /// Parse a `Handshake` payload.
    pub fn handshake_state_vector(&self) -> Result<StateVector, ProtocolError> {
        self.expect_kind(FrameKind::Handshake)?;
        decode_payload(&self.payload)
    }

    /// Parse a `Delta` payload.
    pub fn delta_payload(&self) -> Result<Delta, ProtocolError> {
        self.expect_kind(FrameKind::Delta)?;
        Delta::decode(&self.payload).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Parse a `Presence` payload.
    pub fn presence_update(&self) -> Result<PresenceUpdate, ProtocolError> {
        self.expect_kind(FrameKind::Presence)?;
        decode_payload(&self.payload)
    }

    /// Parse a `Reject` reason.
    pub fn reject_reason(&self) -> Result<String, ProtocolError> {
        self.expect_kind(FrameKind::Reject)?;
        Ok(String::from_utf8_lossy(&self.payload).into_owned())
    }

    fn expect_kind(&self, kind: FrameKind) -> Result<(), ProtocolError> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedKind {
                expected: kind,
                got: self.kind,
            })
        }
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    UnexpectedKind { expected: FrameKind, got: FrameKind },
    ConnectionClosed,
    Timeout,
    Rejected(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedKind { expected, got } => {
                write!(f, "Expected {expected:?} frame, got {got:?}")
            }
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
            Self::Rejected(reason) => write!(f, "Session rejected: {reason}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
