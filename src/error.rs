//! Error taxonomy for the relay and the negotiation client.
//!
//! Transport and protocol errors are handled where they happen and logged.
//! Only [`MediaAccessError`] and lost connectivity ([`CallError::IceFailed`],
//! [`CallError::ConnectionLost`]) are meant to reach the end user.

use thiserror::Error;

use crate::model::negotiation::{NegotiationPhase, PhaseEvent};

/// A frame that could not be turned into a [`SignalingMessage`](crate::model::message::SignalingMessage).
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message carries no payload key")]
    MissingPayload,
    #[error("message carries more than one payload key")]
    AmbiguousPayload,
    #[error("session id is empty")]
    EmptySessionId,
    #[error("session id longer than {max} characters")]
    SessionIdTooLong { max: usize },
    #[error("session description has an empty sdp")]
    EmptySdp,
    #[error("{carried} description inside an {expected} message")]
    DescriptionMismatch {
        expected: &'static str,
        carried: &'static str,
    },
    #[error("ice candidate is empty")]
    EmptyCandidate,
    #[error("binary frame is not valid UTF-8")]
    NotUtf8,
}

/// Failures of the session registry. None of them are fatal to the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("session '{session_id}' already has {members} members")]
    SessionFull { session_id: String, members: usize },
    #[error("endpoint {0} has not joined a session")]
    NoSession(u64),
    #[error("endpoint {endpoint} addressed session '{addressed}' but is a member of '{joined}'")]
    SessionMismatch {
        endpoint: u64,
        addressed: String,
        joined: String,
    },
}

/// Local capture could not be started. Surfaced to the user, never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("permission to capture media was denied")]
    PermissionDenied,
    #[error("no capture device available")]
    NoDevice,
    #[error("capture device failed: {0}")]
    Device(String),
}

/// Errors raised by a [`PeerConnection`](crate::peer::capability::PeerConnection) implementation.
#[derive(Debug, Error)]
pub enum PeerError {
    /// An operation was called in a state that does not allow it, e.g. adding a
    /// candidate before the remote description is applied.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("sdp negotiation failed: {0}")]
    Sdp(String),
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
    #[error("no local ICE candidates found")]
    NoCandidates,
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
    #[error("peer connection is closed")]
    Closed,
}

/// A signaling message arrived in a phase that does not accept it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{event:?} is not valid in phase {phase:?}")]
pub struct ProtocolStateError {
    pub phase: NegotiationPhase,
    pub event: PhaseEvent,
}

/// The WebSocket to the relay failed. Recovered by reconnecting.
#[derive(Debug, Error)]
pub enum SignalingChannelError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("could not encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("connection closed by relay")]
    Closed,
}

/// Everything that can end or degrade a call.
#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    MediaAccess(#[from] MediaAccessError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    ProtocolState(#[from] ProtocolStateError),
    #[error("ICE connectivity failed after {attempts} restart attempts")]
    IceFailed { attempts: u32 },
    #[error("signaling channel lost")]
    SignalingLost,
    #[error("peer connection closed unexpectedly")]
    ConnectionLost,
}

impl CallError {
    /// Whether the error should be shown to the person placing the call.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            CallError::MediaAccess(_) | CallError::IceFailed { .. } | CallError::ConnectionLost
        )
    }
}
