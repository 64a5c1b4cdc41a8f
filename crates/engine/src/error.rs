use tandem_protocol::{CallStatus, ErrorCode, ProtocolError};
use uuid::Uuid;

use crate::negotiator::CallState;

/// Session lifecycle failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(Uuid),
    #[error("session {0} has ended")]
    Ended(Uuid),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("call {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: Uuid,
        from: CallStatus,
        to: CallStatus,
    },
    #[error("session limit reached ({0})")]
    LimitReached(usize),
    #[error("session {0} already exists")]
    Duplicate(Uuid),
    #[error("session store failure: {0}")]
    Store(String),
    #[error("relay rejected session request ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::NotFound(_) | SessionError::Ended(_) => ErrorCode::NotFound,
            SessionError::AccessDenied(_) => ErrorCode::Forbidden,
            SessionError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            SessionError::LimitReached(_) => ErrorCode::LimitReached,
            SessionError::Duplicate(_) => ErrorCode::BadRequest,
            SessionError::Store(_) => ErrorCode::Internal,
            SessionError::Remote { code, .. } => *code,
        }
    }
}

/// Event channel failures.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("session {0} not found")]
    SessionNotFound(Uuid),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("channel closed")]
    Closed,
    #[error("relay rejected request ({code:?}): {message}")]
    Rejected { code: ErrorCode, message: String },
    #[error("channel transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Mirror Capture / Mirror Renderer setup failures.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("already attached to session {0}")]
    AlreadyAttached(Uuid),
    #[error("not attached to a mirror session")]
    NotAttached,
    #[error("element has no structural path")]
    NoPath,
}

/// Peer connection failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("peer connection error: {0}")]
pub struct PeerError(pub String);

impl From<webrtc::Error> for PeerError {
    fn from(e: webrtc::Error) -> Self {
        PeerError(e.to_string())
    }
}

/// Failures acquiring local media from the host environment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("permission to use {0} was denied")]
    PermissionDenied(String),
    #[error("no {0} device available")]
    NotFound(String),
    #[error("media device failure: {0}")]
    Device(String),
}

/// Call negotiation failures surfaced to the controlling caller.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("{op} is not allowed in state {state:?}")]
    InvalidState { op: &'static str, state: CallState },
    #[error("{0} is only available to the call initiator")]
    NotInitiator(&'static str),
    #[error("call has not been initialized")]
    NotInitialized,
    #[error("no outgoing video track to replace")]
    NoVideoSender,
    #[error("call has ended")]
    Ended,
}
