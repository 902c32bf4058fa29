use shared::{
    domain::SessionId,
    error::{ApiError, ErrorCode},
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("a call is already live in this conversation: {session_id}")]
    AlreadyActive { session_id: SessionId },
    #[error("call {session_id} has already ended")]
    SessionEnded { session_id: SessionId },
    #[error("call store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("realtime channel disconnected: {0}")]
    RealtimeDisconnected(String),
    #[error("request refused ({code:?}): {message}")]
    Refused { code: ErrorCode, message: String },
    #[error("failed to attach call media: {0}")]
    Media(String),
}

impl CallError {
    /// Transient failures: the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CallError::StoreUnavailable(_) | CallError::RealtimeDisconnected(_)
        )
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            CallError::AlreadyActive { .. } => Some(ErrorCode::AlreadyActive),
            CallError::SessionEnded { .. } => Some(ErrorCode::SessionEnded),
            CallError::StoreUnavailable(_) => Some(ErrorCode::StoreUnavailable),
            CallError::RealtimeDisconnected(_) => Some(ErrorCode::RealtimeDisconnected),
            CallError::Refused { code, .. } => Some(*code),
            CallError::Media(_) => None,
        }
    }
}

impl From<ApiError> for CallError {
    fn from(err: ApiError) -> Self {
        match (err.code, err.session_id) {
            (ErrorCode::AlreadyActive, Some(session_id)) => CallError::AlreadyActive { session_id },
            (ErrorCode::SessionEnded, Some(session_id)) => CallError::SessionEnded { session_id },
            (ErrorCode::StoreUnavailable, _) => CallError::StoreUnavailable(err.message),
            (ErrorCode::RealtimeDisconnected, _) => CallError::RealtimeDisconnected(err.message),
            (code, _) => CallError::Refused {
                code,
                message: err.message,
            },
        }
    }
}
