use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AlreadyActive,
    SessionEnded,
    StoreUnavailable,
    RealtimeDisconnected,
    Forbidden,
    NotFound,
    Validation,
    Internal,
}

impl ErrorCode {
    /// Transient failures that are safe to retry with the same request.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::StoreUnavailable | ErrorCode::RealtimeDisconnected
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    /// Live session that blocked a create, or the session an error refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn already_active(session_id: SessionId) -> Self {
        Self::new(
            ErrorCode::AlreadyActive,
            "a call is already live in this conversation",
        )
        .with_session(session_id)
    }

    pub fn session_ended(session_id: SessionId) -> Self {
        Self::new(ErrorCode::SessionEnded, "call has already ended").with_session(session_id)
    }
}
