use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    CallType, ConversationId, InitiatorMode, ParticipantId, ParticipantStatus, SessionId,
    SessionState, UserId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSessionRecord {
    pub session_id: SessionId,
    pub conversation_id: ConversationId,
    pub call_type: CallType,
    pub state: SessionState,
    pub initiator_id: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallParticipantRecord {
    pub participant_id: ParticipantId,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub status: ParticipantStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One immutable snapshot of a session and every participant row it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionView {
    pub session: CallSessionRecord,
    pub participants: Vec<CallParticipantRecord>,
}

impl SessionView {
    pub fn session_id(&self) -> SessionId {
        self.session.session_id
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    pub fn is_ended(&self) -> bool {
        self.session.state == SessionState::Ended
    }

    /// Derived active participant count.
    pub fn joined_count(&self) -> usize {
        self.participants
            .iter()
            .filter(|p| p.status == ParticipantStatus::Joined)
            .count()
    }

    pub fn joined_users(&self) -> Vec<UserId> {
        self.participants
            .iter()
            .filter(|p| p.status == ParticipantStatus::Joined)
            .map(|p| p.user_id)
            .collect()
    }

    pub fn participant(&self, user_id: UserId) -> Option<&CallParticipantRecord> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn status_of(&self, user_id: UserId) -> Option<ParticipantStatus> {
        self.participant(user_id).map(|p| p.status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Row-change notification pushed by the fan-out. Deletes carry the old row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RealtimeEvent {
    SessionChanged {
        kind: ChangeKind,
        session: CallSessionRecord,
    },
    ParticipantChanged {
        kind: ChangeKind,
        conversation_id: ConversationId,
        participant: CallParticipantRecord,
    },
}

impl RealtimeEvent {
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            RealtimeEvent::SessionChanged { session, .. } => session.conversation_id,
            RealtimeEvent::ParticipantChanged {
                conversation_id, ..
            } => *conversation_id,
        }
    }

    pub fn session_id(&self) -> SessionId {
        match self {
            RealtimeEvent::SessionChanged { session, .. } => session.session_id,
            RealtimeEvent::ParticipantChanged { participant, .. } => participant.session_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartCallRequest {
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub call_type: CallType,
    #[serde(default)]
    pub invitees: Vec<UserId>,
    #[serde(default)]
    pub initiator_mode: InitiatorMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorRequest {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteRequest {
    pub user_id: UserId,
    pub invitees: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub user_id: UserId,
    /// End the call right away when the leaver was the last one joined.
    #[serde(default)]
    pub skip_cooldown: bool,
}

/// Credentials the media layer needs to enter the call's room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaGrant {
    pub room_name: String,
    pub token: String,
    pub call_type: CallType,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinAck {
    pub view: SessionView,
    pub media_grant: MediaGrant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub timed_out: u64,
    pub ended: u64,
    pub deleted: u64,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
