use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

macro_rules! uuid_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);

uuid_newtype!(SessionId);
uuid_newtype!(ParticipantId);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn as_str(self) -> &'static str {
        match self {
            CallType::Audio => "audio",
            CallType::Video => "video",
        }
    }
}

impl FromStr for CallType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(CallType::Audio),
            "video" => Ok(CallType::Video),
            other => Err(UnknownVariant {
                kind: "call type",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle of a call session. `Dialing` is initial, `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Dialing,
    Active,
    Cooldown,
    Ended,
}

impl SessionState {
    pub const LIVE: [SessionState; 3] = [
        SessionState::Dialing,
        SessionState::Active,
        SessionState::Cooldown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Dialing => "dialing",
            SessionState::Active => "active",
            SessionState::Cooldown => "cooldown",
            SessionState::Ended => "ended",
        }
    }

    pub fn is_live(self) -> bool {
        self != SessionState::Ended
    }
}

impl FromStr for SessionState {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dialing" => Ok(SessionState::Dialing),
            "active" => Ok(SessionState::Active),
            "cooldown" => Ok(SessionState::Cooldown),
            "ended" => Ok(SessionState::Ended),
            other => Err(UnknownVariant {
                kind: "session state",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Invited,
    Ringing,
    Joined,
    Rejected,
    Timeout,
    Left,
}

impl ParticipantStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ParticipantStatus::Invited => "invited",
            ParticipantStatus::Ringing => "ringing",
            ParticipantStatus::Joined => "joined",
            ParticipantStatus::Rejected => "rejected",
            ParticipantStatus::Timeout => "timeout",
            ParticipantStatus::Left => "left",
        }
    }

    /// Invited or ringing: an invite nobody has answered yet.
    pub fn is_pending(self) -> bool {
        matches!(self, ParticipantStatus::Invited | ParticipantStatus::Ringing)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ParticipantStatus::Rejected | ParticipantStatus::Timeout | ParticipantStatus::Left
        )
    }
}

impl FromStr for ParticipantStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invited" => Ok(ParticipantStatus::Invited),
            "ringing" => Ok(ParticipantStatus::Ringing),
            "joined" => Ok(ParticipantStatus::Joined),
            "rejected" => Ok(ParticipantStatus::Rejected),
            "timeout" => Ok(ParticipantStatus::Timeout),
            "left" => Ok(ParticipantStatus::Left),
            other => Err(UnknownVariant {
                kind: "participant status",
                value: other.to_string(),
            }),
        }
    }
}

/// How the caller's own row starts out when a session is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitiatorMode {
    /// The caller is JOINED immediately and the session starts ACTIVE.
    #[default]
    AutoJoin,
    /// The caller rings like everyone else and must join explicitly.
    SelfJoin,
}
