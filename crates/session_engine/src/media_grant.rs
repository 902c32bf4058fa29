use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use shared::{
    domain::{CallType, SessionId, UserId},
    protocol::{CallSessionRecord, MediaGrant},
};

#[derive(Debug, Clone)]
pub struct MediaGrantConfig {
    pub api_key: String,
    pub api_secret: String,
    pub ttl_seconds: i64,
}

#[derive(Debug, Serialize)]
struct RoomGrant {
    room_join: bool,
    room: String,
    can_publish: bool,
    can_subscribe: bool,
    can_publish_sources: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
struct Claims {
    iss: String,
    sub: String,
    exp: i64,
    iat: i64,
    video: RoomGrant,
    metadata: String,
}

pub fn room_name_for_session(session_id: SessionId) -> String {
    format!("call:{session_id}")
}

fn publish_sources(call_type: CallType) -> Vec<&'static str> {
    match call_type {
        CallType::Audio => vec!["microphone"],
        CallType::Video => vec!["microphone", "camera"],
    }
}

pub fn mint_media_grant(
    cfg: &MediaGrantConfig,
    session: &CallSessionRecord,
    user_id: UserId,
    now: DateTime<Utc>,
) -> Result<MediaGrant, jsonwebtoken::errors::Error> {
    let room_name = room_name_for_session(session.session_id);
    let expires_at = now + Duration::seconds(cfg.ttl_seconds);
    let claims = Claims {
        iss: cfg.api_key.clone(),
        sub: format!("user:{}", user_id.0),
        iat: now.timestamp(),
        exp: expires_at.timestamp(),
        video: RoomGrant {
            room_join: true,
            room: room_name.clone(),
            can_publish: true,
            can_subscribe: true,
            can_publish_sources: publish_sources(session.call_type),
        },
        metadata: format!(
            "{{\"conversation_id\":{},\"call_type\":\"{}\"}}",
            session.conversation_id.0,
            session.call_type.as_str()
        ),
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.api_secret.as_bytes()),
    )?;
    Ok(MediaGrant {
        room_name,
        token,
        call_type: session.call_type,
        expires_at,
    })
}

#[cfg(test)]
#[path = "tests/media_grant_tests.rs"]
mod tests;
