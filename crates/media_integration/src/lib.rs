use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use shared::{
    domain::{CallType, SessionId, UserId},
    protocol::MediaGrant,
};
use tokio::sync::broadcast;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaAttachOptions {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub grant: MediaGrant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalTrack {
    Microphone,
    Camera,
}

impl LocalTrack {
    pub fn for_call_type(call_type: CallType) -> &'static [LocalTrack] {
        match call_type {
            CallType::Audio => &[LocalTrack::Microphone],
            CallType::Video => &[LocalTrack::Microphone, LocalTrack::Camera],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    TrackPublished(LocalTrack),
    Released { room_name: String },
}

/// A live attachment to the media room of one call.
#[async_trait]
pub trait MediaSession: Send + Sync {
    fn room_name(&self) -> &str;
    fn published_tracks(&self) -> Vec<LocalTrack>;
    async fn release(&self) -> anyhow::Result<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent>;
}

#[async_trait]
pub trait MediaConnector: Send + Sync {
    async fn attach(&self, options: MediaAttachOptions) -> anyhow::Result<Arc<dyn MediaSession>>;
}

/// Connector for clients without a media stack: records the attachment and
/// publishes nothing on the wire.
#[derive(Debug, Default, Clone)]
pub struct SignalOnlyMediaConnector;

#[async_trait]
impl MediaConnector for SignalOnlyMediaConnector {
    async fn attach(&self, options: MediaAttachOptions) -> anyhow::Result<Arc<dyn MediaSession>> {
        let session = SignalOnlyMediaSession::new(options.grant.room_name.clone());
        for track in LocalTrack::for_call_type(options.grant.call_type) {
            session.publish(*track);
        }
        info!(
            session_id = %options.session_id,
            user_id = options.user_id.0,
            room = %options.grant.room_name,
            "media: attached signal-only session"
        );
        Ok(Arc::new(session))
    }
}

pub struct SignalOnlyMediaSession {
    room_name: String,
    tracks: Mutex<Vec<LocalTrack>>,
    released: AtomicBool,
    events: broadcast::Sender<MediaEvent>,
}

impl SignalOnlyMediaSession {
    fn new(room_name: String) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            room_name,
            tracks: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
            events,
        }
    }

    fn publish(&self, track: LocalTrack) {
        if let Ok(mut tracks) = self.tracks.lock() {
            tracks.push(track);
        }
        let _ = self.events.send(MediaEvent::TrackPublished(track));
    }
}

#[async_trait]
impl MediaSession for SignalOnlyMediaSession {
    fn room_name(&self) -> &str {
        &self.room_name
    }

    fn published_tracks(&self) -> Vec<LocalTrack> {
        self.tracks
            .lock()
            .map(|tracks| tracks.clone())
            .unwrap_or_default()
    }

    async fn release(&self) -> anyhow::Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(mut tracks) = self.tracks.lock() {
            tracks.clear();
        }
        info!(room = %self.room_name, "media: released");
        let _ = self.events.send(MediaEvent::Released {
            room_name: self.room_name.clone(),
        });
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
