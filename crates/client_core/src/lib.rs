use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use media_integration::{MediaAttachOptions, MediaConnector, MediaSession};
use shared::{
    domain::{CallType, ConversationId, InitiatorMode, SessionId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        InviteRequest, JoinAck, LeaveRequest, RealtimeEvent, SessionView, StartCallRequest,
    },
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

pub mod error;
pub mod observer;
pub mod transport;

pub use error::CallError;
pub use observer::SessionStream;
pub use transport::{HttpControlPlane, WsRealtimeConnector};

/// Request/response side of the call service.
#[async_trait]
pub trait CallControlPlane: Send + Sync {
    async fn start_call(&self, request: StartCallRequest) -> Result<SessionView, ApiError>;
    async fn get_session(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> Result<SessionView, ApiError>;
    async fn live_session(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<SessionView>, ApiError>;
    async fn invite(
        &self,
        session_id: SessionId,
        request: InviteRequest,
    ) -> Result<SessionView, ApiError>;
    async fn ring(&self, session_id: SessionId, user_id: UserId) -> Result<SessionView, ApiError>;
    async fn join(&self, session_id: SessionId, user_id: UserId) -> Result<JoinAck, ApiError>;
    async fn reject(&self, session_id: SessionId, user_id: UserId)
        -> Result<SessionView, ApiError>;
    async fn leave(
        &self,
        session_id: SessionId,
        request: LeaveRequest,
    ) -> Result<SessionView, ApiError>;
    async fn end(&self, session_id: SessionId, user_id: UserId) -> Result<SessionView, ApiError>;
}

/// Change feed for one conversation's calls.
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    async fn subscribe(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> anyhow::Result<RealtimeSubscription>;
}

/// An open change feed. `recv` returning `None` means the channel dropped.
pub struct RealtimeSubscription {
    events: mpsc::Receiver<RealtimeEvent>,
    reader: Option<JoinHandle<()>>,
}

impl RealtimeSubscription {
    pub fn new(events: mpsc::Receiver<RealtimeEvent>, reader: Option<JoinHandle<()>>) -> Self {
        Self { events, reader }
    }

    pub async fn recv(&mut self) -> Option<RealtimeEvent> {
        self.events.recv().await
    }
}

impl Drop for RealtimeSubscription {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub server_url: String,
    /// Attempts per request, including the first one.
    pub retry_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            retry_attempts: 4,
            backoff_base: Duration::from_millis(200),
            backoff_cap: Duration::from_secs(5),
        }
    }
}

impl ClientSettings {
    pub(crate) fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_base, self.backoff_cap)
    }
}

/// Capped exponential delay sequence.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: base.min(cap),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.base.min(self.cap);
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }
}

struct AttachedMedia {
    session: Arc<dyn MediaSession>,
    /// Row timestamp of the accepted join; older snapshots cannot release it.
    joined_at: DateTime<Utc>,
}

/// Per-user handle on the call service: issues lifecycle commands, owns the
/// local media attachments, and serves live session snapshots.
pub struct CallSessionClient {
    user_id: UserId,
    settings: ClientSettings,
    control: Arc<dyn CallControlPlane>,
    realtime: Arc<dyn RealtimeConnector>,
    media: Arc<dyn MediaConnector>,
    attached: Mutex<HashMap<SessionId, AttachedMedia>>,
}

impl CallSessionClient {
    pub fn new(
        user_id: UserId,
        settings: ClientSettings,
        control: Arc<dyn CallControlPlane>,
        realtime: Arc<dyn RealtimeConnector>,
        media: Arc<dyn MediaConnector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            user_id,
            settings,
            control,
            realtime,
            media,
            attached: Mutex::new(HashMap::new()),
        })
    }

    /// Client talking to a call server over HTTP and its realtime websocket.
    pub fn connect(
        user_id: UserId,
        settings: ClientSettings,
        media: Arc<dyn MediaConnector>,
    ) -> Arc<Self> {
        let control = Arc::new(HttpControlPlane::new(settings.server_url.clone()));
        let realtime = Arc::new(WsRealtimeConnector::new(settings.server_url.clone()));
        Self::new(user_id, settings, control, realtime, media)
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Starts a call. With `AutoJoin` the caller is joined right away and
    /// media is attached before this returns.
    pub async fn create_session(
        &self,
        conversation_id: ConversationId,
        call_type: CallType,
        invitees: Vec<UserId>,
        initiator_mode: InitiatorMode,
    ) -> Result<SessionId, CallError> {
        let control = &self.control;
        let request = StartCallRequest {
            user_id: self.user_id,
            conversation_id,
            call_type,
            invitees,
            initiator_mode,
        };
        let mut attempts = 0u32;
        let tries = &mut attempts;
        let started = self
            .with_retry("start_call", move || {
                *tries += 1;
                control.start_call(request.clone())
            })
            .await;
        let session_id = match started {
            Ok(view) => view.session_id(),
            // An earlier attempt may have committed with only its response lost.
            Err(CallError::AlreadyActive { session_id }) if attempts > 1 => {
                let view = self.fetch_view(session_id).await?;
                if view.session.initiator_id != self.user_id {
                    return Err(CallError::AlreadyActive { session_id });
                }
                info!(%session_id, "calls: start already committed by an earlier attempt");
                session_id
            }
            Err(err) => return Err(err),
        };
        info!(
            %session_id,
            conversation_id = conversation_id.0,
            call_type = call_type.as_str(),
            "calls: session created"
        );

        if initiator_mode == InitiatorMode::AutoJoin {
            self.join_session(session_id).await?;
        }
        Ok(session_id)
    }

    /// Joins the call and attaches media once the server has accepted the join.
    pub async fn join_session(&self, session_id: SessionId) -> Result<SessionView, CallError> {
        let control = &self.control;
        let user_id = self.user_id;
        let ack = self
            .with_retry("join", move || control.join(session_id, user_id))
            .await?;

        let mut attached = self.attached.lock().await;
        if !attached.contains_key(&session_id) {
            let options = MediaAttachOptions {
                session_id,
                user_id,
                grant: ack.media_grant.clone(),
            };
            match self.media.attach(options).await {
                Ok(session) => {
                    let joined_at = ack
                        .view
                        .participant(user_id)
                        .map_or(ack.view.session.updated_at, |p| p.updated_at);
                    attached.insert(session_id, AttachedMedia { session, joined_at });
                }
                Err(err) => {
                    drop(attached);
                    warn!(%session_id, error = %err, "calls: media attach failed, leaving");
                    let request = LeaveRequest {
                        user_id,
                        skip_cooldown: false,
                    };
                    let cleanup = self
                        .with_retry("leave", move || control.leave(session_id, request.clone()))
                        .await;
                    if let Err(leave_err) = cleanup {
                        warn!(%session_id, error = %leave_err, "calls: leave after failed attach");
                    }
                    return Err(CallError::Media(err.to_string()));
                }
            }
        }
        info!(%session_id, user_id = user_id.0, "calls: joined");
        Ok(ack.view)
    }

    /// Leaves the call. Repeating it, or leaving a call that is already over,
    /// succeeds.
    pub async fn leave_session(&self, session_id: SessionId) -> Result<(), CallError> {
        self.leave_inner(session_id, false).await
    }

    /// Leaves and, when nobody else is joined, ends the call without cooldown.
    pub async fn leave_session_now(&self, session_id: SessionId) -> Result<(), CallError> {
        self.leave_inner(session_id, true).await
    }

    async fn leave_inner(&self, session_id: SessionId, skip_cooldown: bool) -> Result<(), CallError> {
        self.release_media(session_id).await;
        let control = &self.control;
        let request = LeaveRequest {
            user_id: self.user_id,
            skip_cooldown,
        };
        match self
            .with_retry("leave", move || control.leave(session_id, request.clone()))
            .await
        {
            Ok(_) => Ok(()),
            Err(CallError::SessionEnded { .. }) => Ok(()),
            Err(CallError::Refused {
                code: ErrorCode::NotFound,
                ..
            }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn end_session(&self, session_id: SessionId) -> Result<SessionView, CallError> {
        self.release_media(session_id).await;
        let control = &self.control;
        let user_id = self.user_id;
        self.with_retry("end", move || control.end(session_id, user_id))
            .await
    }

    pub async fn reject_session(&self, session_id: SessionId) -> Result<SessionView, CallError> {
        let control = &self.control;
        let user_id = self.user_id;
        self.with_retry("reject", move || control.reject(session_id, user_id))
            .await
    }

    /// Acknowledges delivery of the incoming-call ring.
    pub async fn acknowledge_ring(&self, session_id: SessionId) -> Result<SessionView, CallError> {
        let control = &self.control;
        let user_id = self.user_id;
        self.with_retry("ring", move || control.ring(session_id, user_id))
            .await
    }

    pub async fn invite(
        &self,
        session_id: SessionId,
        invitees: Vec<UserId>,
    ) -> Result<SessionView, CallError> {
        let control = &self.control;
        let request = InviteRequest {
            user_id: self.user_id,
            invitees,
        };
        self.with_retry("invite", move || control.invite(session_id, request.clone()))
            .await
    }

    pub async fn live_session(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<SessionView>, CallError> {
        let control = &self.control;
        let user_id = self.user_id;
        self.with_retry("live_session", move || {
            control.live_session(conversation_id, user_id)
        })
        .await
    }

    /// Live view of a call: the current snapshot, then one snapshot per
    /// change. Media is released as soon as a snapshot shows the call ended
    /// or this user no longer joined.
    pub async fn observe_session(
        self: &Arc<Self>,
        session_id: SessionId,
    ) -> Result<SessionStream, CallError> {
        let initial = self.fetch_view(session_id).await?;
        self.enforce_media_policy(&initial).await;
        Ok(observer::spawn_observer(Arc::clone(self), initial))
    }

    pub async fn attached_media(&self, session_id: SessionId) -> Option<Arc<dyn MediaSession>> {
        self.attached
            .lock()
            .await
            .get(&session_id)
            .map(|media| Arc::clone(&media.session))
    }

    pub(crate) async fn fetch_view(&self, session_id: SessionId) -> Result<SessionView, CallError> {
        let control = &self.control;
        let user_id = self.user_id;
        self.with_retry("get_session", move || {
            control.get_session(session_id, user_id)
        })
        .await
    }

    pub(crate) async fn enforce_media_policy(&self, view: &SessionView) {
        let session_id = view.session_id();
        let release = if view.is_ended() {
            true
        } else {
            let attached = self.attached.lock().await;
            match (attached.get(&session_id), view.participant(self.user_id)) {
                (Some(media), Some(row)) => {
                    row.status.is_terminal() && row.updated_at >= media.joined_at
                }
                _ => false,
            }
        };
        if release {
            self.release_media(session_id).await;
        }
    }

    async fn release_media(&self, session_id: SessionId) {
        let media = self.attached.lock().await.remove(&session_id);
        let Some(AttachedMedia { session: media, .. }) = media else {
            return;
        };
        match media.release().await {
            Ok(()) => info!(%session_id, room = media.room_name(), "calls: media released"),
            Err(err) => warn!(%session_id, error = %err, "calls: media release failed"),
        }
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut backoff = self.settings.backoff();
        let mut attempt = 1;
        loop {
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => CallError::from(err),
            };
            if !err.is_retryable() || attempt >= self.settings.retry_attempts {
                return Err(err);
            }
            let delay = backoff.next_delay();
            warn!(
                op,
                attempt,
                error = %err,
                retry_in_ms = delay.as_millis() as u64,
                "calls: transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
