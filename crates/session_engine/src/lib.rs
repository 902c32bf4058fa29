use std::{collections::BTreeSet, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use shared::{
    domain::{
        ConversationId, InitiatorMode, ParticipantStatus, SessionId, SessionState, UserId,
    },
    error::{ApiError, ErrorCode},
    protocol::{
        CallParticipantRecord, CallSessionRecord, ChangeKind, JoinAck, RealtimeEvent,
        SessionView, StartCallRequest,
    },
};
use storage::{NewSession, ParticipantWrite, SessionGuard, SessionInsert, Storage};
use tracing::{info, warn};

pub mod effects;
pub mod lifecycle;
pub mod media_grant;
pub mod sweeper;

pub use effects::{
    CallSideEffects, ChangeSink, Clock, DiscardChanges, LoggingSideEffects, ManualClock,
    SystemClock,
};
pub use lifecycle::reconcile;
pub use media_grant::{mint_media_grant, room_name_for_session, MediaGrantConfig};
pub use sweeper::run_sweep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleWindows {
    pub ringing: Duration,
    pub cooldown: Duration,
    pub retention: Duration,
}

impl Default for LifecycleWindows {
    fn default() -> Self {
        Self {
            ringing: Duration::seconds(60),
            cooldown: Duration::seconds(60),
            retention: Duration::days(7),
        }
    }
}

#[derive(Clone)]
pub struct EngineContext {
    pub storage: Storage,
    pub media: MediaGrantConfig,
    pub windows: LifecycleWindows,
    /// Only the initiator may end the call for everyone.
    pub end_requires_host: bool,
    pub clock: Arc<dyn Clock>,
    pub sink: Arc<dyn ChangeSink>,
    pub side_effects: Arc<dyn CallSideEffects>,
}

impl EngineContext {
    pub fn new(storage: Storage, media: MediaGrantConfig) -> Self {
        Self {
            storage,
            media,
            windows: LifecycleWindows::default(),
            end_requires_host: false,
            clock: Arc::new(SystemClock),
            sink: Arc::new(DiscardChanges),
            side_effects: Arc::new(LoggingSideEffects),
        }
    }

    pub fn with_windows(mut self, windows: LifecycleWindows) -> Self {
        self.windows = windows;
        self
    }

    pub fn with_end_requires_host(mut self, end_requires_host: bool) -> Self {
        self.end_requires_host = end_requires_host;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_side_effects(mut self, side_effects: Arc<dyn CallSideEffects>) -> Self {
        self.side_effects = side_effects;
        self
    }
}

pub async fn start_call(
    ctx: &EngineContext,
    request: StartCallRequest,
) -> Result<SessionView, ApiError> {
    let StartCallRequest {
        user_id,
        conversation_id,
        call_type,
        invitees,
        initiator_mode,
    } = request;
    ensure_member(ctx, conversation_id, user_id).await?;

    let invitees: Vec<UserId> = invitees
        .into_iter()
        .filter(|invitee| *invitee != user_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    for invitee in &invitees {
        ensure_invitee(ctx, conversation_id, *invitee).await?;
    }

    let (initiator_status, initial_state) = match initiator_mode {
        InitiatorMode::AutoJoin => (ParticipantStatus::Joined, SessionState::Active),
        InitiatorMode::SelfJoin => {
            if invitees.is_empty() {
                return Err(ApiError::new(
                    ErrorCode::Validation,
                    "a self-join call needs at least one invitee",
                ));
            }
            (ParticipantStatus::Ringing, SessionState::Dialing)
        }
    };

    let new = NewSession {
        conversation_id,
        call_type,
        initiator_id: user_id,
        initiator_status,
        initial_state,
        invitees,
    };
    let view = match ctx
        .storage
        .insert_session(&new, ctx.clock.now())
        .await
        .map_err(store_unavailable)?
    {
        SessionInsert::Created(view) => view,
        SessionInsert::AlreadyActive(live) => {
            info!(
                conversation_id = conversation_id.0,
                session_id = %live,
                "calls: start refused, session already live"
            );
            return Err(ApiError::already_active(live));
        }
    };

    publish_session(ctx, ChangeKind::Insert, view.session.clone());
    for participant in &view.participants {
        publish_participant(ctx, ChangeKind::Insert, conversation_id, participant.clone());
    }
    info!(
        conversation_id = conversation_id.0,
        session_id = %view.session_id(),
        initiator_id = user_id.0,
        call_type = call_type.as_str(),
        invitees = view.participants.len() - 1,
        "calls: session started"
    );
    Ok(view)
}

pub async fn get_view(
    ctx: &EngineContext,
    session_id: SessionId,
    user_id: UserId,
) -> Result<SessionView, ApiError> {
    let view = load_view(ctx, session_id).await?;
    ensure_member(ctx, view.session.conversation_id, user_id).await?;
    Ok(view)
}

/// Most recent live session of the conversation, if any.
pub async fn live_session(
    ctx: &EngineContext,
    conversation_id: ConversationId,
    user_id: UserId,
) -> Result<Option<SessionView>, ApiError> {
    ensure_member(ctx, conversation_id, user_id).await?;
    let Some(session) = ctx
        .storage
        .latest_live_session(conversation_id)
        .await
        .map_err(store_unavailable)?
    else {
        return Ok(None);
    };
    ctx.storage
        .load_view(session.session_id)
        .await
        .map_err(store_unavailable)
}

pub async fn invite(
    ctx: &EngineContext,
    session_id: SessionId,
    actor: UserId,
    invitees: Vec<UserId>,
) -> Result<SessionView, ApiError> {
    let view = load_view(ctx, session_id).await?;
    let conversation_id = view.session.conversation_id;
    if view.is_ended() {
        return Err(ApiError::session_ended(session_id));
    }
    let actor_joined = view.status_of(actor) == Some(ParticipantStatus::Joined);
    if !actor_joined && view.session.initiator_id != actor {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only joined participants can invite",
        )
        .with_session(session_id));
    }

    let invitees: BTreeSet<UserId> = invitees.into_iter().filter(|u| *u != actor).collect();
    for invitee in &invitees {
        ensure_invitee(ctx, conversation_id, *invitee).await?;
    }

    let now = ctx.clock.now();
    for invitee in invitees {
        let write = ctx
            .storage
            .upsert_invited(session_id, invitee, now)
            .await
            .map_err(store_unavailable)?;
        publish_write(ctx, conversation_id, write);
    }
    load_view(ctx, session_id).await
}

/// The invitee's device started alerting.
pub async fn ring(
    ctx: &EngineContext,
    session_id: SessionId,
    user_id: UserId,
) -> Result<SessionView, ApiError> {
    let view = load_view(ctx, session_id).await?;
    if view.is_ended() {
        return Err(ApiError::session_ended(session_id));
    }
    let ringing = ctx
        .storage
        .transition_participant(
            session_id,
            user_id,
            &[ParticipantStatus::Invited],
            ParticipantStatus::Ringing,
            ctx.clock.now(),
        )
        .await
        .map_err(store_unavailable)?;
    let Some(ringing) = ringing else {
        return Ok(view);
    };
    publish_participant(
        ctx,
        ChangeKind::Update,
        view.session.conversation_id,
        ringing,
    );
    load_view(ctx, session_id).await
}

pub async fn join(
    ctx: &EngineContext,
    session_id: SessionId,
    user_id: UserId,
) -> Result<JoinAck, ApiError> {
    let session = ctx
        .storage
        .load_session(session_id)
        .await
        .map_err(store_unavailable)?
        .ok_or_else(|| not_found(session_id))?;
    ensure_member(ctx, session.conversation_id, user_id).await?;
    if session.state == SessionState::Ended {
        return Err(ApiError::session_ended(session_id));
    }

    let write = ctx
        .storage
        .upsert_joined(session_id, user_id, ctx.clock.now())
        .await
        .map_err(store_unavailable)?;
    if write == ParticipantWrite::Unchanged {
        // Either already joined (a second device) or the session ended under us.
        let current = ctx
            .storage
            .load_session(session_id)
            .await
            .map_err(store_unavailable)?;
        if current.map_or(true, |s| s.state == SessionState::Ended) {
            return Err(ApiError::session_ended(session_id));
        }
    }
    publish_write(ctx, session.conversation_id, write);

    let view = reconcile(ctx, session_id)
        .await
        .map_err(store_unavailable)?;
    let view = match view {
        Some(view) if !view.is_ended() => view,
        _ => {
            let rolled_back = ctx
                .storage
                .transition_participant(
                    session_id,
                    user_id,
                    &[ParticipantStatus::Joined],
                    ParticipantStatus::Left,
                    ctx.clock.now(),
                )
                .await
                .map_err(store_unavailable)?;
            if let Some(row) = rolled_back {
                publish_participant(ctx, ChangeKind::Update, session.conversation_id, row);
            }
            warn!(
                session_id = %session_id,
                user_id = user_id.0,
                "calls: session ended during join, row rolled back"
            );
            return Err(ApiError::session_ended(session_id));
        }
    };

    let media_grant = mint_media_grant(&ctx.media, &view.session, user_id, ctx.clock.now())
        .map_err(|e| ApiError::new(ErrorCode::Internal, format!("media grant failed: {e}")))?;
    info!(
        session_id = %session_id,
        user_id = user_id.0,
        joined = view.joined_count(),
        "calls: joined"
    );
    Ok(JoinAck { view, media_grant })
}

pub async fn reject(
    ctx: &EngineContext,
    session_id: SessionId,
    user_id: UserId,
) -> Result<SessionView, ApiError> {
    let view = load_view(ctx, session_id).await?;
    let rejected = ctx
        .storage
        .transition_participant(
            session_id,
            user_id,
            &[ParticipantStatus::Invited, ParticipantStatus::Ringing],
            ParticipantStatus::Rejected,
            ctx.clock.now(),
        )
        .await
        .map_err(store_unavailable)?;
    let Some(rejected) = rejected else {
        if view.is_ended() {
            return Ok(view);
        }
        // A retry may follow a reject whose settle step failed.
        return settle(ctx, session_id).await;
    };
    publish_participant(
        ctx,
        ChangeKind::Update,
        view.session.conversation_id,
        rejected,
    );
    info!(session_id = %session_id, user_id = user_id.0, "calls: rejected");
    settle(ctx, session_id).await
}

/// Idempotent. With `skip_cooldown`, the last joined participant leaving ends
/// the call instead of opening the cooldown window.
pub async fn leave(
    ctx: &EngineContext,
    session_id: SessionId,
    user_id: UserId,
    skip_cooldown: bool,
) -> Result<SessionView, ApiError> {
    let view = load_view(ctx, session_id).await?;
    let left = ctx
        .storage
        .transition_participant(
            session_id,
            user_id,
            &[ParticipantStatus::Joined],
            ParticipantStatus::Left,
            ctx.clock.now(),
        )
        .await
        .map_err(store_unavailable)?;
    match left {
        Some(left) => {
            publish_participant(ctx, ChangeKind::Update, view.session.conversation_id, left);
            info!(session_id = %session_id, user_id = user_id.0, "calls: left");
        }
        None if view.is_ended() => return Ok(view),
        // Repeated leave: the row already says LEFT, but the session may not
        // have been settled by the first attempt.
        None if skip_cooldown && view.status_of(user_id) == Some(ParticipantStatus::Left) => {}
        None => return settle(ctx, session_id).await,
    }

    if skip_cooldown {
        let now = ctx.clock.now();
        let ended = ctx
            .storage
            .transition_session(
                session_id,
                &SessionState::LIVE,
                SessionState::Ended,
                SessionGuard::NoJoined,
                now,
            )
            .await
            .map_err(store_unavailable)?;
        if let Some(ended) = ended {
            publish_session(ctx, ChangeKind::Update, ended.clone());
            close_pending_rows(ctx, &ended, now)
                .await
                .map_err(store_unavailable)?;
            return load_view(ctx, session_id).await;
        }
    }
    settle(ctx, session_id).await
}

/// Force-terminates the call for everyone.
pub async fn end(
    ctx: &EngineContext,
    session_id: SessionId,
    actor: UserId,
) -> Result<SessionView, ApiError> {
    let view = load_view(ctx, session_id).await?;
    if view.is_ended() {
        return Ok(view);
    }
    if view.status_of(actor) != Some(ParticipantStatus::Joined) {
        return Err(
            ApiError::new(ErrorCode::Forbidden, "only joined participants can end the call")
                .with_session(session_id),
        );
    }
    if ctx.end_requires_host && view.session.initiator_id != actor {
        return Err(
            ApiError::new(ErrorCode::Forbidden, "only the host can end the call")
                .with_session(session_id),
        );
    }

    let now = ctx.clock.now();
    let ended = ctx
        .storage
        .transition_session(
            session_id,
            &SessionState::LIVE,
            SessionState::Ended,
            SessionGuard::Always,
            now,
        )
        .await
        .map_err(store_unavailable)?;
    let session = match ended {
        Some(session) => {
            publish_session(ctx, ChangeKind::Update, session.clone());
            session
        }
        None => view.session.clone(),
    };

    let left = ctx
        .storage
        .transition_session_participants(
            session_id,
            &[ParticipantStatus::Joined],
            ParticipantStatus::Left,
            now,
        )
        .await
        .map_err(store_unavailable)?;
    for row in left {
        publish_participant(ctx, ChangeKind::Update, session.conversation_id, row);
    }
    close_pending_rows(ctx, &session, now)
        .await
        .map_err(store_unavailable)?;

    info!(session_id = %session_id, actor = actor.0, "calls: ended by participant");
    load_view(ctx, session_id).await
}

/// Moves every still-pending row of an ended session to LEFT and cancels its ring.
pub(crate) async fn close_pending_rows(
    ctx: &EngineContext,
    session: &CallSessionRecord,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let closed = ctx
        .storage
        .transition_session_participants(
            session.session_id,
            &[ParticipantStatus::Invited, ParticipantStatus::Ringing],
            ParticipantStatus::Left,
            now,
        )
        .await?;
    for row in closed {
        if let Err(err) = ctx.side_effects.cancel_ring(session, row.user_id).await {
            warn!(
                session_id = %session.session_id,
                user_id = row.user_id.0,
                error = %err,
                "calls: ring cancel failed"
            );
        }
        publish_participant(ctx, ChangeKind::Update, session.conversation_id, row);
    }
    Ok(())
}

pub(crate) fn publish_session(ctx: &EngineContext, kind: ChangeKind, session: CallSessionRecord) {
    ctx.sink.publish(RealtimeEvent::SessionChanged { kind, session });
}

pub(crate) fn publish_participant(
    ctx: &EngineContext,
    kind: ChangeKind,
    conversation_id: ConversationId,
    participant: CallParticipantRecord,
) {
    ctx.sink.publish(RealtimeEvent::ParticipantChanged {
        kind,
        conversation_id,
        participant,
    });
}

fn publish_write(ctx: &EngineContext, conversation_id: ConversationId, write: ParticipantWrite) {
    match write {
        ParticipantWrite::Inserted(row) => {
            publish_participant(ctx, ChangeKind::Insert, conversation_id, row)
        }
        ParticipantWrite::Updated(row) => {
            publish_participant(ctx, ChangeKind::Update, conversation_id, row)
        }
        ParticipantWrite::Unchanged => {}
    }
}

async fn settle(ctx: &EngineContext, session_id: SessionId) -> Result<SessionView, ApiError> {
    reconcile(ctx, session_id)
        .await
        .map_err(store_unavailable)?
        .ok_or_else(|| not_found(session_id))
}

async fn load_view(ctx: &EngineContext, session_id: SessionId) -> Result<SessionView, ApiError> {
    ctx.storage
        .load_view(session_id)
        .await
        .map_err(store_unavailable)?
        .ok_or_else(|| not_found(session_id))
}

async fn ensure_member(
    ctx: &EngineContext,
    conversation_id: ConversationId,
    user_id: UserId,
) -> Result<(), ApiError> {
    let member = ctx
        .storage
        .is_conversation_member(conversation_id, user_id)
        .await
        .map_err(store_unavailable)?;
    if !member {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "user is not a member of the conversation",
        ));
    }
    Ok(())
}

async fn ensure_invitee(
    ctx: &EngineContext,
    conversation_id: ConversationId,
    invitee: UserId,
) -> Result<(), ApiError> {
    let member = ctx
        .storage
        .is_conversation_member(conversation_id, invitee)
        .await
        .map_err(store_unavailable)?;
    if !member {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("user {} is not a member of the conversation", invitee.0),
        ));
    }
    Ok(())
}

fn not_found(session_id: SessionId) -> ApiError {
    ApiError::new(ErrorCode::NotFound, "call session not found").with_session(session_id)
}

fn store_unavailable(err: anyhow::Error) -> ApiError {
    warn!(error = %err, "calls: store operation failed");
    ApiError::new(ErrorCode::StoreUnavailable, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
