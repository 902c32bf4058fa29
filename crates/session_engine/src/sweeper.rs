use std::collections::BTreeSet;

use shared::{
    domain::SessionId,
    protocol::{ChangeKind, SweepReport},
};
use tracing::{error, info, warn};

use crate::{close_pending_rows, lifecycle::reconcile, publish_participant, publish_session, EngineContext};

const SWEEP_BATCH: u32 = 500;

/// One sweep: pending invites past the ringing window time out, sessions
/// left unsettled are reconciled, expired cooldowns end, old ended sessions
/// are purged. Passes are independent and
/// a failing one is logged without blocking the rest.
pub async fn run_sweep(ctx: &EngineContext) -> SweepReport {
    let mut report = SweepReport::default();

    match timeout_stale_invites(ctx).await {
        Ok(count) => report.timed_out = count,
        Err(err) => error!(error = %err, "sweep: ringing timeout pass failed"),
    }
    if let Err(err) = drain_missed_calls(ctx).await {
        error!(error = %err, "sweep: missed call drain failed");
    }
    match settle_unsettled_sessions(ctx).await {
        Ok(count) => report.ended += count,
        Err(err) => error!(error = %err, "sweep: settle pass failed"),
    }
    match end_expired_cooldowns(ctx).await {
        Ok(count) => report.ended += count,
        Err(err) => error!(error = %err, "sweep: cooldown pass failed"),
    }
    match purge_ended_sessions(ctx).await {
        Ok(count) => report.deleted = count,
        Err(err) => error!(error = %err, "sweep: retention pass failed"),
    }

    if report != SweepReport::default() {
        info!(
            timed_out = report.timed_out,
            ended = report.ended,
            deleted = report.deleted,
            "sweep: finished"
        );
    }
    report
}

async fn timeout_stale_invites(ctx: &EngineContext) -> anyhow::Result<u64> {
    let now = ctx.clock.now();
    let cutoff = now - ctx.windows.ringing;
    let stale = ctx
        .storage
        .stale_pending_participants(cutoff, SWEEP_BATCH)
        .await?;

    let mut timed_out = 0;
    let mut touched = BTreeSet::<SessionId>::new();
    for candidate in stale {
        let Some(row) = ctx
            .storage
            .timeout_pending_participant(
                candidate.participant.participant_id,
                candidate.conversation_id,
                cutoff,
                now,
            )
            .await?
        else {
            continue;
        };
        timed_out += 1;
        touched.insert(row.session_id);
        publish_participant(ctx, ChangeKind::Update, candidate.conversation_id, row);
    }

    for session_id in touched {
        if let Err(err) = reconcile(ctx, session_id).await {
            warn!(session_id = %session_id, error = %err, "sweep: reconcile after timeout failed");
        }
    }
    Ok(timed_out)
}

/// At-least-once: a notice is marked delivered only after the side effect succeeded.
async fn drain_missed_calls(ctx: &EngineContext) -> anyhow::Result<()> {
    let notices = ctx
        .storage
        .undelivered_missed_call_notices(SWEEP_BATCH)
        .await?;
    for notice in notices {
        if let Err(err) = ctx.side_effects.missed_call(&notice).await {
            warn!(
                session_id = %notice.session_id,
                user_id = notice.user_id.0,
                error = %err,
                "sweep: missed call delivery failed, will retry"
            );
            continue;
        }
        ctx.storage
            .mark_notice_delivered(notice.participant_id, ctx.clock.now())
            .await?;
    }
    Ok(())
}

/// Re-runs the transition rules on live sessions whose state contradicts
/// their participant rows. Returns how many of them ended.
async fn settle_unsettled_sessions(ctx: &EngineContext) -> anyhow::Result<u64> {
    let unsettled = ctx.storage.unsettled_live_sessions(SWEEP_BATCH).await?;
    let mut ended = 0;
    for session in unsettled {
        warn!(
            session_id = %session.session_id,
            state = session.state.as_str(),
            "sweep: settling session left behind by an interrupted write"
        );
        if let Some(view) = reconcile(ctx, session.session_id).await? {
            if view.is_ended() {
                ended += 1;
            }
        }
    }
    Ok(ended)
}

async fn end_expired_cooldowns(ctx: &EngineContext) -> anyhow::Result<u64> {
    let now = ctx.clock.now();
    let cutoff = now - ctx.windows.cooldown;
    let stale = ctx
        .storage
        .stale_cooldown_sessions(cutoff, SWEEP_BATCH)
        .await?;

    let mut ended = 0;
    for session in stale {
        let Some(session) = ctx
            .storage
            .end_expired_cooldown(session.session_id, cutoff, now)
            .await?
        else {
            continue;
        };
        ended += 1;
        publish_session(ctx, ChangeKind::Update, session.clone());
        close_pending_rows(ctx, &session, now).await?;
    }
    Ok(ended)
}

async fn purge_ended_sessions(ctx: &EngineContext) -> anyhow::Result<u64> {
    let cutoff = ctx.clock.now() - ctx.windows.retention;
    let deleted = ctx.storage.delete_ended_sessions_before(cutoff).await?;
    let count = deleted.len() as u64;
    for session in deleted {
        publish_session(ctx, ChangeKind::Delete, session);
    }
    Ok(count)
}

#[cfg(test)]
#[path = "tests/sweeper_tests.rs"]
mod tests;
