use shared::{
    domain::{ParticipantStatus, SessionId, SessionState},
    protocol::{ChangeKind, SessionView},
};
use storage::SessionGuard;
use tracing::{debug, warn};

use crate::{close_pending_rows, publish_session, EngineContext};

const MAX_RECONCILE_ROUNDS: usize = 4;

/// Counts derived from the participant rows of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParticipantCounts {
    pub joined: usize,
    /// Pending (invited or ringing) rows, excluding the initiator's own.
    pub pending_invitees: usize,
}

impl ParticipantCounts {
    pub fn of(view: &SessionView) -> Self {
        let initiator = view.session.initiator_id;
        view.participants
            .iter()
            .fold(Self::default(), |mut counts, participant| {
                if participant.status == ParticipantStatus::Joined {
                    counts.joined += 1;
                } else if participant.status.is_pending() && participant.user_id != initiator {
                    counts.pending_invitees += 1;
                }
                counts
            })
    }
}

/// A session move and the predicate on participant rows that must still hold
/// when it is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub to: SessionState,
    pub guard: SessionGuard,
}

/// Where the session should be, given its current state and participant counts.
/// `None` means it is already there.
pub fn next_transition(state: SessionState, counts: ParticipantCounts) -> Option<Transition> {
    match state {
        SessionState::Ended => None,
        SessionState::Dialing | SessionState::Cooldown if counts.joined > 0 => Some(Transition {
            to: SessionState::Active,
            guard: SessionGuard::HasJoined,
        }),
        SessionState::Active if counts.joined == 0 => Some(Transition {
            to: SessionState::Cooldown,
            guard: SessionGuard::NoJoined,
        }),
        SessionState::Dialing if counts.pending_invitees == 0 => Some(Transition {
            to: SessionState::Ended,
            guard: SessionGuard::NoJoinedNoPendingInvitees,
        }),
        // Cooldown expiry is time based and belongs to the sweeper.
        SessionState::Dialing | SessionState::Active | SessionState::Cooldown => None,
    }
}

/// Drives the session to the state its participant rows imply. Every move is
/// a guarded update; losing a race just means re-reading and trying again.
pub async fn reconcile(
    ctx: &EngineContext,
    session_id: SessionId,
) -> anyhow::Result<Option<SessionView>> {
    for _ in 0..MAX_RECONCILE_ROUNDS {
        let Some(view) = ctx.storage.load_view(session_id).await? else {
            return Ok(None);
        };
        let Some(transition) = next_transition(view.state(), ParticipantCounts::of(&view)) else {
            return Ok(Some(view));
        };

        let now = ctx.clock.now();
        let moved = ctx
            .storage
            .transition_session(
                session_id,
                &[view.state()],
                transition.to,
                transition.guard,
                now,
            )
            .await?;
        match moved {
            Some(session) => {
                debug!(
                    session_id = %session_id,
                    from = view.state().as_str(),
                    to = session.state.as_str(),
                    "calls: session transition"
                );
                publish_session(ctx, ChangeKind::Update, session.clone());
                if session.state == SessionState::Ended {
                    close_pending_rows(ctx, &session, now).await?;
                }
            }
            None => debug!(session_id = %session_id, "calls: lost transition race, re-reading"),
        }
    }

    warn!(session_id = %session_id, "calls: reconcile did not settle");
    Ok(ctx.storage.load_view(session_id).await?)
}

#[cfg(test)]
#[path = "tests/lifecycle_tests.rs"]
mod tests;
