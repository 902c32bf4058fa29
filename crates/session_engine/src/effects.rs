use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use shared::{
    domain::UserId,
    protocol::{CallSessionRecord, RealtimeEvent},
};
use storage::MissedCallNotice;
use tokio::sync::broadcast;
use tracing::info;

/// Receives every row change the engine makes, for fan-out to subscribers.
pub trait ChangeSink: Send + Sync {
    fn publish(&self, event: RealtimeEvent);
}

impl ChangeSink for broadcast::Sender<RealtimeEvent> {
    fn publish(&self, event: RealtimeEvent) {
        // No subscribers is fine: clients bootstrap with a full read.
        let _ = self.send(event);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardChanges;

impl ChangeSink for DiscardChanges {
    fn publish(&self, _event: RealtimeEvent) {}
}

/// Collaborators outside the call subsystem: the conversation's system
/// messages and the push notification service.
#[async_trait]
pub trait CallSideEffects: Send + Sync {
    /// Missed-call system message plus notification cancel for a timed-out invitee.
    async fn missed_call(&self, notice: &MissedCallNotice) -> anyhow::Result<()>;
    /// Stop the ringing notification of a pending invitee whose call was ended.
    async fn cancel_ring(&self, session: &CallSessionRecord, user_id: UserId)
        -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSideEffects;

#[async_trait]
impl CallSideEffects for LoggingSideEffects {
    async fn missed_call(&self, notice: &MissedCallNotice) -> anyhow::Result<()> {
        info!(
            conversation_id = notice.conversation_id.0,
            session_id = %notice.session_id,
            user_id = notice.user_id.0,
            "calls: missed call"
        );
        Ok(())
    }

    async fn cancel_ring(
        &self,
        session: &CallSessionRecord,
        user_id: UserId,
    ) -> anyhow::Result<()> {
        info!(
            conversation_id = session.conversation_id.0,
            session_id = %session.session_id,
            user_id = user_id.0,
            "calls: ring cancelled"
        );
        Ok(())
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = at;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
