use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use shared::{
    domain::{CallType, ConversationId, InitiatorMode, UserId},
    protocol::{CallSessionRecord, RealtimeEvent, SessionView, StartCallRequest},
};
use storage::{MissedCallNotice, Storage};

use crate::{
    CallSideEffects, ChangeSink, Clock, EngineContext, LifecycleWindows, ManualClock, MediaGrantConfig,
};

pub const CONVERSATION: ConversationId = ConversationId(100);

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<RealtimeEvent>>,
}

impl RecordingSink {
    pub fn take(&self) -> Vec<RealtimeEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl ChangeSink for RecordingSink {
    fn publish(&self, event: RealtimeEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[derive(Default)]
pub struct RecordingEffects {
    pub missed: Mutex<Vec<MissedCallNotice>>,
    pub cancelled: Mutex<Vec<UserId>>,
    pub fail_missed_calls: Mutex<bool>,
}

#[async_trait]
impl CallSideEffects for RecordingEffects {
    async fn missed_call(&self, notice: &MissedCallNotice) -> anyhow::Result<()> {
        if *self.fail_missed_calls.lock().unwrap() {
            anyhow::bail!("notification service down");
        }
        self.missed.lock().unwrap().push(notice.clone());
        Ok(())
    }

    async fn cancel_ring(
        &self,
        _session: &CallSessionRecord,
        user_id: UserId,
    ) -> anyhow::Result<()> {
        self.cancelled.lock().unwrap().push(user_id);
        Ok(())
    }
}

pub struct Harness {
    pub ctx: EngineContext,
    pub clock: Arc<ManualClock>,
    pub sink: Arc<RecordingSink>,
    pub effects: Arc<RecordingEffects>,
}

pub async fn harness(members: &[i64]) -> Harness {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let clock = Arc::new(ManualClock::new(
        Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    ));
    for member in members {
        storage
            .add_conversation_member(CONVERSATION, UserId(*member), clock.now())
            .await
            .expect("member");
    }
    let sink = Arc::new(RecordingSink::default());
    let effects = Arc::new(RecordingEffects::default());
    let ctx = EngineContext::new(
        storage,
        MediaGrantConfig {
            api_key: "devkey".into(),
            api_secret: "devsecret".into(),
            ttl_seconds: 300,
        },
    )
    .with_windows(LifecycleWindows::default())
    .with_clock(clock.clone())
    .with_sink(sink.clone())
    .with_side_effects(effects.clone());
    Harness {
        ctx,
        clock,
        sink,
        effects,
    }
}

pub fn start_request(initiator: i64, invitees: &[i64], mode: InitiatorMode) -> StartCallRequest {
    StartCallRequest {
        user_id: UserId(initiator),
        conversation_id: CONVERSATION,
        call_type: CallType::Audio,
        invitees: invitees.iter().copied().map(UserId).collect(),
        initiator_mode: mode,
    }
}

pub async fn started(h: &Harness, initiator: i64, invitees: &[i64], mode: InitiatorMode) -> SessionView {
    crate::start_call(&h.ctx, start_request(initiator, invitees, mode))
        .await
        .expect("start call")
}
