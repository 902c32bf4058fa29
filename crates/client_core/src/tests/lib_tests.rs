use super::*;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    Mutex as StdMutex,
};

use axum::{
    extract::{ws::Message as WsMessage, WebSocketUpgrade},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::StreamExt;
use media_integration::{LocalTrack, SignalOnlyMediaConnector};
use session_engine::{EngineContext, MediaGrantConfig};
use shared::{
    domain::{ParticipantStatus, SessionState},
    protocol::{ChangeKind, RealtimeEvent},
};
use storage::Storage;
use tokio::{net::TcpListener, sync::broadcast, task::AbortHandle};

const CONVERSATION: ConversationId = ConversationId(7);
const ALICE: UserId = UserId(1);
const BOB: UserId = UserId(2);
const CAROL: UserId = UserId(3);

/// Drives the real lifecycle engine in-process.
struct EngineControlPlane {
    ctx: EngineContext,
    fail_next: AtomicU32,
    /// Commit the next start, then answer as if the store timed out.
    lose_start_response: AtomicBool,
    fail_next_leave: AtomicU32,
}

impl EngineControlPlane {
    fn transient_failure(&self) -> Result<(), ApiError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(ApiError::new(ErrorCode::StoreUnavailable, "database is locked"));
        }
        Ok(())
    }
}

#[async_trait]
impl CallControlPlane for EngineControlPlane {
    async fn start_call(&self, request: StartCallRequest) -> Result<SessionView, ApiError> {
        self.transient_failure()?;
        let view = session_engine::start_call(&self.ctx, request).await?;
        if self.lose_start_response.swap(false, Ordering::SeqCst) {
            return Err(ApiError::new(ErrorCode::StoreUnavailable, "response lost"));
        }
        Ok(view)
    }

    async fn get_session(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> Result<SessionView, ApiError> {
        self.transient_failure()?;
        session_engine::get_view(&self.ctx, session_id, user_id).await
    }

    async fn live_session(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<SessionView>, ApiError> {
        self.transient_failure()?;
        session_engine::live_session(&self.ctx, conversation_id, user_id).await
    }

    async fn invite(
        &self,
        session_id: SessionId,
        request: InviteRequest,
    ) -> Result<SessionView, ApiError> {
        self.transient_failure()?;
        session_engine::invite(&self.ctx, session_id, request.user_id, request.invitees).await
    }

    async fn ring(&self, session_id: SessionId, user_id: UserId) -> Result<SessionView, ApiError> {
        self.transient_failure()?;
        session_engine::ring(&self.ctx, session_id, user_id).await
    }

    async fn join(&self, session_id: SessionId, user_id: UserId) -> Result<JoinAck, ApiError> {
        self.transient_failure()?;
        session_engine::join(&self.ctx, session_id, user_id).await
    }

    async fn reject(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> Result<SessionView, ApiError> {
        self.transient_failure()?;
        session_engine::reject(&self.ctx, session_id, user_id).await
    }

    async fn leave(
        &self,
        session_id: SessionId,
        request: LeaveRequest,
    ) -> Result<SessionView, ApiError> {
        self.transient_failure()?;
        let remaining = self.fail_next_leave.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_leave.store(remaining - 1, Ordering::SeqCst);
            return Err(ApiError::new(ErrorCode::StoreUnavailable, "database is locked"));
        }
        session_engine::leave(
            &self.ctx,
            session_id,
            request.user_id,
            request.skip_cooldown,
        )
        .await
    }

    async fn end(&self, session_id: SessionId, user_id: UserId) -> Result<SessionView, ApiError> {
        self.transient_failure()?;
        session_engine::end(&self.ctx, session_id, user_id).await
    }
}

/// Fans engine changes out per conversation, like the server's websocket.
struct InProcessRealtime {
    events: broadcast::Sender<RealtimeEvent>,
    readers: StdMutex<Vec<AbortHandle>>,
    subscribes: AtomicUsize,
}

impl InProcessRealtime {
    fn disconnect_all(&self) {
        for reader in self.readers.lock().unwrap().drain(..) {
            reader.abort();
        }
    }
}

#[async_trait]
impl RealtimeConnector for InProcessRealtime {
    async fn subscribe(
        &self,
        conversation_id: ConversationId,
        _user_id: UserId,
    ) -> anyhow::Result<RealtimeSubscription> {
        let mut rx = self.events.subscribe();
        let (tx, events) = mpsc::channel(64);
        let reader = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if event.conversation_id() == conversation_id && tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        self.readers.lock().unwrap().push(reader.abort_handle());
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(RealtimeSubscription::new(events, Some(reader)))
    }
}

#[derive(Default)]
struct RecordingMedia {
    attaches: StdMutex<Vec<(SessionId, UserId)>>,
    fail: bool,
}

#[async_trait]
impl MediaConnector for RecordingMedia {
    async fn attach(&self, options: MediaAttachOptions) -> anyhow::Result<Arc<dyn MediaSession>> {
        if self.fail {
            anyhow::bail!("microphone unavailable");
        }
        self.attaches
            .lock()
            .unwrap()
            .push((options.session_id, options.user_id));
        SignalOnlyMediaConnector.attach(options).await
    }
}

struct World {
    control: Arc<EngineControlPlane>,
    realtime: Arc<InProcessRealtime>,
}

fn fast_settings() -> ClientSettings {
    ClientSettings {
        server_url: "http://127.0.0.1:0".into(),
        retry_attempts: 4,
        backoff_base: Duration::from_millis(5),
        backoff_cap: Duration::from_millis(20),
    }
}

async fn world() -> World {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    for user in [ALICE, BOB, CAROL] {
        storage
            .add_conversation_member(CONVERSATION, user, Utc::now())
            .await
            .expect("member");
    }
    let (events, _) = broadcast::channel(256);
    let ctx = EngineContext::new(
        storage,
        MediaGrantConfig {
            api_key: "test-key".into(),
            api_secret: "test-secret".into(),
            ttl_seconds: 300,
        },
    )
    .with_sink(Arc::new(events.clone()));
    World {
        control: Arc::new(EngineControlPlane {
            ctx,
            fail_next: AtomicU32::new(0),
            lose_start_response: AtomicBool::new(false),
            fail_next_leave: AtomicU32::new(0),
        }),
        realtime: Arc::new(InProcessRealtime {
            events,
            readers: StdMutex::new(Vec::new()),
            subscribes: AtomicUsize::new(0),
        }),
    }
}

impl World {
    fn client(&self, user_id: UserId, media: Arc<RecordingMedia>) -> Arc<CallSessionClient> {
        self.client_with(user_id, media, fast_settings())
    }

    fn client_with(
        &self,
        user_id: UserId,
        media: Arc<RecordingMedia>,
        settings: ClientSettings,
    ) -> Arc<CallSessionClient> {
        CallSessionClient::new(
            user_id,
            settings,
            self.control.clone(),
            self.realtime.clone(),
            media,
        )
    }
}

async fn next_matching(
    stream: &mut SessionStream,
    mut predicate: impl FnMut(&SessionView) -> bool,
) -> SessionView {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let view = stream.next().await.expect("stream open");
            if predicate(&view) {
                return view;
            }
        }
    })
    .await
    .expect("timely snapshot")
}

#[tokio::test]
async fn auto_join_create_attaches_media_and_second_create_reports_live_session() {
    let w = world().await;
    let media = Arc::new(RecordingMedia::default());
    let alice = w.client(ALICE, media.clone());
    let bob = w.client(BOB, Arc::new(RecordingMedia::default()));

    let session_id = alice
        .create_session(CONVERSATION, CallType::Video, vec![BOB], InitiatorMode::AutoJoin)
        .await
        .expect("create");
    assert_eq!(*media.attaches.lock().unwrap(), vec![(session_id, ALICE)]);
    let attached = alice.attached_media(session_id).await.expect("media");
    assert_eq!(attached.room_name(), format!("call:{session_id}"));
    assert_eq!(
        attached.published_tracks(),
        vec![LocalTrack::Microphone, LocalTrack::Camera]
    );

    let err = bob
        .create_session(CONVERSATION, CallType::Audio, vec![], InitiatorMode::AutoJoin)
        .await
        .expect_err("already live");
    assert_eq!(err, CallError::AlreadyActive { session_id });
    assert!(!err.is_retryable());

    let live = bob.live_session(CONVERSATION).await.expect("live");
    assert_eq!(live.map(|v| v.session_id()), Some(session_id));
}

#[tokio::test]
async fn create_recovers_a_start_committed_before_a_transient_failure() {
    let w = world().await;
    let media = Arc::new(RecordingMedia::default());
    let alice = w.client(ALICE, media.clone());

    w.control.lose_start_response.store(true, Ordering::SeqCst);
    let session_id = alice
        .create_session(CONVERSATION, CallType::Audio, vec![BOB], InitiatorMode::AutoJoin)
        .await
        .expect("retried create resolves to the committed call");

    let live = alice.live_session(CONVERSATION).await.expect("live").expect("one call");
    assert_eq!(live.session_id(), session_id);
    assert_eq!(live.session.initiator_id, ALICE);
    assert_eq!(*media.attaches.lock().unwrap(), vec![(session_id, ALICE)]);
    assert!(alice.attached_media(session_id).await.is_some());
}

#[tokio::test]
async fn retried_create_still_refuses_someone_elses_live_call() {
    let w = world().await;
    let alice = w.client(ALICE, Arc::new(RecordingMedia::default()));
    let bob = w.client(BOB, Arc::new(RecordingMedia::default()));
    let session_id = alice
        .create_session(CONVERSATION, CallType::Audio, vec![], InitiatorMode::AutoJoin)
        .await
        .expect("create");

    w.control.fail_next.store(1, Ordering::SeqCst);
    let err = bob
        .create_session(CONVERSATION, CallType::Audio, vec![], InitiatorMode::AutoJoin)
        .await
        .expect_err("alice's call is live");
    assert_eq!(err, CallError::AlreadyActive { session_id });
}

#[tokio::test]
async fn join_after_end_fails_without_attaching_media() {
    let w = world().await;
    let alice = w.client(ALICE, Arc::new(RecordingMedia::default()));
    let carol_media = Arc::new(RecordingMedia::default());
    let carol = w.client(CAROL, carol_media.clone());

    let session_id = alice
        .create_session(CONVERSATION, CallType::Audio, vec![BOB, CAROL], InitiatorMode::AutoJoin)
        .await
        .expect("create");
    let ended = alice.end_session(session_id).await.expect("end");
    assert!(ended.is_ended());
    assert!(alice.attached_media(session_id).await.is_none());

    let err = carol.join_session(session_id).await.expect_err("ended");
    assert_eq!(err, CallError::SessionEnded { session_id });
    assert!(carol_media.attaches.lock().unwrap().is_empty());
    assert!(carol.attached_media(session_id).await.is_none());
}

#[tokio::test]
async fn leave_releases_media_and_repeats_succeed() {
    let w = world().await;
    let alice = w.client(ALICE, Arc::new(RecordingMedia::default()));
    let bob = w.client(BOB, Arc::new(RecordingMedia::default()));

    let session_id = alice
        .create_session(CONVERSATION, CallType::Audio, vec![BOB], InitiatorMode::AutoJoin)
        .await
        .expect("create");
    let view = bob.join_session(session_id).await.expect("join");
    assert_eq!(view.joined_count(), 2);
    let media = bob.attached_media(session_id).await.expect("media");
    assert_eq!(media.published_tracks(), vec![LocalTrack::Microphone]);

    bob.leave_session(session_id).await.expect("leave");
    assert!(bob.attached_media(session_id).await.is_none());
    assert!(media.published_tracks().is_empty());
    bob.leave_session(session_id).await.expect("repeat leave");

    alice.leave_session(session_id).await.expect("last leave");
    let view = alice.fetch_view(session_id).await.expect("view");
    assert_eq!(view.state(), SessionState::Cooldown);

    bob.leave_session(SessionId::new())
        .await
        .expect("leaving an unknown call is a no-op");
}

#[tokio::test]
async fn leave_now_skips_cooldown() {
    let w = world().await;
    let alice = w.client(ALICE, Arc::new(RecordingMedia::default()));

    let session_id = alice
        .create_session(CONVERSATION, CallType::Audio, vec![], InitiatorMode::AutoJoin)
        .await
        .expect("create");
    alice.leave_session_now(session_id).await.expect("leave");
    let view = alice.fetch_view(session_id).await.expect("view");
    assert!(view.is_ended());
    assert!(alice.live_session(CONVERSATION).await.expect("live").is_none());
}

#[tokio::test]
async fn failed_media_attach_leaves_the_call_through_transient_errors() {
    let w = world().await;
    let alice = w.client(ALICE, Arc::new(RecordingMedia::default()));
    let bob = w.client(
        BOB,
        Arc::new(RecordingMedia {
            fail: true,
            ..Default::default()
        }),
    );

    let session_id = alice
        .create_session(CONVERSATION, CallType::Audio, vec![BOB], InitiatorMode::AutoJoin)
        .await
        .expect("create");
    w.control.fail_next_leave.store(2, Ordering::SeqCst);
    let err = bob.join_session(session_id).await.expect_err("attach fails");
    assert!(matches!(err, CallError::Media(_)));

    let view = alice.fetch_view(session_id).await.expect("view");
    assert_eq!(view.status_of(BOB), Some(ParticipantStatus::Left));
    assert_eq!(view.joined_users(), vec![ALICE]);
    assert_eq!(w.control.fail_next_leave.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn transient_failures_retry_until_attempts_run_out() {
    let w = world().await;
    let alice = w.client(ALICE, Arc::new(RecordingMedia::default()));

    w.control.fail_next.store(3, Ordering::SeqCst);
    let live = alice.live_session(CONVERSATION).await.expect("retried");
    assert!(live.is_none());
    assert_eq!(w.control.fail_next.load(Ordering::SeqCst), 0);

    let impatient = w.client_with(
        ALICE,
        Arc::new(RecordingMedia::default()),
        ClientSettings {
            retry_attempts: 2,
            ..fast_settings()
        },
    );
    w.control.fail_next.store(5, Ordering::SeqCst);
    let err = impatient
        .live_session(CONVERSATION)
        .await
        .expect_err("gives up");
    assert!(matches!(err, CallError::StoreUnavailable(_)));
    assert!(err.is_retryable());
    assert_eq!(w.control.fail_next.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn refusals_are_not_retried() {
    let w = world().await;
    let outsider = w.client(UserId(99), Arc::new(RecordingMedia::default()));

    let err = outsider
        .create_session(CONVERSATION, CallType::Audio, vec![], InitiatorMode::AutoJoin)
        .await
        .expect_err("not a member");
    assert_eq!(err.code(), Some(ErrorCode::Forbidden));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn observe_session_follows_changes_and_releases_media_when_call_ends() {
    let w = world().await;
    let alice = w.client(ALICE, Arc::new(RecordingMedia::default()));
    let bob = w.client(BOB, Arc::new(RecordingMedia::default()));

    let session_id = alice
        .create_session(CONVERSATION, CallType::Audio, vec![BOB, CAROL], InitiatorMode::AutoJoin)
        .await
        .expect("create");

    let mut snapshots = bob.observe_session(session_id).await.expect("observe");
    let first = next_matching(&mut snapshots, |_| true).await;
    assert_eq!(first.session_id(), session_id);
    assert_eq!(first.status_of(BOB), Some(ParticipantStatus::Invited));

    bob.acknowledge_ring(session_id).await.expect("ring");
    bob.join_session(session_id).await.expect("join");
    let joined = next_matching(&mut snapshots, |v| v.joined_count() == 2).await;
    assert_eq!(joined.status_of(BOB), Some(ParticipantStatus::Joined));
    assert!(bob.attached_media(session_id).await.is_some());

    alice.end_session(session_id).await.expect("end");
    let ended = next_matching(&mut snapshots, SessionView::is_ended).await;
    assert_eq!(ended.status_of(BOB), Some(ParticipantStatus::Left));
    assert_eq!(ended.status_of(CAROL), Some(ParticipantStatus::Left));
    assert!(bob.attached_media(session_id).await.is_none());
}

#[tokio::test]
async fn observer_resubscribes_and_rereads_after_disconnect() {
    let w = world().await;
    let alice = w.client(ALICE, Arc::new(RecordingMedia::default()));
    let bob = w.client(BOB, Arc::new(RecordingMedia::default()));

    let session_id = alice
        .create_session(CONVERSATION, CallType::Audio, vec![BOB], InitiatorMode::AutoJoin)
        .await
        .expect("create");
    let mut snapshots = alice.observe_session(session_id).await.expect("observe");
    next_matching(&mut snapshots, |_| true).await;
    for _ in 0..100 {
        if w.realtime.subscribes.load(Ordering::SeqCst) >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    w.realtime.disconnect_all();
    bob.reject_session(session_id).await.expect("reject");

    let view = next_matching(&mut snapshots, |v| {
        v.status_of(BOB) == Some(ParticipantStatus::Rejected)
    })
    .await;
    assert_eq!(view.state(), SessionState::Active);
    assert!(w.realtime.subscribes.load(Ordering::SeqCst) >= 2);
    assert!(alice.attached_media(session_id).await.is_some());
}

#[tokio::test]
async fn http_control_plane_maps_error_bodies_and_unreachable_servers() {
    let live_id = SessionId::new();
    let app = Router::new().route(
        "/calls",
        post(move || async move {
            (
                StatusCode::CONFLICT,
                Json(ApiError::already_active(live_id)),
            )
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    let control = HttpControlPlane::new(format!("http://{addr}/"));
    let err = control
        .start_call(StartCallRequest {
            user_id: ALICE,
            conversation_id: CONVERSATION,
            call_type: CallType::Audio,
            invitees: vec![],
            initiator_mode: InitiatorMode::AutoJoin,
        })
        .await
        .expect_err("conflict");
    assert_eq!(
        CallError::from(err),
        CallError::AlreadyActive {
            session_id: live_id
        }
    );

    let err = control
        .get_session(live_id, ALICE)
        .await
        .expect_err("no such route");
    assert_eq!(err.code, ErrorCode::NotFound);

    let closed = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let closed_addr = closed.local_addr().expect("addr");
    drop(closed);
    let err = HttpControlPlane::new(format!("http://{closed_addr}"))
        .live_session(CONVERSATION, ALICE)
        .await
        .expect_err("unreachable");
    assert!(CallError::from(err).is_retryable());
}

#[tokio::test]
async fn websocket_connector_decodes_events_and_reports_close() {
    let session_id = SessionId::new();
    let event = RealtimeEvent::SessionChanged {
        kind: ChangeKind::Delete,
        session: shared::protocol::CallSessionRecord {
            session_id,
            conversation_id: CONVERSATION,
            call_type: CallType::Audio,
            state: SessionState::Ended,
            initiator_id: ALICE,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            ended_at: Some(Utc::now()),
        },
    };
    let payload = serde_json::to_string(&event).expect("json");
    let app = Router::new().route(
        "/realtime",
        get(move |ws: WebSocketUpgrade| {
            let payload = payload.clone();
            async move {
                ws.on_upgrade(move |mut socket| async move {
                    let _ = socket.send(WsMessage::Text("not json".into())).await;
                    let _ = socket.send(WsMessage::Text(payload)).await;
                    let _ = socket.send(WsMessage::Close(None)).await;
                })
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    let connector = WsRealtimeConnector::new(format!("http://{addr}"));
    assert_eq!(
        connector
            .realtime_url(CONVERSATION, BOB)
            .expect("url")
            .as_str(),
        format!("ws://{addr}/realtime?user_id=2&conversation_id=7")
    );

    let mut subscription = connector.subscribe(CONVERSATION, BOB).await.expect("subscribe");
    let received = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("timely")
        .expect("event");
    assert_eq!(received, event);
    let closed = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("timely close");
    assert!(closed.is_none());
}

#[test]
fn backoff_doubles_up_to_the_cap() {
    let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
    let delays: Vec<_> = (0..4).map(|_| backoff.next_delay()).collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(350),
            Duration::from_millis(350),
        ]
    );
    backoff.reset();
    assert_eq!(backoff.next_delay(), Duration::from_millis(100));
}

#[test]
fn realtime_url_rejects_non_http_servers() {
    let connector = WsRealtimeConnector::new("ftp://example.test");
    assert!(connector.realtime_url(CONVERSATION, ALICE).is_err());
}
