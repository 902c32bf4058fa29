use super::*;
use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
};
use chrono::{Duration, TimeZone, Utc};
use futures::StreamExt;
use session_engine::{ManualClock, MediaGrantConfig};
use shared::{
    domain::{ConversationId, SessionState, UserId},
    error::{ApiError, ErrorCode},
    protocol::{JoinAck, RealtimeEvent, SessionView, SweepReport},
};
use tower::ServiceExt;

struct TestApp {
    app: Router,
    state: Arc<AppState>,
    clock: Arc<ManualClock>,
}

async fn test_app() -> TestApp {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
    for (conversation, user) in [(1, 1), (1, 2), (1, 3), (2, 1)] {
        storage
            .add_conversation_member(ConversationId(conversation), UserId(user), Utc::now())
            .await
            .expect("member");
    }
    let engine = EngineContext::new(
        storage,
        MediaGrantConfig {
            api_key: "k".to_string(),
            api_secret: "s".to_string(),
            ttl_seconds: 60,
        },
    )
    .with_clock(clock.clone());
    let state = Arc::new(AppState::new(engine));
    TestApp {
        app: build_router(state.clone()),
        state,
        clock,
    }
}

fn post_json(uri: impl AsRef<str>, body: serde_json::Value) -> Request<Body> {
    let body = body.to_string();
    Request::post(uri.as_ref())
        .header("content-type", "application/json")
        .header("content-length", body.len())
        .body(Body::from(body))
        .expect("request")
}

async fn read_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

async fn start(app: &Router, user: i64, invitees: &[i64]) -> SessionView {
    let response = app
        .clone()
        .oneshot(post_json(
            "/calls",
            serde_json::json!({
                "user_id": user,
                "conversation_id": 1,
                "call_type": "audio",
                "invitees": invitees,
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    read_json(response).await
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let t = test_app().await;
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = t.app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn second_start_conflicts_with_live_session_id() {
    let t = test_app().await;
    let view = start(&t.app, 1, &[2]).await;
    assert_eq!(view.state(), SessionState::Active);

    let response = t
        .app
        .clone()
        .oneshot(post_json(
            "/calls",
            serde_json::json!({"user_id": 2, "conversation_id": 1, "call_type": "video"}),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let err: ApiError = read_json(response).await;
    assert_eq!(err.code, ErrorCode::AlreadyActive);
    assert_eq!(err.session_id, Some(view.session_id()));

    let live = Request::get("/conversations/1/calls/live?user_id=2")
        .body(Body::empty())
        .expect("request");
    let response = t.app.oneshot(live).await.expect("response");
    let live: Option<SessionView> = read_json(response).await;
    assert_eq!(live.map(|v| v.session_id()), Some(view.session_id()));
}

#[tokio::test]
async fn join_returns_media_grant_and_ended_calls_are_gone() {
    let t = test_app().await;
    let view = start(&t.app, 1, &[2, 3]).await;
    let session_id = view.session_id();

    let response = t
        .app
        .clone()
        .oneshot(post_json(
            format!("/calls/{session_id}/join"),
            serde_json::json!({"user_id": 2}),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let ack: JoinAck = read_json(response).await;
    assert_eq!(ack.media_grant.room_name, format!("call:{session_id}"));
    assert_eq!(ack.view.joined_count(), 2);

    let response = t
        .app
        .clone()
        .oneshot(post_json(
            format!("/calls/{session_id}/end"),
            serde_json::json!({"user_id": 2}),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let ended: SessionView = read_json(response).await;
    assert!(ended.is_ended());

    let response = t
        .app
        .oneshot(post_json(
            format!("/calls/{session_id}/join"),
            serde_json::json!({"user_id": 3}),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::GONE);
    let err: ApiError = read_json(response).await;
    assert_eq!(err.code, ErrorCode::SessionEnded);
}

#[tokio::test]
async fn call_reads_are_scoped_to_members() {
    let t = test_app().await;
    let view = start(&t.app, 1, &[]).await;

    let outsider = Request::get(format!("/calls/{}?user_id=7", view.session_id()))
        .body(Body::empty())
        .expect("request");
    let response = t.app.clone().oneshot(outsider).await.expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let missing = Request::get(format!(
        "/calls/{}?user_id=1",
        shared::domain::SessionId::new()
    ))
    .body(Body::empty())
    .expect("request");
    let response = t.app.oneshot(missing).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sweep_route_ends_expired_cooldown() {
    let t = test_app().await;
    let view = start(&t.app, 1, &[]).await;
    let response = t
        .app
        .clone()
        .oneshot(post_json(
            format!("/calls/{}/leave", view.session_id()),
            serde_json::json!({"user_id": 1}),
        ))
        .await
        .expect("response");
    let cooling: SessionView = read_json(response).await;
    assert_eq!(cooling.state(), SessionState::Cooldown);

    t.clock.advance(Duration::seconds(61));
    let response = t
        .app
        .clone()
        .oneshot(
            Request::post("/sweep")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    let report: SweepReport = read_json(response).await;
    assert_eq!(
        report,
        SweepReport {
            timed_out: 0,
            ended: 1,
            deleted: 0
        }
    );
}

#[tokio::test]
async fn oversized_bodies_are_rejected() {
    let t = test_app().await;
    let invitees: Vec<i64> = (0..20_000).collect();
    let response = t
        .app
        .oneshot(post_json(
            "/calls",
            serde_json::json!({
                "user_id": 1,
                "conversation_id": 1,
                "call_type": "audio",
                "invitees": invitees,
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn realtime_socket_streams_only_its_conversation() {
    let t = test_app().await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = t.app.clone();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    let refused = tokio_tungstenite::connect_async(format!(
        "ws://{addr}/realtime?user_id=9&conversation_id=1"
    ))
    .await;
    match refused {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::FORBIDDEN)
        }
        Err(other) => panic!("expected forbidden upgrade, got {other}"),
        Ok(_) => panic!("outsider upgrade should be refused"),
    }

    let (mut socket, _) = tokio_tungstenite::connect_async(format!(
        "ws://{addr}/realtime?user_id=1&conversation_id=1"
    ))
    .await
    .expect("connect");
    for _ in 0..100 {
        if t.state.events.receiver_count() > 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    session_engine::start_call(
        &t.state.engine,
        shared::protocol::StartCallRequest {
            user_id: UserId(1),
            conversation_id: ConversationId(2),
            call_type: shared::domain::CallType::Audio,
            invitees: vec![],
            initiator_mode: Default::default(),
        },
    )
    .await
    .expect("other conversation");
    let view = start(&t.app, 1, &[]).await;

    let message = tokio::time::timeout(std::time::Duration::from_secs(5), socket.next())
        .await
        .expect("timely event")
        .expect("stream open")
        .expect("message");
    let text = message.into_text().expect("text frame");
    let event: RealtimeEvent = serde_json::from_str(&text).expect("event json");
    assert_eq!(event.conversation_id(), ConversationId(1));
    assert_eq!(event.session_id(), view.session_id());
}
