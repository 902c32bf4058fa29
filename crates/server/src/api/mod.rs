use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use session_engine as engine;
use shared::{
    domain::{ConversationId, SessionId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ActorRequest, InviteRequest, JoinAck, LeaveRequest, SessionView, StartCallRequest,
        SweepReport,
    },
};
use tracing::error;

use crate::app_state::AppState;

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
pub(crate) struct UserQuery {
    pub(crate) user_id: i64,
}

pub(crate) fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::AlreadyActive => StatusCode::CONFLICT,
        ErrorCode::SessionEnded => StatusCode::GONE,
        ErrorCode::StoreUnavailable | ErrorCode::RealtimeDisconnected => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(err.code), Json(err))
}

pub(crate) async fn healthz(State(state): State<Arc<AppState>>) -> ApiResult<&'static str> {
    state.engine.storage.health_check().await.map_err(|e| {
        error!(error = %e, "health check failed");
        reject(ApiError::new(ErrorCode::StoreUnavailable, e.to_string()))
    })?;
    Ok("ok")
}

pub(crate) async fn start_call(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartCallRequest>,
) -> ApiResult<(StatusCode, Json<SessionView>)> {
    let view = engine::start_call(&state.engine, req).await.map_err(reject)?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub(crate) async fn get_call(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
    Query(q): Query<UserQuery>,
) -> ApiResult<Json<SessionView>> {
    let view = engine::get_view(&state.engine, session_id, UserId(q.user_id))
        .await
        .map_err(reject)?;
    Ok(Json(view))
}

pub(crate) async fn live_call(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> ApiResult<Json<Option<SessionView>>> {
    let view = engine::live_session(
        &state.engine,
        ConversationId(conversation_id),
        UserId(q.user_id),
    )
    .await
    .map_err(reject)?;
    Ok(Json(view))
}

pub(crate) async fn invite(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
    Json(req): Json<InviteRequest>,
) -> ApiResult<Json<SessionView>> {
    let view = engine::invite(&state.engine, session_id, req.user_id, req.invitees)
        .await
        .map_err(reject)?;
    Ok(Json(view))
}

pub(crate) async fn ring(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
    Json(req): Json<ActorRequest>,
) -> ApiResult<Json<SessionView>> {
    let view = engine::ring(&state.engine, session_id, req.user_id)
        .await
        .map_err(reject)?;
    Ok(Json(view))
}

pub(crate) async fn join(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
    Json(req): Json<ActorRequest>,
) -> ApiResult<Json<JoinAck>> {
    let ack = engine::join(&state.engine, session_id, req.user_id)
        .await
        .map_err(reject)?;
    Ok(Json(ack))
}

pub(crate) async fn reject_call(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
    Json(req): Json<ActorRequest>,
) -> ApiResult<Json<SessionView>> {
    let view = engine::reject(&state.engine, session_id, req.user_id)
        .await
        .map_err(reject)?;
    Ok(Json(view))
}

pub(crate) async fn leave(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
    Json(req): Json<LeaveRequest>,
) -> ApiResult<Json<SessionView>> {
    let view = engine::leave(&state.engine, session_id, req.user_id, req.skip_cooldown)
        .await
        .map_err(reject)?;
    Ok(Json(view))
}

pub(crate) async fn end(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
    Json(req): Json<ActorRequest>,
) -> ApiResult<Json<SessionView>> {
    let view = engine::end(&state.engine, session_id, req.user_id)
        .await
        .map_err(reject)?;
    Ok(Json(view))
}

pub(crate) async fn sweep(State(state): State<Arc<AppState>>) -> Json<SweepReport> {
    Json(engine::run_sweep(&state.engine).await)
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
