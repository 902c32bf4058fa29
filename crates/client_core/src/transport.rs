use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{ConversationId, SessionId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ActorRequest, InviteRequest, JoinAck, LeaveRequest, RealtimeEvent, SessionView,
        StartCallRequest,
    },
};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::{CallControlPlane, RealtimeConnector, RealtimeSubscription};

const SUBSCRIPTION_BUFFER: usize = 256;

/// Control plane reached over the server's JSON routes.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    http: reqwest::Client,
    server_url: String,
}

impl HttpControlPlane {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, user_id: UserId) -> Result<T, ApiError> {
        let response = self
            .http
            .get(format!("{}{path}", self.server_url))
            .query(&[("user_id", user_id.0)])
            .send()
            .await
            .map_err(unreachable_server)?;
        decode(response).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self
            .http
            .post(format!("{}{path}", self.server_url))
            .json(body)
            .send()
            .await
            .map_err(unreachable_server)?;
        decode(response).await
    }
}

fn unreachable_server(err: reqwest::Error) -> ApiError {
    ApiError::new(
        ErrorCode::StoreUnavailable,
        format!("call server unreachable: {err}"),
    )
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let status = response.status();
    if status.is_success() {
        return response.json::<T>().await.map_err(|err| {
            ApiError::new(ErrorCode::Internal, format!("malformed response body: {err}"))
        });
    }

    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(err) => Err(err),
        Err(_) => {
            let code = match status {
                StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::BAD_GATEWAY
                | StatusCode::GATEWAY_TIMEOUT => ErrorCode::StoreUnavailable,
                StatusCode::FORBIDDEN => ErrorCode::Forbidden,
                StatusCode::NOT_FOUND => ErrorCode::NotFound,
                s if s.is_client_error() => ErrorCode::Validation,
                _ => ErrorCode::Internal,
            };
            Err(ApiError::new(code, format!("server returned {status}: {body}")))
        }
    }
}

#[async_trait]
impl CallControlPlane for HttpControlPlane {
    async fn start_call(&self, request: StartCallRequest) -> Result<SessionView, ApiError> {
        self.post("/calls", &request).await
    }

    async fn get_session(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> Result<SessionView, ApiError> {
        self.get(&format!("/calls/{session_id}"), user_id).await
    }

    async fn live_session(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<SessionView>, ApiError> {
        self.get(
            &format!("/conversations/{}/calls/live", conversation_id.0),
            user_id,
        )
        .await
    }

    async fn invite(
        &self,
        session_id: SessionId,
        request: InviteRequest,
    ) -> Result<SessionView, ApiError> {
        self.post(&format!("/calls/{session_id}/invite"), &request)
            .await
    }

    async fn ring(&self, session_id: SessionId, user_id: UserId) -> Result<SessionView, ApiError> {
        self.post(&format!("/calls/{session_id}/ring"), &ActorRequest { user_id })
            .await
    }

    async fn join(&self, session_id: SessionId, user_id: UserId) -> Result<JoinAck, ApiError> {
        self.post(&format!("/calls/{session_id}/join"), &ActorRequest { user_id })
            .await
    }

    async fn reject(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> Result<SessionView, ApiError> {
        self.post(
            &format!("/calls/{session_id}/reject"),
            &ActorRequest { user_id },
        )
        .await
    }

    async fn leave(
        &self,
        session_id: SessionId,
        request: LeaveRequest,
    ) -> Result<SessionView, ApiError> {
        self.post(&format!("/calls/{session_id}/leave"), &request)
            .await
    }

    async fn end(&self, session_id: SessionId, user_id: UserId) -> Result<SessionView, ApiError> {
        self.post(&format!("/calls/{session_id}/end"), &ActorRequest { user_id })
            .await
    }
}

/// Realtime channel carried over the server's `/realtime` websocket.
#[derive(Debug, Clone)]
pub struct WsRealtimeConnector {
    server_url: String,
}

impl WsRealtimeConnector {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
        }
    }

    pub fn realtime_url(&self, conversation_id: ConversationId, user_id: UserId) -> Result<Url> {
        let mut url = Url::parse(&self.server_url)
            .with_context(|| format!("invalid server url: {}", self.server_url))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            _ => return Err(anyhow!("server_url must start with http:// or https://")),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot switch {} to {scheme}", self.server_url))?;
        url.set_path("/realtime");
        url.query_pairs_mut()
            .clear()
            .append_pair("user_id", &user_id.0.to_string())
            .append_pair("conversation_id", &conversation_id.0.to_string());
        Ok(url)
    }
}

#[async_trait]
impl RealtimeConnector for WsRealtimeConnector {
    async fn subscribe(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<RealtimeSubscription> {
        let ws_url = self.realtime_url(conversation_id, user_id)?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (_, mut ws_reader) = ws_stream.split();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<RealtimeEvent>(&text) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(error = %err, "realtime: undecodable event"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "realtime: websocket error");
                        break;
                    }
                }
            }
            debug!(conversation_id = conversation_id.0, "realtime: reader stopped");
        });

        Ok(RealtimeSubscription::new(rx, Some(reader)))
    }
}
