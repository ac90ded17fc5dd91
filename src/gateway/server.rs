//! 中继 HTTP 接口（axum）
//!
//! 代理侧路由（register / session / dispatch / chat / status）在配置了共享令牌时需带 `X-SL-Token` 头；
//! `/callback` 只认回调令牌。请求体在边界处解码一次，解码失败一律 400。

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use subtle::ConstantTimeEq;

use super::hub::RelayHub;
use super::message::{
    CallbackMessage, Conversant, DispatchRequest, EndSessionRequest, RegisterRequest,
    RegisterResponse, StartSessionRequest,
};
use crate::core::RelayError;
use crate::observability::log_request;

/// 代理共享令牌请求头
pub const SHARED_TOKEN_HEADER: &str = "x-sl-token";

/// 服务状态
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<RelayHub>,
    pub shared_token: Option<String>,
}

impl AppState {
    pub fn new(hub: Arc<RelayHub>, shared_token: Option<String>) -> Self {
        Self {
            hub,
            shared_token: shared_token.filter(|t| !t.is_empty()),
        }
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), RelayError> {
        let Some(expected) = &self.shared_token else {
            return Ok(());
        };
        let presented = headers
            .get(SHARED_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
            Ok(())
        } else {
            Err(RelayError::Unauthorized)
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            RelayError::Validation(_) | RelayError::Serialization(_) => {
                (StatusCode::BAD_REQUEST, "invalid_request")
            }
            RelayError::DuplicateRequest(_) => (StatusCode::CONFLICT, "duplicate_request"),
            RelayError::Busy(_) => (StatusCode::CONFLICT, "busy"),
            RelayError::CallbackChannelRegistered(_) => {
                (StatusCode::CONFLICT, "callback_channel_registered")
            }
            RelayError::TokenMismatch => (StatusCode::CONFLICT, "token_mismatch"),
            RelayError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            RelayError::Dispatch(_) => (StatusCode::BAD_GATEWAY, "dispatch_failed"),
            RelayError::Config(_) | RelayError::Io(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        if status.is_server_error() {
            tracing::error!("{}", self);
        } else {
            tracing::debug!("{}", self);
        }
        (status, Json(json!({ "error": code }))).into_response()
    }
}

/// 创建中继路由
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/register", post(register))
        .route("/session/start", post(start_session))
        .route("/session/end", post(end_session))
        .route("/dispatch", post(dispatch))
        .route("/chat", post(chat))
        .route("/callback", post(callback))
        .route("/status", get(status))
        .with_state(state)
}

fn decode<T: DeserializeOwned>(body: &Bytes) -> Result<T, RelayError> {
    serde_json::from_slice(body).map_err(|e| RelayError::Validation(format!("malformed body: {}", e)))
}

fn logged(route: &str, conversant: &str, message: &str, response: Response) -> Response {
    log_request(route, conversant, message, response.status().as_u16());
    response
}

/// POST /register - 登记（或重新登记）回调地址
async fn register(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let result = async {
        state.authorize(&headers)?;
        let request: RegisterRequest = decode(&body)?;
        let issued = state.hub.register(&request.endpoint).await?;
        Ok::<_, RelayError>(RegisterResponse {
            token: issued.token.as_str().to_string(),
            generation: issued.generation,
        })
    }
    .await;

    let response = match result {
        Ok(registered) => Json(registered).into_response(),
        Err(e) => e.into_response(),
    };
    logged("/register", "", "", response)
}

/// POST /session/start
async fn start_session(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let result = async {
        state.authorize(&headers)?;
        let request: StartSessionRequest = decode(&body)?;
        let id = request.conversant_id.trim().to_string();
        let conversant = Conversant {
            display_name: request.display_name.unwrap_or_default(),
            id: id.clone(),
            endpoint: request.endpoint,
        };
        let session_state = state.hub.start_session(conversant).await?;
        Ok::<_, RelayError>((id, session_state))
    }
    .await;

    match result {
        Ok((id, session_state)) => logged(
            "/session/start",
            &id,
            "",
            Json(json!({ "state": session_state })).into_response(),
        ),
        Err(e) => logged("/session/start", "", "", e.into_response()),
    }
}

/// POST /session/end
async fn end_session(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let result = async {
        state.authorize(&headers)?;
        let request: EndSessionRequest = decode(&body)?;
        let ended = state.hub.end_session(&request.conversant_id).await;
        Ok::<_, RelayError>((request.conversant_id, ended))
    }
    .await;

    match result {
        Ok((id, ended)) => logged(
            "/session/end",
            &id,
            "",
            Json(json!({ "ended": ended })).into_response(),
        ),
        Err(e) => logged("/session/end", "", "", e.into_response()),
    }
}

/// POST /dispatch - 异步派发，立即返回 202
async fn dispatch(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(e) = state.authorize(&headers) {
        return logged("/dispatch", "", "", e.into_response());
    }
    let request: DispatchRequest = match decode(&body) {
        Ok(request) => request,
        Err(e) => return logged("/dispatch", "", "", e.into_response()),
    };

    let conversant = request.conversant_id.clone();
    let message = request.message.clone();
    let response = match state.hub.submit_input(request).await {
        Ok(accepted) => (StatusCode::ACCEPTED, Json(accepted)).into_response(),
        Err(e) => e.into_response(),
    };
    logged("/dispatch", &conversant, &message, response)
}

/// POST /chat - 同步派发，回复直接返回；终止失败时 502 并带通用回复
async fn chat(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(e) = state.authorize(&headers) {
        return logged("/chat", "", "", e.into_response());
    }
    let request: DispatchRequest = match decode(&body) {
        Ok(request) => request,
        Err(e) => return logged("/chat", "", "", e.into_response()),
    };

    let conversant = request.conversant_id.clone();
    let message = request.message.clone();
    let response = match state.hub.chat_sync(request).await {
        Ok(reply) if reply.ok => Json(reply).into_response(),
        Ok(reply) => (StatusCode::BAD_GATEWAY, Json(reply)).into_response(),
        Err(e) => e.into_response(),
    };
    logged("/chat", &conversant, &message, response)
}

/// POST /callback - Responder 回调 / 代理拉取
async fn callback(State(state): State<AppState>, body: Bytes) -> Response {
    let message: CallbackMessage = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("malformed callback body: {}", e);
            let response =
                (StatusCode::BAD_REQUEST, Json(json!({ "error": "malformed_callback" }))).into_response();
            return logged("/callback", "", "", response);
        }
    };

    let conversant = message.conversant_id().to_string();
    let ack = state.hub.handle_callback(message).await;
    logged("/callback", &conversant, "", Json(ack).into_response())
}

/// GET /status - 运维快照
async fn status(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = state.authorize(&headers) {
        return e.into_response();
    }
    Json(state.hub.snapshot().await).into_response()
}
