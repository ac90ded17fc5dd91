//! HTTP Responder 客户端
//!
//! 以 JSON POST 调用 Responder 端点，并把传输层 / 状态码错误归入 FailureClass：
//! - 连接失败、超时、DNS 解析失败 → Transport（可重放）
//! - 5xx → Upstream（可重放）
//! - 401/403 且 error 为 token_mismatch → TokenMismatch（重新登记）
//! - 其余 401/403 → Unauthorized；其余 4xx → Validation（终止）

use std::error::Error as _;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::traits::{Responder, ResponderAck, ResponderRequest};
use crate::core::{DispatchError, RelayError};
use crate::gateway::ResponderReply;

/// 错误体中表示令牌失配的 error 值
const TOKEN_MISMATCH_CODE: &str = "token_mismatch";

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
}

/// 兼容 `{ok, reply, actions}` 的回复体
#[derive(Debug, Deserialize)]
struct ReplyBody {
    #[serde(default)]
    ok: Option<bool>,
    #[serde(flatten)]
    reply: ResponderReply,
}

pub struct HttpResponder {
    client: Client,
}

impl HttpResponder {
    pub fn new(timeout: Duration) -> Result<Self, RelayError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sl-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RelayError::Config(format!("http client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

/// reqwest 错误链中是否出现 DNS 解析失败
fn is_unresolved_host(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string().to_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return true;
        }
        source = cause.source();
    }
    false
}

fn classify_transport(err: reqwest::Error) -> DispatchError {
    if is_unresolved_host(&err) {
        let host = err
            .url()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        DispatchError::UnresolvedHost(host)
    } else if err.is_timeout() {
        DispatchError::Transport("timeout".to_string())
    } else {
        DispatchError::Transport(err.without_url().to_string())
    }
}

pub(crate) fn classify_status(status: StatusCode, body: &str) -> DispatchError {
    let code = status.as_u16();
    if status.is_server_error() {
        return DispatchError::Upstream { status: code };
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        let mismatch = serde_json::from_str::<ErrorBody>(body)
            .ok()
            .and_then(|b| b.error)
            .is_some_and(|e| e == TOKEN_MISMATCH_CODE);
        return if mismatch {
            DispatchError::TokenMismatch
        } else {
            DispatchError::Unauthorized { status: code }
        };
    }
    DispatchError::Validation(format!("responder returned {}", code))
}

pub(crate) fn parse_reply(body: &str) -> Result<ResponderAck, DispatchError> {
    if body.trim().is_empty() {
        return Ok(ResponderAck::Accepted);
    }
    let parsed: ReplyBody = serde_json::from_str(body)
        .map_err(|e| DispatchError::Validation(format!("malformed responder reply: {}", e)))?;
    if parsed.ok == Some(false) {
        // 上游自己报告失败（如模型调用出错）
        return Err(DispatchError::Upstream { status: 200 });
    }
    if parsed.reply.reply.trim().is_empty() {
        return Err(DispatchError::Validation("empty reply".to_string()));
    }
    Ok(ResponderAck::Replied(parsed.reply))
}

#[async_trait]
impl Responder for HttpResponder {
    async fn respond(
        &self,
        endpoint: &str,
        request: &ResponderRequest,
    ) -> Result<ResponderAck, DispatchError> {
        let resp = self
            .client
            .post(endpoint)
            .json(request)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        let body = resp.text().await.map_err(classify_transport)?;

        if status == StatusCode::ACCEPTED {
            return Ok(ResponderAck::Accepted);
        }
        if !status.is_success() {
            tracing::debug!(endpoint, status = status.as_u16(), "responder error status");
            return Err(classify_status(status, &body));
        }
        parse_reply(&body)
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_are_upstream() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            DispatchError::Upstream { status: 502 }
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, "oops"),
            DispatchError::Upstream { status: 503 }
        );
    }

    #[test]
    fn test_token_mismatch_is_distinct_from_auth() {
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, r#"{"error":"token_mismatch"}"#),
            DispatchError::TokenMismatch
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, r#"{"error":"unauthorized"}"#),
            DispatchError::Unauthorized { status: 403 }
        );
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "{}"),
            DispatchError::Validation(_)
        ));
    }

    #[test]
    fn test_parse_inline_reply() {
        let ack = parse_reply(r#"{"ok":true,"reply":"hi there","reply_chars":8,"actions":["Give:QUEST_REWARD"]}"#)
            .unwrap();
        match ack {
            ResponderAck::Replied(reply) => {
                assert_eq!(reply.reply, "hi there");
                assert_eq!(reply.actions, vec!["Give:QUEST_REWARD".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_reply_edge_cases() {
        assert_eq!(parse_reply("  ").unwrap(), ResponderAck::Accepted);
        assert_eq!(
            parse_reply(r#"{"ok":false,"reply":"Sorry","error":"empty_reply"}"#),
            Err(DispatchError::Upstream { status: 200 })
        );
        assert!(matches!(parse_reply("<html>"), Err(DispatchError::Validation(_))));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport() {
        let responder = HttpResponder::new(Duration::from_secs(2)).unwrap();
        let request = ResponderRequest {
            request_id: "req_1".into(),
            conversant_id: "c1".into(),
            display_name: "c1".into(),
            message: "hello".into(),
            callback_token: None,
            callback_url: None,
            session_context: None,
            metadata: Default::default(),
        };
        // 端口 9 (discard) 在测试环境中不监听
        let err = responder
            .respond("http://127.0.0.1:9/chat", &request)
            .await
            .unwrap_err();
        assert!(err.is_retriable(), "unexpected {:?}", err);
    }
}
