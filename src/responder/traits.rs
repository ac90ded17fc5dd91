//! Responder 抽象
//!
//! 所有后端（HTTP / Mock）实现 Responder：把一条对话方消息送到指定端点，
//! 端点要么直接回复，要么接受后经回调送达。

use async_trait::async_trait;
use serde::Serialize;

use crate::core::DispatchError;
use crate::gateway::{ConversantId, RequestId, RequestMetadata, ResponderReply};

/// 发送给 Responder 的请求体
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponderRequest {
    pub request_id: RequestId,
    pub conversant_id: ConversantId,
    pub display_name: String,
    pub message: String,
    /// 回调时必须原样带回的令牌
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    /// Session Store 中的上下文标识
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_context: Option<String>,
    #[serde(flatten)]
    pub metadata: RequestMetadata,
}

/// Responder 的应答方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponderAck {
    /// 已接受，回复稍后经回调到达
    Accepted,
    /// 直接回复
    Replied(ResponderReply),
}

/// Responder trait
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(
        &self,
        endpoint: &str,
        request: &ResponderRequest,
    ) -> Result<ResponderAck, DispatchError>;

    /// 名称（日志用）
    fn name(&self) -> &str {
        "responder"
    }
}
