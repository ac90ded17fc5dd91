//! 中继消息协议定义
//!
//! 代理 ↔ 中继、中继 ↔ Responder 之间的统一消息格式。回调消息在边界处解码一次，
//! 之后只以类型化的枚举流转。

use serde::{Deserialize, Serialize};

use crate::core::FailureClass;

/// 对话方 ID（代理侧稳定标识，如 avatar key）
pub type ConversantId = String;

/// 当前回调消息版本
pub const CALLBACK_VERSION: u32 = 1;

/// 请求 ID：在其生命周期内全局唯一
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        Self(format!("req_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 对话方
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversant {
    pub id: ConversantId,
    pub display_name: String,
    /// 代理登记的回调地址（推送回复用）
    pub endpoint: Option<String>,
}

impl Conversant {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            endpoint: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// 无会话
    Idle,
    /// 会话打开，无在途请求
    Active,
    /// 已派发一个请求，等待回调
    AwaitingReply,
}

/// 派发方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// 立即返回，回复经回调到达
    Async,
    /// 回复在 HTTP 响应中直接返回
    Sync,
}

/// 代理附带的上下文字段，原样转发给 Responder
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub npc_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// Responder 的回复
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponderReply {
    pub reply: String,
    #[serde(default, alias = "action_tags")]
    pub actions: Vec<String>,
    /// 会话上下文（线程 ID 等），成功解析后写回 Session Store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl ResponderReply {
    pub fn text(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            actions: Vec::new(),
            context: None,
        }
    }
}

/// 会话结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Explicit,
    Timeout,
}

/// 会话管理器对外发出的事件（唯一可观察的副作用）
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Reply {
        conversant: Conversant,
        request_id: RequestId,
        mode: DispatchMode,
        reply: ResponderReply,
    },
    Failed {
        conversant: Conversant,
        request_id: RequestId,
        mode: DispatchMode,
        class: FailureClass,
        reply: String,
    },
    Ended {
        conversant: Conversant,
        reason: EndReason,
    },
}

impl SessionEvent {
    pub fn conversant(&self) -> &Conversant {
        match self {
            SessionEvent::Reply { conversant, .. }
            | SessionEvent::Failed { conversant, .. }
            | SessionEvent::Ended { conversant, .. } => conversant,
        }
    }
}

// ---- 代理 → 中继 ----

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub token: String,
    pub generation: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartSessionRequest {
    pub conversant_id: ConversantId,
    pub display_name: Option<String>,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndSessionRequest {
    pub conversant_id: ConversantId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchRequest {
    pub conversant_id: ConversantId,
    pub display_name: Option<String>,
    pub endpoint: Option<String>,
    pub message: String,
    pub callback_token: Option<String>,
    #[serde(flatten)]
    pub metadata: RequestMetadata,
}

impl DispatchRequest {
    pub fn conversant(&self) -> Conversant {
        Conversant {
            id: self.conversant_id.trim().to_string(),
            // 未提供时留空，会话保留已有显示名
            display_name: self
                .display_name
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .to_string(),
            endpoint: self.endpoint.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Dispatched,
    Queued,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchAccepted {
    pub status: DispatchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default)]
    pub replaced: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub ok: bool,
    pub reply: String,
    pub reply_chars: usize,
    pub actions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---- Responder / 代理 → 中继回调 ----

fn default_version() -> u32 {
    CALLBACK_VERSION
}

/// 回调消息（带版本的标签联合）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallbackMessage {
    /// Responder 送达一条回复
    Package {
        #[serde(default = "default_version")]
        v: u32,
        request_id: RequestId,
        conversant_id: ConversantId,
        reply_text: String,
        #[serde(default)]
        action_tags: Vec<String>,
        token: String,
        #[serde(default)]
        context: Option<String>,
    },
    /// 代理拉取 outbox 中尚未送达的回复
    FetchRequest {
        #[serde(default = "default_version")]
        v: u32,
        conversant_id: ConversantId,
        token: String,
    },
}

impl CallbackMessage {
    pub fn version(&self) -> u32 {
        match self {
            CallbackMessage::Package { v, .. } | CallbackMessage::FetchRequest { v, .. } => *v,
        }
    }

    pub fn conversant_id(&self) -> &str {
        match self {
            CallbackMessage::Package { conversant_id, .. }
            | CallbackMessage::FetchRequest { conversant_id, .. } => conversant_id,
        }
    }
}

/// outbox 中的一条待取消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub kind: OutboxKind,
    pub text: String,
    #[serde(default)]
    pub actions: Vec<String>,
    /// 毫秒时间戳
    pub at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxKind {
    Reply,
    Failure,
    Ended,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallbackAck {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replies: Vec<OutboxEntry>,
}

impl CallbackAck {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            replies: Vec::new(),
        }
    }

    pub fn rejected() -> Self {
        Self::default()
    }
}

/// 运维状态快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub sessions: usize,
    pub outstanding: usize,
    pub registrations: usize,
}
