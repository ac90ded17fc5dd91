//! 中继错误类型与失败分类
//!
//! 与 DispatchRouter 配合：根据 DispatchError 的 FailureClass 决定重放 / 重新登记 / 终止。

use thiserror::Error;

use crate::gateway::RequestId;

/// 失败分类：决定派发失败后的恢复路径
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// 主机不可达 / 无法解析（可重放一次）
    Transport,
    /// 上游 5xx（可重放一次）
    Upstream,
    /// 回调令牌失配（触发重新登记，而非普通重试）
    Authorization,
    /// 请求体非法（终止，不重试）
    Validation,
    /// 超过 REQUEST_TTL 被回收（终止）
    Stale,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureClass::Transport => write!(f, "transport"),
            FailureClass::Upstream => write!(f, "upstream"),
            FailureClass::Authorization => write!(f, "authorization"),
            FailureClass::Validation => write!(f, "validation"),
            FailureClass::Stale => write!(f, "stale"),
        }
    }
}

/// 向 Responder 派发一次请求时可能出现的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unresolved host: {0}")]
    UnresolvedHost(String),

    #[error("Upstream unavailable (status {status})")]
    Upstream { status: u16 },

    /// Responder 拒绝了当前携带的回调令牌（令牌已被轮换）
    #[error("Callback token rejected by responder")]
    TokenMismatch,

    /// 与令牌轮换无关的鉴权拒绝
    #[error("Unauthorized (status {status})")]
    Unauthorized { status: u16 },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Request expired before a callback arrived")]
    Stale,

    /// 关联表中已无此请求（已被回收或已消费），本次交换静默放弃
    #[error("Request no longer tracked")]
    Abandoned,
}

impl DispatchError {
    pub fn class(&self) -> FailureClass {
        match self {
            DispatchError::Transport(_) | DispatchError::UnresolvedHost(_) => FailureClass::Transport,
            DispatchError::Upstream { .. } => FailureClass::Upstream,
            DispatchError::TokenMismatch => FailureClass::Authorization,
            DispatchError::Unauthorized { .. } | DispatchError::Validation(_) => {
                FailureClass::Validation
            }
            DispatchError::Stale | DispatchError::Abandoned => FailureClass::Stale,
        }
    }

    /// 是否可以重放一次（到 fallback 或回到 primary）
    pub fn is_retriable(&self) -> bool {
        matches!(self.class(), FailureClass::Transport | FailureClass::Upstream)
    }

    pub fn is_token_mismatch(&self) -> bool {
        matches!(self, DispatchError::TokenMismatch)
    }
}

/// 中继层错误（边界校验、状态冲突、配置与 IO）
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate request id: {0}")]
    DuplicateRequest(RequestId),

    /// 同步派发时该会话已有请求在途
    #[error("Conversant {0} already has a request in flight")]
    Busy(String),

    /// 同步派发仅在未登记回调通道时可用
    #[error("Callback channel registered for {0}; use async dispatch")]
    CallbackChannelRegistered(String),

    #[error("Callback token mismatch; re-register the endpoint")]
    TokenMismatch,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
