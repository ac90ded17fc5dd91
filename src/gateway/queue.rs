//! 单槽消息队列
//!
//! 请求在途期间，每个对话方最多保留一条待发消息；新输入覆盖旧输入（后写者胜），不追加。

use std::time::Instant;

use super::message::RequestMetadata;

/// 一条待发消息
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub text: String,
    pub metadata: RequestMetadata,
    pub queued_at: Instant,
}

impl PendingMessage {
    pub fn new(text: impl Into<String>, metadata: RequestMetadata) -> Self {
        Self {
            text: text.into(),
            metadata,
            queued_at: Instant::now(),
        }
    }
}

/// 单槽：offer 覆盖，take 取出
#[derive(Debug, Default)]
pub struct QueueSlot {
    pending: Option<PendingMessage>,
}

impl QueueSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// 放入消息，返回被替换掉的旧消息
    pub fn offer(&mut self, message: PendingMessage) -> Option<PendingMessage> {
        self.pending.replace(message)
    }

    pub fn take(&mut self) -> Option<PendingMessage> {
        self.pending.take()
    }

    pub fn peek(&self) -> Option<&PendingMessage> {
        self.pending.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_none()
    }
}
