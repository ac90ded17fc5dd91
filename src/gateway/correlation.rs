//! 关联表：request_id → 在途请求
//!
//! 每个请求只被消费一次；迟到或重复的回调在 take 时得到 None，只记日志不重放。
//! 超过 REQUEST_TTL 的条目由 reap 回收，调用方将其视为终止性派发失败。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use super::message::{ConversantId, DispatchMode, RequestId, RequestMetadata};
use super::registry::CallbackToken;
use super::session::DispatchTicket;
use crate::core::RelayError;

/// 一次在途派发
#[derive(Debug, Clone)]
pub struct OutstandingRequest {
    pub request_id: RequestId,
    pub conversant_id: ConversantId,
    pub display_name: String,
    pub message: String,
    pub metadata: RequestMetadata,
    pub mode: DispatchMode,
    /// 当前目标 Responder 端点
    pub endpoint: String,
    /// 对话方登记的回调地址；令牌按此地址校验
    pub reply_endpoint: Option<String>,
    /// 派发时携带的回调令牌
    pub token: Option<CallbackToken>,
    /// 0 或 1：最多重放一次
    pub attempt: u8,
    /// 已因令牌失配重新登记并重派过
    pub relinked: bool,
    /// 等待回调地址重新登记后再重派
    pub awaiting_relink: bool,
    pub created_at: Instant,
}

impl OutstandingRequest {
    pub fn from_ticket(ticket: &DispatchTicket, endpoint: &str, token: Option<CallbackToken>) -> Self {
        Self {
            request_id: ticket.request_id.clone(),
            conversant_id: ticket.conversant.id.clone(),
            display_name: ticket.conversant.display_name.clone(),
            message: ticket.message.clone(),
            metadata: ticket.metadata.clone(),
            mode: ticket.mode,
            endpoint: endpoint.to_string(),
            reply_endpoint: ticket.conversant.endpoint.clone(),
            token,
            attempt: 0,
            relinked: false,
            awaiting_relink: false,
            created_at: Instant::now(),
        }
    }

    pub fn is_stale(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.created_at) > ttl
    }
}

/// 关联表
pub struct CorrelationTable {
    entries: RwLock<HashMap<RequestId, OutstandingRequest>>,
    ttl: Duration,
}

impl CorrelationTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// 记录在途请求；重复 ID 被拒绝
    pub async fn put(&self, entry: OutstandingRequest) -> Result<(), RelayError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&entry.request_id) {
            return Err(RelayError::DuplicateRequest(entry.request_id));
        }
        entries.insert(entry.request_id.clone(), entry);
        Ok(())
    }

    /// 取出（单次消费）
    pub async fn take(&self, request_id: &RequestId) -> Option<OutstandingRequest> {
        let taken = self.entries.write().await.remove(request_id);
        if taken.is_none() {
            tracing::debug!(request_id = %request_id, "correlation miss (late or duplicate)");
        }
        taken
    }

    /// 只读查看，不消费
    pub async fn get(&self, request_id: &RequestId) -> Option<OutstandingRequest> {
        self.entries.read().await.get(request_id).cloned()
    }

    /// 原地修改条目
    pub async fn update<F, R>(&self, request_id: &RequestId, f: F) -> Option<R>
    where
        F: FnOnce(&mut OutstandingRequest) -> R,
    {
        let mut entries = self.entries.write().await;
        entries.get_mut(request_id).map(f)
    }

    /// 回收超过 TTL 的条目
    pub async fn reap(&self, now: Instant) -> Vec<OutstandingRequest> {
        let mut entries = self.entries.write().await;
        let stale: Vec<RequestId> = entries
            .values()
            .filter(|e| e.is_stale(now, self.ttl))
            .map(|e| e.request_id.clone())
            .collect();

        stale
            .iter()
            .filter_map(|id| entries.remove(id))
            .collect()
    }

    /// 等待某回调地址重新登记的请求
    pub async fn awaiting_relink(&self, reply_endpoint: &str) -> Vec<RequestId> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.awaiting_relink && e.reply_endpoint.as_deref() == Some(reply_endpoint))
            .map(|e| e.request_id.clone())
            .collect()
    }

    /// 某对话方的在途请求数（诊断用）
    pub async fn outstanding_for(&self, conversant_id: &str) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.conversant_id == conversant_id)
            .count()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
