//! Outbox：推送失败（或尚未推送）的回复按对话方暂存，等待代理用 FetchRequest 取回
//!
//! 每个对话方最多保留 limit 条，超出时丢弃最旧的一条。
//! 长期无人取回的邮箱由回收任务按最后写入时间清除。

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use super::message::{ConversantId, OutboxEntry, OutboxKind};

#[derive(Debug)]
struct Mailbox {
    /// 写入时对话方登记的回调地址，FetchRequest 的令牌按它校验
    endpoint: String,
    entries: VecDeque<OutboxEntry>,
    touched: Instant,
}

pub struct Outbox {
    mailboxes: RwLock<HashMap<ConversantId, Mailbox>>,
    limit: usize,
}

impl Outbox {
    pub fn new(limit: usize) -> Self {
        Self {
            mailboxes: RwLock::new(HashMap::new()),
            limit: limit.max(1),
        }
    }

    pub async fn push(&self, conversant_id: &str, endpoint: &str, kind: OutboxKind, text: &str, actions: Vec<String>) {
        let mut mailboxes = self.mailboxes.write().await;
        let mailbox = mailboxes
            .entry(conversant_id.to_string())
            .or_insert_with(|| Mailbox {
                endpoint: endpoint.to_string(),
                entries: VecDeque::new(),
                touched: Instant::now(),
            });
        mailbox.endpoint = endpoint.to_string();
        mailbox.touched = Instant::now();
        mailbox.entries.push_back(OutboxEntry {
            kind,
            text: text.to_string(),
            actions,
            at: chrono::Utc::now().timestamp_millis(),
        });
        while mailbox.entries.len() > self.limit {
            mailbox.entries.pop_front();
            tracing::warn!(conversant = conversant_id, limit = self.limit, "outbox full, dropped oldest reply");
        }
    }

    /// 邮箱对应的回调地址
    pub async fn endpoint_for(&self, conversant_id: &str) -> Option<String> {
        self.mailboxes
            .read()
            .await
            .get(conversant_id)
            .map(|m| m.endpoint.clone())
    }

    /// 取出并清空某对话方的全部待取消息
    pub async fn drain(&self, conversant_id: &str) -> Vec<OutboxEntry> {
        self.mailboxes
            .write()
            .await
            .remove(conversant_id)
            .map(|m| m.entries.into_iter().collect())
            .unwrap_or_default()
    }

    /// 清除最后写入早于 max_age 的邮箱，返回清除数
    pub async fn prune(&self, now: Instant, max_age: Duration) -> usize {
        let mut mailboxes = self.mailboxes.write().await;
        let before = mailboxes.len();
        mailboxes.retain(|conversant_id, mailbox| {
            let keep = now.saturating_duration_since(mailbox.touched) <= max_age;
            if !keep {
                tracing::info!(
                    conversant = %conversant_id,
                    dropped = mailbox.entries.len(),
                    "outbox mailbox expired unfetched"
                );
            }
            keep
        });
        before - mailboxes.len()
    }

    pub async fn len(&self) -> usize {
        self.mailboxes.read().await.len()
    }

    pub async fn pending(&self, conversant_id: &str) -> usize {
        self.mailboxes
            .read()
            .await
            .get(conversant_id)
            .map(|m| m.entries.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_empties_mailbox() {
        let outbox = Outbox::new(8);
        outbox.push("c1", "http://agent/c1", OutboxKind::Reply, "hi there", vec![]).await;
        outbox.push("c1", "http://agent/c1", OutboxKind::Failure, "Sorry", vec![]).await;

        let drained = outbox.drain("c1").await;
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].text, "hi there");
        assert_eq!(drained[1].kind, OutboxKind::Failure);
        assert!(outbox.drain("c1").await.is_empty());
        assert!(outbox.endpoint_for("c1").await.is_none());
    }

    #[tokio::test]
    async fn test_limit_drops_oldest() {
        let outbox = Outbox::new(2);
        for text in ["one", "two", "three"] {
            outbox.push("c1", "http://agent/c1", OutboxKind::Reply, text, vec![]).await;
        }
        assert_eq!(outbox.pending("c1").await, 2);
        let texts: Vec<String> = outbox.drain("c1").await.into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["two".to_string(), "three".to_string()]);
    }

    #[tokio::test]
    async fn test_prune_drops_unfetched_mailboxes() {
        let outbox = Outbox::new(8);
        outbox.push("c1", "http://agent/c1", OutboxKind::Ended, "", vec![]).await;
        outbox.push("c2", "http://agent/c2", OutboxKind::Reply, "hi", vec![]).await;

        let max_age = Duration::from_secs(900);
        assert_eq!(outbox.prune(Instant::now(), max_age).await, 0);
        assert_eq!(outbox.len().await, 2);

        let later = Instant::now() + max_age + Duration::from_secs(1);
        assert_eq!(outbox.prune(later, max_age).await, 2);
        assert_eq!(outbox.len().await, 0);
        assert_eq!(outbox.pending("c1").await, 0);
    }
}
