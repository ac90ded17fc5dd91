//! 派发 / 重试路由
//!
//! 先发往 primary；首次交换遇到可重放失败时，恰好重放一次（有 fallback 发 fallback，否则回到 primary）。
//! 令牌失配单独处理：重新登记后用新令牌重派一次。同一次交换中最多一次恢复，
//! 第二次失败一律终止，因此每次交换最多发送两次。
//!
//! 路由本身不持有会话状态，只读写关联表条目。

use std::sync::Arc;

use super::correlation::{CorrelationTable, OutstandingRequest};
use super::registry::CallbackRegistry;
use super::session::DispatchTicket;
use super::session_store::SessionStore;
use super::message::RequestId;
use crate::core::DispatchError;
use crate::responder::{Responder, ResponderAck, ResponderRequest};

/// 路由配置
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub primary: String,
    pub fallback: Option<String>,
    /// 交给 Responder 的回调地址
    pub callback_url: Option<String>,
}

impl RouterConfig {
    pub fn new(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            fallback: None,
            callback_url: None,
        }
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }

    pub fn with_callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    /// 重放目标：fallback 优先，否则 primary
    fn replay_target(&self) -> &str {
        self.fallback.as_deref().unwrap_or(&self.primary)
    }
}

/// 一次失败后路由选择的恢复方式
enum Recovery {
    Replay,
    Relink,
}

pub struct DispatchRouter {
    config: RouterConfig,
    responder: Arc<dyn Responder>,
    table: Arc<CorrelationTable>,
    registry: Arc<CallbackRegistry>,
    store: Arc<dyn SessionStore>,
}

impl DispatchRouter {
    pub fn new(
        config: RouterConfig,
        responder: Arc<dyn Responder>,
        table: Arc<CorrelationTable>,
        registry: Arc<CallbackRegistry>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            config,
            responder,
            table,
            registry,
            store,
        }
    }

    /// 记录在途请求并发往 primary
    pub async fn dispatch(&self, ticket: &DispatchTicket) -> Result<ResponderAck, DispatchError> {
        let token = match &ticket.conversant.endpoint {
            Some(endpoint) => self.registry.current(endpoint).await,
            None => None,
        };
        let entry = OutstandingRequest::from_ticket(ticket, &self.config.primary, token);
        self.table.put(entry).await.map_err(|e| {
            tracing::error!(request_id = %ticket.request_id, "{}", e);
            DispatchError::Validation("duplicate request id".to_string())
        })?;

        tracing::info!(
            request_id = %ticket.request_id,
            conversant = %ticket.conversant.id,
            endpoint = %self.config.primary,
            "dispatching"
        );
        self.exchange(&ticket.request_id).await
    }

    /// 以关联表中条目的当前状态（端点、令牌）再发一次；用于回调侧的重新登记恢复
    pub async fn redispatch(&self, request_id: &RequestId) -> Result<ResponderAck, DispatchError> {
        tracing::info!(request_id = %request_id, "redispatching with current callback token");
        self.exchange(request_id).await
    }

    async fn exchange(&self, request_id: &RequestId) -> Result<ResponderAck, DispatchError> {
        let mut session_context: Option<Option<String>> = None;

        loop {
            // 条目已被回收或消费：放弃本次交换
            let Some(entry) = self.table.get(request_id).await else {
                tracing::debug!(request_id = %request_id, "request no longer tracked, abandoning");
                return Err(DispatchError::Abandoned);
            };

            if session_context.is_none() {
                session_context = Some(self.store.load(&entry.conversant_id).await);
            }
            let request = self.build_request(&entry, session_context.clone().flatten());

            match self.responder.respond(&entry.endpoint, &request).await {
                Ok(ack) => return Ok(ack),
                Err(err) => {
                    tracing::warn!(
                        request_id = %request_id,
                        endpoint = %entry.endpoint,
                        attempt = entry.attempt,
                        class = %err.class(),
                        "dispatch failed: {}",
                        err
                    );
                    if !self.recover(&entry, &err).await {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// 选择并记录恢复方式；返回 false 表示终止
    async fn recover(&self, entry: &OutstandingRequest, err: &DispatchError) -> bool {
        if entry.attempt > 0 || entry.relinked {
            return false;
        }

        let recovery = if err.is_token_mismatch() {
            Recovery::Relink
        } else if err.is_retriable() {
            Recovery::Replay
        } else {
            return false;
        };

        match recovery {
            Recovery::Replay => {
                let target = self.config.replay_target().to_string();
                tracing::info!(request_id = %entry.request_id, endpoint = %target, "replaying once");
                self.table
                    .update(&entry.request_id, |e| {
                        e.attempt = 1;
                        e.endpoint = target;
                    })
                    .await
                    .is_some()
            }
            Recovery::Relink => {
                let Some(reply_endpoint) = entry.reply_endpoint.as_deref() else {
                    return false;
                };
                let issued = self.registry.rotate(reply_endpoint).await;
                self.table
                    .update(&entry.request_id, |e| {
                        e.relinked = true;
                        e.awaiting_relink = false;
                        e.token = Some(issued.token);
                    })
                    .await
                    .is_some()
            }
        }
    }

    fn build_request(&self, entry: &OutstandingRequest, session_context: Option<String>) -> ResponderRequest {
        ResponderRequest {
            request_id: entry.request_id.clone(),
            conversant_id: entry.conversant_id.clone(),
            display_name: entry.display_name.clone(),
            message: entry.message.clone(),
            callback_token: entry.token.as_ref().map(|t| t.as_str().to_string()),
            callback_url: self.config.callback_url.clone(),
            session_context,
            metadata: entry.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::gateway::message::{Conversant, DispatchMode, RequestMetadata};
    use crate::gateway::session_store::MemorySessionStore;
    use crate::gateway::ResponderReply;
    use crate::responder::MockResponder;

    struct Fixture {
        router: DispatchRouter,
        responder: Arc<MockResponder>,
        table: Arc<CorrelationTable>,
        registry: Arc<CallbackRegistry>,
        store: Arc<MemorySessionStore>,
    }

    fn fixture(config: RouterConfig, script: Vec<Result<ResponderAck, DispatchError>>) -> Fixture {
        let responder = Arc::new(MockResponder::with_script(script));
        let table = Arc::new(CorrelationTable::new(Duration::from_secs(90)));
        let registry = Arc::new(CallbackRegistry::new());
        let store = Arc::new(MemorySessionStore::new());
        let router = DispatchRouter::new(
            config,
            responder.clone(),
            table.clone(),
            registry.clone(),
            store.clone(),
        );
        Fixture {
            router,
            responder,
            table,
            registry,
            store,
        }
    }

    fn ticket() -> DispatchTicket {
        DispatchTicket {
            request_id: RequestId::generate(),
            conversant: Conversant::new("c1", "Avatar One").with_endpoint("http://agent/c1"),
            message: "hello".into(),
            metadata: RequestMetadata::default(),
            mode: DispatchMode::Async,
        }
    }

    fn config() -> RouterConfig {
        RouterConfig::new("http://primary/chat").with_fallback("http://fallback/chat")
    }

    #[tokio::test]
    async fn test_gateway_error_replays_to_fallback() {
        let f = fixture(
            config(),
            vec![
                Err(DispatchError::Upstream { status: 502 }),
                Ok(ResponderAck::Replied(ResponderReply::text("hi there"))),
            ],
        );
        let t = ticket();
        let ack = f.router.dispatch(&t).await.unwrap();
        assert_eq!(ack, ResponderAck::Replied(ResponderReply::text("hi there")));

        let calls = f.responder.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].endpoint, "http://primary/chat");
        assert_eq!(calls[1].endpoint, "http://fallback/chat");
        assert_eq!(f.table.get(&t.request_id).await.map(|e| e.attempt), Some(1));
    }

    #[tokio::test]
    async fn test_replay_goes_back_to_primary_without_fallback() {
        let f = fixture(
            RouterConfig::new("http://primary/chat"),
            vec![Err(DispatchError::UnresolvedHost("primary".into()))],
        );
        f.router.dispatch(&ticket()).await.unwrap();
        let calls = f.responder.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.endpoint == "http://primary/chat"));
    }

    #[tokio::test]
    async fn test_at_most_two_attempts() {
        let f = fixture(
            config(),
            vec![
                Err(DispatchError::Transport("refused".into())),
                Err(DispatchError::Upstream { status: 503 }),
                Ok(ResponderAck::Accepted),
            ],
        );
        let err = f.router.dispatch(&ticket()).await.unwrap_err();
        assert_eq!(err, DispatchError::Upstream { status: 503 });
        assert_eq!(f.responder.call_count(), 2);
    }

    #[tokio::test]
    async fn test_non_retriable_is_terminal_immediately() {
        let f = fixture(
            config(),
            vec![Err(DispatchError::Validation("bad request".into()))],
        );
        assert!(f.router.dispatch(&ticket()).await.is_err());
        assert_eq!(f.responder.call_count(), 1);
    }

    #[tokio::test]
    async fn test_token_mismatch_relinks_once() {
        let f = fixture(
            config(),
            vec![Err(DispatchError::TokenMismatch), Ok(ResponderAck::Accepted)],
        );
        let old = f.registry.register("http://agent/c1").await;
        let t = ticket();
        assert_eq!(f.router.dispatch(&t).await.unwrap(), ResponderAck::Accepted);

        let calls = f.responder.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].request.callback_token.as_deref(), Some(old.token.as_str()));
        let current = f.registry.current("http://agent/c1").await.unwrap();
        assert_ne!(current, old.token);
        assert_eq!(calls[1].request.callback_token.as_deref(), Some(current.as_str()));
        // 重新登记不消耗重放次数，目标仍是 primary
        assert_eq!(calls[1].endpoint, "http://primary/chat");
        let entry = f.table.get(&t.request_id).await.unwrap();
        assert!(entry.relinked);
        assert_eq!(entry.attempt, 0);
    }

    #[tokio::test]
    async fn test_retriable_after_relink_is_terminal() {
        let f = fixture(
            config(),
            vec![
                Err(DispatchError::TokenMismatch),
                Err(DispatchError::Upstream { status: 502 }),
            ],
        );
        f.registry.register("http://agent/c1").await;
        let err = f.router.dispatch(&ticket()).await.unwrap_err();
        assert_eq!(err, DispatchError::Upstream { status: 502 });
        assert_eq!(f.responder.call_count(), 2);
    }

    #[tokio::test]
    async fn test_abandons_when_entry_is_gone() {
        let f = fixture(config(), vec![]);
        let t = ticket();
        f.router.dispatch(&t).await.unwrap();
        f.table.take(&t.request_id).await;
        assert_eq!(
            f.router.redispatch(&t.request_id).await,
            Err(DispatchError::Abandoned)
        );
        assert_eq!(f.responder.call_count(), 1);
    }

    #[tokio::test]
    async fn test_session_context_is_forwarded() {
        let f = fixture(config(), vec![]);
        f.store.save("c1", "thread_42").await.unwrap();
        f.router.dispatch(&ticket()).await.unwrap();
        assert_eq!(
            f.responder.calls()[0].request.session_context.as_deref(),
            Some("thread_42")
        );
    }
}
