//! RelayHub - 中继核心运行时
//!
//! 组合会话管理、关联表、回调登记表与派发路由：
//! - **会话**：输入驱动状态机，忙时进入单槽队列
//! - **派发**：在独立任务中调用 Responder，不在锁内等待网络
//! - **回调**：令牌校验 → 关联表单次消费 → 会话转移 → 排队消息派发
//! - **回收**：超时请求按终止失败处理，空闲会话结束

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use super::clamp::clamp_reply;
use super::correlation::{CorrelationTable, OutstandingRequest};
use super::message::{
    CallbackAck, CallbackMessage, ChatResponse, Conversant, DispatchAccepted, DispatchRequest,
    DispatchStatus, RequestId, ResponderReply, SessionEvent, SessionState, StatusSnapshot,
    CALLBACK_VERSION,
};
use super::outbox::Outbox;
use super::registry::{CallbackRegistry, IssuedToken, Verification};
use super::router::{DispatchRouter, RouterConfig};
use super::session::{DispatchTicket, InputOutcome, ResolveOutcome, SessionManager};
use super::session_store::SessionStore;
use crate::config::AppConfig;
use crate::core::{DispatchError, FailureClass, RelayError};
use crate::responder::{Responder, ResponderAck};

/// Hub 配置
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub router: RouterConfig,
    /// 会话空闲超时
    pub session_timeout: Duration,
    /// 在途请求等待回调的最长时间
    pub request_ttl: Duration,
    pub max_reply_bytes: usize,
    /// 终止失败时发给对话方的通用回复
    pub failure_reply: String,
    pub outbox_limit: usize,
    /// 代理未指定 npc_id 时使用
    pub npc_id: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

impl HubConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        let mut router = RouterConfig::new(config.responder.primary_url.clone());
        if let Some(fallback) = &config.responder.fallback_url {
            router = router.with_fallback(fallback.clone());
        }
        if let Some(url) = config.callback_url() {
            router = router.with_callback_url(url);
        }
        Self {
            router,
            session_timeout: config.relay.session_timeout(),
            request_ttl: config.relay.request_ttl(),
            max_reply_bytes: config.relay.max_reply_bytes,
            failure_reply: config.relay.failure_reply.clone(),
            outbox_limit: config.relay.outbox_limit,
            npc_id: config.responder.npc_id.clone(),
        }
    }
}

/// 一轮回收的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapSummary {
    /// 超时失败的在途请求数
    pub stale: usize,
    /// 因空闲结束的会话数
    pub expired: usize,
    /// 长期无人取回而清除的 outbox 邮箱数
    pub mailboxes: usize,
}

pub struct RelayHub {
    config: HubConfig,
    sessions: SessionManager,
    table: Arc<CorrelationTable>,
    registry: Arc<CallbackRegistry>,
    router: DispatchRouter,
    store: Arc<dyn SessionStore>,
    outbox: Arc<Outbox>,
}

impl RelayHub {
    /// 创建 Hub，同时返回会话事件接收端（交给 ReplyDelivery 消费）
    pub fn new(
        config: HubConfig,
        responder: Arc<dyn Responder>,
        store: Arc<dyn SessionStore>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (sessions, events_rx) = SessionManager::new(config.session_timeout);
        let table = Arc::new(CorrelationTable::new(config.request_ttl));
        let registry = Arc::new(CallbackRegistry::new());
        let router = DispatchRouter::new(
            config.router.clone(),
            responder,
            Arc::clone(&table),
            Arc::clone(&registry),
            Arc::clone(&store),
        );
        let outbox = Arc::new(Outbox::new(config.outbox_limit));

        let hub = Arc::new(Self {
            config,
            sessions,
            table,
            registry,
            router,
            store,
            outbox,
        });
        (hub, events_rx)
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<CallbackRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn outbox(&self) -> Arc<Outbox> {
        Arc::clone(&self.outbox)
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn correlation(&self) -> &CorrelationTable {
        &self.table
    }

    pub async fn start_session(&self, conversant: Conversant) -> Result<SessionState, RelayError> {
        if conversant.id.trim().is_empty() {
            return Err(RelayError::Validation("conversant_id is required".into()));
        }
        Ok(self.sessions.start(conversant).await)
    }

    pub async fn end_session(&self, conversant_id: &str) -> bool {
        self.sessions.end(conversant_id.trim()).await
    }

    /// 登记回调地址；等待重新登记的在途请求随即用新令牌重派
    pub async fn register(self: &Arc<Self>, endpoint: &str) -> Result<IssuedToken, RelayError> {
        let endpoint = endpoint.trim();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(RelayError::Validation(
                "endpoint must be an http(s) URL".into(),
            ));
        }

        let issued = self.registry.register(endpoint).await;
        for request_id in self.table.awaiting_relink(endpoint).await {
            let token = issued.token.clone();
            let relinked = self
                .table
                .update(&request_id, |e| {
                    e.awaiting_relink = false;
                    e.relinked = true;
                    e.token = Some(token);
                    e.conversant_id.clone()
                })
                .await;
            if let Some(conversant_id) = relinked {
                self.spawn_redispatch(request_id, conversant_id);
            }
        }
        Ok(issued)
    }

    /// 异步派发：立即返回；忙时进入单槽队列
    pub async fn submit_input(
        self: &Arc<Self>,
        request: DispatchRequest,
    ) -> Result<DispatchAccepted, RelayError> {
        let conversant = self.validated_conversant(&request).await?;
        let Some(endpoint) = conversant.endpoint.clone() else {
            return Err(RelayError::Validation(
                "a callback endpoint is required for async dispatch".into(),
            ));
        };

        if let Some(token) = &request.callback_token {
            if !self.registry.verify(&endpoint, token).await.is_accepted() {
                tracing::info!(conversant = %conversant.id, endpoint = %endpoint, "agent presented a retired callback token");
                return Err(RelayError::TokenMismatch);
            }
        }

        let mut metadata = request.metadata.clone();
        metadata
            .npc_id
            .get_or_insert_with(|| self.config.npc_id.clone());

        match self
            .sessions
            .receive_input(conversant, &request.message, metadata)
            .await
        {
            InputOutcome::Dispatch(ticket) => {
                let request_id = ticket.request_id.clone();
                self.spawn_dispatch(ticket);
                Ok(DispatchAccepted {
                    status: DispatchStatus::Dispatched,
                    request_id: Some(request_id),
                    replaced: false,
                })
            }
            InputOutcome::Queued { replaced } => Ok(DispatchAccepted {
                status: DispatchStatus::Queued,
                request_id: None,
                replaced,
            }),
        }
    }

    /// 同步派发：仅限未登记回调通道的对话方，回复直接在响应中返回
    pub async fn chat_sync(self: &Arc<Self>, request: DispatchRequest) -> Result<ChatResponse, RelayError> {
        let conversant = self.validated_conversant(&request).await?;
        if let Some(endpoint) = &conversant.endpoint {
            if self.registry.current(endpoint).await.is_some() {
                return Err(RelayError::CallbackChannelRegistered(conversant.id));
            }
        }

        let mut metadata = request.metadata.clone();
        metadata
            .npc_id
            .get_or_insert_with(|| self.config.npc_id.clone());

        let conversant_id = conversant.id.clone();
        let Some(ticket) = self
            .sessions
            .begin_exclusive(conversant, &request.message, metadata)
            .await
        else {
            return Err(RelayError::Busy(conversant_id));
        };

        let outcome = match self.router.dispatch(&ticket).await {
            Ok(ResponderAck::Replied(reply)) => self.complete(&ticket.request_id, reply).await,
            Ok(ResponderAck::Accepted) => {
                let err = DispatchError::Validation("responder deferred a synchronous request".into());
                self.fail_request(&ticket.request_id, &conversant_id, &err).await;
                Err(err.class())
            }
            Err(err) => {
                self.fail_request(&ticket.request_id, &conversant_id, &err).await;
                Err(err.class())
            }
        };

        Ok(match outcome {
            Ok(reply) => ChatResponse {
                ok: true,
                reply_chars: reply.reply.chars().count(),
                reply: reply.reply,
                actions: reply.actions,
                error: None,
            },
            Err(class) => ChatResponse {
                ok: false,
                reply_chars: self.config.failure_reply.chars().count(),
                reply: self.config.failure_reply.clone(),
                actions: Vec::new(),
                error: Some(class.to_string()),
            },
        })
    }

    /// 处理回调消息；格式错误已在边界处拒绝
    pub async fn handle_callback(self: &Arc<Self>, message: CallbackMessage) -> CallbackAck {
        if message.version() != CALLBACK_VERSION {
            tracing::warn!(version = message.version(), "unsupported callback version");
            return CallbackAck::rejected();
        }

        match message {
            CallbackMessage::Package {
                request_id,
                conversant_id,
                reply_text,
                action_tags,
                token,
                context,
                ..
            } => {
                let reply = ResponderReply {
                    reply: reply_text,
                    actions: action_tags,
                    context,
                };
                self.accept_package(&request_id, &conversant_id, &token, reply)
                    .await
            }
            CallbackMessage::FetchRequest {
                conversant_id,
                token,
                ..
            } => self.fetch_replies(&conversant_id, &token).await,
        }
    }

    async fn accept_package(
        self: &Arc<Self>,
        request_id: &RequestId,
        conversant_id: &str,
        token: &str,
        reply: ResponderReply,
    ) -> CallbackAck {
        let Some(entry) = self.table.get(request_id).await else {
            tracing::info!(request_id = %request_id, "callback for unknown request ignored");
            return CallbackAck::rejected();
        };
        if entry.conversant_id != conversant_id {
            tracing::warn!(request_id = %request_id, conversant = conversant_id, "callback conversant does not match request");
            return CallbackAck::rejected();
        }
        let Some(endpoint) = entry.reply_endpoint.as_deref() else {
            tracing::warn!(request_id = %request_id, "callback for request without a callback channel");
            return CallbackAck::rejected();
        };

        match self.registry.verify(endpoint, token).await {
            Verification::Accepted => {
                if self.complete(request_id, reply).await.is_err() {
                    return CallbackAck::rejected();
                }
                CallbackAck::accepted()
            }
            verification => {
                tracing::warn!(request_id = %request_id, endpoint, ?verification, "callback token rejected");
                self.relink(&entry).await;
                CallbackAck::rejected()
            }
        }
    }

    /// 回调令牌失配后的恢复：每个请求最多一次；已重放过的交换不再恢复
    async fn relink(self: &Arc<Self>, entry: &OutstandingRequest) {
        if entry.attempt > 0 {
            tracing::warn!(request_id = %entry.request_id, "token mismatch after replay, leaving request to expire");
            return;
        }
        if entry.relinked || entry.awaiting_relink {
            tracing::warn!(request_id = %entry.request_id, "repeated token mismatch, leaving request to expire");
            return;
        }
        let Some(endpoint) = entry.reply_endpoint.as_deref() else {
            return;
        };

        let current = self.registry.current(endpoint).await;
        match current {
            Some(token) if entry.token.as_ref() != Some(&token) => {
                // 代理已重新登记：直接用新令牌重派
                let updated = self
                    .table
                    .update(&entry.request_id, |e| {
                        e.relinked = true;
                        e.token = Some(token);
                    })
                    .await;
                if updated.is_some() {
                    self.spawn_redispatch(entry.request_id.clone(), entry.conversant_id.clone());
                }
            }
            _ => {
                tracing::info!(request_id = %entry.request_id, endpoint, "awaiting re-registration of callback channel");
                self.table
                    .update(&entry.request_id, |e| e.awaiting_relink = true)
                    .await;
            }
        }
    }

    /// 代理拉取 outbox
    pub async fn fetch_replies(&self, conversant_id: &str, token: &str) -> CallbackAck {
        let endpoint = match self.sessions.conversant(conversant_id).await {
            Some(Conversant {
                endpoint: Some(endpoint),
                ..
            }) => Some(endpoint),
            _ => self.outbox.endpoint_for(conversant_id).await,
        };
        let Some(endpoint) = endpoint else {
            return CallbackAck::accepted();
        };

        if !self.registry.verify(&endpoint, token).await.is_accepted() {
            tracing::warn!(conversant = conversant_id, "fetch request with invalid token");
            return CallbackAck::rejected();
        }
        CallbackAck {
            accepted: true,
            replies: self.outbox.drain(conversant_id).await,
        }
    }

    /// 回收超时请求与空闲会话
    pub async fn reap(self: &Arc<Self>, now: Instant) -> ReapSummary {
        let stale = self.table.reap(now).await;
        for entry in &stale {
            tracing::warn!(request_id = %entry.request_id, conversant = %entry.conversant_id, "request expired without callback");
            let outcome = self
                .sessions
                .fail(
                    &entry.conversant_id,
                    &entry.request_id,
                    FailureClass::Stale,
                    &self.config.failure_reply,
                )
                .await;
            self.settle(outcome);
        }

        let expired = self.sessions.expire_idle(now).await;
        let mailboxes = self.outbox.prune(now, self.config.session_timeout).await;
        ReapSummary {
            stale: stale.len(),
            expired: expired.len(),
            mailboxes,
        }
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            sessions: self.sessions.active_count().await,
            outstanding: self.table.len().await,
            registrations: self.registry.len().await,
        }
    }

    async fn validated_conversant(&self, request: &DispatchRequest) -> Result<Conversant, RelayError> {
        let mut conversant = request.conversant();
        if conversant.id.is_empty() {
            return Err(RelayError::Validation("conversant_id is required".into()));
        }
        if request.message.trim().is_empty() {
            return Err(RelayError::Validation("message is required".into()));
        }
        if conversant.endpoint.is_none() {
            conversant.endpoint = self
                .sessions
                .conversant(&conversant.id)
                .await
                .and_then(|c| c.endpoint);
        }
        Ok(conversant)
    }

    /// 消费关联表条目并把回复交给会话
    async fn complete(
        self: &Arc<Self>,
        request_id: &RequestId,
        mut reply: ResponderReply,
    ) -> Result<ResponderReply, FailureClass> {
        let Some(entry) = self.table.take(request_id).await else {
            return Err(FailureClass::Stale);
        };

        if reply.reply.trim().is_empty() {
            tracing::warn!(request_id = %request_id, "responder sent an empty reply");
            let outcome = self
                .sessions
                .fail(
                    &entry.conversant_id,
                    request_id,
                    FailureClass::Validation,
                    &self.config.failure_reply,
                )
                .await;
            self.settle(outcome);
            return Err(FailureClass::Validation);
        }
        reply.reply = clamp_reply(reply.reply.trim(), self.config.max_reply_bytes);

        if let Some(context) = &reply.context {
            if let Err(e) = self.store.save(&entry.conversant_id, context).await {
                tracing::warn!(conversant = %entry.conversant_id, "failed to save session context: {}", e);
            }
        }

        let outcome = self
            .sessions
            .resolve(&entry.conversant_id, request_id, reply.clone())
            .await;
        self.settle(outcome);
        Ok(reply)
    }

    async fn fail_request(self: &Arc<Self>, request_id: &RequestId, conversant_id: &str, err: &DispatchError) {
        self.table.take(request_id).await;
        let outcome = self
            .sessions
            .fail(conversant_id, request_id, err.class(), &self.config.failure_reply)
            .await;
        self.settle(outcome);
    }

    /// 会话回到 Active 后若有排队消息，立即派发
    fn settle(self: &Arc<Self>, outcome: ResolveOutcome) {
        if let ResolveOutcome::Delivered { next: Some(ticket) } = outcome {
            tracing::debug!(conversant = %ticket.conversant.id, request_id = %ticket.request_id, "dispatching queued message");
            self.spawn_dispatch(ticket);
        }
    }

    async fn after_exchange(
        self: &Arc<Self>,
        request_id: &RequestId,
        conversant_id: &str,
        result: Result<ResponderAck, DispatchError>,
    ) {
        match result {
            Ok(ResponderAck::Accepted) => {
                tracing::debug!(request_id = %request_id, "responder accepted, awaiting callback");
            }
            Ok(ResponderAck::Replied(reply)) => {
                if self.complete(request_id, reply).await.is_err() {
                    tracing::debug!(request_id = %request_id, "inline reply not delivered (request reaped or empty reply)");
                }
            }
            Err(DispatchError::Abandoned) => {}
            Err(err) => self.fail_request(request_id, conversant_id, &err).await,
        }
    }

    fn spawn_dispatch(self: &Arc<Self>, ticket: DispatchTicket) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let result = hub.router.dispatch(&ticket).await;
            hub.after_exchange(&ticket.request_id, &ticket.conversant.id, result)
                .await;
        });
    }

    fn spawn_redispatch(self: &Arc<Self>, request_id: RequestId, conversant_id: String) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let result = hub.router.redispatch(&request_id).await;
            hub.after_exchange(&request_id, &conversant_id, result).await;
        });
    }
}
