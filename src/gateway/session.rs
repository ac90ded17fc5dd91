//! 会话管理
//!
//! 每个对话方一个状态机：Idle → Active → AwaitingReply → Active → … → Idle。
//! 每个会话同时最多一个在途请求、一条排队消息；超出的输入进入单槽队列而非加锁等待。
//! 管理器不做任何 IO，副作用只通过 SessionEvent 发出。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, RwLock};

use super::message::{
    Conversant, ConversantId, DispatchMode, EndReason, RequestId, RequestMetadata,
    ResponderReply, SessionEvent, SessionState,
};
use super::queue::{PendingMessage, QueueSlot};
use crate::core::FailureClass;

/// 会话 ID
pub type SessionId = String;

/// 进入 AwaitingReply 时交给派发路由的工单
#[derive(Debug, Clone)]
pub struct DispatchTicket {
    pub request_id: RequestId,
    pub conversant: Conversant,
    pub message: String,
    pub metadata: RequestMetadata,
    pub mode: DispatchMode,
}

/// receive_input 的结果
#[derive(Debug)]
pub enum InputOutcome {
    /// 会话转入 AwaitingReply，调用方需派发此工单
    Dispatch(DispatchTicket),
    /// 已有请求在途，输入进入单槽队列
    Queued { replaced: bool },
}

/// resolve / fail 的结果
#[derive(Debug)]
pub enum ResolveOutcome {
    /// 已送达；若队列中有消息，next 为紧接着要派发的工单
    Delivered { next: Option<DispatchTicket> },
    /// 会话不存在或在途请求不匹配（迟到），无状态变化
    Ignored,
}

#[derive(Debug, Clone)]
struct InFlight {
    request_id: RequestId,
    mode: DispatchMode,
}

/// 单个会话
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub conversant: Conversant,
    pub state: SessionState,
    pub queued: QueueSlot,
    in_flight: Option<InFlight>,
    pub last_active: Instant,
    pub created_at: Instant,
}

impl Session {
    /// 未提供显示名时以 conversant_id 代替
    pub fn new(mut conversant: Conversant) -> Self {
        if conversant.display_name.trim().is_empty() {
            conversant.display_name = conversant.id.clone();
        }
        let now = Instant::now();
        Self {
            id: format!("session_{}", uuid::Uuid::new_v4()),
            conversant,
            state: SessionState::Active,
            queued: QueueSlot::new(),
            in_flight: None,
            last_active: now,
            created_at: now,
        }
    }

    pub fn in_flight(&self) -> Option<&RequestId> {
        self.in_flight.as_ref().map(|f| &f.request_id)
    }

    /// 刷新显示名与回调地址（其余字段不变）
    fn refresh(&mut self, conversant: &Conversant) {
        if !conversant.display_name.trim().is_empty() {
            self.conversant.display_name = conversant.display_name.clone();
        }
        if conversant.endpoint.is_some() {
            self.conversant.endpoint = conversant.endpoint.clone();
        }
        self.last_active = Instant::now();
    }

    /// Active → AwaitingReply，分配新的 request_id
    fn begin(&mut self, message: PendingMessage, mode: DispatchMode) -> DispatchTicket {
        let request_id = RequestId::generate();
        self.state = SessionState::AwaitingReply;
        self.in_flight = Some(InFlight {
            request_id: request_id.clone(),
            mode,
        });
        self.last_active = Instant::now();
        DispatchTicket {
            request_id,
            conversant: self.conversant.clone(),
            message: message.text,
            metadata: message.metadata,
            mode,
        }
    }

    /// AwaitingReply → Active（仅当 request_id 匹配），返回该请求的派发方式
    fn settle(&mut self, request_id: &RequestId) -> Option<DispatchMode> {
        match &self.in_flight {
            Some(f) if &f.request_id == request_id => {
                let mode = f.mode;
                self.in_flight = None;
                self.state = SessionState::Active;
                self.last_active = Instant::now();
                Some(mode)
            }
            _ => None,
        }
    }

    /// 排队消息出队并立即派发
    fn advance(&mut self) -> Option<DispatchTicket> {
        self.queued
            .take()
            .map(|next| self.begin(next, DispatchMode::Async))
    }

    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_active) > timeout
    }
}

/// 会话管理器
pub struct SessionManager {
    /// conversant_id -> Session
    sessions: RwLock<HashMap<ConversantId, Session>>,
    session_timeout: Duration,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionManager {
    pub fn new(session_timeout: Duration) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                sessions: RwLock::new(HashMap::new()),
                session_timeout,
                events,
            },
            events_rx,
        )
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("session event receiver dropped");
        }
    }

    /// Idle → Active；已存在时幂等（只刷新显示名 / 回调地址）
    pub async fn start(&self, conversant: Conversant) -> SessionState {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&conversant.id) {
            Some(session) => {
                session.refresh(&conversant);
                session.state
            }
            None => {
                tracing::info!(conversant = %conversant.id, "session started");
                let session = Session::new(conversant);
                let state = session.state;
                sessions.insert(session.conversant.id.clone(), session);
                state
            }
        }
    }

    /// 用户输入：Active → 派发；AwaitingReply → 覆盖排队槽。首次接触时隐式开始会话。
    pub async fn receive_input(
        &self,
        conversant: Conversant,
        text: &str,
        metadata: RequestMetadata,
    ) -> InputOutcome {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(conversant.id.clone())
            .or_insert_with(|| {
                tracing::info!(conversant = %conversant.id, "session started on first input");
                Session::new(conversant.clone())
            });
        session.refresh(&conversant);

        let message = PendingMessage::new(text, metadata);
        match session.state {
            SessionState::AwaitingReply => {
                let replaced = session.queued.offer(message).is_some();
                tracing::debug!(conversant = %conversant.id, replaced, "input queued behind in-flight request");
                InputOutcome::Queued { replaced }
            }
            SessionState::Active | SessionState::Idle => {
                InputOutcome::Dispatch(session.begin(message, DispatchMode::Async))
            }
        }
    }

    /// 同步派发入口：只在没有在途请求时开始，不排队
    pub async fn begin_exclusive(
        &self,
        conversant: Conversant,
        text: &str,
        metadata: RequestMetadata,
    ) -> Option<DispatchTicket> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(conversant.id.clone())
            .or_insert_with(|| Session::new(conversant.clone()));
        session.refresh(&conversant);
        if session.state == SessionState::AwaitingReply {
            return None;
        }
        Some(session.begin(PendingMessage::new(text, metadata), DispatchMode::Sync))
    }

    /// 回复送达：AwaitingReply → Active，若有排队消息立即转回 AwaitingReply
    pub async fn resolve(
        &self,
        conversant_id: &str,
        request_id: &RequestId,
        reply: ResponderReply,
    ) -> ResolveOutcome {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(conversant_id) else {
            tracing::debug!(conversant = conversant_id, request_id = %request_id, "reply for idle conversant dropped");
            return ResolveOutcome::Ignored;
        };
        let Some(mode) = session.settle(request_id) else {
            tracing::debug!(conversant = conversant_id, request_id = %request_id, "reply does not match in-flight request");
            return ResolveOutcome::Ignored;
        };

        self.emit(SessionEvent::Reply {
            conversant: session.conversant.clone(),
            request_id: request_id.clone(),
            mode,
            reply,
        });
        ResolveOutcome::Delivered {
            next: session.advance(),
        }
    }

    /// 终止性失败：与 resolve 相同的转移，但发出通用失败回复
    pub async fn fail(
        &self,
        conversant_id: &str,
        request_id: &RequestId,
        class: FailureClass,
        reply: &str,
    ) -> ResolveOutcome {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(conversant_id) else {
            return ResolveOutcome::Ignored;
        };
        let Some(mode) = session.settle(request_id) else {
            return ResolveOutcome::Ignored;
        };

        tracing::warn!(conversant = conversant_id, request_id = %request_id, %class, "request failed");
        self.emit(SessionEvent::Failed {
            conversant: session.conversant.clone(),
            request_id: request_id.clone(),
            mode,
            class,
            reply: reply.to_string(),
        });
        ResolveOutcome::Delivered {
            next: session.advance(),
        }
    }

    /// 显式结束：任意状态 → Idle。在途请求不取消，关联表条目按 TTL 回收。
    pub async fn end(&self, conversant_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(conversant_id);
        match removed {
            Some(session) => {
                tracing::info!(conversant = conversant_id, "session ended");
                self.emit(SessionEvent::Ended {
                    conversant: session.conversant,
                    reason: EndReason::Explicit,
                });
                true
            }
            None => false,
        }
    }

    /// 结束空闲超过 session_timeout 的会话
    pub async fn expire_idle(&self, now: Instant) -> Vec<ConversantId> {
        let mut sessions = self.sessions.write().await;
        let expired: Vec<ConversantId> = sessions
            .values()
            .filter(|s| s.is_expired(now, self.session_timeout))
            .map(|s| s.conversant.id.clone())
            .collect();

        for id in &expired {
            if let Some(session) = sessions.remove(id) {
                tracing::info!(conversant = %id, "session timed out");
                self.emit(SessionEvent::Ended {
                    conversant: session.conversant,
                    reason: EndReason::Timeout,
                });
            }
        }
        expired
    }

    pub async fn state(&self, conversant_id: &str) -> SessionState {
        self.sessions
            .read()
            .await
            .get(conversant_id)
            .map(|s| s.state)
            .unwrap_or(SessionState::Idle)
    }

    pub async fn in_flight(&self, conversant_id: &str) -> Option<RequestId> {
        self.sessions
            .read()
            .await
            .get(conversant_id)
            .and_then(|s| s.in_flight().cloned())
    }

    pub async fn queued_text(&self, conversant_id: &str) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(conversant_id)
            .and_then(|s| s.queued.peek().map(|m| m.text.clone()))
    }

    pub async fn conversant(&self, conversant_id: &str) -> Option<Conversant> {
        self.sessions
            .read()
            .await
            .get(conversant_id)
            .map(|s| s.conversant.clone())
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
