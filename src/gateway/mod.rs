//! 异步派发 / 回调中继
//!
//! 游戏内脚本代理每次请求都有严格超时、内存极小、不能保持长连接，
//! 因此 Responder 的回复不在请求响应中返回，而是经回调到达中继，再推送给代理。
//!
//! ## 组件
//!
//! - **session**：每个对话方一个状态机（Idle / Active / AwaitingReply），同时最多一个在途请求
//! - **queue**：在途期间到达的输入进入单槽队列，后写覆盖
//! - **correlation**：request_id → 在途请求，单次消费，按 TTL 回收
//! - **registry**：回调地址 → 轮换令牌，重新登记立即作废旧令牌
//! - **router**：主 / 备端点派发，每次交换最多一次恢复（重放或重新登记）
//! - **hub**：组合以上组件；**server**：HTTP 接口；**delivery** / **outbox**：回复推送与暂存
//!
//! ## 控制流
//!
//! 代理 → server → hub → router → Responder → `/callback` → registry 校验 →
//! correlation 取出 → session 转移 → 排队消息派发

mod clamp;
mod correlation;
mod delivery;
mod hub;
mod message;
mod outbox;
mod queue;
mod reaper;
mod registry;
mod router;
#[cfg(feature = "server")]
mod server;
mod session;
mod session_store;

pub use clamp::{clamp_reply, trim_to_bytes};
pub use correlation::{CorrelationTable, OutstandingRequest};
pub use delivery::{ReplyDelivery, ReplyPush};
pub use hub::{HubConfig, ReapSummary, RelayHub};
pub use message::{
    CallbackAck, CallbackMessage, ChatResponse, Conversant, ConversantId, DispatchAccepted,
    DispatchMode, DispatchRequest, DispatchStatus, EndReason, EndSessionRequest, OutboxEntry,
    OutboxKind, RegisterRequest, RegisterResponse, RequestId, RequestMetadata, ResponderReply,
    SessionEvent, SessionState, StartSessionRequest, StatusSnapshot, CALLBACK_VERSION,
};
pub use outbox::Outbox;
pub use queue::{PendingMessage, QueueSlot};
pub use reaper::spawn_reaper;
pub use registry::{CallbackRegistry, CallbackToken, IssuedToken, Verification};
pub use router::{DispatchRouter, RouterConfig};
#[cfg(feature = "server")]
pub use server::{create_router, AppState, SHARED_TOKEN_HEADER};
pub use session::{
    DispatchTicket, InputOutcome, ResolveOutcome, Session, SessionId, SessionManager,
};
pub use session_store::{create_session_store, FileSessionStore, MemorySessionStore, SessionStore};
