//! Mock Responder（用于测试，无需网络）
//!
//! 按脚本依次返回预设结果；脚本耗尽后一律返回 Accepted。记录每次调用的端点与请求体。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::traits::{Responder, ResponderAck, ResponderRequest};
use crate::core::DispatchError;
use crate::gateway::ResponderReply;

/// 一次被记录的调用
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub endpoint: String,
    pub request: ResponderRequest,
}

/// 脚本化的 Mock Responder
#[derive(Debug, Default)]
pub struct MockResponder {
    script: Mutex<VecDeque<Result<ResponderAck, DispatchError>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockResponder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(outcomes: Vec<Result<ResponderAck, DispatchError>>) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 追加一个预设结果
    pub fn push(&self, outcome: Result<ResponderAck, DispatchError>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(outcome);
    }

    pub fn push_reply(&self, text: &str) {
        self.push(Ok(ResponderAck::Replied(ResponderReply::text(text))));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl Responder for MockResponder {
    async fn respond(
        &self,
        endpoint: &str,
        request: &ResponderRequest,
    ) -> Result<ResponderAck, DispatchError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedCall {
                endpoint: endpoint.to_string(),
                request: request.clone(),
            });
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(Ok(ResponderAck::Accepted))
    }

    fn name(&self) -> &str {
        "mock"
    }
}
