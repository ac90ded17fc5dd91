//! 回复推送：消费 SessionEvent，把回复 POST 到对话方登记的回调地址
//!
//! 推送带 `Authorization: Bearer <token>`；地址未登记或推送失败时写入 Outbox。
//! 同步派发的回复已在 HTTP 响应中返回，这里跳过。没有回调地址的对话方只走同步派发，其结束事件直接丢弃。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::message::{ConversantId, DispatchMode, OutboxKind, RequestId, SessionEvent};
use super::outbox::Outbox;
use super::registry::CallbackRegistry;
use crate::core::RelayError;

const NO_ACTIONS: &[String] = &[];

/// 推送给代理的消息体
#[derive(Debug, Clone, Serialize)]
pub struct ReplyPush<'a> {
    pub conversant_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<&'a RequestId>,
    pub kind: OutboxKind,
    pub reply: &'a str,
    pub actions: &'a [String],
}

pub struct ReplyDelivery {
    client: reqwest::Client,
    registry: Arc<CallbackRegistry>,
    outbox: Arc<Outbox>,
}

impl ReplyDelivery {
    pub fn new(
        timeout: Duration,
        registry: Arc<CallbackRegistry>,
        outbox: Arc<Outbox>,
    ) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Config(format!("delivery client: {}", e)))?;
        Ok(Self {
            client,
            registry,
            outbox,
        })
    }

    /// 持续消费事件，直到通道关闭或收到关停信号
    ///
    /// 每个对话方一条投递链：同一对话方按事件顺序推送，不同对话方互不等待。
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        shutdown: CancellationToken,
    ) {
        let mut lanes: HashMap<ConversantId, JoinHandle<()>> = HashMap::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("reply delivery stopped");
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else { break };
                    lanes.retain(|_, lane| !lane.is_finished());
                    let conversant_id = event.conversant().id.clone();
                    let previous = lanes.remove(&conversant_id);
                    let delivery = Arc::clone(&self);
                    let lane = tokio::spawn(async move {
                        if let Some(previous) = previous {
                            let _ = previous.await;
                        }
                        delivery.deliver(event).await;
                    });
                    lanes.insert(conversant_id, lane);
                }
            }
        }

        for (_, lane) in lanes.drain() {
            let _ = lane.await;
        }
    }

    pub async fn deliver(&self, event: SessionEvent) {
        let (request_id, kind, text, actions): (Option<&RequestId>, OutboxKind, &str, &[String]) =
            match &event {
                SessionEvent::Reply {
                    mode: DispatchMode::Sync,
                    ..
                }
                | SessionEvent::Failed {
                    mode: DispatchMode::Sync,
                    ..
                } => return,
                SessionEvent::Reply {
                    request_id, reply, ..
                } => (
                    Some(request_id),
                    OutboxKind::Reply,
                    reply.reply.as_str(),
                    reply.actions.as_slice(),
                ),
                SessionEvent::Failed {
                    request_id, reply, ..
                } => (Some(request_id), OutboxKind::Failure, reply.as_str(), NO_ACTIONS),
                SessionEvent::Ended { .. } => (None, OutboxKind::Ended, "", NO_ACTIONS),
            };

        let conversant = event.conversant();
        let Some(endpoint) = conversant.endpoint.as_deref() else {
            tracing::debug!(conversant = %conversant.id, "no callback endpoint, event not delivered");
            return;
        };

        let push = ReplyPush {
            conversant_id: &conversant.id,
            request_id,
            kind,
            reply: text,
            actions,
        };
        if let Err(e) = self.push(endpoint, &push).await {
            tracing::warn!(conversant = %conversant.id, endpoint, "push failed, keeping reply in outbox: {}", e);
            self.outbox
                .push(&conversant.id, endpoint, kind, text, actions.to_vec())
                .await;
        }
    }

    async fn push(&self, endpoint: &str, body: &ReplyPush<'_>) -> Result<(), String> {
        let token = self
            .registry
            .current(endpoint)
            .await
            .ok_or_else(|| "endpoint not registered".to_string())?;

        let resp = self
            .client
            .post(endpoint)
            .bearer_auth(token.as_str())
            .json(body)
            .send()
            .await
            .map_err(|e| e.without_url().to_string())?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("agent returned {}", resp.status()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::message::{Conversant, EndReason};
    use crate::gateway::ResponderReply;

    fn delivery() -> (ReplyDelivery, Arc<CallbackRegistry>, Arc<Outbox>) {
        let registry = Arc::new(CallbackRegistry::new());
        let outbox = Arc::new(Outbox::new(8));
        let delivery =
            ReplyDelivery::new(Duration::from_secs(2), registry.clone(), outbox.clone()).unwrap();
        (delivery, registry, outbox)
    }

    fn reply_event(endpoint: &str, mode: DispatchMode) -> SessionEvent {
        SessionEvent::Reply {
            conversant: Conversant::new("c1", "Avatar One").with_endpoint(endpoint),
            request_id: RequestId::generate(),
            mode,
            reply: ResponderReply::text("hi there"),
        }
    }

    #[tokio::test]
    async fn test_unregistered_endpoint_falls_back_to_outbox() {
        let (delivery, _registry, outbox) = delivery();
        delivery
            .deliver(reply_event("http://agent/c1", DispatchMode::Async))
            .await;
        let entries = outbox.drain("c1").await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text, "hi there");
        assert_eq!(entries[0].kind, OutboxKind::Reply);
    }

    #[tokio::test]
    async fn test_unreachable_agent_falls_back_to_outbox() {
        let (delivery, registry, outbox) = delivery();
        registry.register("http://127.0.0.1:9/reply").await;
        delivery
            .deliver(reply_event("http://127.0.0.1:9/reply", DispatchMode::Async))
            .await;
        assert_eq!(outbox.pending("c1").await, 1);
        assert_eq!(
            outbox.endpoint_for("c1").await.as_deref(),
            Some("http://127.0.0.1:9/reply")
        );
    }

    #[tokio::test]
    async fn test_sync_replies_are_skipped() {
        let (delivery, _registry, outbox) = delivery();
        delivery
            .deliver(reply_event("http://agent/c1", DispatchMode::Sync))
            .await;
        assert_eq!(outbox.pending("c1").await, 0);
    }

    fn event_for(conversant_id: &str, endpoint: &str, text: &str) -> SessionEvent {
        SessionEvent::Reply {
            conversant: Conversant::new(conversant_id, conversant_id).with_endpoint(endpoint),
            request_id: RequestId::generate(),
            mode: DispatchMode::Async,
            reply: ResponderReply::text(text),
        }
    }

    /// 接受连接但从不应答的代理
    async fn silent_agent() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        format!("http://{}/reply", addr)
    }

    #[tokio::test]
    async fn test_slow_agent_does_not_block_other_conversants() {
        let (delivery, registry, outbox) = delivery();
        let slow = silent_agent().await;
        registry.register(&slow).await;

        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::new(delivery).run(rx, shutdown.clone()));

        tx.send(event_for("slow", &slow, "waiting")).unwrap();
        tx.send(event_for("c2", "http://agent/c2", "hi there")).unwrap();

        let started = std::time::Instant::now();
        while outbox.pending("c2").await == 0 {
            assert!(
                started.elapsed() < Duration::from_millis(1000),
                "c2 was held behind the slow agent"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(outbox.pending("slow").await, 0);

        shutdown.cancel();
        handle.await.unwrap();
        // 关停时等待在途推送超时后落入 outbox
        assert_eq!(outbox.pending("slow").await, 1);
    }

    #[tokio::test]
    async fn test_events_for_one_conversant_keep_order() {
        let (delivery, _registry, outbox) = delivery();
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::new(delivery).run(rx, shutdown.clone()));

        for text in ["one", "two", "three"] {
            tx.send(event_for("c1", "http://agent/c1", text)).unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        let texts: Vec<String> = outbox.drain("c1").await.into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_event_without_endpoint_is_dropped() {
        let (delivery, _registry, outbox) = delivery();
        delivery
            .deliver(SessionEvent::Ended {
                conversant: Conversant::new("c1", "Avatar One"),
                reason: EndReason::Explicit,
            })
            .await;
        assert_eq!(outbox.len().await, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (delivery, _registry, outbox) = delivery();
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::new(delivery).run(rx, shutdown.clone()));

        tx.send(SessionEvent::Ended {
            conversant: Conversant::new("c1", "Avatar One").with_endpoint("http://agent/c1"),
            reason: EndReason::Timeout,
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(outbox.pending("c1").await, 1);
    }
}
