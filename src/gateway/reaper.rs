//! 周期回收任务：超时的在途请求与空闲会话

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::hub::{ReapSummary, RelayHub};

/// 启动回收任务，收到关停信号后退出
pub fn spawn_reaper(hub: Arc<RelayHub>, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(every);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("reaper stopped");
                    break;
                }
                _ = timer.tick() => {
                    let summary = hub.reap(Instant::now()).await;
                    if summary != ReapSummary::default() {
                        tracing::info!(
                            stale = summary.stale,
                            expired = summary.expired,
                            mailboxes = summary.mailboxes,
                            "reaped expired requests, sessions and mailboxes"
                        );
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::hub::HubConfig;
    use crate::gateway::message::{Conversant, SessionState};
    use crate::gateway::session_store::MemorySessionStore;
    use crate::responder::MockResponder;

    #[tokio::test]
    async fn test_reaper_expires_idle_sessions() {
        let config = HubConfig {
            session_timeout: Duration::from_millis(20),
            request_ttl: Duration::from_millis(10),
            ..HubConfig::default()
        };
        let (hub, _rx) = RelayHub::new(
            config,
            Arc::new(MockResponder::new()),
            Arc::new(MemorySessionStore::new()),
        );
        hub.start_session(Conversant::new("c1", "Avatar One"))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = spawn_reaper(hub.clone(), Duration::from_millis(10), shutdown.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hub.sessions().state("c1").await, SessionState::Idle);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
