//! sl-relay 服务
//!
//! 加载配置、创建 Hub，并启动回复投递任务、回收任务与 HTTP 服务。
//!
//! 配置: config/default.toml，环境变量 RELAY__* 覆盖（如 RELAY__RESPONDER__PRIMARY_URL）
//! 启动: cargo run --bin sl-relay -- [config.toml]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sl_relay::config::load_config;
use sl_relay::core::{ShutdownManager, ShutdownReason};
use sl_relay::gateway::{
    create_router, create_session_store, spawn_reaper, AppState, HubConfig, RelayHub,
    ReplyDelivery,
};
use sl_relay::observability;
use sl_relay::responder::HttpResponder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;
    config.validate().context("Invalid config")?;

    let responder = Arc::new(
        HttpResponder::new(Duration::from_secs(config.responder.timeout_secs))
            .context("Failed to create responder client")?,
    );
    let store = create_session_store(config.store.path.as_deref()).await;
    let (hub, events) = RelayHub::new(HubConfig::from_app_config(&config), responder, store);

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let mut reasons = shutdown.subscribe();

    let delivery = Arc::new(
        ReplyDelivery::new(
            Duration::from_secs(config.responder.timeout_secs),
            hub.registry(),
            hub.outbox(),
        )
        .context("Failed to create delivery client")?,
    );
    let delivery_task = tokio::spawn(delivery.run(events, shutdown.token()));
    let reaper_task = spawn_reaper(
        Arc::clone(&hub),
        config.relay.reap_interval(),
        shutdown.token(),
    );

    let app = create_router(AppState::new(hub, config.server.shared_token.clone()));
    let listener = match tokio::net::TcpListener::bind(&config.server.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            shutdown.shutdown(ShutdownReason::FatalError(e.to_string()));
            return Err(e).context(format!("Failed to bind {}", config.server.bind_addr));
        }
    };
    tracing::info!("sl-relay listening on http://{}", config.server.bind_addr);
    tracing::info!(
        primary = %config.responder.primary_url,
        fallback = ?config.responder.fallback_url,
        "responder endpoints"
    );

    let graceful = Arc::clone(&shutdown);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { graceful.wait_for_shutdown().await })
        .await
        .context("Server error")?;

    if !shutdown.is_shutdown() {
        shutdown.shutdown(ShutdownReason::UserInitiated);
    }
    let _ = tokio::join!(delivery_task, reaper_task);
    let reason = reasons.try_recv().ok();
    tracing::info!(?reason, "sl-relay stopped");
    Ok(())
}
