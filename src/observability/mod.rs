//! 可观测性：tracing 日志初始化与请求行日志

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 单行日志中消息片段的最大字符数
const SNIPPET_CHARS: usize = 120;

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

/// 截取消息片段：换行替换为空格，最多 120 个字符
pub fn snippet(message: &str) -> String {
    message
        .chars()
        .take(SNIPPET_CHARS)
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect()
}

/// 每个代理请求记录一行
pub fn log_request(route: &str, conversant: &str, message: &str, status: u16) {
    let conversant = if conversant.is_empty() { "-" } else { conversant };
    tracing::info!(
        route,
        conversant,
        status,
        msg = %snippet(message),
        "agent request"
    );
}
