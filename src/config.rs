//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RELAY__*` 覆盖（双下划线表示嵌套，如 `RELAY__RESPONDER__PRIMARY_URL=http://...`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::RelayError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub relay: RelaySection,
    pub responder: ResponderSection,
    pub store: StoreSection,
}

/// [server] 段：监听地址、代理共享令牌、对外回调地址
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 设置后，面向代理的路由需携带 `X-SL-Token` 头
    pub shared_token: Option<String>,
    /// 交给 Responder 的回调根地址，如 https://relay.example.com
    pub public_url: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            shared_token: None,
            public_url: None,
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8001".to_string()
}

/// [relay] 段：超时、回复长度上限、通用失败回复
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    /// 会话空闲超时（秒）
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    /// 在途请求等待回调的最长时间（秒），必须短于会话超时
    #[serde(default = "default_request_ttl_secs")]
    pub request_ttl_secs: u64,
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
    /// 回复最大字节数（代理脚本内存有限）
    #[serde(default = "default_max_reply_bytes")]
    pub max_reply_bytes: usize,
    #[serde(default = "default_failure_reply")]
    pub failure_reply: String,
    /// 每个对话方在 outbox 中最多保留的未取回复数
    #[serde(default = "default_outbox_limit")]
    pub outbox_limit: usize,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            session_timeout_secs: default_session_timeout_secs(),
            request_ttl_secs: default_request_ttl_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            max_reply_bytes: default_max_reply_bytes(),
            failure_reply: default_failure_reply(),
            outbox_limit: default_outbox_limit(),
        }
    }
}

fn default_session_timeout_secs() -> u64 {
    900
}

fn default_request_ttl_secs() -> u64 {
    90
}

fn default_reap_interval_secs() -> u64 {
    5
}

fn default_max_reply_bytes() -> usize {
    1024
}

fn default_failure_reply() -> String {
    "Sorry, I glitched. Try again.".to_string()
}

fn default_outbox_limit() -> usize {
    8
}

impl RelaySection {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn request_ttl(&self) -> Duration {
        Duration::from_secs(self.request_ttl_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

/// [responder] 段：主 / 备端点与超时
#[derive(Debug, Clone, Deserialize)]
pub struct ResponderSection {
    #[serde(default = "default_primary_url")]
    pub primary_url: String,
    pub fallback_url: Option<String>,
    /// 单次 HTTP 调用超时（秒）
    #[serde(default = "default_responder_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_npc_id")]
    pub npc_id: String,
}

impl Default for ResponderSection {
    fn default() -> Self {
        Self {
            primary_url: default_primary_url(),
            fallback_url: None,
            timeout_secs: default_responder_timeout_secs(),
            npc_id: default_npc_id(),
        }
    }
}

fn default_primary_url() -> String {
    "http://127.0.0.1:8000/chat".to_string()
}

fn default_responder_timeout_secs() -> u64 {
    30
}

fn default_npc_id() -> String {
    "SLQuest_DefaultNPC".to_string()
}

/// [store] 段：会话存储（未设置 path 时使用内存存储）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreSection {
    pub path: Option<PathBuf>,
}

impl AppConfig {
    /// 校验跨字段约束
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.responder.primary_url.trim().is_empty() {
            return Err(RelayError::Config("responder.primary_url is empty".into()));
        }
        if self.relay.request_ttl_secs == 0 {
            return Err(RelayError::Config("relay.request_ttl_secs must be > 0".into()));
        }
        if self.relay.request_ttl_secs >= self.relay.session_timeout_secs {
            return Err(RelayError::Config(format!(
                "relay.request_ttl_secs ({}) must be shorter than relay.session_timeout_secs ({})",
                self.relay.request_ttl_secs, self.relay.session_timeout_secs
            )));
        }
        if self.relay.max_reply_bytes < 16 {
            return Err(RelayError::Config("relay.max_reply_bytes must be >= 16".into()));
        }
        Ok(())
    }

    /// Responder 回调地址：`{public_url}/callback`
    pub fn callback_url(&self) -> Option<String> {
        self.server
            .public_url
            .as_ref()
            .map(|base| format!("{}/callback", base.trim_end_matches('/')))
    }
}

/// 从 config 目录加载配置，环境变量 RELAY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 RELAY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RELAY")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
