//! 回调通道登记表
//!
//! 每个代理回调地址对应一个轮换的 bearer 令牌。重新登记立即作废旧令牌（拒绝，而非过期）；
//! 登记本身没有固定有效期。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;

/// 回调令牌（不可猜测）
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackToken(String);

impl CallbackToken {
    /// 两个 UUIDv4 拼接：64 个十六进制字符，244 位随机量
    pub fn generate() -> Self {
        Self(format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 常数时间比较
    pub fn matches(&self, candidate: &str) -> bool {
        self.0.as_bytes().ct_eq(candidate.as_bytes()).into()
    }
}

impl From<String> for CallbackToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Debug for CallbackToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix: String = self.0.chars().take(6).collect();
        write!(f, "CallbackToken({}…)", prefix)
    }
}

/// 登记结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: CallbackToken,
    pub generation: u64,
}

/// 令牌校验结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Accepted,
    /// 该地址没有登记
    Unregistered,
    /// 令牌与当前登记不符，调用方应触发重新登记
    Mismatch { generation: u64 },
}

impl Verification {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verification::Accepted)
    }
}

#[derive(Debug, Clone)]
struct Registration {
    token: CallbackToken,
    generation: u64,
}

/// 回调通道登记表
#[derive(Default)]
pub struct CallbackRegistry {
    registrations: RwLock<HashMap<String, Registration>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记（或重新登记）回调地址：签发新令牌，原子替换旧登记
    pub async fn register(&self, endpoint: &str) -> IssuedToken {
        let mut registrations = self.registrations.write().await;
        let generation = registrations
            .get(endpoint)
            .map(|r| r.generation + 1)
            .unwrap_or(1);
        let token = CallbackToken::generate();
        registrations.insert(
            endpoint.to_string(),
            Registration {
                token: token.clone(),
                generation,
            },
        );
        tracing::info!(endpoint, generation, "callback channel registered");
        IssuedToken { token, generation }
    }

    /// Responder 拒绝令牌后由中继自行发起的重新登记
    pub async fn rotate(&self, endpoint: &str) -> IssuedToken {
        tracing::warn!(endpoint, "rotating callback token after rejection");
        self.register(endpoint).await
    }

    pub async fn verify(&self, endpoint: &str, token: &str) -> Verification {
        let registrations = self.registrations.read().await;
        match registrations.get(endpoint) {
            None => Verification::Unregistered,
            Some(r) if r.token.matches(token) => Verification::Accepted,
            Some(r) => Verification::Mismatch {
                generation: r.generation,
            },
        }
    }

    pub async fn current(&self, endpoint: &str) -> Option<CallbackToken> {
        self.registrations
            .read()
            .await
            .get(endpoint)
            .map(|r| r.token.clone())
    }

    pub async fn len(&self) -> usize {
        self.registrations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.registrations.read().await.is_empty()
    }
}
