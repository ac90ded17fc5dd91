//! sl-relay - 游戏内脚本代理与对话后端之间的异步派发 / 回调中继
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、优雅关闭
//! - **gateway**: 会话、关联表、回调登记、派发路由与 HTTP 接口
//! - **observability**: 日志初始化与请求行日志
//! - **responder**: 对话后端客户端抽象与实现（HTTP / Mock）

pub mod config;
pub mod core;
pub mod gateway;
pub mod observability;
pub mod responder;

pub use gateway::{HubConfig, RelayHub};
