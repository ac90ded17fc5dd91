//! 核心层：错误分类、优雅关闭

pub mod error;
pub mod shutdown;

pub use error::{DispatchError, FailureClass, RelayError};
pub use shutdown::{ShutdownManager, ShutdownReason};
