//! Responder 层：对话后端的客户端抽象与实现（HTTP / Mock）

pub mod http;
pub mod mock;
pub mod traits;

pub use http::HttpResponder;
pub use mock::{MockResponder, RecordedCall};
pub use traits::{Responder, ResponderAck, ResponderRequest};
