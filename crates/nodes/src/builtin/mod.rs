//! Node types every deployment ships with.

mod echo;
mod http;
mod sentinel;

pub use echo::EchoNode;
pub use http::{
    HttpNode, HttpNodeConfig, normalize_url, request_timeout, resolve_config, retry_delay_suggestion,
    should_retry,
};
pub use sentinel::{EndNode, StartNode};
