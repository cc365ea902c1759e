//! Request forwarding from the sidecar to its backend
pub mod error;
pub mod http;
pub mod metrics;
pub mod rpc;

pub use error::ForwardError;
pub use http::{HttpForwarder, HttpReply};
pub use metrics::MetricsCollector;
pub use rpc::{positional_params, RpcForwarder, RpcRequest};
