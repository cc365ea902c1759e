//! Core sidecar registration functionality
//!
//! This library provides:
//! - Service descriptors announcing one running instance of a service
//! - The registry contract plus HTTP and in-memory implementations
//! - Validated sidecar configuration

pub mod client;
pub mod config;
pub mod error;
pub mod node;
pub mod registry;
pub mod service;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use client::HttpRegistry;
pub use config::SidecarConfig;
pub use error::{ConfigError, RegistrationError, Result};
pub use node::Node;
pub use registry::{MemoryRegistry, Registry};
pub use service::Service;
