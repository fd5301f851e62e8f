//! warmrun: single-node function runner.
//!
//! Functions registered over HTTP are executed inside language-specific
//! instances (Docker containers or local process sandboxes) that stay warm
//! between invocations. The [`pool`] keeps at most one instance per function
//! and language and serializes invocations on it; the [`dispatcher`] runs one
//! invocation end to end against a leased instance.

pub mod code_store;
pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod function;
pub mod function_store;
pub mod http_models;
pub mod http_server;
pub mod metrics;
pub mod otel_tracing;
pub mod pool;
pub mod service;

pub use dispatcher::Dispatcher;
pub use driver::{DockerDriver, ForkExecDriver, ProcessDriver};
pub use error::InvocationError;
pub use pool::ContainerPool;
pub use service::Service;
