//! Request and response bodies of the HTTP API that are not part of the
//! invocation envelope.

use serde::Serialize;

use crate::{function::FunctionDescriptor, pool::PoolSnapshot};

#[derive(Debug, Clone, Serialize)]
pub struct FunctionResponse {
    pub msg: String,
    pub function: FunctionDescriptor,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageResponse {
    pub msg: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolResponse {
    #[serde(flatten)]
    pub snapshot: PoolSnapshot,
    pub uptime_secs: u64,
}
