//! Function metadata as seen by the dispatcher and the pool.

use std::{fmt, time::Duration};

use anyhow::Result;
use serde::{Deserialize, Serialize};
pub use warmrun_entrypoint::Language;

pub type FunctionId = i64;

const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Longest accepted invocation timeout: one day.
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// A registered function. Owned by the metadata store, read-only for the
/// duration of an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub id: FunctionId,
    pub name: String,
    pub route: String,
    pub language: Language,
    #[serde(rename = "timeout")]
    pub timeout_secs: u64,
}

impl FunctionDescriptor {
    pub fn pool_key(&self) -> PoolKey {
        PoolKey {
            function_id: self.id,
            language: self.language,
        }
    }

    /// Invocation time limit, capped at [`MAX_TIMEOUT_SECS`] for
    /// descriptors persisted before the cap existed.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.min(MAX_TIMEOUT_SECS))
    }
}

/// Client-supplied fields of a function, used for create and update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionMetadata {
    pub name: String,
    pub route: String,
    pub language: Language,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl FunctionMetadata {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("function name must not be empty");
        }
        if self.timeout == 0 {
            anyhow::bail!("timeout must be greater than 0");
        }
        if self.timeout > MAX_TIMEOUT_SECS {
            anyhow::bail!("timeout must be at most {} seconds", MAX_TIMEOUT_SECS);
        }
        Ok(())
    }

    pub fn into_descriptor(self, id: FunctionId) -> FunctionDescriptor {
        FunctionDescriptor {
            id,
            name: self.name,
            route: self.route,
            language: self.language,
            timeout_secs: self.timeout,
        }
    }
}

/// Identity of a pool slot: one instance at most per function and language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PoolKey {
    pub function_id: FunctionId,
    pub language: Language,
}

impl PoolKey {
    pub fn new(function_id: FunctionId, language: Language) -> Self {
        Self {
            function_id,
            language,
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.language, self.function_id)
    }
}
