//! Function code on the host filesystem, laid out as
//! `{base}/{language}/{function_id}/function.{ext}` with an optional
//! `test_input.json` fixture next to the handler.

use std::path::{Path, PathBuf};

use serde_json::Value;
use warmrun_entrypoint::protocol::{FIXTURE_FILE, warmup_payload};

use crate::{
    error::InvocationError,
    function::{FunctionDescriptor, FunctionId, Language},
};

/// Where an invocation's payload came from. Exactly one source is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSource {
    Explicit,
    Fixture,
    Warmup,
}

impl PayloadSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadSource::Explicit => "explicit",
            PayloadSource::Fixture => "fixture",
            PayloadSource::Warmup => "warmup",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CodeStore {
    base: PathBuf,
}

/// A function's code directory, verified to contain its handler.
#[derive(Debug, Clone)]
pub struct FunctionCode {
    pub dir: PathBuf,
    pub language: Language,
}

impl CodeStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn function_dir(&self, language: Language, function_id: FunctionId) -> PathBuf {
        self.base
            .join(language.as_str())
            .join(function_id.to_string())
    }

    /// Resolve and verify the code directory of `function`. Touches only
    /// the filesystem.
    pub async fn locate(&self, function: &FunctionDescriptor) -> Result<FunctionCode, InvocationError> {
        let dir = self.function_dir(function.language, function.id);
        if !tokio::fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()) {
            return Err(InvocationError::FunctionCodeNotFound {
                path: dir.display().to_string(),
            });
        }

        let handler_file = function.language.handler_file();
        if !tokio::fs::metadata(dir.join(handler_file))
            .await
            .is_ok_and(|m| m.is_file())
        {
            return Err(InvocationError::MissingHandler {
                handler_file: handler_file.to_string(),
                path: dir.display().to_string(),
            });
        }

        // Bind mounts need an absolute source.
        let dir = tokio::fs::canonicalize(&dir)
            .await
            .map_err(|e| InvocationError::Internal {
                reason: format!("failed to resolve {}: {}", dir.display(), e),
            })?;

        Ok(FunctionCode {
            dir,
            language: function.language,
        })
    }
}

/// No body, `null` and `{}` all mean "no payload supplied".
pub fn is_absent(payload: Option<&Value>) -> bool {
    match payload {
        None | Some(Value::Null) => true,
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

impl FunctionCode {
    pub fn fixture_path(&self) -> PathBuf {
        self.dir.join(FIXTURE_FILE)
    }

    /// Pick the invocation payload: the explicit one when present, else the
    /// fixture file, else the warm-up sentinel.
    pub async fn resolve_payload(
        &self,
        explicit: Option<Value>,
    ) -> Result<(Value, PayloadSource), InvocationError> {
        if let Some(payload) = explicit &&
            !is_absent(Some(&payload))
        {
            return Ok((payload, PayloadSource::Explicit));
        }

        let fixture = self.fixture_path();
        let content = match tokio::fs::read_to_string(&fixture).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((warmup_payload(), PayloadSource::Warmup));
            }
            Err(e) => {
                return Err(InvocationError::InvalidFixture {
                    path: fixture.display().to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let payload =
            serde_json::from_str(&content).map_err(|e| InvocationError::InvalidFixture {
                path: fixture.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok((payload, PayloadSource::Fixture))
    }
}
