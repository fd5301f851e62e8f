//! Handler capability: the narrow interface the entrypoint invokes.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use serde_json::value::RawValue;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::debug;

use crate::protocol::Language;

const PYTHON_SHIM: &str = include_str!("shims/python.py");
const NODE_SHIM: &str = include_str!("shims/node.js");

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The handler ran and raised (non-zero exit of the interpreter).
    #[error("handler raised (exit code {exit_code:?})")]
    Raised { exit_code: Option<i32> },

    /// The handler could not be run at all.
    #[error("handler unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("handler file {0} not found")]
    MissingHandler(PathBuf),

    #[error("failed to resolve handler path {path}: {source}")]
    Path {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A user function callable with one JSON payload.
///
/// Returns the raw bytes of the serialized return value.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn invoke(&self, payload: &RawValue) -> Result<Vec<u8>, HandlerError>;
}

/// Runs a script handler through its language interpreter.
///
/// The embedded shim loads `function.<ext>`, reads the payload from stdin and
/// writes the return value to stdout. The handler's own prints are routed to
/// stderr, which is inherited from the entrypoint.
#[derive(Debug, Clone)]
pub struct ScriptHandler {
    language: Language,
    handler_path: PathBuf,
    interpreter: String,
}

impl ScriptHandler {
    /// Resolve the handler file of `language` inside `function_dir`.
    pub fn resolve(language: Language, function_dir: &Path) -> Result<Self, ResolveError> {
        let path = function_dir.join(language.handler_file());
        if !path.is_file() {
            return Err(ResolveError::MissingHandler(path));
        }
        let handler_path = path
            .canonicalize()
            .map_err(|source| ResolveError::Path {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            language,
            handler_path,
            interpreter: language.interpreter().to_string(),
        })
    }

    /// Override the interpreter binary (e.g. `python3.12`).
    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    pub fn handler_path(&self) -> &Path {
        &self.handler_path
    }

    fn command(&self) -> Command {
        let (flag, shim) = match self.language {
            Language::Python => ("-c", PYTHON_SHIM),
            Language::Javascript => ("-e", NODE_SHIM),
        };
        let mut cmd = Command::new(&self.interpreter);
        cmd.arg(flag).arg(shim).arg(&self.handler_path);
        cmd
    }
}

#[async_trait]
impl Handler for ScriptHandler {
    async fn invoke(&self, payload: &RawValue) -> Result<Vec<u8>, HandlerError> {
        debug!(
            language = %self.language,
            handler = %self.handler_path.display(),
            interpreter = %self.interpreter,
            "Invoking handler"
        );

        let mut child = self
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HandlerError::Unavailable(anyhow::anyhow!(
                    "failed to spawn {}: {}",
                    self.interpreter,
                    e
                ))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| HandlerError::Unavailable(anyhow::anyhow!("handler stdin unavailable")))?;
        let input = payload.get().as_bytes().to_vec();
        let writer = tokio::spawn(async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| HandlerError::Unavailable(e.into()))?;

        // A handler that exits before reading its stdin closes the pipe early;
        // its exit status is what matters.
        if let Ok(Err(e)) = writer.await {
            debug!(error = %e, "Handler did not consume the full payload");
        }

        if !output.status.success() {
            return Err(HandlerError::Raised {
                exit_code: output.status.code(),
            });
        }

        Ok(output.stdout)
    }
}
