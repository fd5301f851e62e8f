//! warmrun runtime entrypoint.
//!
//! Executed once per invocation inside a function instance. Reads the payload
//! written by the dispatcher, invokes the function handler and writes its
//! return value to stdout. See [`protocol`] for the full contract.

pub mod handler;
pub mod protocol;

use std::path::Path;

use tokio::io::{AsyncWrite, AsyncWriteExt};

pub use handler::{Handler, HandlerError, ResolveError, ScriptHandler};
pub use protocol::Language;

use crate::protocol::{EXIT_HANDLER_FAILED, EXIT_PROTOCOL_ERROR, PayloadError};

#[derive(Debug, thiserror::Error)]
pub enum EntrypointError {
    #[error(transparent)]
    Input(#[from] PayloadError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("failed to write handler output: {0}")]
    Output(#[source] std::io::Error),
}

impl EntrypointError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            EntrypointError::Handler(HandlerError::Raised { .. }) => EXIT_HANDLER_FAILED,
            _ => EXIT_PROTOCOL_ERROR,
        }
    }
}

/// Run one invocation: read the payload at `input`, call `handler`, write
/// the result to `out` as a single line.
pub async fn run<H, W>(input: &Path, handler: &H, out: &mut W) -> Result<(), EntrypointError>
where
    H: Handler + ?Sized,
    W: AsyncWrite + Unpin,
{
    let payload = protocol::read_payload(input).await?;
    let output = handler.invoke(&payload).await?;

    out.write_all(output.trim_ascii())
        .await
        .map_err(EntrypointError::Output)?;
    out.write_all(b"\n").await.map_err(EntrypointError::Output)?;
    out.flush().await.map_err(EntrypointError::Output)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::value::RawValue;

    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn invoke(&self, payload: &RawValue) -> Result<Vec<u8>, HandlerError> {
            Ok(format!("  {}\n\n", payload.get()).into_bytes())
        }
    }

    struct RaisingHandler;

    #[async_trait]
    impl Handler for RaisingHandler {
        async fn invoke(&self, _payload: &RawValue) -> Result<Vec<u8>, HandlerError> {
            Err(HandlerError::Raised { exit_code: Some(1) })
        }
    }

    #[tokio::test]
    async fn test_run_writes_single_trimmed_line() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.json");
        tokio::fs::write(&input, br#"{"b":1,"a":[1.10,2]}"#).await.unwrap();

        let mut out = Vec::new();
        run(&input, &EchoHandler, &mut out).await.unwrap();
        assert_eq!(out, b"{\"b\":1,\"a\":[1.10,2]}\n");
    }

    #[tokio::test]
    async fn test_handler_failure_maps_to_handler_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.json");
        tokio::fs::write(&input, b"{}").await.unwrap();

        let mut out = Vec::new();
        let err = run(&input, &RaisingHandler, &mut out).await.unwrap_err();
        assert_eq!(err.exit_code(), EXIT_HANDLER_FAILED);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_input_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.json");
        tokio::fs::write(&input, b"not json").await.unwrap();

        let mut out = Vec::new();
        let err = run(&input, &EchoHandler, &mut out).await.unwrap_err();
        assert!(matches!(err, EntrypointError::Input(_)));
        assert_eq!(err.exit_code(), EXIT_PROTOCOL_ERROR);
        assert!(out.is_empty());
    }
}
