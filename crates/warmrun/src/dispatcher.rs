//! End-to-end orchestration of one invocation.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::http::StatusCode;
use serde_json::{Value, json};
use tokio::time::{Instant, timeout_at};
use tracing::{Instrument, field, info, info_span, warn};
use uuid::Uuid;
use warmrun_entrypoint::protocol::{encode_payload, entrypoint_args, warmup_payload};

use crate::{
    code_store::CodeStore,
    config::RuntimesConfig,
    driver::{ExecError, ExecOutput, ProcessDriver},
    error::{InvocationError, excerpt},
    function::FunctionDescriptor,
    metrics::WarmrunMetrics,
    pool::{ContainerPool, ReleaseOutcome},
};

/// Longest raw output echoed back on [`InvocationError::InvalidOutputFormat`].
const RAW_OUTPUT_EXCERPT_LIMIT: usize = 4096;

const WARMUP_MESSAGE: &str = "Warm-up attempted";

/// A payload serialized to the host scratch directory. Removed on drop, so
/// every exit path of an invocation cleans it up.
struct PayloadFile {
    path: PathBuf,
}

impl PayloadFile {
    async fn write(scratch_dir: &Path, payload: &Value) -> Result<Self, InvocationError> {
        let internal = |reason: String| InvocationError::Internal { reason };

        tokio::fs::create_dir_all(scratch_dir)
            .await
            .map_err(|e| internal(format!("failed to create {}: {}", scratch_dir.display(), e)))?;
        let bytes =
            encode_payload(payload).map_err(|e| internal(format!("failed to encode payload: {}", e)))?;

        let path = scratch_dir.join(format!("input_{}.json", Uuid::new_v4()));
        let file = Self { path };
        tokio::fs::write(&file.path, bytes)
            .await
            .map_err(|e| internal(format!("failed to write {}: {}", file.path.display(), e)))?;
        Ok(file)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PayloadFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) &&
            e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "Failed to remove payload file");
        }
    }
}

/// Map a completed execution to the response body or an error.
pub fn classify_output(output: &ExecOutput) -> Result<Value, InvocationError> {
    if !output.success() {
        return Err(InvocationError::execution_failure(
            output.exit_code,
            &String::from_utf8_lossy(&output.stderr),
        ));
    }

    let raw = output.stdout.trim_ascii();
    match serde_json::from_slice::<Value>(raw) {
        Ok(Value::Object(mut body)) => {
            body.shift_remove("status");
            Ok(Value::Object(body))
        }
        Ok(value) => Ok(json!({ "output": value })),
        Err(_) => Err(InvocationError::InvalidOutputFormat {
            raw: excerpt(&String::from_utf8_lossy(raw), RAW_OUTPUT_EXCERPT_LIMIT),
        }),
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    code_store: CodeStore,
    pool: ContainerPool,
    driver: Arc<dyn ProcessDriver>,
    runtimes: RuntimesConfig,
    scratch_dir: PathBuf,
    metrics: WarmrunMetrics,
}

impl Dispatcher {
    pub fn new(
        code_store: CodeStore,
        pool: ContainerPool,
        driver: Arc<dyn ProcessDriver>,
        runtimes: RuntimesConfig,
        scratch_dir: PathBuf,
        metrics: WarmrunMetrics,
    ) -> Self {
        Self {
            code_store,
            pool,
            driver,
            runtimes,
            scratch_dir,
            metrics,
        }
    }

    pub fn pool(&self) -> &ContainerPool {
        &self.pool
    }

    /// Run `function` once. `payload` of `None`, `null` or `{}` selects the
    /// fixture or the warm-up sentinel.
    pub async fn invoke(
        &self,
        function: &FunctionDescriptor,
        payload: Option<Value>,
    ) -> Result<Value, InvocationError> {
        let arrived = Instant::now();
        let span = info_span!(
            "invocation",
            function_id = function.id,
            language = %function.language,
            instance = field::Empty,
        );

        let result = self
            .run(function, payload, arrived)
            .instrument(span.clone())
            .await;

        let elapsed = arrived.elapsed();
        let result_kind = match &result {
            Ok(_) => "success",
            Err(e) => e.kind(),
        };
        self.metrics
            .record_invocation(&function.pool_key(), result_kind, elapsed);
        info!(
            parent: &span,
            result = result_kind,
            duration_ms = elapsed.as_millis() as u64,
            "Invocation finished"
        );
        result
    }

    /// Invoke with the warm-up sentinel and wrap the result in the
    /// informational envelope, keeping the inner status.
    pub async fn warmup(&self, function: &FunctionDescriptor) -> (StatusCode, Value) {
        let (status, result) = match self.invoke(function, Some(warmup_payload())).await {
            Ok(body) => (StatusCode::OK, body),
            Err(e) => (e.status_code(), e.to_body()),
        };
        (
            status,
            json!({ "message": WARMUP_MESSAGE, "result": result }),
        )
    }

    async fn run(
        &self,
        function: &FunctionDescriptor,
        payload: Option<Value>,
        arrived: Instant,
    ) -> Result<Value, InvocationError> {
        // Nothing below touches a container until the code and payload are
        // known to be usable.
        let code = self.code_store.locate(function).await?;
        let (payload, source) = code.resolve_payload(payload).await?;
        let input = PayloadFile::write(&self.scratch_dir, &payload).await?;

        let timeout = function.timeout();
        let deadline = arrived + timeout;
        let lease = self
            .pool
            .acquire(function.pool_key(), &code.dir, deadline)
            .await?;
        let handle = lease.handle().clone();
        tracing::Span::current().record("instance", handle.id.as_str());
        info!(
            payload_source = source.as_str(),
            cold_start = lease.cold_start(),
            generation = lease.generation(),
            "Instance acquired"
        );

        match timeout_at(
            deadline,
            self.driver
                .transfer(&handle, input.path(), &handle.input_path),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.pool.release(lease, ReleaseOutcome::TransferFailure);
                return Err(InvocationError::TransferFailure {
                    reason: format!("{:#}", e),
                });
            }
            Err(_) => {
                self.pool.release(lease, ReleaseOutcome::Timeout);
                return Err(InvocationError::Timeout {
                    detail: format!(
                        "deadline of {}s reached while copying input",
                        timeout.as_secs()
                    ),
                });
            }
        }
        drop(input);

        let mut command = self.runtimes.get(function.language).entrypoint.clone();
        command.extend(entrypoint_args(
            function.language,
            &handle.input_path,
            &handle.function_dir,
        ));

        let output = match self.driver.exec(&handle, &command, timeout).await {
            Ok(output) => output,
            Err(ExecError::TimedOut(_)) => {
                self.pool.release(lease, ReleaseOutcome::Timeout);
                return Err(InvocationError::Timeout {
                    detail: format!("execution exceeded {}s", timeout.as_secs()),
                });
            }
            Err(ExecError::Failed(e)) => {
                warn!(error = ?e, "Runtime failed to execute entrypoint");
                self.pool.release(lease, ReleaseOutcome::RuntimeFault);
                return Err(InvocationError::execution_failure(None, &format!("{:#}", e)));
            }
        };

        let result = classify_output(&output);
        let outcome = match &result {
            Ok(_) => ReleaseOutcome::Success,
            Err(_) => ReleaseOutcome::HandlerError,
        };
        self.pool.release(lease, outcome);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(stdout: &str) -> ExecOutput {
        ExecOutput {
            stdout: stdout.as_bytes().to_vec(),
            stderr: vec![],
            exit_code: Some(0),
        }
    }

    #[test]
    fn test_object_output_is_passed_through() {
        let body = classify_output(&completed("{\"x\": 1}\n")).unwrap();
        assert_eq!(body, json!({"x": 1}));
    }

    #[test]
    fn test_status_field_is_stripped_keeping_order() {
        let body = classify_output(&completed(r#"{"b": 1, "status": 500, "a": 2}"#)).unwrap();
        assert_eq!(serde_json::to_string(&body).unwrap(), r#"{"b":1,"a":2}"#);
    }

    #[test]
    fn test_scalar_output_is_wrapped() {
        assert_eq!(
            classify_output(&completed("\"ok\"")).unwrap(),
            json!({"output": "ok"})
        );
        assert_eq!(
            classify_output(&completed("[1, 2]")).unwrap(),
            json!({"output": [1, 2]})
        );
        assert_eq!(
            classify_output(&completed("null")).unwrap(),
            json!({"output": null})
        );
    }

    #[test]
    fn test_non_json_output() {
        let err = classify_output(&completed("hello world\n")).unwrap_err();
        let InvocationError::InvalidOutputFormat { raw } = err else {
            panic!("unexpected error {:?}", err);
        };
        assert_eq!(raw, "hello world");
    }

    #[test]
    fn test_two_json_documents_are_invalid() {
        let err = classify_output(&completed("{\"a\":1}\n{\"b\":2}")).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_non_zero_exit() {
        let err = classify_output(&ExecOutput {
            stdout: b"{\"partial\": true}".to_vec(),
            stderr: b"Traceback (most recent call last):\nValueError: boom\n".to_vec(),
            exit_code: Some(1),
        })
        .unwrap_err();
        let InvocationError::ExecutionFailure { exit_code, stderr } = err else {
            panic!("unexpected error {:?}", err);
        };
        assert_eq!(exit_code, Some(1));
        assert!(stderr.ends_with("ValueError: boom"));
    }

    #[tokio::test]
    async fn test_payload_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let file = PayloadFile::write(&dir.path().join("scratch"), &json!({"n": 1}))
            .await
            .unwrap();
        let path = file.path().to_path_buf();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), r#"{"n":1}"#);
        drop(file);
        assert!(!path.exists());
    }
}
