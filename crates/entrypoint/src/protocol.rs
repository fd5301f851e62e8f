//! The entrypoint protocol: the fixed contract between the dispatcher and the
//! code running inside an instance.
//!
//! - The dispatcher writes exactly one JSON value to the input location.
//! - The entrypoint resolves `function.<ext>` inside the function directory
//!   and calls its exported `handler` with the payload.
//! - The handler's return value is written to stdout as a single JSON
//!   document. Diagnostics go to stderr.
//! - Exit code 0 means the handler returned, [`EXIT_HANDLER_FAILED`] means it
//!   raised, [`EXIT_PROTOCOL_ERROR`] means the entrypoint could not run it.

use std::{fmt, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Value, value::RawValue};

/// Input location inside container instances.
pub const INPUT_PATH: &str = "/tmp/input.json";

/// Mount point of the function's code directory inside container instances.
pub const FUNCTION_DIR: &str = "/function";

/// Optional per-function payload used when the caller supplies none.
pub const FIXTURE_FILE: &str = "test_input.json";

/// Key of the sentinel payload used for warm-up invocations.
pub const WARMUP_MARKER: &str = "_warmup";

pub const EXIT_HANDLER_FAILED: i32 = 1;
pub const EXIT_PROTOCOL_ERROR: i32 = 2;

#[derive(Debug, thiserror::Error)]
#[error("unsupported language: {0:?}")]
pub struct UnknownLanguage(pub String);

/// Languages a function handler can be written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Language {
    Python,
    Javascript,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::Python, Language::Javascript];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
        }
    }

    /// Name of the handler file inside the function directory.
    pub fn handler_file(&self) -> &'static str {
        match self {
            Language::Python => "function.py",
            Language::Javascript => "function.js",
        }
    }

    /// Interpreter binary used to run the handler shim.
    pub fn interpreter(&self) -> &'static str {
        match self {
            Language::Python => "python3",
            Language::Javascript => "node",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" => Ok(Language::Javascript),
            _ => Err(UnknownLanguage(s.to_string())),
        }
    }
}

impl TryFrom<String> for Language {
    type Error = UnknownLanguage;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// The sentinel payload `{"_warmup": true}`.
pub fn warmup_payload() -> Value {
    let mut map = serde_json::Map::new();
    map.insert(WARMUP_MARKER.to_string(), Value::Bool(true));
    Value::Object(map)
}

pub fn is_warmup(payload: &Value) -> bool {
    payload
        .get(WARMUP_MARKER)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Arguments the dispatcher appends to the configured entrypoint command.
pub fn entrypoint_args(language: Language, input_path: &str, function_dir: &str) -> Vec<String> {
    vec![
        "--language".to_string(),
        language.as_str().to_string(),
        "--input".to_string(),
        input_path.to_string(),
        "--function-dir".to_string(),
        function_dir.to_string(),
    ]
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("failed to read payload from {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("payload at {path} is not a single JSON value: {source}")]
    Malformed {
        path: String,
        source: serde_json::Error,
    },
}

/// Serialize a payload for the input file.
pub fn encode_payload(payload: &Value) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(payload)
}

/// Read the payload from the input file, keeping its exact text.
///
/// The raw text is forwarded to the handler untouched, so numbers keep their
/// full precision and objects keep their key order.
pub async fn read_payload(path: &Path) -> Result<Box<RawValue>, PayloadError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| PayloadError::Read {
            path: path.display().to_string(),
            source,
        })?;
    serde_json::from_slice(&bytes).map_err(|source| PayloadError::Malformed {
        path: path.display().to_string(),
        source,
    })
}
