//! warmrun runtime entrypoint binary.
//!
//! Installed in every function image and triggered by the dispatcher through
//! the container runtime's exec primitive. Stdout carries only the handler's
//! return value; everything else, including our own logs, goes to stderr.

use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use tracing::{debug, error};
use warmrun_entrypoint::{
    EntrypointError,
    Language,
    ScriptHandler,
    protocol::{FUNCTION_DIR, INPUT_PATH},
};

#[derive(Parser, Debug)]
#[command(name = "warmrun-entrypoint")]
#[command(version, about = "Runs one warmrun function invocation")]
struct Args {
    /// Language of the function handler.
    #[arg(long)]
    language: Language,

    /// Location of the JSON payload.
    #[arg(long, default_value = INPUT_PATH)]
    input: PathBuf,

    /// Directory holding the function code.
    #[arg(long, default_value = FUNCTION_DIR)]
    function_dir: PathBuf,

    /// Interpreter override (defaults to python3 / node).
    #[arg(long)]
    interpreter: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("WARMRUN_ENTRYPOINT_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Invocation failed");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(args: Args) -> Result<(), EntrypointError> {
    let mut handler = ScriptHandler::resolve(args.language, &args.function_dir)?;
    if let Some(interpreter) = args.interpreter {
        handler = handler.with_interpreter(interpreter);
    }
    debug!(
        language = %args.language,
        handler = %handler.handler_path().display(),
        input = %args.input.display(),
        "Handler resolved"
    );

    let mut stdout = tokio::io::stdout();
    warmrun_entrypoint::run(&args.input, &handler, &mut stdout).await
}
