use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use engine::{Sanitizer, SanitizerLimits};
use server::{ServerError, ServerResult};

#[derive(Args)]
pub struct CheckArgs {
    /// Script file to screen
    file: PathBuf,
}

/// Prints the sanitization result as JSON. Exit code 2 when rejected.
pub async fn run_check(args: CheckArgs) -> ServerResult<ExitCode> {
    let code = tokio::fs::read_to_string(&args.file)
        .await
        .map_err(|e| ServerError::Config(format!("read {}: {e}", args.file.display())))?;

    let result = Sanitizer::new(SanitizerLimits::default()).sanitize(&code);
    let json = serde_json::to_string_pretty(&result)
        .map_err(|e| ServerError::Config(format!("serialize result: {e}")))?;
    println!("{json}");

    Ok(if result.is_valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}
