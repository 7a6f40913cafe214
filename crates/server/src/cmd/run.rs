use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Args;
use engine::{ExecutionStatus, RunConfig, SubmitRequest};
use event_hub::{ExecutionEvent, Outbound};
use serde_json::{Map, Value};
use server::{App, IsolationMode, ServerError, ServerResult, backend};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Args)]
pub struct RunArgs {
    /// Script file to execute
    file: PathBuf,

    #[arg(long, default_value = "cli")]
    script_id: String,

    /// Parameters as a JSON object
    #[arg(long)]
    params: Option<String>,

    #[arg(long)]
    timeout_ms: Option<u64>,

    /// chromium, firefox or webkit
    #[arg(long)]
    browser: Option<String>,

    /// Sandbox backend (overrides the config file)
    #[arg(long, value_enum, env = "PLAYGUARD_ISOLATION")]
    isolation: Option<IsolationMode>,
}

/// Runs one script to completion, printing every event as a JSON line.
///
/// Exit code 0 when the script completed, 1 when it failed or was cancelled.
pub async fn run_script(config_path: Option<&Path>, args: RunArgs) -> ServerResult<ExitCode> {
    let mut config = super::load_config(config_path).await?;
    if let Some(isolation) = args.isolation {
        config.isolation = isolation;
    }
    let code = tokio::fs::read_to_string(&args.file)
        .await
        .map_err(|e| ServerError::Config(format!("read {}: {e}", args.file.display())))?;
    let parameters = parse_params(args.params.as_deref())?;

    let factory = backend::select(&config).await?;
    let app = App::build(&config, factory)?;
    let hub = app.orchestrator.hub().clone();

    let execution_id = uuid::Uuid::new_v4().to_string();
    let (channel, mut events) = hub.register();
    hub.subscribe(channel, &execution_id);

    let request = SubmitRequest {
        script_id: args.script_id,
        code,
        parameters,
        config: RunConfig {
            timeout_ms: args.timeout_ms,
            browser_engine: args.browser,
            ..RunConfig::default()
        },
        execution_id: Some(execution_id.clone()),
    };
    if let Err(e) = app.orchestrator.submit(request).await {
        app.shutdown().await;
        return Err(e.into());
    }
    info!(execution_id = %execution_id, "execution started");

    let interrupt = CancellationToken::new();
    super::cancel_on_signal(interrupt.clone());

    loop {
        tokio::select! {
            () = interrupt.cancelled(), if !interrupt.is_cancelled() => {
                app.orchestrator.cancel(&execution_id);
            }
            frame = events.recv() => match frame {
                Some(Outbound::Text(text)) => {
                    println!("{text}");
                    if is_terminal(&text) {
                        break;
                    }
                }
                Some(Outbound::Ping) => {}
                Some(Outbound::Close) | None => {
                    warn!(execution_id = %execution_id, "event channel closed early");
                    break;
                }
            },
        }
    }

    hub.disconnect(channel);
    let status = app
        .orchestrator
        .get_execution(&execution_id)
        .map(|execution| execution.status);
    app.shutdown().await;

    Ok(match status {
        Some(ExecutionStatus::Completed) => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

fn parse_params(raw: Option<&str>) -> ServerResult<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ServerError::Config("--params must be a JSON object".into())),
        Err(e) => Err(ServerError::Config(format!("--params: {e}"))),
    }
}

fn is_terminal(frame: &str) -> bool {
    serde_json::from_str::<ExecutionEvent>(frame).is_ok_and(|event| event.kind.is_terminal())
}
