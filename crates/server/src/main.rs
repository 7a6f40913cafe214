mod cmd;

use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "playguard", version)]
struct Cli {
    /// YAML config file; built-in defaults when omitted
    #[arg(long, short, global = true, env = "PLAYGUARD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept scripts and stream their events over WebSocket
    Serve(cmd::ServeArgs),
    /// Execute one script file and print its events as JSON lines
    Run(cmd::RunArgs),
    /// Screen a script file without running it
    Check(cmd::CheckArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries `run`/`check` output.
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    let result = match cli.command {
        Command::Serve(args) => cmd::run_serve(config, args)
            .await
            .map(|()| ExitCode::SUCCESS),
        Command::Run(args) => cmd::run_script(config, args).await,
        Command::Check(args) => cmd::run_check(args).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
