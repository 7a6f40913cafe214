mod check;
mod run;
mod serve;

pub use check::{CheckArgs, run_check};
pub use run::{RunArgs, run_script};
pub use serve::{ServeArgs, run_serve};

use std::path::Path;

use server::{ServerConfig, ServerResult, config};
use tokio_util::sync::CancellationToken;
use tracing::info;

async fn load_config(path: Option<&Path>) -> ServerResult<ServerConfig> {
    match path {
        Some(path) => {
            let config = config::load(path).await?;
            info!(path = %path.display(), "config loaded");
            Ok(config)
        }
        None => Ok(ServerConfig::default()),
    }
}

/// Cancel `token` on the first SIGTERM or SIGINT.
fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sigint = signal(SignalKind::interrupt()).ok();

        tokio::select! {
            _ = recv_signal(&mut sigterm) => {
                info!("received SIGTERM, shutting down");
            }
            _ = recv_signal(&mut sigint) => {
                info!("received SIGINT, shutting down");
            }
        }
        token.cancel();
    });
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
