use std::net::SocketAddr;
use std::path::Path;

use clap::Args;
use server::{App, AppState, IsolationMode, ServerResult, backend, serve_on};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Args)]
pub struct ServeArgs {
    /// Address to accept WebSocket connections on
    #[arg(long, env = "PLAYGUARD_LISTEN")]
    listen: Option<SocketAddr>,

    /// Sandbox backend (overrides the config file)
    #[arg(long, value_enum, env = "PLAYGUARD_ISOLATION")]
    isolation: Option<IsolationMode>,
}

pub async fn run_serve(config_path: Option<&Path>, args: ServeArgs) -> ServerResult<()> {
    let mut config = super::load_config(config_path).await?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(isolation) = args.isolation {
        config.isolation = isolation;
    }

    let factory = backend::select(&config).await?;
    let app = App::build(&config, factory)?;
    let listener = TcpListener::bind(config.listen).await?;
    info!(
        addr = %listener.local_addr()?,
        isolation = %app.orchestrator.isolation(),
        max_concurrent = config.engine.max_concurrent,
        "playguard listening"
    );

    let shutdown = CancellationToken::new();
    super::cancel_on_signal(shutdown.clone());

    let state = AppState {
        orchestrator: app.orchestrator.clone(),
        heartbeat: config.heartbeat(),
        stale_after: config.stale_after(),
    };
    serve_on(listener, state, shutdown).await?;
    app.shutdown().await;
    Ok(())
}
