//! WebSocket front door.
//!
//! Each connection becomes one hub channel. Inbound frames are requests
//! handled by [`crate::ws::handle`]; outbound frames are whatever the hub
//! queues for the channel (events, replies, pings).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use engine::Orchestrator;
use event_hub::{Hub, Outbound};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{ServerError, ServerResult};
use crate::ws;

/// How long shutdown waits for connections to flush their last frames.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub heartbeat: Duration,
    pub stale_after: Duration,
}

impl AppState {
    fn hub(&self) -> &Arc<Hub> {
        self.orchestrator.hub()
    }
}

/// Accept connections until `shutdown` fires, then cancel every execution,
/// close every channel and wait briefly for connections to finish.
pub async fn serve_on(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> ServerResult<()> {
    let connections = TaskTracker::new();
    let period = state.heartbeat.max(Duration::from_millis(10));
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,

            _ = heartbeat.tick() => {
                let pruned = state.hub().heartbeat(state.stale_after);
                if !pruned.is_empty() {
                    info!(count = pruned.len(), "dropped stale channels");
                }
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let state = state.clone();
                    connections.spawn(async move {
                        if let Err(e) = connection(stream, peer, state).await {
                            debug!(%peer, error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
        }
    }

    info!(
        connections = state.hub().channel_count(),
        "front door closing"
    );
    state.orchestrator.shutdown().await;
    state.hub().close_all();
    connections.close();
    if tokio::time::timeout(CLOSE_GRACE, connections.wait())
        .await
        .is_err()
    {
        warn!("connections still open after grace period");
    }
    Ok(())
}

async fn connection(stream: TcpStream, peer: SocketAddr, state: AppState) -> ServerResult<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| ServerError::WebSocket(format!("handshake: {e}")))?;
    let (mut sink, mut source) = ws.split();
    let hub = state.hub().clone();
    let (channel, mut outbound) = hub.register();
    debug!(channel, %peer, "client connected");

    let result = loop {
        tokio::select! {
            inbound = source.next() => match inbound {
                Some(Ok(message)) => {
                    hub.touch(channel);
                    match message {
                        Message::Text(text) => {
                            let reply = ws::handle(&state.orchestrator, channel, text.as_str()).await;
                            if let Some(frame) = reply.to_frame() {
                                hub.send_to(channel, frame);
                            }
                        }
                        Message::Close(_) => break Ok(()),
                        // tungstenite answers pings itself; binary frames are not part of the protocol.
                        _ => {}
                    }
                }
                Some(Err(e)) => break Err(ServerError::WebSocket(e.to_string())),
                None => break Ok(()),
            },

            frame = outbound.recv() => {
                let sent = match frame {
                    Some(Outbound::Text(text)) => sink.send(Message::text(text.to_string())).await,
                    Some(Outbound::Ping) => sink.send(Message::Ping(Default::default())).await,
                    Some(Outbound::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break Ok(());
                    }
                };
                if let Err(e) = sent {
                    break Err(ServerError::WebSocket(e.to_string()));
                }
            }
        }
    };

    hub.disconnect(channel);
    debug!(channel, %peer, "client disconnected");
    result
}
