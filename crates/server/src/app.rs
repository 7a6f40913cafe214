use std::sync::Arc;

use engine::{
    Collaborators, EngineMetrics, HttpPersistence, MetricsSnapshot, Orchestrator, PersistenceSink,
    StaticCatalog,
};
use event_hub::Hub;
use sandbox::SandboxFactory;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};

/// An orchestrator wired to the collaborators named in the config.
pub struct App {
    pub orchestrator: Orchestrator,
    pub metrics: Arc<EngineMetrics>,
}

impl App {
    pub fn build(config: &ServerConfig, factory: Arc<dyn SandboxFactory>) -> ServerResult<Self> {
        let metrics = Arc::new(EngineMetrics::default());
        let mut collaborators = Collaborators {
            catalog: Arc::new(StaticCatalog::new(config.scripts.clone())),
            metrics: metrics.clone(),
            ..Collaborators::default()
        };
        if let Some(persistence) = &config.persistence {
            let sink = HttpPersistence::new(persistence.url.clone(), persistence.token.clone())
                .map_err(|e| ServerError::Config(format!("persistence client: {e}")))?;
            info!(url = %persistence.url, "mirroring executions over HTTP");
            collaborators.persistence = Arc::new(sink) as Arc<dyn PersistenceSink>;
        }

        let orchestrator = Orchestrator::new(
            config.engine.clone(),
            factory,
            Arc::new(Hub::new()),
            collaborators,
        );
        Ok(Self {
            orchestrator,
            metrics,
        })
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Cancel everything still running and log the final counters.
    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
        let m = self.metrics();
        info!(
            total = m.total,
            completed = m.completed,
            failed = m.failed,
            cancelled = m.cancelled,
            blocked = m.blocked,
            timeouts = m.timeouts,
            average_duration_ms = m.average_duration_ms,
            quarantined = self.orchestrator.quarantine().len(),
            "engine stopped"
        );
    }
}
