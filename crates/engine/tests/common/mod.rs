#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use engine::{Collaborators, EngineConfig, EngineMetrics, MemoryProbe, Orchestrator};
use event_hub::{Hub, Outbound};
use parking_lot::Mutex;
use sandbox::{
    IsolationLevel, OutputLine, ProcessExit, Sandbox, SandboxConfig, SandboxError, SandboxFactory,
};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// Scripted sandbox
// ---------------------------------------------------------------------------

/// One step of a fake sandbox run.
#[derive(Debug, Clone)]
pub enum Step {
    Stdout(String),
    Stderr(String),
    Sleep(Duration),
    /// Exit with the given code; output closes.
    Exit(i32),
    /// Keep running (and keep output open) until killed.
    Hang,
}

pub fn out(text: &str) -> Step {
    Step::Stdout(text.to_string())
}

pub fn err(text: &str) -> Step {
    Step::Stderr(text.to_string())
}

pub struct FakeSandbox {
    id: String,
    steps: Vec<Step>,
    exit_tx: watch::Sender<Option<i32>>,
    exit_rx: watch::Receiver<Option<i32>>,
    player: Option<JoinHandle<()>>,
    kills: Arc<AtomicUsize>,
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    async fn start(&mut self) -> sandbox::Result<mpsc::Receiver<OutputLine>> {
        let (tx, rx) = mpsc::channel(64);
        let steps = std::mem::take(&mut self.steps);
        let exit_tx = self.exit_tx.clone();
        self.player = Some(tokio::spawn(async move {
            for step in steps {
                match step {
                    Step::Stdout(text) => {
                        let _ = tx.send(OutputLine::stdout(text)).await;
                    }
                    Step::Stderr(text) => {
                        let _ = tx.send(OutputLine::stderr(text)).await;
                    }
                    Step::Sleep(d) => tokio::time::sleep(d).await,
                    Step::Exit(code) => {
                        drop(tx);
                        exit_tx.send_replace(Some(code));
                        return;
                    }
                    Step::Hang => {
                        std::future::pending::<()>().await;
                    }
                }
            }
            drop(tx);
            exit_tx.send_replace(Some(0));
        }));
        Ok(rx)
    }

    async fn wait(&mut self) -> sandbox::Result<ProcessExit> {
        let code = *self
            .exit_rx
            .wait_for(Option::is_some)
            .await
            .map_err(|e| SandboxError::WaitFailed(e.to_string()))?;
        Ok(ProcessExit {
            pid: Some(4242),
            exit_code: code.unwrap_or(-1),
        })
    }

    async fn kill(&mut self) -> sandbox::Result<()> {
        if let Some(player) = self.player.take() {
            player.abort();
        }
        let running = self.exit_tx.borrow().is_none();
        if running {
            self.kills.fetch_add(1, Ordering::SeqCst);
            self.exit_tx.send_replace(Some(137));
        }
        Ok(())
    }
}

/// Factory handing out [`FakeSandbox`]es that all play the same script.
pub struct FakeFactory {
    steps: Vec<Step>,
    isolation: IsolationLevel,
    fail_create: bool,
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub kills: Arc<AtomicUsize>,
    pub label_kills: AtomicUsize,
    /// Artifact text as written at create time, per sandbox.
    pub artifacts: Mutex<Vec<String>>,
    pub scratch_dirs: Mutex<Vec<std::path::PathBuf>>,
}

impl FakeFactory {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            isolation: IsolationLevel::Container,
            fail_create: false,
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            kills: Arc::new(AtomicUsize::new(0)),
            label_kills: AtomicUsize::new(0),
            artifacts: Mutex::new(Vec::new()),
            scratch_dirs: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }
}

#[async_trait]
impl SandboxFactory for FakeFactory {
    fn name(&self) -> &str {
        "fake"
    }

    fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    async fn create(&self, config: SandboxConfig) -> sandbox::Result<Box<dyn Sandbox>> {
        if self.fail_create {
            return Err(SandboxError::CreationFailed("no runtime".into()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        let artifact = std::fs::read_to_string(config.artifact_path())?;
        self.artifacts.lock().push(artifact);
        self.scratch_dirs.lock().push(config.scratch_dir.clone());

        let (exit_tx, exit_rx) = watch::channel(None);
        Ok(Box::new(FakeSandbox {
            id: config.execution_id,
            steps: self.steps.clone(),
            exit_tx,
            exit_rx,
            player: None,
            kills: self.kills.clone(),
        }))
    }

    async fn destroy(&self, mut sandbox: Box<dyn Sandbox>) {
        let _ = sandbox.kill().await;
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    async fn kill_by_label(&self, _execution_id: &str) {
        self.label_kills.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Memory probe
// ---------------------------------------------------------------------------

pub struct FixedProbe {
    pub own: AtomicU64,
    pub child: AtomicU64,
}

impl FixedProbe {
    pub fn new(own: u64, child: u64) -> Self {
        Self {
            own: AtomicU64::new(own),
            child: AtomicU64::new(child),
        }
    }
}

impl MemoryProbe for FixedProbe {
    fn resident_mb(&self) -> Option<u64> {
        Some(self.own.load(Ordering::Relaxed))
    }

    fn child_resident_mb(&self, _pid: u32) -> Option<u64> {
        Some(self.child.load(Ordering::Relaxed))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub factory: Arc<FakeFactory>,
    pub hub: Arc<Hub>,
    pub metrics: Arc<EngineMetrics>,
    pub probe: Arc<FixedProbe>,
}

pub fn harness(factory: FakeFactory, config: EngineConfig) -> Harness {
    let factory = Arc::new(factory);
    let hub = Arc::new(Hub::new());
    let metrics = Arc::new(EngineMetrics::default());
    let probe = Arc::new(FixedProbe::new(100, 50));
    let collaborators = Collaborators {
        metrics: metrics.clone(),
        memory: probe.clone(),
        ..Collaborators::default()
    };
    let orchestrator = Orchestrator::new(config, factory.clone(), hub.clone(), collaborators);
    Harness {
        orchestrator,
        factory,
        hub,
        metrics,
        probe,
    }
}

/// Registers a channel subscribed to `execution_id`.
pub fn subscribe(hub: &Hub, execution_id: &str) -> mpsc::Receiver<Outbound> {
    let (channel, rx) = hub.register();
    assert!(hub.subscribe(channel, execution_id));
    rx
}

/// Collects event frames up to and including the first terminal event.
pub async fn events_until_terminal(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Value> {
    let mut events = Vec::new();
    loop {
        let next = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for events")
            .expect("channel closed before a terminal event");
        let Outbound::Text(frame) = next else {
            continue;
        };
        let event: Value = serde_json::from_str(&frame).unwrap();
        let terminal = matches!(
            event["type"].as_str(),
            Some("COMPLETE" | "ERROR" | "CANCELLED")
        );
        events.push(event);
        if terminal {
            return events;
        }
    }
}

pub fn types(events: &[Value]) -> Vec<&str> {
    events.iter().filter_map(|e| e["type"].as_str()).collect()
}

pub const SAFE_CODE: &str = "await page.goto('https://example.com');\nlog.info('navigated');";
