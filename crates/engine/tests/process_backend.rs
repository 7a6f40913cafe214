mod common;

use std::path::PathBuf;
use std::sync::Arc;

use common::{events_until_terminal, subscribe, types};
use engine::{Collaborators, EngineConfig, Orchestrator, SubmitRequest};
use event_hub::Hub;
use sandbox::IsolationLevel;
use sandbox_process::{ProcessConfig, ProcessFactory};

/// Runs `script` with `sh -c` instead of Playwright. `{artifact}` and
/// `{output}` are substituted by the backend.
fn orchestrator(script: &str, hub: Arc<Hub>) -> Orchestrator {
    let factory = ProcessFactory::new(ProcessConfig {
        program: PathBuf::from("sh"),
        args: vec!["-c".into(), script.into()],
        ..ProcessConfig::default()
    })
    .unwrap();
    Orchestrator::new(
        EngineConfig {
            monitor_interval_ms: 100,
            ..EngineConfig::default()
        },
        Arc::new(factory),
        hub,
        Collaborators::default(),
    )
}

fn request(id: &str) -> SubmitRequest {
    SubmitRequest {
        execution_id: Some(id.to_string()),
        ..SubmitRequest::new("script-1", "await page.goto('https://example.com');")
    }
}

#[tokio::test]
async fn shell_run_reports_logs_exports_and_completion() {
    let hub = Arc::new(Hub::new());
    let orchestrator = orchestrator(
        r#"test -f {artifact} || exit 9
test -d {output} || exit 8
echo '[LOG:INFO] script started'
echo '[EXPORT] {"from": "sh"}'
echo 'noise on stderr' >&2
echo '[LOG:INFO] script finished'"#,
        hub.clone(),
    );
    assert_eq!(orchestrator.isolation(), IsolationLevel::Process);

    let mut rx = subscribe(&hub, "exec-sh");
    orchestrator.submit(request("exec-sh")).await.unwrap();
    let events = events_until_terminal(&mut rx).await;

    let kinds = types(&events);
    assert_eq!(kinds.last(), Some(&"COMPLETE"));
    assert!(kinds.contains(&"RESULT_UPDATE"));
    let complete = events.last().unwrap();
    assert_eq!(complete["data"]["result"]["from"], "sh");

    let execution = orchestrator.get_execution("exec-sh").unwrap();
    assert_eq!(execution.progress, 100);
    assert_eq!(execution.security.isolation_level, IsolationLevel::Process);
    assert_eq!(execution.logs.len(), 2);
}

#[tokio::test]
async fn shell_run_failure_carries_exit_code() {
    let hub = Arc::new(Hub::new());
    let orchestrator = orchestrator("echo 'Error: no browser' >&2; exit 3", hub.clone());

    let mut rx = subscribe(&hub, "exec-fail");
    orchestrator.submit(request("exec-fail")).await.unwrap();
    let events = events_until_terminal(&mut rx).await;

    let error = &events.last().unwrap()["data"];
    assert_eq!(error["reason"], "SANDBOX_RUNTIME");
    let message = error["message"].as_str().unwrap();
    assert!(message.contains("exited with code 3"), "{message}");
    assert!(message.contains("no browser"), "{message}");
}

#[tokio::test]
async fn shell_run_is_killed_on_timeout() {
    let hub = Arc::new(Hub::new());
    let orchestrator = orchestrator("echo '[LOG:INFO] script started'; sleep 30", hub.clone());

    let mut rx = subscribe(&hub, "exec-sleep");
    let mut req = request("exec-sleep");
    req.config.timeout_ms = Some(1_000);
    let started = std::time::Instant::now();
    orchestrator.submit(req).await.unwrap();
    let events = events_until_terminal(&mut rx).await;

    assert_eq!(events.last().unwrap()["data"]["reason"], "TIMEOUT");
    assert!(started.elapsed().as_secs() < 10);
    orchestrator.shutdown().await;
    assert_eq!(orchestrator.active_count(), 0);
}
