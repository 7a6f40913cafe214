use std::path::PathBuf;
use std::time::Duration;

use sandbox::{IsolationLevel, OutputStream, ResourceLimits, SandboxConfig, SandboxError, SandboxFactory};
use sandbox_process::{ProcessConfig, ProcessFactory};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Factory that runs the artifact as a shell script.
fn shell_factory() -> ProcessFactory {
    ProcessFactory::new(ProcessConfig {
        program: PathBuf::from("sh"),
        args: vec!["{artifact}".into()],
        ..ProcessConfig::default()
    })
    .unwrap()
}

fn sandbox_config(dir: &TempDir, id: &str, script: &str) -> SandboxConfig {
    std::fs::write(dir.path().join("script.sh"), script).unwrap();
    SandboxConfig {
        execution_id: id.to_string(),
        resources: ResourceLimits {
            memory_mb: 128,
            cpu_percent: 50,
            timeout: Duration::from_secs(5),
        },
        scratch_dir: dir.path().to_path_buf(),
        artifact: "script.sh".into(),
        browser_engine: "chromium".into(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn runs_artifact_and_streams_output() {
    let dir = TempDir::new().unwrap();
    let factory = shell_factory();
    assert_eq!(factory.isolation(), IsolationLevel::Process);

    let config = sandbox_config(
        &dir,
        "exec-out",
        "echo \"[LOG:INFO] $PLAYGUARD_EXECUTION_ID\"\necho warn >&2\nexit 3\n",
    );
    let mut sandbox = factory.create(config).await.unwrap();
    let mut lines = sandbox.start().await.unwrap();
    assert!(sandbox.pid().is_some());

    let mut seen = Vec::new();
    while let Some(line) = lines.recv().await {
        seen.push(line);
    }
    let exit = sandbox.wait().await.unwrap();

    assert_eq!(exit.exit_code, 3);
    assert!(
        seen.iter()
            .any(|l| l.stream == OutputStream::Stdout && l.text == "[LOG:INFO] exec-out")
    );
    assert!(
        seen.iter()
            .any(|l| l.stream == OutputStream::Stderr && l.text == "warn")
    );
    assert!(dir.path().join("out").is_dir());
    factory.destroy(sandbox).await;
}

#[tokio::test]
async fn kill_terminates_long_running_script() {
    let dir = TempDir::new().unwrap();
    let factory = shell_factory();
    let mut sandbox = factory
        .create(sandbox_config(&dir, "exec-kill", "sleep 30\n"))
        .await
        .unwrap();
    let _lines = sandbox.start().await.unwrap();

    sandbox.kill().await.unwrap();
    let exit = tokio::time::timeout(Duration::from_secs(5), sandbox.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(!exit.success());

    // Idempotent after exit.
    sandbox.kill().await.unwrap();
}

#[tokio::test]
async fn kill_by_label_reaches_running_sandbox() {
    let dir = TempDir::new().unwrap();
    let factory = shell_factory();
    let mut sandbox = factory
        .create(sandbox_config(&dir, "exec-label", "sleep 30\n"))
        .await
        .unwrap();
    let _lines = sandbox.start().await.unwrap();

    factory.kill_by_label("exec-label").await;
    factory.kill_by_label("unknown-id").await;

    let exit = tokio::time::timeout(Duration::from_secs(5), sandbox.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exit.exit_code, 128 + 9);
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let dir = TempDir::new().unwrap();
    let factory = shell_factory();
    let mut sandbox = factory
        .create(sandbox_config(&dir, "exec-twice", "exit 0\n"))
        .await
        .unwrap();
    let _lines = sandbox.start().await.unwrap();
    let err = sandbox.start().await.unwrap_err();
    assert!(matches!(err, SandboxError::StartFailed(_)), "got: {err}");
    sandbox.wait().await.unwrap();
}

#[tokio::test]
async fn wait_before_start_is_an_error() {
    let dir = TempDir::new().unwrap();
    let factory = shell_factory();
    let mut sandbox = factory
        .create(sandbox_config(&dir, "exec-idle", "exit 0\n"))
        .await
        .unwrap();
    assert!(matches!(
        sandbox.wait().await,
        Err(SandboxError::NotRunning(_))
    ));
}

#[tokio::test]
async fn missing_program_is_not_available() {
    let result = ProcessFactory::new(ProcessConfig {
        program: PathBuf::from("definitely-not-a-real-binary-playguard"),
        ..ProcessConfig::default()
    });
    assert!(matches!(result, Err(SandboxError::BackendNotAvailable(_))));
}

#[tokio::test]
async fn create_requires_existing_scratch_dir() {
    let factory = shell_factory();
    let config = SandboxConfig {
        execution_id: "exec-missing".into(),
        resources: ResourceLimits {
            memory_mb: 128,
            cpu_percent: 50,
            timeout: Duration::from_secs(5),
        },
        scratch_dir: PathBuf::from("/nonexistent/playguard/scratch"),
        artifact: "script.sh".into(),
        browser_engine: "chromium".into(),
    };
    assert!(matches!(
        factory.create(config).await,
        Err(SandboxError::InvalidConfig(_))
    ));
}
