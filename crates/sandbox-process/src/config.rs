use std::path::PathBuf;

use sandbox::SandboxConfig;

/// Launch template for the fallback backend.
///
/// `args` may contain the placeholders `{artifact}` (absolute artifact path),
/// `{scratch}` (scratch directory), `{output}` (output directory) and
/// `{browser}` (browser engine name).
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Extra environment, e.g. `NODE_PATH` pointing at a Playwright install.
    pub env: Vec<(String, String)>,
    /// Capacity of the per-sandbox output line channel.
    pub output_buffer: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("npx"),
            args: vec![
                "playwright".into(),
                "test".into(),
                "{artifact}".into(),
                "--reporter=line".into(),
                "--workers=1".into(),
                "--output={output}".into(),
            ],
            env: Vec::new(),
            output_buffer: 256,
        }
    }
}

impl ProcessConfig {
    pub(crate) fn render_args(&self, config: &SandboxConfig) -> Vec<String> {
        let artifact = config.artifact_path().display().to_string();
        let scratch = config.scratch_dir.display().to_string();
        let output = config.output_dir().display().to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{artifact}", &artifact)
                    .replace("{scratch}", &scratch)
                    .replace("{output}", &output)
                    .replace("{browser}", &config.browser_engine)
            })
            .collect()
    }
}
