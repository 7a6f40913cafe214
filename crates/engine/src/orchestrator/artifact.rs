//! Generation of the Playwright test file a sandbox runs.

use sandbox::IsolationLevel;
use serde_json::{Map, Value};

use crate::types::ResolvedConfig;

/// File name of the generated test inside the scratch directory.
pub const ARTIFACT_FILE: &str = "script.spec.js";

/// Resource types the page may load when running isolated.
const ALLOWED_RESOURCE_TYPES: &[&str] = &["document", "script", "stylesheet", "image", "font"];

const HELPERS: &str = r#"
const format = (args) => args
  .map((a) => (typeof a === 'string' ? a : JSON.stringify(a)))
  .join(' ')
  .replace(/\r?\n/g, ' ');
const emit = (tag, text) => process.stdout.write(`[${tag}] ${text}\n`);
const log = Object.freeze({
  debug: (...args) => emit('LOG:DEBUG', format(args)),
  info: (...args) => emit('LOG:INFO', format(args)),
  warn: (...args) => emit('LOG:WARN', format(args)),
  error: (...args) => emit('LOG:ERROR', format(args)),
});
const OUT_DIR = path.join(__dirname, 'out');
let shotCount = 0;
async function screenshot(page, name) {
  shotCount += 1;
  const base = String(name || `shot-${shotCount}`).replace(/[^A-Za-z0-9_.-]/g, '_').slice(0, 64);
  const file = base.endsWith('.png') ? base : `${base}.png`;
  if (CAPTURE_SCREENSHOTS) {
    await page.screenshot({ path: path.join(OUT_DIR, file), fullPage: true });
  }
  emit('SCREENSHOT', file);
  return file;
}
function exportData(data) {
  emit('EXPORT', JSON.stringify(data));
}
"#;

/// Builds the test file around already-sanitized code.
pub fn render(
    sanitized_code: &str,
    parameters: &Map<String, Value>,
    config: &ResolvedConfig,
    isolation: IsolationLevel,
) -> String {
    let params = Value::Object(parameters.clone()).to_string();
    let engine = Value::String(config.browser_engine.clone()).to_string();

    let mut out = String::with_capacity(sanitized_code.len() + HELPERS.len() + 1024);
    out.push_str("'use strict';\n");
    out.push_str("const { test, expect } = require('@playwright/test');\n");
    out.push_str("const path = require('path');\n\n");
    out.push_str(&format!("const params = Object.freeze({params});\n"));
    out.push_str(&format!(
        "const CAPTURE_SCREENSHOTS = {};\n",
        config.capture_screenshots
    ));
    out.push_str(HELPERS);
    out.push('\n');
    out.push_str(&format!(
        "test.use({{ viewport: {{ width: 1280, height: 720 }}, headless: {}, browserName: {engine} }});\n",
        config.headless
    ));
    out.push_str(&format!("test.setTimeout({});\n\n", config.timeout_ms));
    out.push_str("test('playguard execution', async ({ page }) => {\n");
    if isolation == IsolationLevel::Container {
        let allowed = ALLOWED_RESOURCE_TYPES
            .iter()
            .map(|t| format!("'{t}'"))
            .collect::<Vec<_>>()
            .join(", ");
        out.push_str(&format!("  const allowedTypes = new Set([{allowed}]);\n"));
        out.push_str(
            "  await page.route('**/*', (route) =>\n    \
             allowedTypes.has(route.request().resourceType()) ? route.continue() : route.abort());\n",
        );
    }
    out.push_str("  log.info('script started');\n");
    out.push_str(sanitized_code);
    if !sanitized_code.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("  log.info('script finished');\n");
    out.push_str("});\n");
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn config() -> ResolvedConfig {
        ResolvedConfig {
            timeout_ms: 15_000,
            headless: false,
            browser_engine: "webkit".into(),
            capture_screenshots: true,
            max_memory_mb: 512,
            max_cpu_percent: 50,
        }
    }

    #[test]
    fn embeds_code_parameters_and_settings() {
        let params = json!({"user": "alice", "quote": "it's \"fine\""});
        let js = render(
            "await page.goto('https://example.com');",
            params.as_object().unwrap(),
            &config(),
            IsolationLevel::Process,
        );
        assert!(js.contains("const params = Object.freeze({"));
        assert!(js.contains(r#""user":"alice""#));
        assert!(js.contains(r#""quote":"it's \"fine\"""#));
        assert!(js.contains("viewport: { width: 1280, height: 720 }, headless: false, browserName: \"webkit\""));
        assert!(js.contains("test.setTimeout(15000);"));
        assert!(js.contains("const CAPTURE_SCREENSHOTS = true;"));
        assert!(js.contains("await page.goto('https://example.com');\n  log.info('script finished');"));
        assert!(!js.contains("page.route"));
    }

    #[test]
    fn isolated_runs_filter_resource_types() {
        let js = render("", &Map::new(), &config(), IsolationLevel::Container);
        assert!(js.contains(
            "new Set(['document', 'script', 'stylesheet', 'image', 'font'])"
        ));
        assert!(js.contains("await page.route('**/*'"));
    }
}
