//! Fixed rule catalogs used by the sanitizer stages.

use std::sync::LazyLock;

use regex::Regex;
use tracing::error;

/// Literal substrings rejected outright (shell escapes, credential paths).
pub(crate) const BLOCKED_SUBSTRINGS: &[&str] = &[
    "rm -rf",
    "$(curl",
    "$(wget",
    "`curl ",
    "`wget ",
    "/etc/passwd",
    "/etc/shadow",
    "/etc/sudoers",
    ".ssh/",
    "id_rsa",
    ".aws/credentials",
    "/proc/self",
    "/var/run/docker.sock",
];

/// A pipe into `sh` or `bash`. A logical `||` is not a pipe.
pub(crate) static SHELL_PIPE: LazyLock<Option<Regex>> =
    LazyLock::new(|| compile(r"(?:^|[^|])\|\s*(?:ba)?sh\b"));

pub(crate) struct DenyRule {
    pub name: &'static str,
    pub pattern: Regex,
    pub message: &'static str,
}

const DENY_CATALOG: &[(&str, &str, &str)] = &[
    (
        "child-process-module",
        r#"\brequire\s*\(\s*['"`](?:node:)?child_process['"`]\s*\)"#,
        "child process spawning",
    ),
    (
        "host-module",
        r#"\brequire\s*\(\s*['"`](?:node:)?(?:fs|fs/promises|path|os|vm|v8|worker_threads|cluster|inspector|module|process)['"`]"#,
        "host filesystem or runtime module",
    ),
    (
        "network-module",
        r#"\brequire\s*\(\s*['"`](?:node:)?(?:net|http|https|http2|dgram|dns|tls|undici)['"`]"#,
        "non-sandboxed network module",
    ),
    ("module-loading", r"\brequire\s*\(", "dynamic module loading"),
    ("dynamic-import", r"\bimport\s*\(", "dynamic module loading"),
    ("static-import", r"(?m)^\s*import\s+[\w{*]", "module loading"),
    ("process-access", r"\bprocess\s*(?:\.|\[)", "process control"),
    (
        "process-spawn",
        r"(?:^|[^.\w$])(?:exec|execSync|execFile|execFileSync|spawn|spawnSync|fork)\s*\(",
        "child process spawning",
    ),
    ("filesystem-access", r"\bfs\s*(?:\.|\[)", "filesystem access"),
    (
        "filesystem-call",
        r"\b(?:readFileSync|writeFileSync|appendFileSync|readdirSync|unlinkSync|rmSync|rmdirSync|mkdirSync|createReadStream|createWriteStream)\s*\(",
        "filesystem access",
    ),
    ("eval", r"\beval\s*\(", "dynamic code evaluation"),
    (
        "function-constructor",
        r"(?:\bnew\s+|(?:^|[^.\w$]))Function\s*\(",
        "dynamic code evaluation",
    ),
    (
        "string-timer",
        r#"\bset(?:Timeout|Interval|Immediate)\s*\(\s*['"`]"#,
        "dynamic code evaluation",
    ),
    ("proto-access", r"__proto__", "prototype escape"),
    (
        "constructor-chain",
        r#"constructor\s*(?:\.\s*constructor|\[\s*['"`]constructor)|\[\s*['"`]constructor['"`]\s*\]"#,
        "constructor escape",
    ),
    (
        "prototype-manipulation",
        r"\b(?:setPrototypeOf|__defineGetter__|__defineSetter__|__lookupGetter__|__lookupSetter__)\b|\.prototype\b",
        "prototype escape",
    ),
    ("global-this", r"\bglobalThis\b", "ambient global access"),
    ("global-object", r"\bglobal\s*(?:\.|\[)", "ambient global access"),
    ("module-object", r"\b(?:module|exports)\s*(?:\.|\[)", "ambient global access"),
    ("module-paths", r"\b(?:__dirname|__filename)\b", "ambient global access"),
    ("buffer", r"\bBuffer\s*(?:\.|\()", "ambient global access"),
    ("reflection", r"\bReflect\s*\.|\bnew\s+Proxy\s*\(", "reflection"),
    ("websocket", r"\bWebSocket\b", "non-sandboxed network access"),
    ("xhr", r"\bXMLHttpRequest\b", "non-sandboxed network access"),
    ("bare-fetch", r"(?:^|[^.\w$])fetch\s*\(", "non-sandboxed network access"),
    ("workers", r"\b(?:importScripts|SharedArrayBuffer|WebAssembly)\b|\bnew\s+Worker\s*\(", "worker or native code"),
];

/// Dangerous capability references. Any hit is a hard rejection.
pub(crate) static DENYLIST: LazyLock<Vec<DenyRule>> = LazyLock::new(|| {
    DENY_CATALOG
        .iter()
        .filter_map(|(name, pattern, message)| match Regex::new(pattern) {
            Ok(pattern) => Some(DenyRule {
                name,
                pattern,
                message,
            }),
            Err(e) => {
                error!(rule = name, error = %e, "invalid denylist pattern");
                None
            }
        })
        .collect()
});

/// First denylist rule matching `text`, with the matched fragment.
pub(crate) fn first_deny_match(text: &str) -> Option<(&'static DenyRule, String)> {
    DENYLIST.iter().find_map(|rule| {
        rule.pattern
            .find(text)
            .map(|m| (rule, m.as_str().trim().to_string()))
    })
}

// ---------------------------------------------------------------------------
// Capability allowlist
// ---------------------------------------------------------------------------

/// Receivers that may never have methods called on them.
pub(crate) const RESTRICTED_RECEIVERS: &[&str] = &[
    "process",
    "require",
    "module",
    "exports",
    "global",
    "globalThis",
    "fs",
    "os",
    "vm",
    "child_process",
    "cp",
    "net",
    "http",
    "https",
    "Buffer",
    "Reflect",
    "Atomics",
    "WebAssembly",
    "Function",
];

/// Namespaces whose methods are checked against a qualified list.
pub(crate) const QUALIFIED: &[(&str, &[&str])] = &[
    ("JSON", &["parse", "stringify"]),
    (
        "Math",
        &[
            "abs", "ceil", "floor", "max", "min", "pow", "random", "round", "sign", "sqrt", "trunc",
        ],
    ),
    ("Object", &["keys", "values", "entries", "assign", "freeze", "fromEntries"]),
    ("Promise", &["all", "allSettled", "any", "race", "resolve", "reject"]),
    ("Array", &["isArray", "from", "of"]),
    ("Number", &["isFinite", "isInteger", "isNaN", "parseFloat", "parseInt"]),
    ("String", &["fromCharCode", "raw"]),
    ("Date", &["now", "parse", "UTC"]),
    ("console", LOGGING_METHODS),
    ("log", LOGGING_METHODS),
    ("test", &["step", "info"]),
    ("expect", &["soft", "poll"]),
];

/// The whitelisted logging surface.
pub(crate) const LOGGING_METHODS: &[&str] = &["log", "info", "warn", "error", "debug"];

/// Browser-automation and basic language methods allowed on any other receiver.
pub(crate) const GENERIC_METHODS: &[&str] = &[
    // page / frame / locator
    "goto", "click", "dblclick", "fill", "type", "press", "pressSequentially", "check", "uncheck",
    "selectOption", "hover", "focus", "blur", "tap", "clear", "dragTo", "waitForSelector",
    "waitForTimeout", "waitForLoadState", "waitForURL", "waitForNavigation", "waitForResponse",
    "waitForRequest", "waitForFunction", "waitFor", "locator", "getByRole", "getByText",
    "getByLabel", "getByPlaceholder", "getByTestId", "getByAltText", "getByTitle", "frameLocator",
    "frame", "mainFrame", "frames", "title", "url", "content", "textContent", "innerText",
    "innerHTML", "inputValue", "getAttribute", "isVisible", "isHidden", "isEnabled", "isDisabled",
    "isChecked", "isEditable", "screenshot", "setViewportSize", "viewportSize", "reload", "goBack",
    "goForward", "evaluate", "evaluateAll", "$", "$$", "$eval", "$$eval", "first", "last", "nth",
    "count", "all", "allTextContents", "allInnerTexts", "boundingBox", "scrollIntoViewIfNeeded",
    "setDefaultTimeout", "setDefaultNavigationTimeout", "selectText", "dispatchEvent", "status",
    "ok", "json", "text", "headers", "request", "response", "down", "up", "insertText", "move",
    "wheel",
    // expect matchers
    "toBe", "toEqual", "toStrictEqual", "toContain", "toContainText", "toBeTruthy", "toBeFalsy",
    "toBeDefined", "toBeUndefined", "toBeNull", "toBeGreaterThan", "toBeGreaterThanOrEqual",
    "toBeLessThan", "toBeLessThanOrEqual", "toMatch", "toHaveText", "toHaveTitle", "toHaveURL",
    "toHaveCount", "toHaveValue", "toHaveAttribute", "toHaveClass", "toBeVisible", "toBeHidden",
    "toBeEnabled", "toBeDisabled", "toBeChecked", "toHaveLength", "toHaveProperty",
    // language
    "push", "pop", "shift", "unshift", "slice", "splice", "map", "filter", "reduce", "forEach",
    "find", "findIndex", "some", "every", "includes", "indexOf", "lastIndexOf", "join", "concat",
    "sort", "reverse", "flat", "flatMap", "at", "keys", "values", "entries", "has", "get", "set",
    "add", "delete", "clear", "trim", "trimStart", "trimEnd", "split", "replace", "replaceAll",
    "toLowerCase", "toUpperCase", "startsWith", "endsWith", "padStart", "padEnd", "substring",
    "charAt", "charCodeAt", "match", "matchAll", "test", "exec", "repeat", "search",
    "localeCompare", "toString", "toFixed", "toISOString", "toLocaleString", "getTime",
    "valueOf", "then", "catch", "finally",
];

/// `receiver.method(` or `).method(` call sites in masked code. Group 1 is
/// the identifier directly before the dot, if any.
pub(crate) static CALL_SITE: LazyLock<Option<Regex>> =
    LazyLock::new(|| compile(r"([A-Za-z_$][\w$]*)?\s*\??\.\s*([A-Za-z_$][\w$]*)\s*\("));

// ---------------------------------------------------------------------------
// Semantic heuristics
// ---------------------------------------------------------------------------

pub(crate) static CONSTRUCTOR_ACCESS: LazyLock<Option<Regex>> =
    LazyLock::new(|| compile(r"\.\s*constructor\b"));

/// Obfuscation indicators; each hit adds one to the score.
pub(crate) static OBFUSCATION: LazyLock<Option<Regex>> = LazyLock::new(|| {
    compile(
        r"\\x[0-9A-Fa-f]{2}|\\u[0-9A-Fa-f]{4}|\\u\{[0-9A-Fa-f]+\}|\bfromCharCode\b|\batob\s*\(|\bunescape\s*\(|\bdecodeURIComponent\s*\(|\bescape\s*\(",
    )
});

/// String literal passed straight to `atob`.
pub(crate) static ATOB_LITERAL: LazyLock<Option<Regex>> =
    LazyLock::new(|| compile(r#"\batob\s*\(\s*(?:'([^']*)'|"([^"]*)"|`([^`$]*)`)\s*\)"#));

pub(crate) const INJECTION_CATALOG: &[(&str, &str)] = &[
    ("script-tag", r"(?i)<\s*script\b"),
    ("javascript-url", r"(?i)\bjavascript\s*:"),
    ("vbscript-url", r"(?i)\bvbscript\s*:"),
    ("html-data-url", r"(?i)\bdata\s*:\s*text/html"),
    (
        "inline-handler",
        r"(?i)\bon(?:click|dblclick|load|unload|error|abort|mouseover|mouseout|mousedown|mouseup|focus|blur|change|submit|keydown|keyup|keypress|input|toggle|pointerdown|animationstart)\s*=",
    ),
    ("document-write", r"\bdocument\s*\.\s*write(?:ln)?\s*\("),
    ("inner-html-assignment", r"\.\s*(?:inner|outer)HTML\s*=[^=]"),
];

pub(crate) static INJECTION: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    INJECTION_CATALOG
        .iter()
        .filter_map(|(name, pattern)| compile(pattern).map(|re| (*name, re)))
        .collect()
});

/// Literal navigation targets.
pub(crate) static GOTO_LITERAL: LazyLock<Option<Regex>> =
    LazyLock::new(|| compile(r#"\.\s*goto\s*\(\s*(?:'([^']*)'|"([^"]*)"|`([^`$]*)`)"#));

pub(crate) static LOOP_KEYWORD: LazyLock<Option<Regex>> =
    LazyLock::new(|| compile(r"\b(?:for|while)\s*\(|\bdo\s*\{"));

fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            error!(pattern, error = %e, "invalid sanitizer pattern");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_pattern_compiles() {
        assert_eq!(DENYLIST.len(), DENY_CATALOG.len());
        assert_eq!(INJECTION.len(), INJECTION_CATALOG.len());
        for re in [
            &CALL_SITE,
            &CONSTRUCTOR_ACCESS,
            &OBFUSCATION,
            &ATOB_LITERAL,
            &SHELL_PIPE,
            &GOTO_LITERAL,
            &LOOP_KEYWORD,
        ] {
            assert!(re.is_some());
        }
    }

    #[test]
    fn shell_pipes_are_not_logical_or() {
        let Some(re) = SHELL_PIPE.as_ref() else {
            panic!("shell pipe pattern did not compile");
        };
        for text in ["curl x | sh", "curl x |sh", "wget -o- x | bash -s", "| sh"] {
            assert!(re.is_match(text), "missed: {text}");
        }
        for text in [
            "const ok = visible || shown;",
            "const label = title || shortName;",
            "a || shouldRetry",
            "x || bashful",
            "a | shape",
        ] {
            assert!(!re.is_match(text), "false positive on: {text}");
        }
    }

    #[test]
    fn denylist_names_first_offending_rule() {
        let (rule, fragment) = first_deny_match("const cp = require('child_process');").unwrap();
        assert_eq!(rule.name, "child-process-module");
        assert_eq!(fragment, "require('child_process')");

        let (rule, _) = first_deny_match("x = process.env.HOME").unwrap();
        assert_eq!(rule.name, "process-access");
        let (rule, _) = first_deny_match("const f = new Function('return 1')").unwrap();
        assert_eq!(rule.name, "function-constructor");
        let (rule, _) = first_deny_match("({}).constructor.constructor('x')").unwrap();
        assert_eq!(rule.name, "constructor-chain");
    }

    #[test]
    fn denylist_ignores_method_lookalikes() {
        for code in [
            "await page.goto('https://example.com');",
            "const m = /a(b)/.exec(text);",
            "const r = await page.request.fetch('https://example.com');",
            "const processed = items.map((i) => i.value);",
            "log.info('global state ok');",
        ] {
            assert!(first_deny_match(code).is_none(), "false positive on: {code}");
        }
    }
}
