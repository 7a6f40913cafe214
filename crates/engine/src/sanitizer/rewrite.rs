use std::borrow::Cow;

use super::rules::DENYLIST;

/// Replacement for any fragment that matches the denylist.
pub const INERT_MARKER: &str = "void 0 /* [sanitized] */";

const PRELUDE: &str = "await (async function (__scope) {\n\
    for (const __name of [\"require\", \"module\", \"exports\"]) {\n\
    try { delete __scope[__name]; } catch (_) {}\n\
    }\n\
    return (async (process, require, module, exports, Buffer, global) => {\n\
    \"use strict\";\n";

const POSTLUDE: &str = "\n})();\n})(globalThis);\n";

/// Replaces every denylist match in comment-free code with [`INERT_MARKER`].
pub(crate) fn neutralize(stripped: &str) -> String {
    let mut text = stripped.to_string();
    for rule in DENYLIST.iter() {
        if let Cow::Owned(replaced) = rule.pattern.replace_all(&text, INERT_MARKER) {
            text = replaced;
        }
    }
    text
}

/// Wraps the payload so ambient module handles are deleted from
/// `globalThis` and shadowed by `undefined` parameters when it runs.
/// The wrapper itself names `globalThis`, so denylist checks apply to the
/// payload, not to the wrapped text.
pub(crate) fn wrap(payload: &str) -> String {
    let mut wrapped = String::with_capacity(PRELUDE.len() + payload.len() + POSTLUDE.len());
    wrapped.push_str(PRELUDE);
    wrapped.push_str(payload.trim());
    wrapped.push_str(POSTLUDE);
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitizer::{lexer, rules};

    #[test]
    fn wrapper_is_well_formed_and_scrubs_the_real_global() {
        let wrapped = wrap("await page.goto('https://example.com');");
        assert!(lexer::scan(&wrapped).is_ok());
        assert!(wrapped.contains("(process, require, module, exports, Buffer, global)"));
        assert!(wrapped.contains("await page.goto('https://example.com');"));
        // Strict mode makes `this` undefined in a plain call, so the scope
        // handed to the delete loop must be the global object itself.
        assert!(wrapped.contains("delete __scope[__name]"));
        assert!(wrapped.ends_with("})(globalThis);\n"));
        assert!(!wrapped.contains("return this"));
    }

    #[test]
    fn neutralize_replaces_matches() {
        let out = neutralize("const x = eval('1'); log.info('ok');");
        assert_eq!(out, format!("const x = {INERT_MARKER}'1'); log.info('ok');"));
        assert!(rules::first_deny_match(&out).is_none());
    }
}
