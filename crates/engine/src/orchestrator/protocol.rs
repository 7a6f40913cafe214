//! Classification of sandbox output lines.
//!
//! The generated test artifact prints tagged lines (`[LOG:INFO] ...`,
//! `[SCREENSHOT] file`, `[EXPORT] {json}`). Test runners may prefix output
//! with their own decoration, so the earliest tag anywhere in the line wins.

use super::execution::LogLevel;

const LOG_TAG: &str = "[LOG:";
const SCREENSHOT_TAG: &str = "[SCREENSHOT]";
const EXPORT_TAG: &str = "[EXPORT]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineTag<'a> {
    Log { level: LogLevel, message: &'a str },
    Screenshot(&'a str),
    Export(&'a str),
    /// Untagged, non-empty output.
    Plain(&'a str),
    Empty,
}

pub fn classify(line: &str) -> LineTag<'_> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return LineTag::Empty;
    }

    let earliest = [
        (line.find(LOG_TAG), LOG_TAG),
        (line.find(SCREENSHOT_TAG), SCREENSHOT_TAG),
        (line.find(EXPORT_TAG), EXPORT_TAG),
    ]
    .into_iter()
    .filter_map(|(pos, tag)| pos.map(|p| (p, tag)))
    .min_by_key(|(pos, _)| *pos);

    let Some((pos, tag)) = earliest else {
        return LineTag::Plain(line.trim());
    };
    let Some(rest) = line.get(pos + tag.len()..) else {
        return LineTag::Plain(line.trim());
    };

    match tag {
        SCREENSHOT_TAG => LineTag::Screenshot(rest.trim()),
        EXPORT_TAG => LineTag::Export(rest.trim()),
        _ => match rest.split_once(']') {
            Some((level, message)) if !level.contains(' ') => LineTag::Log {
                level: LogLevel::from_tag(level),
                message: message.trim(),
            },
            _ => LineTag::Plain(line.trim()),
        },
    }
}
