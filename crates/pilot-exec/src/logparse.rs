//! Diagnostic extraction from a task's captured stderr.
//!
//! Container supervisors (apptainer in particular) interleave their own structured debug lines with the
//! child's output. The child's error is what callers want, so supervisor chatter is skipped.

use std::sync::LazyLock;

use regex::Regex;

/// Returned when the log holds nothing but blank lines.
pub const NO_ERROR_INFO: &str = "<no error info>";

/// `<LEVEL>   [<no spaces>]   ...`, e.g. `DEBUG   [U=613,P=47]   Master()   Child exited ...`
static SUPERVISOR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\S+\s+\[[^\s]+\]\s+").expect("invalid supervisor line pattern")
});

static SUPERVISOR_MESSAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\S+\s+\[[^\s]+\]\s+\S+\s+(.*)$").expect("invalid supervisor message pattern")
});

static CLEANUP_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^DEBUG\s+\[.*\]\s+CleanupContainer\(\)").expect("invalid cleanup pattern")
});

static TRACE_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(Traceback \(most recent call last\):|thread '.*' panicked at)")
        .expect("invalid trace header pattern")
});

/// Most relevant error text of a stderr capture.
///
/// 1. a stack trace ending at the last child line (before supervisor cleanup), if there is one;
/// 2. otherwise the last child line;
/// 3. otherwise, when every line is supervisor output, the message column of the last line.
pub fn extract_error(log: &[u8]) -> String {
    let text = String::from_utf8_lossy(log);
    let lines: Vec<&str> = text
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty())
        .collect();

    let Some(last) = lines.last() else {
        return NO_ERROR_INFO.to_string();
    };

    let Some(idx) = last_child_line(&lines) else {
        return supervisor_message(last).to_string();
    };

    if let Some(start) = (0..=idx).rev().find(|&i| TRACE_HEADER.is_match(lines[i])) {
        return lines[start..=idx].join("\n");
    }
    lines[idx].to_string()
}

/// Index of the last line not written by the supervisor, looking only before its cleanup chatter.
pub fn last_child_line(lines: &[&str]) -> Option<usize> {
    let end = lines
        .iter()
        .position(|l| CLEANUP_LINE.is_match(l))
        .unwrap_or(lines.len());
    lines[..end]
        .iter()
        .rposition(|l| !SUPERVISOR_LINE.is_match(l))
}

fn supervisor_message(line: &str) -> &str {
    SUPERVISOR_MESSAGE
        .captures(line)
        .and_then(|c| c.get(1))
        .map_or(line, |m| m.as_str())
}
