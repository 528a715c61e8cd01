// ABOUTME: Bounded per-sandbox log buffer and log line classification
// ABOUTME: Detects framework build phases, fatal build errors and benign HTTP access logs

use crate::types::{LogPhase, LogType, SandboxLog};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use std::collections::VecDeque;

/// Append-only log buffer that drops the oldest entries past `capacity`.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    capacity: usize,
    entries: VecDeque<SandboxLog>,
    dropped: u64,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
            dropped: 0,
        }
    }

    pub fn push(&mut self, entry: SandboxLog) {
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            self.dropped += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries evicted so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> impl Iterator<Item = &SandboxLog> {
        self.entries.iter()
    }

    /// Entries newer than `since`, keeping only the most recent `limit`.
    pub fn query(&self, since: Option<DateTime<Utc>>, limit: Option<usize>) -> Vec<SandboxLog> {
        let filtered: Vec<&SandboxLog> = self
            .entries
            .iter()
            .filter(|log| since.map_or(true, |t| log.timestamp > t))
            .collect();

        let skip = match limit {
            Some(max) if filtered.len() > max => filtered.len() - max,
            _ => 0,
        };

        filtered.into_iter().skip(skip).cloned().collect()
    }

    pub fn render(&self) -> Vec<String> {
        self.entries.iter().map(SandboxLog::render).collect()
    }
}

/// Build phase inferred from a run-phase output line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildSignal {
    Compiling,
    Ready,
}

static COMPILING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(compiling|building|bundling|starting)\b").expect("valid regex")
});

static READY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\bready\b|compiled\b|local:\s+https?://)").expect("valid regex")
});

static FATAL: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"SyntaxError",
        r"Module not found",
        r"Cannot find module",
        r"ERR_MODULE_NOT_FOUND",
        r"Failed to compile",
        r"Unexpected token",
        r"Unterminated (string|regexp|template)",
        r"ReferenceError",
        r"Error: Cannot resolve",
        r"Could not resolve",
    ])
    .expect("valid regex set")
});

/// Access log shape: `::1 - - [07/Sep/2025 12:25:39] "GET / HTTP/1.1" 200 -`
static HTTP_ACCESS_LOG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^[:\w\.-]+ - - \[[^\]]+\] "[A-Z]+ [^"]+ HTTP/[\d\.]+" (\d{3})"#)
        .expect("valid regex")
});

/// Map a run-phase line to a build phase, if it announces one.
pub fn detect_build_signal(line: &str) -> Option<BuildSignal> {
    if READY.is_match(line) && !COMPILING.is_match(line) {
        Some(BuildSignal::Ready)
    } else if COMPILING.is_match(line) {
        Some(BuildSignal::Compiling)
    } else {
        None
    }
}

/// Whether a line reports an error the dev server will not recover from on its own.
pub fn is_fatal_build_error(line: &str) -> bool {
    FATAL.is_match(line)
}

/// Whether a line is an HTTP access log for a 2xx/3xx response.
pub fn is_successful_http_log(line: &str) -> bool {
    HTTP_ACCESS_LOG
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok())
        .is_some_and(|status| (200..400).contains(&status))
}

/// Build a log entry for a child process line.
///
/// Servers that write successful access logs to stderr get them recorded as
/// informational rather than as errors.
pub fn classify_line(phase: LogPhase, stderr: bool, line: String) -> SandboxLog {
    let log_type = if !stderr {
        LogType::Stdout
    } else if is_successful_http_log(&line) {
        LogType::System
    } else {
        LogType::Stderr
    };

    SandboxLog {
        timestamp: Utc::now(),
        phase,
        log_type,
        message: line,
    }
}

/// The last `max` lines that look like errors, for terminal error messages.
pub fn error_excerpt<'a>(lines: impl Iterator<Item = &'a SandboxLog>, max: usize) -> String {
    let errors: Vec<&str> = lines
        .filter(|l| l.log_type == LogType::Stderr || is_fatal_build_error(&l.message))
        .map(|l| l.message.as_str())
        .collect();
    let start = errors.len().saturating_sub(max);
    errors[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(msg: &str) -> SandboxLog {
        classify_line(LogPhase::Run, false, msg.to_string())
    }

    #[test]
    fn test_buffer_drops_oldest() {
        let mut buffer = LogBuffer::new(3);
        for i in 0..5 {
            buffer.push(line(&format!("line {}", i)));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.dropped(), 2);
        let messages: Vec<_> = buffer.entries().map(|l| l.message.clone()).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_query_limit_keeps_most_recent() {
        let mut buffer = LogBuffer::new(10);
        for i in 0..6 {
            buffer.push(line(&format!("line {}", i)));
        }
        let recent = buffer.query(None, Some(2));
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "line 4");
        assert_eq!(recent[1].message, "line 5");
        assert_eq!(buffer.query(None, None).len(), 6);
    }

    #[test]
    fn test_query_since_filters_older_entries() {
        let mut buffer = LogBuffer::new(10);
        let mut old = line("old");
        old.timestamp = Utc::now() - chrono::Duration::minutes(10);
        buffer.push(old);
        buffer.push(line("new"));

        let cutoff = Utc::now() - chrono::Duration::minutes(1);
        let logs = buffer.query(Some(cutoff), None);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "new");
    }

    #[test]
    fn test_detect_build_signal() {
        assert_eq!(
            detect_build_signal(" ○ Compiling / ..."),
            Some(BuildSignal::Compiling)
        );
        assert_eq!(
            detect_build_signal(" ✓ Ready in 2.1s"),
            Some(BuildSignal::Ready)
        );
        assert_eq!(
            detect_build_signal("  - Local:        http://localhost:3100"),
            Some(BuildSignal::Ready)
        );
        assert_eq!(detect_build_signal("npm notice"), None);
    }

    #[test]
    fn test_fatal_patterns() {
        assert!(is_fatal_build_error(
            "SyntaxError: Unexpected token '<' in app/page.tsx"
        ));
        assert!(is_fatal_build_error("Module not found: Can't resolve './Hero'"));
        assert!(is_fatal_build_error("Error: Cannot find module 'next'"));
        assert!(is_fatal_build_error("ReferenceError: useState is not defined"));
        assert!(!is_fatal_build_error(" ✓ Compiled / in 1200ms"));
        assert!(!is_fatal_build_error("warn - Fast Refresh had to perform a full reload"));
    }

    #[test]
    fn test_successful_http_logs_on_stderr_are_informational() {
        let access = "::1 - - [07/Sep/2025 12:25:39] \"GET / HTTP/1.1\" 200 -";
        assert!(is_successful_http_log(access));
        assert_eq!(
            classify_line(LogPhase::Run, true, access.to_string()).log_type,
            LogType::System
        );

        let missing = "127.0.0.1 - - [07/Sep/2025 12:25:39] \"GET /x HTTP/1.1\" 404 -";
        assert!(!is_successful_http_log(missing));
        assert_eq!(
            classify_line(LogPhase::Run, true, missing.to_string()).log_type,
            LogType::Stderr
        );
    }

    #[test]
    fn test_error_excerpt_takes_last_errors() {
        let mut buffer = LogBuffer::new(10);
        buffer.push(line("ready"));
        for i in 0..4 {
            buffer.push(classify_line(LogPhase::Run, true, format!("err {}", i)));
        }
        assert_eq!(error_excerpt(buffer.entries(), 2), "err 2\nerr 3");
    }
}
