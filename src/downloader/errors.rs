// Error types for extractor backends and the fetch orchestrator

use thiserror::Error;

use super::diagnostics::{diagnose_error, BlockingReason};

/// Failure of a single backend attempt. Always recoverable: the orchestrator
/// logs it and moves on to the next backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Network timeout while talking to YouTube or waiting on a subprocess
    #[error("Network timeout: {0}")]
    NetworkTimeout(String),

    /// YouTube refused the request (403, 429, bot detection, ...)
    #[error("Blocked by YouTube: {0}")]
    Blocked(String),

    /// yt-dlp missing, not provisioned, or failed to spawn
    #[error("Tool not available: {0}")]
    ToolNotFound(String),

    /// Failed to parse extractor output
    #[error("Parse error: {0}")]
    ParseError(String),

    /// The video exists but the extractor reports it cannot be played
    #[error("Not playable: {0}")]
    Unplayable(String),

    /// No format matched the requested kind/quality
    #[error("No suitable format: {0}")]
    NoFormat(String),

    /// HTTP request failed or returned a non-success status
    #[error("HTTP error: {0}")]
    Http(String),

    /// Subprocess exited unsuccessfully
    #[error("Execution error: {0}")]
    ExecutionError(String),

    /// Stream ended before producing a single byte
    #[error("Stream ended before any data was produced")]
    EmptyStream,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Anything else
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl BackendError {
    /// Build an error from a failed subprocess, classifying its stderr
    pub fn from_exit(code: Option<i32>, stderr: &str) -> Self {
        let tail = stderr_tail(stderr);
        match Self::from(tail.clone()) {
            Self::Unknown(_) => Self::ExecutionError(format!("exit code {:?}: {}", code, tail)),
            classified => classified,
        }
    }

    /// Blocking reason suggested by the error text, for logging
    pub fn blocking_reason(&self) -> Option<BlockingReason> {
        match self {
            Self::ToolNotFound(_) | Self::ParseError(_) | Self::EmptyStream => None,
            other => diagnose_error(&other.to_string()),
        }
    }
}

// Smart detection of error types from free-form extractor output
impl From<String> for BackendError {
    fn from(s: String) -> Self {
        let lower = s.to_lowercase();

        // IP blocking shows up as a timeout against youtube.com
        if (lower.contains("timeout") || lower.contains("timed out")) && lower.contains("youtube.com") {
            return Self::Blocked(s);
        }

        if lower.contains("timeout") || lower.contains("timed out") {
            return Self::NetworkTimeout(s);
        }

        if matches!(
            diagnose_error(&s),
            Some(
                BlockingReason::RateLimited
                    | BlockingReason::BotDetection
                    | BlockingReason::Http403Forbidden
            )
        ) {
            return Self::Blocked(s);
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return Self::ToolNotFound(s);
        }

        if lower.contains("json") || lower.contains("parse") {
            return Self::ParseError(s);
        }

        Self::Unknown(s)
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::NetworkTimeout(e.to_string())
        } else if let Some(status) = e.status() {
            Self::from(format!("HTTP status {}: {}", status, e))
        } else {
            Self::Http(e.to_string())
        }
    }
}

/// Last few meaningful stderr lines; yt-dlp prints a lot of noise before the error
fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let start = lines.len().saturating_sub(3);
    lines[start..].join(" | ")
}

/// One failed backend attempt, kept for the final error report
#[derive(Debug)]
pub struct BackendFailure {
    pub backend: &'static str,
    pub error: BackendError,
}

/// Orchestrator-level failures. Only these cross the HTTP boundary.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Missing or malformed URL; no backend is attempted
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Every backend was tried and none produced a usable result
    #[error("All backends failed: {}", summarize(.0))]
    AllBackendsFailed(Vec<BackendFailure>),

    /// The downloads directory is not writable, even after fallback
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Writing a permanent download failed; the partial file was removed
    #[error("Failed to save download: {0}")]
    SaveFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

fn summarize(failures: &[BackendFailure]) -> String {
    if failures.is_empty() {
        return "no backends configured".to_string();
    }
    failures
        .iter()
        .map(|f| format!("{}: {}", f.backend, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_against_youtube_is_blocking() {
        let err = BackendError::from("Read timed out while fetching https://www.youtube.com/watch".to_string());
        assert!(matches!(err, BackendError::Blocked(_)));
    }

    #[test]
    fn test_plain_timeout() {
        let err = BackendError::from("Timed out after 30s".to_string());
        assert!(matches!(err, BackendError::NetworkTimeout(_)));
    }

    #[test]
    fn test_forbidden_is_blocking() {
        let err = BackendError::from("ERROR: unable to download video data: HTTP Error 403: Forbidden".to_string());
        assert!(matches!(err, BackendError::Blocked(_)));
        assert_eq!(err.blocking_reason(), Some(BlockingReason::Http403Forbidden));
    }

    #[test]
    fn test_exit_keeps_stderr_tail() {
        let stderr = "[youtube] abc: Downloading webpage\n\nERROR: something odd happened\n";
        let err = BackendError::from_exit(Some(1), stderr);
        match err {
            BackendError::ExecutionError(msg) => {
                assert!(msg.contains("Some(1)"));
                assert!(msg.contains("ERROR: something odd happened"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_all_backends_failed_lists_each_attempt() {
        let err = FetchError::AllBackendsFailed(vec![
            BackendFailure {
                backend: "yt-dlp-pipe",
                error: BackendError::ToolNotFound("yt-dlp".to_string()),
            },
            BackendFailure {
                backend: "innertube",
                error: BackendError::EmptyStream,
            },
        ]);
        let text = err.to_string();
        assert!(text.contains("yt-dlp-pipe: Tool not available"));
        assert!(text.contains("innertube: Stream ended"));
    }
}
