// Helper functions shared by the orchestrator and backend implementations

use std::collections::VecDeque;
use std::io;
use std::process::Stdio;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command as TokioCommand;
use tokio::time::{timeout, Duration};

use super::errors::BackendError;
use super::models::MediaKind;

lazy_static::lazy_static! {
    // watch?v=ID (v may appear after other query params), shorts/ID, youtu.be/ID
    static ref YOUTUBE_URL_RE: Regex = Regex::new(
        r"^(?:https?://)?(?:(?:www|m|music)\.)?(?:youtube\.com/(?:watch\?(?:[^#\s]*&)?v=|shorts/)|youtu\.be/)([A-Za-z0-9_-]+)(?:$|[?&#/])"
    ).unwrap();
}

const MAX_TITLE_CHARS: usize = 80;

/// Stderr kept from a subprocess; only its last lines end up in errors
pub const STDERR_TAIL_BYTES: usize = 16 * 1024;

/// Return the video id if `url` is a YouTube watch, shorts or short-link URL
pub fn extract_video_id(url: &str) -> Option<String> {
    YOUTUBE_URL_RE
        .captures(url.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Strip path-hostile characters from a human-readable title.
/// Returns None when nothing usable is left.
pub fn sanitize_title(title: &str) -> Option<String> {
    let cleaned: String = title
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let truncated: String = collapsed.chars().take(MAX_TITLE_CHARS).collect();
    let trimmed = truncated.trim_matches(|c: char| c == '.' || c.is_whitespace());

    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// `<title>-<millis>.<ext>`, or `<video|audio>-<millis>.<ext>` when the title is unknown
pub fn build_filename(title: Option<&str>, kind: MediaKind, extension: &str, millis: u128) -> String {
    let ext = extension.trim_start_matches('.');
    match title.and_then(sanitize_title) {
        Some(name) => format!("{}-{}.{}", name, millis, ext),
        None => format!("{}-{}.{}", kind.as_str(), millis, ext),
    }
}

/// Content-Disposition value with an ASCII fallback and an RFC 5987 UTF-8 name
pub fn content_disposition(filename: &str) -> String {
    let ascii: String = filename
        .chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' { c } else { '_' })
        .collect();

    let mut encoded = String::with_capacity(filename.len() * 3);
    for byte in filename.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }

    format!("attachment; filename=\"{}\"; filename*=UTF-8''{}", ascii, encoded)
}

/// Run command with timeout (shared utility)
pub async fn run_output_with_timeout(
    program: &str,
    args: Vec<String>,
    timeout_secs: u64,
) -> Result<std::process::Output, BackendError> {
    let mut child = TokioCommand::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BackendError::ToolNotFound(format!("Failed to start {}: {}", program, e)))?;

    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| BackendError::ExecutionError(format!("Failed to capture stdout from {}", program)))?;
    let stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| BackendError::ExecutionError(format!("Failed to capture stderr from {}", program)))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout_pipe.read_to_end(&mut buf).await.map(|_| buf)
    });
    let stderr_task = tokio::spawn(read_tail(stderr_pipe, STDERR_TAIL_BYTES));

    let waited = timeout(Duration::from_secs(timeout_secs), child.wait()).await;
    match waited {
        Ok(status_res) => {
            let status = status_res?;
            let stdout = stdout_task
                .await
                .map_err(|e| BackendError::ExecutionError(format!("stdout task failed: {}", e)))??;
            let stderr = stderr_task
                .await
                .map_err(|e| BackendError::ExecutionError(format!("stderr task failed: {}", e)))??;
            Ok(std::process::Output { status, stdout, stderr })
        }
        Err(_) => {
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            Err(BackendError::NetworkTimeout(format!(
                "{} timed out after {}s",
                program, timeout_secs
            )))
        }
    }
}

/// Drain `reader` to the end, keeping only its last `limit` bytes
pub async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> io::Result<Vec<u8>> {
    let mut tail = VecDeque::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(tail.into());
        }
        tail.extend(&buf[..n]);
        let excess = tail.len().saturating_sub(limit);
        tail.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_youtube_url_variants() {
        let cases = [
            ("https://www.youtube.com/watch?v=abc123XYZ", "abc123XYZ"),
            ("http://youtube.com/watch?v=dQw4w9WgXcQ&t=42", "dQw4w9WgXcQ"),
            ("youtube.com/watch?feature=share&v=dQw4w9WgXcQ", "dQw4w9WgXcQ"),
            ("https://m.youtube.com/watch?v=dQw4w9WgXcQ", "dQw4w9WgXcQ"),
            ("https://youtube.com/shorts/abc123XYZ", "abc123XYZ"),
            ("https://www.youtube.com/shorts/abc123XYZ?feature=share", "abc123XYZ"),
            ("https://youtu.be/dQw4w9WgXcQ", "dQw4w9WgXcQ"),
        ];
        for (url, id) in cases {
            assert_eq!(extract_video_id(url).as_deref(), Some(id), "{}", url);
        }
    }

    #[test]
    fn test_rejects_non_video_urls() {
        for url in [
            "",
            "not a url",
            "https://www.youtube.com/",
            "https://www.youtube.com/channel/UC123",
            "https://example.com/watch?v=abc123XYZ",
            "https://youtube.com.evil.io/watch?v=abc",
            "ftp://youtube.com/watch?v=abc",
        ] {
            assert_eq!(extract_video_id(url), None, "{}", url);
        }
    }

    #[test]
    fn test_sanitize_title_strips_hostile_characters() {
        assert_eq!(
            sanitize_title("AC/DC: Live  at \"Donington\"?").as_deref(),
            Some("ACDC Live at Donington")
        );
        assert_eq!(sanitize_title("../.."), None);
        assert_eq!(sanitize_title("  \t "), None);
    }

    #[test]
    fn test_sanitize_title_truncates() {
        let long = "x".repeat(500);
        assert_eq!(sanitize_title(&long).unwrap().chars().count(), MAX_TITLE_CHARS);
    }

    #[test]
    fn test_build_filename() {
        assert_eq!(
            build_filename(Some("My Song"), MediaKind::Audio, "mp3", 1700000000000),
            "My Song-1700000000000.mp3"
        );
        assert_eq!(
            build_filename(None, MediaKind::Video, ".mp4", 42),
            "video-42.mp4"
        );
        assert_eq!(
            build_filename(Some("???"), MediaKind::Audio, "m4a", 42),
            "audio-42.m4a"
        );
    }

    #[test]
    fn test_content_disposition_has_ascii_and_utf8_names() {
        let value = content_disposition("Café Живой-1.mp4");
        assert!(value.starts_with("attachment; filename=\"Caf_ _____-1.mp4\""));
        assert!(value.contains("filename*=UTF-8''Caf%C3%A9%20"));
        assert!(value.is_ascii());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_output_with_timeout_captures_output() {
        let out = run_output_with_timeout(
            "sh",
            vec!["-c".to_string(), "printf hello; printf oops >&2; exit 3".to_string()],
            5,
        )
        .await
        .unwrap();
        assert_eq!(out.stdout, b"hello");
        assert_eq!(out.stderr, b"oops");
        assert_eq!(out.status.code(), Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_output_with_timeout_kills_slow_process() {
        let err = run_output_with_timeout("sh", vec!["-c".to_string(), "sleep 5".to_string()], 1)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NetworkTimeout(_)));
    }

    #[tokio::test]
    async fn test_missing_program_is_tool_not_found() {
        let err = run_output_with_timeout("definitely-not-a-real-binary-xyz", vec![], 1)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn test_read_tail_keeps_only_the_end() {
        let mut noisy = "[download]  1.0% of 10MiB\n".repeat(2000).into_bytes();
        noisy.extend_from_slice(b"ERROR: HTTP Error 403: Forbidden\n");

        let tail = read_tail(noisy.as_slice(), 64).await.unwrap();
        assert_eq!(tail.len(), 64);
        assert!(String::from_utf8_lossy(&tail).ends_with("ERROR: HTTP Error 403: Forbidden\n"));

        let short = read_tail(&b"short"[..], 64).await.unwrap();
        assert_eq!(short, b"short");
    }
}
