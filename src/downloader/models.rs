// Common data models for the fetch orchestrator

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::errors::FetchError;
use super::traits::ByteStream;
use super::utils::extract_video_id;

pub const UNKNOWN_TITLE: &str = "Unknown title";

/// What the caller wants out of a URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Metadata,
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested quality: a sentinel or a backend-specific format identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Quality {
    Highest,
    Lowest,
    /// yt-dlp format id, itag, or a height label such as "720p"
    Format(String),
}

impl Quality {
    /// Accepts the JSON shapes clients send: a string or a number.
    /// Empty strings and nulls mean "no preference".
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Self::parse(s),
            serde_json::Value::Number(n) => Some(Self::Format(n.to_string())),
            _ => None,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        match trimmed.to_lowercase().as_str() {
            "" => None,
            "highest" | "best" => Some(Self::Highest),
            "lowest" | "worst" => Some(Self::Lowest),
            _ => Some(Self::Format(trimmed.to_string())),
        }
    }
}

/// One inbound call. Construction validates the URL, so a MediaRequest
/// always carries a YouTube-shaped URL and its video id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRequest {
    pub url: String,
    pub video_id: String,
    pub kind: MediaKind,
    pub quality: Option<Quality>,
}

impl MediaRequest {
    pub fn new(url: &str, kind: MediaKind, quality: Option<Quality>) -> Result<Self, FetchError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(FetchError::InvalidInput("URL is required".to_string()));
        }
        let video_id = extract_video_id(url)
            .ok_or_else(|| FetchError::InvalidInput(format!("Not a YouTube video URL: {}", url)))?;

        Ok(Self {
            url: url.to_string(),
            video_id,
            kind,
            quality,
        })
    }
}

/// Format identifier as the backend reports it: yt-dlp uses strings, the
/// player API uses numeric itags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FormatId {
    Itag(u64),
    Text(String),
}

impl fmt::Display for FormatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Itag(n) => write!(f, "{}", n),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Normalized shape every backend's native format is mapped into
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatDescriptor {
    pub quality_label: Option<String>,
    pub container: Option<String>,
    pub has_audio: bool,
    pub has_video: bool,
    pub format_id: Option<FormatId>,
}

/// Video metadata returned by the info endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMetadata {
    pub title: String,
    pub author: Option<String>,
    pub duration_seconds: Option<u64>,
    pub view_count: Option<u64>,
    pub thumbnail_url: Option<String>,
    pub description: Option<String>,
    pub upload_date: Option<String>,
    pub formats: Vec<FormatDescriptor>,
}

/// What a single metadata backend managed to find. Everything is optional;
/// the orchestrator merges partial results in backend priority order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub duration_seconds: Option<u64>,
    pub view_count: Option<u64>,
    pub thumbnail_url: Option<String>,
    pub description: Option<String>,
    pub upload_date: Option<String>,
    pub formats: Vec<FormatDescriptor>,
}

impl PartialMetadata {
    /// Fill fields still missing here from a later backend's result.
    /// Format lists are never concatenated: a later list only replaces an
    /// empty one.
    pub fn merge(&mut self, later: PartialMetadata) {
        fill(&mut self.title, later.title);
        fill(&mut self.author, later.author);
        fill(&mut self.duration_seconds, later.duration_seconds);
        fill(&mut self.view_count, later.view_count);
        fill(&mut self.thumbnail_url, later.thumbnail_url);
        fill(&mut self.description, later.description);
        fill(&mut self.upload_date, later.upload_date);
        if self.formats.is_empty() {
            self.formats = later.formats;
        }
    }

    pub fn has_formats(&self) -> bool {
        !self.formats.is_empty()
    }

    pub fn into_metadata(self) -> MediaMetadata {
        MediaMetadata {
            title: self.title.unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
            author: self.author,
            duration_seconds: self.duration_seconds,
            view_count: self.view_count,
            thumbnail_url: self.thumbnail_url,
            description: self.description,
            upload_date: self.upload_date,
            formats: self.formats,
        }
    }
}

fn fill<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

/// A committed media stream: the first bytes have already been received
/// from `backend`, so no other backend may be tried for this request.
pub struct StreamHandle {
    pub body: ByteStream,
    pub content_type: String,
    pub filename: String,
    pub content_length: Option<u64>,
    pub backend: &'static str,
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("content_type", &self.content_type)
            .field("filename", &self.filename)
            .field("content_length", &self.content_length)
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

/// A permanent download written into the managed directory
#[derive(Debug, Clone, Serialize)]
pub struct SavedDownload {
    pub filename: String,
    pub path: PathBuf,
    pub bytes: u64,
}
