// Backend strategy traits

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use super::errors::BackendError;
use super::models::{MediaRequest, PartialMetadata};

/// Media bytes in flight. Dropping the stream releases whatever produces it
/// (subprocess, HTTP connection, transient file).
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// What a stream backend hands back: an open, not yet committed byte source
pub struct MediaSource {
    pub body: ByteStream,
    pub content_type: String,
    /// File extension without the dot
    pub extension: String,
    pub content_length: Option<u64>,
    /// Title, if the backend learned it while opening the stream
    pub title: Option<String>,
}

/// A strategy that turns a URL into (possibly partial) metadata
#[async_trait]
pub trait MetadataBackend: Send + Sync {
    /// Name of the backend (for logging)
    fn name(&self) -> &'static str;

    async fn fetch_metadata(&self, request: &MediaRequest) -> Result<PartialMetadata, BackendError>;
}

/// A strategy that turns a URL into a readable media stream
#[async_trait]
pub trait StreamBackend: Send + Sync {
    /// Name of the backend (for logging)
    fn name(&self) -> &'static str;

    /// Open a stream for `request.kind` (video or audio). Returning Ok does
    /// not commit the response: the orchestrator waits for the first bytes.
    async fn open_stream(&self, request: &MediaRequest) -> Result<MediaSource, BackendError>;
}
