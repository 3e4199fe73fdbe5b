// Downloader module - backends, orchestration and storage

pub mod backends;
pub mod diagnostics;
pub mod errors;
pub mod format_selector;
pub mod models;
pub mod orchestrator;
pub mod storage;
pub mod tools;
pub mod traits;
pub mod utils;

pub use errors::{BackendError, BackendFailure, FetchError};
pub use models::{MediaKind, MediaMetadata, MediaRequest, Quality, SavedDownload, StreamHandle};
pub use orchestrator::Fetcher;
pub use storage::{SavedFile, StorageManager};
pub use tools::{ToolConfig, ToolManager};
pub use traits::{ByteStream, MediaSource, MetadataBackend, StreamBackend};
