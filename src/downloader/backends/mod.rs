// Extractor backends

pub mod innertube;
pub mod player;
pub mod watch_page;
pub mod ytdlp;

pub use innertube::InnertubeBackend;
pub use watch_page::WatchPageBackend;
pub use ytdlp::{YtDlp, YtDlpBackend, YtDlpFileBackend, YtDlpPipeBackend, YtDlpSettings};
