// FormatSelector - maps requested quality onto backend format choices
//
// yt-dlp receives a format expression; the player API backend ranks its own
// formats with the same quality semantics:
// - highest / lowest sentinels
// - height labels ("1080p", "720p", ...) capped with a fallback to best
// - anything else is a backend format id (yt-dlp id or itag)

use super::models::{MediaKind, Quality};

/// Where yt-dlp output goes; affects which formats can be merged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputTarget {
    /// Written to stdout, cannot be seeked
    Pipe,
    /// Written to a file on disk
    File,
}

pub struct FormatSelector;

impl FormatSelector {
    /// Parse "720p"-style labels into a height cap
    pub fn height_label(value: &str) -> Option<u32> {
        let digits = value.trim().strip_suffix('p').or_else(|| value.trim().strip_suffix('P'))?;
        let height: u32 = digits.parse().ok()?;
        (height >= 100).then_some(height)
    }

    /// yt-dlp `-f` expression for a request
    pub fn ytdlp_spec(kind: MediaKind, quality: Option<&Quality>, target: OutputTarget) -> String {
        match kind {
            MediaKind::Audio => Self::audio_spec(quality, target),
            _ => Self::video_spec(quality),
        }
    }

    fn video_spec(quality: Option<&Quality>) -> String {
        match quality {
            None | Some(Quality::Highest) => "bv*+ba/b".to_string(),
            Some(Quality::Lowest) => "wv*+wa/w".to_string(),
            Some(Quality::Format(value)) => match Self::height_label(value) {
                Some(h) => format!("bv*[height<={h}]+ba/b[height<={h}]/bv*+ba/b"),
                None => format!("{value}+ba/{value}/bv*+ba/b"),
            },
        }
    }

    fn audio_spec(quality: Option<&Quality>, target: OutputTarget) -> String {
        match (quality, target) {
            // m4a is the one audio container that plays everywhere when piped raw
            (None | Some(Quality::Highest), OutputTarget::Pipe) => "ba[ext=m4a]/ba/b".to_string(),
            (None | Some(Quality::Highest), OutputTarget::File) => "ba/b".to_string(),
            (Some(Quality::Lowest), _) => "wa/w".to_string(),
            (Some(Quality::Format(value)), _) => format!("{value}/ba/b"),
        }
    }
}
