// YouTube player response model, shared by the player API and watch page backends

use serde::Deserialize;

use crate::downloader::errors::BackendError;
use crate::downloader::models::{FormatDescriptor, FormatId, PartialMetadata};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerResponse {
    pub playability_status: Option<PlayabilityStatus>,
    pub video_details: Option<VideoDetails>,
    pub streaming_data: Option<StreamingData>,
    pub microformat: Option<Microformat>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayabilityStatus {
    pub status: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoDetails {
    pub video_id: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub length_seconds: Option<String>,
    pub view_count: Option<String>,
    pub short_description: Option<String>,
    pub thumbnail: Option<Thumbnails>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Thumbnails {
    #[serde(default)]
    pub thumbnails: Vec<Thumbnail>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Thumbnail {
    pub url: String,
    pub width: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingData {
    /// Progressive formats (audio and video muxed)
    #[serde(default)]
    pub formats: Vec<RawFormat>,
    /// DASH formats (audio-only or video-only)
    #[serde(default)]
    pub adaptive_formats: Vec<RawFormat>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFormat {
    pub itag: u64,
    /// Direct URL; absent when the format is signature-ciphered
    pub url: Option<String>,
    pub mime_type: String,
    pub quality_label: Option<String>,
    pub bitrate: Option<u64>,
    pub height: Option<u32>,
    pub content_length: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Microformat {
    pub player_microformat_renderer: Option<MicroformatRenderer>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicroformatRenderer {
    pub upload_date: Option<String>,
    pub publish_date: Option<String>,
}

impl RawFormat {
    /// `video/mp4; codecs="avc1.42001E, mp4a.40.2"` -> ("video", "mp4")
    fn mime_parts(&self) -> (&str, &str) {
        let essence = self.mime_type.split(';').next().unwrap_or("").trim();
        let mut parts = essence.splitn(2, '/');
        (parts.next().unwrap_or(""), parts.next().unwrap_or(""))
    }

    pub fn mime_essence(&self) -> &str {
        self.mime_type.split(';').next().unwrap_or("").trim()
    }

    fn codec_count(&self) -> usize {
        self.mime_type
            .split("codecs=")
            .nth(1)
            .map(|c| c.trim_matches('"').split(',').filter(|s| !s.trim().is_empty()).count())
            .unwrap_or(0)
    }

    pub fn has_video(&self) -> bool {
        self.mime_parts().0 == "video"
    }

    pub fn has_audio(&self) -> bool {
        match self.mime_parts().0 {
            "audio" => true,
            // Progressive video carries both codecs in the mime type
            "video" => self.codec_count() > 1,
            _ => false,
        }
    }

    /// File extension for a download of this format
    pub fn extension(&self) -> &'static str {
        match self.mime_parts() {
            ("audio", "mp4") => "m4a",
            ("audio", "webm") => "webm",
            ("video", "webm") => "webm",
            ("video", "3gpp") => "3gp",
            _ => "mp4",
        }
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length.as_deref().and_then(|s| s.parse().ok())
    }

    pub fn describe(&self) -> FormatDescriptor {
        let (_, subtype) = self.mime_parts();
        FormatDescriptor {
            quality_label: self.quality_label.clone(),
            container: (!subtype.is_empty()).then(|| subtype.to_string()),
            has_audio: self.has_audio(),
            has_video: self.has_video(),
            format_id: Some(FormatId::Itag(self.itag)),
        }
    }
}

impl PlayerResponse {
    /// Fail unless YouTube says the video is playable
    pub fn ensure_playable(&self) -> Result<(), BackendError> {
        match &self.playability_status {
            Some(status) if status.status != "OK" => Err(BackendError::Unplayable(format!(
                "{}: {}",
                status.status,
                status.reason.as_deref().unwrap_or("no reason given")
            ))),
            _ => Ok(()),
        }
    }

    pub fn title(&self) -> Option<String> {
        self.video_details.as_ref().and_then(|d| d.title.clone())
    }

    /// Progressive first, then adaptive
    pub fn all_formats(&self) -> impl Iterator<Item = &RawFormat> {
        self.streaming_data
            .iter()
            .flat_map(|s| s.formats.iter().chain(s.adaptive_formats.iter()))
    }

    pub fn to_partial(&self) -> PartialMetadata {
        let details = self.video_details.clone().unwrap_or_default();
        let renderer = self
            .microformat
            .as_ref()
            .and_then(|m| m.player_microformat_renderer.clone())
            .unwrap_or_default();

        PartialMetadata {
            title: details.title.filter(|t| !t.is_empty()),
            author: details.author,
            duration_seconds: details.length_seconds.and_then(|s| s.parse().ok()),
            view_count: details.view_count.and_then(|s| s.parse().ok()),
            thumbnail_url: details
                .thumbnail
                .and_then(|t| t.thumbnails.into_iter().max_by_key(|th| th.width.unwrap_or(0)))
                .map(|th| th.url),
            description: details.short_description,
            upload_date: renderer.upload_date.or(renderer.publish_date),
            formats: self.all_formats().map(RawFormat::describe).collect(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::PLAYER_JSON;
    use super::*;

    #[test]
    fn test_maps_player_response_to_metadata() {
        let player: PlayerResponse = serde_json::from_str(PLAYER_JSON).unwrap();
        player.ensure_playable().unwrap();

        let meta = player.to_partial();
        assert_eq!(meta.title.as_deref(), Some("Test Video"));
        assert_eq!(meta.author.as_deref(), Some("Test Channel"));
        assert_eq!(meta.duration_seconds, Some(212));
        assert_eq!(meta.view_count, Some(1_234_567));
        assert_eq!(meta.thumbnail_url.as_deref(), Some("https://i.ytimg.com/large.jpg"));
        assert_eq!(meta.upload_date.as_deref(), Some("2009-10-25"));
        assert_eq!(meta.formats.len(), 4);
    }

    #[test]
    fn test_format_descriptors() {
        let player: PlayerResponse = serde_json::from_str(PLAYER_JSON).unwrap();
        let formats = player.to_partial().formats;

        let progressive = &formats[0];
        assert!(progressive.has_audio && progressive.has_video);
        assert_eq!(progressive.container.as_deref(), Some("mp4"));
        assert_eq!(progressive.quality_label.as_deref(), Some("360p"));
        assert_eq!(progressive.format_id, Some(FormatId::Itag(18)));

        let video_only = &formats[1];
        assert!(video_only.has_video && !video_only.has_audio);

        let audio_only = &formats[2];
        assert!(audio_only.has_audio && !audio_only.has_video);
    }

    #[test]
    fn test_unplayable_status_is_an_error() {
        let player: PlayerResponse = serde_json::from_str(
            r#"{"playabilityStatus": {"status": "LOGIN_REQUIRED", "reason": "Sign in to confirm your age"}}"#,
        )
        .unwrap();
        let err = player.ensure_playable().unwrap_err();
        assert!(matches!(err, BackendError::Unplayable(_)));
        assert!(player.to_partial().formats.is_empty());
    }

    #[test]
    fn test_extensions() {
        let player: PlayerResponse = serde_json::from_str(PLAYER_JSON).unwrap();
        let exts: Vec<&str> = player.all_formats().map(|f| f.extension()).collect();
        assert_eq!(exts, vec!["mp4", "mp4", "m4a", "webm"]);
    }
}
