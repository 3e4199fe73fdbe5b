// Player API backend: asks YouTube's internal player endpoint for video
// details and streams a format that carries a direct URL.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::USER_AGENT;
use tracing::debug;

use super::player::{PlayerResponse, RawFormat};
use crate::downloader::errors::BackendError;
use crate::downloader::format_selector::FormatSelector;
use crate::downloader::models::{MediaKind, MediaRequest, PartialMetadata, Quality};
use crate::downloader::traits::{MediaSource, MetadataBackend, StreamBackend};

const PLAYER_ENDPOINT: &str = "https://www.youtube.com/youtubei/v1/player?prettyPrint=false";
const CLIENT_NAME: &str = "ANDROID";
const CLIENT_VERSION: &str = "19.44.38";
// The Android client gets unciphered format URLs
const ANDROID_USER_AGENT: &str = "com.google.android.youtube/19.44.38 (Linux; U; Android 11) gzip";

pub struct InnertubeBackend {
    client: reqwest::Client,
    timeout: Duration,
}

impl InnertubeBackend {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn player(&self, video_id: &str) -> Result<PlayerResponse, BackendError> {
        let response = self
            .client
            .post(PLAYER_ENDPOINT)
            .header(USER_AGENT, ANDROID_USER_AGENT)
            .timeout(self.timeout)
            .json(&player_request_body(video_id))
            .send()
            .await?
            .error_for_status()?;

        response
            .json::<PlayerResponse>()
            .await
            .map_err(|e| BackendError::ParseError(format!("player response: {}", e)))
    }
}

fn player_request_body(video_id: &str) -> serde_json::Value {
    serde_json::json!({
        "videoId": video_id,
        "context": {
            "client": {
                "clientName": CLIENT_NAME,
                "clientVersion": CLIENT_VERSION,
                "androidSdkVersion": 30,
                "hl": "en",
                "gl": "US"
            }
        },
        "contentCheckOk": true,
        "racyCheckOk": true
    })
}

/// Pick a directly downloadable format for the request.
///
/// Video requests only consider progressive formats (muxed audio and video);
/// audio requests only consider audio-only adaptive formats. Unknown itags
/// and unmatched height caps fall back to the best candidate.
pub fn pick_format<'a>(
    player: &'a PlayerResponse,
    kind: MediaKind,
    quality: Option<&Quality>,
) -> Option<&'a RawFormat> {
    let streaming = player.streaming_data.as_ref()?;
    let candidates: Vec<&RawFormat> = match kind {
        MediaKind::Audio => streaming
            .adaptive_formats
            .iter()
            .filter(|f| f.url.is_some() && f.has_audio() && !f.has_video())
            .collect(),
        _ => streaming
            .formats
            .iter()
            .filter(|f| f.url.is_some() && f.has_video() && f.has_audio())
            .collect(),
    };

    let rank = |f: &&RawFormat| (f.height.unwrap_or(0), f.bitrate.unwrap_or(0));
    let highest = || candidates.iter().copied().max_by_key(rank);

    match quality {
        None | Some(Quality::Highest) => highest(),
        Some(Quality::Lowest) => candidates.iter().copied().min_by_key(rank),
        Some(Quality::Format(value)) => {
            if let Ok(itag) = value.parse::<u64>() {
                candidates.iter().copied().find(|f| f.itag == itag).or_else(highest)
            } else if let Some(cap) = FormatSelector::height_label(value) {
                candidates
                    .iter()
                    .copied()
                    .filter(|f| f.height.is_some_and(|h| h <= cap))
                    .max_by_key(rank)
                    .or_else(highest)
            } else {
                highest()
            }
        }
    }
}

#[async_trait]
impl MetadataBackend for InnertubeBackend {
    fn name(&self) -> &'static str {
        "innertube"
    }

    async fn fetch_metadata(&self, request: &MediaRequest) -> Result<PartialMetadata, BackendError> {
        let player = self.player(&request.video_id).await?;
        if let Err(e) = player.ensure_playable() {
            // Details without formats are still worth merging
            if player.video_details.is_none() {
                return Err(e);
            }
            debug!(video_id = %request.video_id, error = %e, "player response is not playable");
        }
        Ok(player.to_partial())
    }
}

#[async_trait]
impl StreamBackend for InnertubeBackend {
    fn name(&self) -> &'static str {
        "innertube"
    }

    async fn open_stream(&self, request: &MediaRequest) -> Result<MediaSource, BackendError> {
        let player = self.player(&request.video_id).await?;
        player.ensure_playable()?;

        let format = pick_format(&player, request.kind, request.quality.as_ref()).ok_or_else(|| {
            BackendError::NoFormat(format!("no direct {} format for {}", request.kind, request.video_id))
        })?;
        let url = format
            .url
            .as_deref()
            .ok_or_else(|| BackendError::NoFormat(format!("itag {} has no direct URL", format.itag)))?;
        debug!(itag = format.itag, mime = %format.mime_type, "selected player format");

        let response = self
            .client
            .get(url)
            .header(USER_AGENT, ANDROID_USER_AGENT)
            .send()
            .await?
            .error_for_status()?;

        let content_length = response.content_length().or_else(|| format.content_length());
        let body = response.bytes_stream().map(|chunk| chunk.map_err(io::Error::other)).boxed();

        Ok(MediaSource {
            body,
            content_type: format.mime_essence().to_string(),
            extension: format.extension().to_string(),
            content_length,
            title: player.title(),
        })
    }
}
