// Watch page backend: metadata scraped from the player response embedded
// in the HTML of youtube.com/watch. Never streams.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{ACCEPT_LANGUAGE, COOKIE, USER_AGENT};

use super::player::PlayerResponse;
use crate::downloader::errors::BackendError;
use crate::downloader::models::{MediaRequest, PartialMetadata};
use crate::downloader::traits::MetadataBackend;

const DESKTOP_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

lazy_static::lazy_static! {
    // `var ytInitialPlayerResponse = {` or `window["ytInitialPlayerResponse"] = {`
    static ref PLAYER_RESPONSE_RE: Regex =
        Regex::new(r#"ytInitialPlayerResponse"?\]?\s*=\s*"#).unwrap();
}

pub struct WatchPageBackend {
    client: reqwest::Client,
    timeout: Duration,
}

impl WatchPageBackend {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

/// Deserialize exactly one JSON value starting right after the assignment.
/// Whatever script follows the object is left unread.
pub fn extract_player_response(html: &str) -> Result<PlayerResponse, BackendError> {
    let marker = PLAYER_RESPONSE_RE
        .find(html)
        .ok_or_else(|| BackendError::ParseError("ytInitialPlayerResponse not found in watch page".to_string()))?;

    let rest = &html[marker.end()..];
    let mut values = serde_json::Deserializer::from_str(rest).into_iter::<PlayerResponse>();
    match values.next() {
        Some(Ok(player)) => Ok(player),
        Some(Err(e)) => Err(BackendError::ParseError(format!("embedded player response: {}", e))),
        None => Err(BackendError::ParseError("embedded player response is empty".to_string())),
    }
}

#[async_trait]
impl MetadataBackend for WatchPageBackend {
    fn name(&self) -> &'static str {
        "watch-page"
    }

    async fn fetch_metadata(&self, request: &MediaRequest) -> Result<PartialMetadata, BackendError> {
        let url = format!("https://www.youtube.com/watch?v={}&hl=en", request.video_id);
        let html = self
            .client
            .get(&url)
            .header(USER_AGENT, DESKTOP_USER_AGENT)
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            // Skip the EU consent interstitial
            .header(COOKIE, "CONSENT=YES+1")
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let player = extract_player_response(&html)?;
        if player.video_details.is_none() {
            player.ensure_playable()?;
        }
        Ok(player.to_partial())
    }
}

#[cfg(test)]
mod tests {
    use super::super::player::fixtures::PLAYER_JSON;
    use super::*;

    #[test]
    fn test_extracts_embedded_player_response() {
        let html = format!(
            "<html><script>var ytInitialPlayerResponse = {};var meta = document.createElement('meta');</script></html>",
            PLAYER_JSON
        );
        let player = extract_player_response(&html).unwrap();
        let meta = player.to_partial();
        assert_eq!(meta.title.as_deref(), Some("Test Video"));
        assert_eq!(meta.formats.len(), 4);
    }

    #[test]
    fn test_window_assignment_form() {
        let html = r#"<script>window["ytInitialPlayerResponse"] = {"videoDetails": {"title": "Windowed"}};</script>"#;
        let player = extract_player_response(html).unwrap();
        assert_eq!(player.title().as_deref(), Some("Windowed"));
    }

    #[test]
    fn test_missing_marker_is_parse_error() {
        let err = extract_player_response("<html><body>consent required</body></html>").unwrap_err();
        assert!(matches!(err, BackendError::ParseError(_)));
    }

    #[test]
    fn test_truncated_json_is_parse_error() {
        let err = extract_player_response("var ytInitialPlayerResponse = {\"videoDetails\": {").unwrap_err();
        assert!(matches!(err, BackendError::ParseError(_)));
    }
}
