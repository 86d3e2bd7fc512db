//! YouTube Data API v3 adapter
//!
//! Two calls per poll:
//! 1. `search` for live videos in the Gaming category (20), most viewed
//!    first, paged until `max_results` ids
//! 2. `videos` with `snippet,liveStreamingDetails` for those ids, 50 per call
//!
//! YouTube has no game field, so games come from the channel mapping or from
//! title and tag keywords.

use super::error::{retry_after_from_headers, AdapterError};
use super::{FetchBatch, PlatformAdapter, RawStreamInfo};
use crate::config::YouTubeConfig;
use crate::identity::IdentityMap;
use crate::types::{current_timestamp, Platform};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const GAMING_CATEGORY_ID: &str = "20";
/// API maximum for both `search.maxResults` and `videos.id`
const MAX_PAGE_SIZE: u32 = 50;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: SearchItemId,
}

#[derive(Debug, Deserialize)]
struct SearchItemId {
    #[serde(rename = "videoId")]
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideosResponse {
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Video {
    id: String,
    snippet: VideoSnippet,
    #[serde(rename = "liveStreamingDetails")]
    live_streaming_details: Option<LiveStreamingDetails>,
}

#[derive(Debug, Deserialize)]
struct VideoSnippet {
    #[serde(rename = "channelId")]
    channel_id: String,
    #[serde(rename = "channelTitle", default)]
    channel_title: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(rename = "defaultAudioLanguage")]
    default_audio_language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LiveStreamingDetails {
    #[serde(rename = "concurrentViewers")]
    concurrent_viewers: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    reason: String,
}

/// Video ids and the next page token of one search page
pub fn parse_search_page(body: &str) -> Result<(Vec<String>, Option<String>), AdapterError> {
    let page: SearchResponse = serde_json::from_str(body)?;
    let ids = page
        .items
        .into_iter()
        .filter_map(|item| item.id.video_id)
        .filter(|id| !id.is_empty())
        .collect();
    Ok((ids, page.next_page_token.filter(|t| !t.is_empty())))
}

/// Decode a `videos` response into stream records and a malformed count.
///
/// A video without a numeric `concurrentViewers` is malformed: it either
/// ended between the two calls or the count is hidden.
pub fn parse_videos(body: &str, identity: &IdentityMap) -> Result<(Vec<RawStreamInfo>, usize), AdapterError> {
    let response: VideosResponse = serde_json::from_str(body)?;
    let mut streams = Vec::with_capacity(response.items.len());
    let mut malformed = 0;

    for value in response.items {
        let video: Video = match serde_json::from_value(value) {
            Ok(video) => video,
            Err(e) => {
                log::warn!("⚠️  Dropping malformed YouTube video record: {}", e);
                malformed += 1;
                continue;
            }
        };

        let viewers = video
            .live_streaming_details
            .as_ref()
            .and_then(|d| d.concurrent_viewers.as_deref())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let Some(viewer_count) = viewers else {
            log::warn!("⚠️  Dropping YouTube video {} without a viewer count", video.id);
            malformed += 1;
            continue;
        };

        let snippet = video.snippet;
        let game = identity.game_from_broadcast(&snippet.channel_id, &snippet.title, &snippet.tags);
        let organizer = identity.organizer_from(
            &[snippet.channel_id.as_str(), snippet.channel_title.as_str()],
            &snippet.channel_title,
        );

        streams.push(RawStreamInfo {
            platform: Platform::YouTube,
            stream_id: video.id,
            channel_id: snippet.channel_id,
            channel_name: snippet.channel_title,
            title: snippet.title,
            game,
            organizer,
            viewer_count,
            language: snippet.default_audio_language,
            observed_at: None,
        });
    }

    Ok((streams, malformed))
}

/// Map an error response to the adapter taxonomy using the API's reason codes
pub fn classify_error(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    quota_backoff: Duration,
    now: i64,
) -> AdapterError {
    let (reasons, message) = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => (
            envelope
                .error
                .errors
                .into_iter()
                .map(|d| d.reason)
                .collect::<Vec<_>>(),
            envelope.error.message,
        ),
        Err(_) => (Vec::new(), body.chars().take(200).collect()),
    };
    let has_reason = |wanted: &[&str]| reasons.iter().any(|r| wanted.contains(&r.as_str()));

    if has_reason(&[
        "quotaExceeded",
        "rateLimitExceeded",
        "dailyLimitExceeded",
        "userRateLimitExceeded",
    ]) || status == StatusCode::TOO_MANY_REQUESTS
    {
        let retry_after = retry_after_from_headers(headers, now).unwrap_or(quota_backoff);
        return AdapterError::RateLimited { retry_after };
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            AdapterError::Auth(format!("{}: {}", status, message))
        }
        StatusCode::BAD_REQUEST if has_reason(&["keyInvalid", "badRequest"]) => {
            AdapterError::Auth(format!("{}: {}", status, message))
        }
        s if s.is_server_error() => AdapterError::Transient(format!("{}: {}", status, message)),
        _ => AdapterError::MalformedResponse(format!("unexpected status {}: {}", status, message)),
    }
}

pub struct YouTubeAdapter {
    config: YouTubeConfig,
    identity: Arc<IdentityMap>,
    client: reqwest::Client,
}

impl YouTubeAdapter {
    pub fn new(config: YouTubeConfig, identity: Arc<IdentityMap>) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("esportstracker/", env!("CARGO_PKG_VERSION")))
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| AdapterError::Transient(format!("YouTube HTTP client: {}", e)))?;

        Ok(Self {
            config,
            identity,
            client,
        })
    }

    async fn get(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<String, AdapterError> {
        let url = format!("{}/{}", self.config.api_url.trim_end_matches('/'), endpoint);
        let response = self
            .client
            .get(&url)
            .query(query)
            .query(&[("key", self.config.api_key.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error(
                status,
                &headers,
                &body,
                self.config.quota_backoff,
                current_timestamp(),
            ));
        }
        Ok(response.text().await?)
    }

    async fn search_live_video_ids(&self) -> Result<Vec<String>, AdapterError> {
        let wanted = self.config.max_results as usize;
        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        let mut page_token: Option<String> = None;

        while ids.len() < wanted {
            let page_size = (wanted - ids.len()).min(MAX_PAGE_SIZE as usize).to_string();
            let mut query = vec![
                ("part", "id"),
                ("eventType", "live"),
                ("type", "video"),
                ("videoCategoryId", GAMING_CATEGORY_ID),
                ("order", "viewCount"),
                ("maxResults", page_size.as_str()),
            ];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }

            let body = self.get("search", &query).await?;
            let (page_ids, next) = parse_search_page(&body)?;
            let before = ids.len();
            for id in page_ids {
                if ids.len() < wanted && seen.insert(id.clone()) {
                    ids.push(id);
                }
            }

            // Every search page costs quota; stop once paging stops making progress
            if ids.len() == before {
                log::debug!("YouTube search page added no new ids; stopping");
                break;
            }
            match next {
                Some(token) if page_token.as_deref() != Some(token.as_str()) => page_token = Some(token),
                _ => break,
            }
        }

        Ok(ids)
    }
}

#[async_trait]
impl PlatformAdapter for YouTubeAdapter {
    fn platform(&self) -> Platform {
        Platform::YouTube
    }

    async fn fetch_live_streams(&self) -> Result<FetchBatch, AdapterError> {
        let polled_at = current_timestamp();
        let ids = self.search_live_video_ids().await?;
        let mut batch = FetchBatch {
            platform: Platform::YouTube,
            streams: Vec::with_capacity(ids.len()),
            malformed: 0,
            polled_at,
        };

        for chunk in ids.chunks(MAX_PAGE_SIZE as usize) {
            let id_list = chunk.join(",");
            let body = self
                .get(
                    "videos",
                    &[("part", "snippet,liveStreamingDetails"), ("id", id_list.as_str())],
                )
                .await?;
            let (streams, malformed) = parse_videos(&body, &self.identity)?;
            batch.streams.extend(streams);
            batch.malformed += malformed;
        }

        log::debug!(
            "📺 YouTube: {} live videos, {} malformed",
            batch.streams.len(),
            batch.malformed
        );
        Ok(batch)
    }
}
