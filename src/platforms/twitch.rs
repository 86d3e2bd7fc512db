//! Twitch Helix adapter
//!
//! - app access token via OAuth client credentials, cached until 60s
//!   before expiry
//! - `GET /helix/streams?first=100&after=<cursor>`, following the cursor up
//!   to `max_pages` pages
//!
//! Helix lists live streams by viewer count, descending, so paging stops at
//! the first page that reaches below `min_viewers`.

use super::error::{error_for_status, AdapterError};
use super::{FetchBatch, PlatformAdapter, RawStreamInfo};
use crate::config::TwitchConfig;
use crate::identity::IdentityMap;
use crate::types::{current_timestamp, Platform};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const PAGE_SIZE: &str = "100";
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    refresh_at: Instant,
}

#[derive(Debug, Deserialize)]
struct StreamsPage {
    #[serde(default)]
    data: Vec<serde_json::Value>,
    #[serde(default)]
    pagination: Pagination,
}

#[derive(Debug, Default, Deserialize)]
struct Pagination {
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelixStream {
    id: String,
    user_id: String,
    user_login: String,
    user_name: String,
    #[serde(default)]
    game_name: String,
    #[serde(default)]
    title: String,
    viewer_count: u64,
    #[serde(default)]
    language: String,
}

/// One decoded `/helix/streams` page
#[derive(Debug, Default)]
pub struct ParsedPage {
    pub streams: Vec<RawStreamInfo>,
    pub malformed: usize,
    pub below_threshold: usize,
    pub cursor: Option<String>,
}

/// Decode one page. Undecodable records are counted and dropped; a body that
/// is not a streams page at all is `MalformedResponse`.
pub fn parse_streams_page(
    body: &str,
    identity: &IdentityMap,
    min_viewers: u64,
) -> Result<ParsedPage, AdapterError> {
    let page: StreamsPage = serde_json::from_str(body)?;
    let mut parsed = ParsedPage {
        cursor: page.pagination.cursor.filter(|c| !c.is_empty()),
        ..ParsedPage::default()
    };

    for value in page.data {
        let stream: HelixStream = match serde_json::from_value(value) {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("⚠️  Dropping malformed Twitch stream record: {}", e);
                parsed.malformed += 1;
                continue;
            }
        };
        if stream.id.is_empty() {
            log::warn!("⚠️  Dropping Twitch stream record without id");
            parsed.malformed += 1;
            continue;
        }
        if stream.viewer_count < min_viewers {
            parsed.below_threshold += 1;
            continue;
        }

        let organizer = identity.organizer_from(
            &[
                stream.user_id.as_str(),
                stream.user_login.as_str(),
                stream.user_name.as_str(),
            ],
            &stream.user_login,
        );
        parsed.streams.push(RawStreamInfo {
            platform: Platform::Twitch,
            game: identity.game_from_category(&stream.game_name),
            organizer,
            viewer_count: stream.viewer_count,
            language: Some(stream.language).filter(|l| !l.is_empty()),
            observed_at: None,
            stream_id: stream.id,
            channel_id: stream.user_id,
            channel_name: stream.user_name,
            title: stream.title,
        });
    }

    Ok(parsed)
}

pub struct TwitchAdapter {
    config: TwitchConfig,
    identity: Arc<IdentityMap>,
    client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl TwitchAdapter {
    pub fn new(config: TwitchConfig, identity: Arc<IdentityMap>) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("esportstracker/", env!("CARGO_PKG_VERSION")))
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| AdapterError::Transient(format!("Twitch HTTP client: {}", e)))?;

        Ok(Self {
            config,
            identity,
            client,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, AdapterError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.access_token.clone());
            }
        }

        let token = self.request_token().await?;
        let access_token = token.access_token.clone();
        *cached = Some(token);
        Ok(access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn request_token(&self) -> Result<CachedToken, AdapterError> {
        let url = format!("{}/oauth2/token", self.config.auth_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .query(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    AdapterError::Auth(format!("token request rejected ({})", status))
                }
                _ => error_for_status(status, &headers, current_timestamp(), &body),
            });
        }

        let token: TokenResponse = serde_json::from_str(&response.text().await?)?;
        let lifetime = Duration::from_secs(token.expires_in);
        log::info!("🔑 Obtained Twitch app token (expires in {}s)", token.expires_in);

        Ok(CachedToken {
            access_token: token.access_token,
            refresh_at: Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN),
        })
    }

    /// Fetch one raw page. A 401 invalidates the cached token and retries the
    /// page once with a fresh one.
    async fn fetch_page(&self, cursor: Option<&str>) -> Result<String, AdapterError> {
        let url = format!("{}/helix/streams", self.config.api_url.trim_end_matches('/'));
        let mut refreshed = false;

        loop {
            let token = self.access_token().await?;
            let mut request = self
                .client
                .get(&url)
                .header("Client-Id", &self.config.client_id)
                .bearer_auth(&token)
                .query(&[("first", PAGE_SIZE)]);
            if let Some(cursor) = cursor {
                request = request.query(&[("after", cursor)]);
            }

            let response = request.send().await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !refreshed {
                log::warn!("⚠️  Twitch rejected cached token, refreshing");
                self.invalidate_token().await;
                refreshed = true;
                continue;
            }

            if !status.is_success() {
                let headers = response.headers().clone();
                let body = response.text().await.unwrap_or_default();
                return Err(error_for_status(status, &headers, current_timestamp(), &body));
            }

            return Ok(response.text().await?);
        }
    }
}

#[async_trait]
impl PlatformAdapter for TwitchAdapter {
    fn platform(&self) -> Platform {
        Platform::Twitch
    }

    async fn fetch_live_streams(&self) -> Result<FetchBatch, AdapterError> {
        let polled_at = current_timestamp();
        let mut seen = HashSet::new();
        let mut batch = FetchBatch {
            platform: Platform::Twitch,
            streams: Vec::new(),
            malformed: 0,
            polled_at,
        };
        let mut cursor: Option<String> = None;

        for page_no in 0..self.config.max_pages {
            let body = self.fetch_page(cursor.as_deref()).await?;
            let page = parse_streams_page(&body, &self.identity, self.config.min_viewers)?;
            batch.malformed += page.malformed;

            for stream in page.streams {
                // Streams shift between pages while we page; keep the first sighting
                if seen.insert(stream.stream_id.clone()) {
                    batch.streams.push(stream);
                }
            }

            log::debug!(
                "📄 Twitch page {}: {} streams so far, {} below threshold",
                page_no + 1,
                batch.streams.len(),
                page.below_threshold
            );

            if page.below_threshold > 0 || page.cursor.is_none() {
                break;
            }
            cursor = page.cursor;
        }

        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NormalizedName;
    use crate::platforms::test_support::StubServer;
    use serde_json::json;

    fn stream_json(id: &str, login: &str, game: &str, viewers: u64) -> serde_json::Value {
        json!({
            "id": id,
            "user_id": format!("{}-id", login),
            "user_login": login,
            "user_name": login.to_uppercase(),
            "game_id": "1",
            "game_name": game,
            "type": "live",
            "title": "Grand finals",
            "viewer_count": viewers,
            "started_at": "2024-05-01T12:00:00Z",
            "language": "en",
        })
    }

    fn config(api_url: &str, min_viewers: u64) -> TwitchConfig {
        TwitchConfig {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            api_url: api_url.to_string(),
            auth_url: api_url.to_string(),
            max_pages: 5,
            min_viewers,
            http_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_malformed_record_is_dropped_not_the_page() {
        let identity = IdentityMap::defaults();
        let mut data: Vec<serde_json::Value> = (0..9)
            .map(|i| stream_json(&format!("s{}", i), "esl_csgo", "Counter-Strike", 1_000 - i))
            .collect();
        data.push(json!({ "id": "broken", "viewer_count": "lots" }));
        let body = json!({ "data": data, "pagination": { "cursor": "abc" } }).to_string();

        let page = parse_streams_page(&body, &identity, 10).unwrap();
        assert_eq!(page.streams.len(), 9);
        assert_eq!(page.malformed, 1);
        assert_eq!(page.cursor.as_deref(), Some("abc"));

        let first = &page.streams[0];
        assert_eq!(first.game, NormalizedName::Canonical("Counter-Strike".to_string()));
        assert_eq!(first.organizer, NormalizedName::Canonical("ESL".to_string()));
        assert_eq!(first.observed_at, None);
        assert_eq!(first.language.as_deref(), Some("en"));
    }

    #[test]
    fn test_min_viewers_and_unmapped_names() {
        let identity = IdentityMap::defaults();
        let body = json!({
            "data": [
                stream_json("a", "somebody", "Just Chatting", 50),
                stream_json("b", "nobody", "Dota 2", 9),
            ],
            "pagination": {}
        })
        .to_string();

        let page = parse_streams_page(&body, &identity, 10).unwrap();
        assert_eq!(page.streams.len(), 1);
        assert_eq!(page.below_threshold, 1);
        assert_eq!(page.cursor, None);
        assert_eq!(
            page.streams[0].game,
            NormalizedName::Unmapped("Just Chatting".to_string())
        );
        assert_eq!(
            page.streams[0].organizer,
            NormalizedName::Unmapped("somebody".to_string())
        );
    }

    #[test]
    fn test_unreadable_body_is_malformed_response() {
        let identity = IdentityMap::defaults();
        let err = parse_streams_page("<html>oops</html>", &identity, 10).unwrap_err();
        assert!(matches!(err, AdapterError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_pages_are_followed_and_deduplicated() {
        let server = StubServer::start(|path, _count| {
            if path.starts_with("/oauth2/token") {
                return (200, json!({ "access_token": "t1", "expires_in": 3600 }).to_string());
            }
            if path.contains("after=page2") {
                let body = json!({
                    "data": [stream_json("s2", "b", "Dota 2", 80), stream_json("s3", "c", "Dota 2", 60)],
                    "pagination": {}
                });
                return (200, body.to_string());
            }
            let body = json!({
                "data": [stream_json("s1", "a", "Dota 2", 100), stream_json("s2", "b", "Dota 2", 90)],
                "pagination": { "cursor": "page2" }
            });
            (200, body.to_string())
        })
        .await;

        let adapter = TwitchAdapter::new(config(&server.url(), 10), Arc::new(IdentityMap::defaults())).unwrap();
        let batch = adapter.fetch_live_streams().await.unwrap();

        let ids: Vec<&str> = batch.streams.iter().map(|s| s.stream_id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2", "s3"]);
        // Token fetched once and reused for the second page
        assert_eq!(server.hits("/oauth2/token"), 1);
    }

    #[tokio::test]
    async fn test_401_refreshes_token_once() {
        let server = StubServer::start(|path, count| {
            if path.starts_with("/oauth2/token") {
                return (200, json!({ "access_token": "t", "expires_in": 3600 }).to_string());
            }
            // First streams call is rejected, the retry succeeds
            if count == 0 {
                return (401, json!({ "error": "Unauthorized" }).to_string());
            }
            (200, json!({ "data": [stream_json("s1", "a", "Dota 2", 100)] }).to_string())
        })
        .await;

        let adapter = TwitchAdapter::new(config(&server.url(), 10), Arc::new(IdentityMap::defaults())).unwrap();
        let batch = adapter.fetch_live_streams().await.unwrap();
        assert_eq!(batch.streams.len(), 1);
        assert_eq!(server.hits("/oauth2/token"), 2);
    }

    #[tokio::test]
    async fn test_repeated_401_is_auth_error() {
        let server = StubServer::start(|path, _count| {
            if path.starts_with("/oauth2/token") {
                return (200, json!({ "access_token": "t", "expires_in": 3600 }).to_string());
            }
            (401, json!({ "error": "Unauthorized" }).to_string())
        })
        .await;

        let adapter = TwitchAdapter::new(config(&server.url(), 10), Arc::new(IdentityMap::defaults())).unwrap();
        let err = adapter.fetch_live_streams().await.unwrap_err();
        assert!(matches!(err, AdapterError::Auth(_)));
    }

    #[tokio::test]
    async fn test_rejected_credentials_are_auth_error() {
        let server = StubServer::start(|_path, _count| {
            (403, json!({ "status": 403, "message": "invalid client secret" }).to_string())
        })
        .await;

        let adapter = TwitchAdapter::new(config(&server.url(), 10), Arc::new(IdentityMap::defaults())).unwrap();
        let err = adapter.fetch_live_streams().await.unwrap_err();
        assert!(matches!(err, AdapterError::Auth(_)));
    }
}
