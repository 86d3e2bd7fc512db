use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Rate-limit wait used when the upstream gives no hint
pub const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum AdapterError {
    /// Credentials rejected or missing. Never retried automatically.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited, retry after {}s", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// The response body as a whole could not be read
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::RateLimited { .. } | AdapterError::Transient(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AdapterError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return AdapterError::MalformedResponse(err.to_string());
        }
        match err.status() {
            Some(StatusCode::UNAUTHORIZED) | Some(StatusCode::FORBIDDEN) => {
                AdapterError::Auth(err.to_string())
            }
            Some(StatusCode::TOO_MANY_REQUESTS) => AdapterError::RateLimited {
                retry_after: DEFAULT_RATE_LIMIT_WAIT,
            },
            _ => AdapterError::Transient(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        AdapterError::MalformedResponse(err.to_string())
    }
}

/// Wait suggested by `Retry-After` (seconds) or `Ratelimit-Reset` (epoch
/// seconds, Twitch)
pub fn retry_after_from_headers(headers: &HeaderMap, now: i64) -> Option<Duration> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
    };

    if let Some(secs) = header("retry-after") {
        return Some(Duration::from_secs(secs.max(0) as u64));
    }
    header("ratelimit-reset").map(|reset| Duration::from_secs((reset - now).max(1) as u64))
}

/// Classify a non-success status that carries no platform-specific reason
pub fn error_for_status(status: StatusCode, headers: &HeaderMap, now: i64, body: &str) -> AdapterError {
    let snippet: String = body.chars().take(200).collect();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            AdapterError::Auth(format!("{}: {}", status, snippet))
        }
        StatusCode::TOO_MANY_REQUESTS => AdapterError::RateLimited {
            retry_after: retry_after_from_headers(headers, now).unwrap_or(DEFAULT_RATE_LIMIT_WAIT),
        },
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
            AdapterError::Transient(format!("{}: {}", status, snippet))
        }
        _ => AdapterError::MalformedResponse(format!("unexpected status {}: {}", status, snippet)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_retry_after_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after_from_headers(&headers, 1_000), None);

        headers.insert("ratelimit-reset", HeaderValue::from_static("1030"));
        assert_eq!(retry_after_from_headers(&headers, 1_000), Some(Duration::from_secs(30)));
        // Reset already passed
        assert_eq!(retry_after_from_headers(&headers, 2_000), Some(Duration::from_secs(1)));

        headers.insert("retry-after", HeaderValue::from_static("7"));
        assert_eq!(retry_after_from_headers(&headers, 1_000), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_status_classification() {
        let headers = HeaderMap::new();
        assert!(matches!(
            error_for_status(StatusCode::UNAUTHORIZED, &headers, 0, ""),
            AdapterError::Auth(_)
        ));
        let limited = error_for_status(StatusCode::TOO_MANY_REQUESTS, &headers, 0, "");
        assert_eq!(limited.retry_after(), Some(DEFAULT_RATE_LIMIT_WAIT));
        assert!(limited.is_retryable());

        let unavailable = error_for_status(StatusCode::SERVICE_UNAVAILABLE, &headers, 0, "down");
        assert!(matches!(unavailable, AdapterError::Transient(_)));
        assert!(!error_for_status(StatusCode::NOT_FOUND, &headers, 0, "").is_retryable());
    }
}
