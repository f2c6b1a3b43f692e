//! Shared HTTP plumbing for the platform adapters
//!
//! Every adapter sends its requests through [`send`], which turns transport
//! failures and non-2xx responses into [`PlatformError`] values with the same
//! meaning on every platform.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::error::PlatformError;
use crate::platforms::TokenGrant;

/// Retry-After assumed when a 429 does not carry one
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Longest error body kept in messages
const MAX_BODY_IN_MESSAGE: usize = 300;

/// Error dialect of the response body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDialect {
    /// Plain HTTP status mapping
    Rest,
    /// Facebook Graph API `{"error": {"code": ..}}` bodies
    Graph,
}

/// Build the client shared by all adapters
///
/// `request_timeout` bounds one request including its body, so it has to fit
/// the largest upload; callers put tighter deadlines around short calls.
pub fn build_client(
    connect_timeout: Duration,
    request_timeout: Duration,
) -> Result<reqwest::Client, PlatformError> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(request_timeout)
        .user_agent(concat!("autopost/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| PlatformError::Network(format!("Failed to build HTTP client: {}", e)))
}

/// Send a request and classify any failure
pub async fn send(request: RequestBuilder, dialect: ErrorDialect) -> Result<Response, PlatformError> {
    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    debug!(status = status.as_u16(), body = %truncate(&body), "Platform request failed");

    if dialect == ErrorDialect::Graph {
        if let Some(error) = graph_error(&body, retry_after) {
            return Err(error);
        }
    }
    Err(classify_status(status, retry_after, &body))
}

/// Send a request and decode a JSON body
pub async fn send_json<T: DeserializeOwned>(
    request: RequestBuilder,
    dialect: ErrorDialect,
) -> Result<T, PlatformError> {
    let response = send(request, dialect).await?;
    response
        .json::<T>()
        .await
        .map_err(|e| PlatformError::Protocol(format!("Unexpected response body: {}", e)))
}

/// Map an HTTP status to an adapter error
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> PlatformError {
    let message = format!("HTTP {}: {}", status.as_u16(), truncate(body));
    match status.as_u16() {
        401 => PlatformError::AuthExpired(message),
        429 => PlatformError::RateLimited {
            retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
            message,
        },
        400 | 413 | 415 | 422 => PlatformError::InvalidMedia(message),
        403 | 404 => PlatformError::Rejected(message),
        500..=599 => PlatformError::Unavailable(message),
        _ => PlatformError::Protocol(message),
    }
}

pub fn transport_error(error: reqwest::Error) -> PlatformError {
    if error.is_timeout() {
        PlatformError::Unavailable(format!("Request timed out: {}", error))
    } else if error.is_decode() {
        PlatformError::Protocol(error.to_string())
    } else {
        PlatformError::Network(error.to_string())
    }
}

/// Retry-After in its delta-seconds form
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    error: GraphErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GraphErrorDetail {
    #[serde(default)]
    message: String,
    code: Option<i64>,
}

/// Interpret a Graph API error body, if it is one we have a mapping for
pub fn graph_error(body: &str, retry_after: Option<Duration>) -> Option<PlatformError> {
    let parsed: GraphErrorBody = serde_json::from_str(body).ok()?;
    let code = parsed.error.code?;
    let message = format!("Graph error {}: {}", code, parsed.error.message);

    match code {
        190 => Some(PlatformError::AuthExpired(message)),
        4 | 17 | 32 | 613 => Some(PlatformError::RateLimited {
            retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
            message,
        }),
        _ => None,
    }
}

/// Token endpoints answer a bad refresh token with 400/401; the user has to
/// re-link in that case
pub fn refresh_error(error: PlatformError) -> PlatformError {
    match error {
        PlatformError::AuthExpired(message)
        | PlatformError::InvalidMedia(message)
        | PlatformError::Rejected(message) => PlatformError::RefreshDenied(message),
        other => other,
    }
}

/// OAuth 2.0 token response
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
}

impl From<TokenResponse> for TokenGrant {
    fn from(token: TokenResponse) -> Self {
        Self {
            access_token: SecretString::from(token.access_token),
            refresh_token: token.refresh_token.map(SecretString::from),
            expires_in: token
                .expires_in
                .map(|secs| Duration::from_secs(secs.max(0) as u64)),
        }
    }
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_BODY_IN_MESSAGE) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Join a base URL and a path without doubling slashes
pub fn join(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (401, "auth"),
            (429, "rate"),
            (400, "media"),
            (413, "media"),
            (415, "media"),
            (422, "media"),
            (403, "rejected"),
            (404, "rejected"),
            (500, "unavailable"),
            (503, "unavailable"),
            (418, "protocol"),
        ];

        for (code, expected) in cases {
            let status = StatusCode::from_u16(code).unwrap();
            let kind = match classify_status(status, None, "body") {
                PlatformError::AuthExpired(_) => "auth",
                PlatformError::RateLimited { .. } => "rate",
                PlatformError::InvalidMedia(_) => "media",
                PlatformError::Rejected(_) => "rejected",
                PlatformError::Unavailable(_) => "unavailable",
                PlatformError::Protocol(_) => "protocol",
                other => panic!("unexpected mapping for {}: {:?}", code, other),
            };
            assert_eq!(kind, expected, "status {}", code);
        }
    }

    #[test]
    fn test_rate_limit_uses_retry_after_or_default() {
        match classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(12)), "") {
            PlatformError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_secs(12))
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }

        match classify_status(StatusCode::TOO_MANY_REQUESTS, None, "") {
            PlatformError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, DEFAULT_RETRY_AFTER)
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("30"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(30)));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_graph_error_codes() {
        let expired = r#"{"error":{"message":"Session has expired","type":"OAuthException","code":190}}"#;
        assert!(matches!(
            graph_error(expired, None),
            Some(PlatformError::AuthExpired(_))
        ));

        for code in [4, 17, 32, 613] {
            let body = format!(r#"{{"error":{{"message":"Too many calls","code":{}}}}}"#, code);
            assert!(matches!(
                graph_error(&body, None),
                Some(PlatformError::RateLimited { .. })
            ));
        }

        let other = r#"{"error":{"message":"Invalid parameter","code":100}}"#;
        assert!(graph_error(other, None).is_none());
        assert!(graph_error("not json", None).is_none());
    }

    #[test]
    fn test_refresh_error_mapping() {
        assert!(matches!(
            refresh_error(PlatformError::InvalidMedia("invalid_grant".into())),
            PlatformError::RefreshDenied(_)
        ));
        assert!(matches!(
            refresh_error(PlatformError::AuthExpired("bad client".into())),
            PlatformError::RefreshDenied(_)
        ));
        assert!(matches!(
            refresh_error(PlatformError::Unavailable("503".into())),
            PlatformError::Unavailable(_)
        ));
    }

    #[test]
    fn test_long_bodies_are_truncated() {
        let body = "x".repeat(1_000);
        let error = classify_status(StatusCode::BAD_GATEWAY, None, &body);
        assert!(error.to_string().len() < 400);
    }

    #[test]
    fn test_join() {
        assert_eq!(join("https://api.x.com/", "/2/tweets"), "https://api.x.com/2/tweets");
        assert_eq!(join("https://api.x.com", "2/tweets"), "https://api.x.com/2/tweets");
    }
}
