//! TikTok adapter (Content Posting API)
//!
//! Videos only. `init` returns a publish id and an upload URL; the bytes are
//! PUT in one request and TikTok finishes publishing asynchronously.

use async_trait::async_trait;
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;

use crate::error::PlatformError;
use crate::platforms::http::{self, ErrorDialect, TokenResponse};
use crate::platforms::{
    AppCredentials, PlatformAdapter, PlatformResult, PublishRequest, TokenGrant,
};
use crate::types::{AccountMetrics, Credential, Platform, PostMetrics};

const DEFAULT_API_BASE: &str = "https://open.tiktokapis.com";
const MAX_TITLE_CHARS: usize = 2200;

pub struct TikTokAdapter {
    client: reqwest::Client,
    app: AppCredentials,
    api_base: String,
}

/// Every TikTok response wraps its payload next to an `error` object whose
/// code is "ok" on success
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    #[serde(default)]
    message: String,
}

impl<T> Envelope<T> {
    fn into_data(self) -> PlatformResult<T> {
        if let Some(error) = self.error {
            if error.code != "ok" {
                return Err(api_error(&error));
            }
        }
        self.data
            .ok_or_else(|| PlatformError::Protocol("Response has no data".to_string()))
    }
}

fn api_error(error: &ApiError) -> PlatformError {
    let message = format!("{}: {}", error.code, error.message);
    match error.code.as_str() {
        "access_token_invalid" | "token_expired" => PlatformError::AuthExpired(message),
        "rate_limit_exceeded" | "spam_risk_too_many_posts" => PlatformError::RateLimited {
            retry_after: http::DEFAULT_RETRY_AFTER,
            message,
        },
        "invalid_file_upload" | "file_format_check_failed" | "video_pull_failed" => {
            PlatformError::InvalidMedia(message)
        }
        "scope_not_authorized" | "unaudited_client_can_only_post_to_private_accounts" => {
            PlatformError::Rejected(message)
        }
        _ => PlatformError::Protocol(message),
    }
}

#[derive(Debug, Deserialize)]
struct InitData {
    publish_id: String,
    upload_url: String,
}

#[derive(Debug, Deserialize)]
struct UserData {
    user: UserStats,
}

#[derive(Debug, Deserialize)]
struct UserStats {
    #[serde(default)]
    follower_count: u64,
    following_count: Option<u64>,
    video_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct VideoList {
    #[serde(default)]
    videos: Vec<VideoStats>,
}

#[derive(Debug, Deserialize)]
struct VideoStats {
    view_count: Option<u64>,
    #[serde(default)]
    like_count: u64,
    #[serde(default)]
    comment_count: u64,
    #[serde(default)]
    share_count: u64,
}

fn post_metrics_from(video: &VideoStats) -> PostMetrics {
    PostMetrics {
        views: video.view_count,
        likes: video.like_count,
        comments: video.comment_count,
        shares: video.share_count,
        saves: None,
        reach: None,
        impressions: None,
    }
}

impl TikTokAdapter {
    pub fn new(client: reqwest::Client, app: AppCredentials, api_base: Option<String>) -> Self {
        Self {
            client,
            app,
            api_base: api_base.unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
        }
    }

    fn url(&self, path: &str) -> String {
        http::join(&self.api_base, path)
    }
}

#[async_trait]
impl PlatformAdapter for TikTokAdapter {
    fn platform(&self) -> Platform {
        Platform::TikTok
    }

    async fn publish(
        &self,
        credential: &Credential,
        request: &PublishRequest<'_>,
    ) -> PlatformResult<String> {
        self.validate_media(request.media)?;
        let token = credential.access_token.expose_secret();
        let size = request.media.len();
        let title: String = request.caption.chars().take(MAX_TITLE_CHARS).collect();

        let init: Envelope<InitData> = http::send_json(
            self.client
                .post(self.url("v2/post/publish/video/init/"))
                .bearer_auth(token)
                .json(&json!({
                    "post_info": {
                        "title": title,
                        "privacy_level": "PUBLIC_TO_EVERYONE",
                    },
                    "source_info": {
                        "source": "FILE_UPLOAD",
                        "video_size": size,
                        "chunk_size": size,
                        "total_chunk_count": 1,
                    },
                })),
            ErrorDialect::Rest,
        )
        .await?;
        let init = init.into_data()?;

        http::send(
            self.client
                .put(&init.upload_url)
                .header(CONTENT_TYPE, request.media.media_type.mime())
                .header(
                    CONTENT_RANGE,
                    format!("bytes 0-{}/{}", size.saturating_sub(1), size),
                )
                .body(request.media.bytes.to_vec()),
            ErrorDialect::Rest,
        )
        .await?;

        Ok(init.publish_id)
    }

    async fn fetch_account_metrics(
        &self,
        credential: &Credential,
        _account: &str,
    ) -> PlatformResult<AccountMetrics> {
        let user: Envelope<UserData> = http::send_json(
            self.client
                .get(self.url("v2/user/info/"))
                .bearer_auth(credential.access_token.expose_secret())
                .query(&[("fields", "follower_count,following_count,video_count")]),
            ErrorDialect::Rest,
        )
        .await?;
        let stats = user.into_data()?.user;

        Ok(AccountMetrics {
            followers: stats.follower_count,
            following: stats.following_count,
            posts: stats.video_count,
            total_views: None,
        })
    }

    async fn fetch_post_metrics(
        &self,
        credential: &Credential,
        _account: &str,
        platform_post_id: &str,
    ) -> PlatformResult<PostMetrics> {
        let list: Envelope<VideoList> = http::send_json(
            self.client
                .post(self.url("v2/video/query/"))
                .bearer_auth(credential.access_token.expose_secret())
                .query(&[(
                    "fields",
                    "id,view_count,like_count,comment_count,share_count",
                )])
                .json(&json!({ "filters": { "video_ids": [platform_post_id] } })),
            ErrorDialect::Rest,
        )
        .await?;

        let list = list.into_data()?;
        let video = list.videos.first().ok_or_else(|| {
            PlatformError::Rejected(format!("Video {} not found", platform_post_id))
        })?;
        Ok(post_metrics_from(video))
    }

    async fn refresh_credential(&self, credential: &Credential) -> PlatformResult<TokenGrant> {
        let refresh_token = credential.refresh_token.as_ref().ok_or_else(|| {
            PlatformError::RefreshDenied("No refresh token stored for tiktok".to_string())
        })?;
        let client_key = self.app.require_client_id(Platform::TikTok)?;
        let client_secret = self
            .app
            .client_secret
            .as_ref()
            .map(|s| s.expose_secret())
            .unwrap_or_default();

        let token: TokenResponse = http::send_json(
            self.client.post(self.url("v2/oauth/token/")).form(&[
                ("client_key", client_key),
                ("client_secret", client_secret),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.expose_secret()),
            ]),
            ErrorDialect::Rest,
        )
        .await
        .map_err(http::refresh_error)?;

        Ok(token.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_envelope_yields_data() {
        let body = r#"{"data":{"publish_id":"v_pub_1","upload_url":"https://up.example/1"},
            "error":{"code":"ok","message":"","log_id":"x"}}"#;
        let envelope: Envelope<InitData> = serde_json::from_str(body).unwrap();
        let data = envelope.into_data().unwrap();
        assert_eq!(data.publish_id, "v_pub_1");
    }

    #[test]
    fn test_error_codes_are_classified() {
        let cases = [
            ("access_token_invalid", "auth"),
            ("rate_limit_exceeded", "rate"),
            ("file_format_check_failed", "media"),
            ("scope_not_authorized", "rejected"),
            ("internal_error", "protocol"),
        ];
        for (code, expected) in cases {
            let kind = match api_error(&ApiError {
                code: code.to_string(),
                message: String::new(),
            }) {
                PlatformError::AuthExpired(_) => "auth",
                PlatformError::RateLimited { .. } => "rate",
                PlatformError::InvalidMedia(_) => "media",
                PlatformError::Rejected(_) => "rejected",
                PlatformError::Protocol(_) => "protocol",
                other => panic!("unexpected {:?}", other),
            };
            assert_eq!(kind, expected, "code {}", code);
        }
    }

    #[test]
    fn test_error_envelope_wins_over_data() {
        let body = r#"{"data":{},"error":{"code":"access_token_invalid","message":"expired"}}"#;
        let envelope: Envelope<VideoList> = serde_json::from_str(body).unwrap();
        assert!(matches!(
            envelope.into_data(),
            Err(PlatformError::AuthExpired(_))
        ));
    }

    #[test]
    fn test_video_stats_mapping() {
        let body = r#"{"data":{"videos":[{"id":"1","view_count":4000,"like_count":300,
            "comment_count":20,"share_count":9}]},"error":{"code":"ok"}}"#;
        let envelope: Envelope<VideoList> = serde_json::from_str(body).unwrap();
        let list = envelope.into_data().unwrap();
        let metrics = post_metrics_from(&list.videos[0]);

        assert_eq!(metrics.views, Some(4000));
        assert_eq!(metrics.likes, 300);
        assert_eq!(metrics.shares, 9);
    }
}
