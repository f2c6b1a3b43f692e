//! Twitter / X adapter
//!
//! Images go through the one-shot media upload; videos use the chunked
//! INIT / APPEND / FINALIZE flow and are polled until processing finishes.
//! The tweet itself is created through the v2 API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::PlatformError;
use crate::media::MediaFile;
use crate::platforms::http::{self, ErrorDialect, TokenResponse};
use crate::platforms::{
    AppCredentials, PlatformAdapter, PlatformResult, PublishRequest, TokenGrant, PROCESSING_WAIT,
};
use crate::types::{AccountMetrics, Credential, Platform, PostMetrics};

const DEFAULT_API_BASE: &str = "https://api.x.com";
const UPLOAD_PATH: &str = "1.1/media/upload.json";
const CHUNK_SIZE: usize = 4 * 1024 * 1024;
const MAX_CHECK_AFTER_SECS: u64 = 10;

pub struct TwitterAdapter {
    client: reqwest::Client,
    app: AppCredentials,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct MediaUploadResponse {
    media_id_string: String,
    processing_info: Option<ProcessingInfo>,
}

#[derive(Debug, Deserialize)]
struct ProcessingInfo {
    state: String,
    check_after_secs: Option<u64>,
    error: Option<ProcessingError>,
}

#[derive(Debug, Deserialize)]
struct ProcessingError {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct CreatedTweet {
    id: String,
}

#[derive(Debug, Deserialize)]
struct UserData {
    public_metrics: UserPublicMetrics,
}

#[derive(Debug, Deserialize)]
struct UserPublicMetrics {
    followers_count: u64,
    following_count: u64,
    tweet_count: u64,
}

#[derive(Debug, Deserialize)]
struct TweetData {
    public_metrics: TweetPublicMetrics,
}

#[derive(Debug, Deserialize)]
struct TweetPublicMetrics {
    retweet_count: u64,
    reply_count: u64,
    like_count: u64,
    #[serde(default)]
    quote_count: u64,
    bookmark_count: Option<u64>,
    impression_count: Option<u64>,
}

impl TwitterAdapter {
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

    async fn upload_image(&self, token: &str, media: &MediaFile) -> PlatformResult<String> {
        let part = Part::bytes(media.bytes.to_vec())
            .file_name(media.file_name.clone())
            .mime_str(media.media_type.mime())
            .map_err(|e| PlatformError::InvalidMedia(e.to_string()))?;
        let form = Form::new().part("media", part);

        let uploaded: MediaUploadResponse = http::send_json(
            self.client
                .post(self.url(UPLOAD_PATH))
                .bearer_auth(token)
                .multipart(form),
            ErrorDialect::Rest,
        )
        .await?;
        Ok(uploaded.media_id_string)
    }

    async fn upload_video(&self, token: &str, media: &MediaFile) -> PlatformResult<String> {
        let total_bytes = media.len().to_string();
        let init: MediaUploadResponse = http::send_json(
            self.client
                .post(self.url(UPLOAD_PATH))
                .bearer_auth(token)
                .form(&[
                    ("command", "INIT"),
                    ("total_bytes", total_bytes.as_str()),
                    ("media_type", media.media_type.mime()),
                    ("media_category", "tweet_video"),
                ]),
            ErrorDialect::Rest,
        )
        .await?;
        let media_id = init.media_id_string;

        for (index, chunk) in media.bytes.chunks(CHUNK_SIZE).enumerate() {
            let form = Form::new()
                .text("command", "APPEND")
                .text("media_id", media_id.clone())
                .text("segment_index", index.to_string())
                .part("media", Part::bytes(chunk.to_vec()));
            http::send(
                self.client
                    .post(self.url(UPLOAD_PATH))
                    .bearer_auth(token)
                    .multipart(form),
                ErrorDialect::Rest,
            )
            .await?;
        }

        let mut status: MediaUploadResponse = http::send_json(
            self.client
                .post(self.url(UPLOAD_PATH))
                .bearer_auth(token)
                .form(&[("command", "FINALIZE"), ("media_id", media_id.as_str())]),
            ErrorDialect::Rest,
        )
        .await?;

        let mut waited = Duration::ZERO;
        while waited < PROCESSING_WAIT {
            let Some(info) = status.processing_info.take() else {
                return Ok(media_id);
            };
            match info.state.as_str() {
                "succeeded" => return Ok(media_id),
                "failed" => {
                    let reason = info
                        .error
                        .and_then(|e| e.message)
                        .unwrap_or_else(|| "processing failed".to_string());
                    return Err(PlatformError::InvalidMedia(reason));
                }
                _ => {
                    let wait = info
                        .check_after_secs
                        .unwrap_or(1)
                        .clamp(1, MAX_CHECK_AFTER_SECS);
                    debug!(media_id = %media_id, wait, "Waiting for video processing");
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    waited += Duration::from_secs(wait);
                    status = http::send_json(
                        self.client
                            .get(self.url(UPLOAD_PATH))
                            .bearer_auth(token)
                            .query(&[("command", "STATUS"), ("media_id", media_id.as_str())]),
                        ErrorDialect::Rest,
                    )
                    .await?;
                }
            }
        }

        Err(PlatformError::Unavailable(format!(
            "Video {} still processing",
            media_id
        )))
    }
}

fn post_metrics_from(metrics: TweetPublicMetrics) -> PostMetrics {
    PostMetrics {
        views: metrics.impression_count,
        likes: metrics.like_count,
        comments: metrics.reply_count,
        shares: metrics.retweet_count + metrics.quote_count,
        saves: metrics.bookmark_count,
        reach: None,
        impressions: metrics.impression_count,
    }
}

#[async_trait]
impl PlatformAdapter for TwitterAdapter {
    fn platform(&self) -> Platform {
        Platform::Twitter
    }

    async fn publish(
        &self,
        credential: &Credential,
        request: &PublishRequest<'_>,
    ) -> PlatformResult<String> {
        self.validate_media(request.media)?;
        let token = credential.access_token.expose_secret();

        let media_id = if request.media.media_type.is_video() {
            self.upload_video(token, request.media).await?
        } else {
            self.upload_image(token, request.media).await?
        };

        let created: DataEnvelope<CreatedTweet> = http::send_json(
            self.client
                .post(self.url("2/tweets"))
                .bearer_auth(token)
                .json(&json!({
                    "text": request.caption,
                    "media": { "media_ids": [media_id] },
                })),
            ErrorDialect::Rest,
        )
        .await?;

        Ok(created.data.id)
    }

    async fn fetch_account_metrics(
        &self,
        credential: &Credential,
        _account: &str,
    ) -> PlatformResult<AccountMetrics> {
        let user: DataEnvelope<UserData> = http::send_json(
            self.client
                .get(self.url("2/users/me"))
                .bearer_auth(credential.access_token.expose_secret())
                .query(&[("user.fields", "public_metrics")]),
            ErrorDialect::Rest,
        )
        .await?;

        let metrics = user.data.public_metrics;
        Ok(AccountMetrics {
            followers: metrics.followers_count,
            following: Some(metrics.following_count),
            posts: Some(metrics.tweet_count),
            total_views: None,
        })
    }

    async fn fetch_post_metrics(
        &self,
        credential: &Credential,
        _account: &str,
        platform_post_id: &str,
    ) -> PlatformResult<PostMetrics> {
        let tweet: DataEnvelope<TweetData> = http::send_json(
            self.client
                .get(self.url(&format!("2/tweets/{}", platform_post_id)))
                .bearer_auth(credential.access_token.expose_secret())
                .query(&[("tweet.fields", "public_metrics")]),
            ErrorDialect::Rest,
        )
        .await?;

        Ok(post_metrics_from(tweet.data.public_metrics))
    }

    async fn refresh_credential(&self, credential: &Credential) -> PlatformResult<TokenGrant> {
        let refresh_token = credential.refresh_token.as_ref().ok_or_else(|| {
            PlatformError::RefreshDenied("No refresh token stored for twitter".to_string())
        })?;
        let client_id = self.app.require_client_id(Platform::Twitter)?;

        let mut request = self.client.post(self.url("2/oauth2/token")).form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose_secret()),
            ("client_id", client_id),
        ]);
        if let Some(secret) = &self.app.client_secret {
            request = request.basic_auth(client_id, Some(secret.expose_secret()));
        }

        let token: TokenResponse = http::send_json(request, ErrorDialect::Rest)
            .await
            .map_err(http::refresh_error)?;

        Ok(token.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use crate::types::CredentialStatus;

    fn credential(refresh: Option<&str>) -> Credential {
        Credential {
            user: "alice".to_string(),
            platform: Platform::Twitter,
            account: "@alice".to_string(),
            access_token: SecretString::from("token"),
            refresh_token: refresh.map(SecretString::from),
            expires_at: None,
            status: CredentialStatus::Active,
            version: 0,
            updated_at: 0,
        }
    }

    fn adapter() -> TwitterAdapter {
        TwitterAdapter::new(
            reqwest::Client::new(),
            AppCredentials::new(Some("client".into()), None),
            Some("http://127.0.0.1:9".into()),
        )
    }

    #[test]
    fn test_tweet_metrics_mapping() {
        let body = r#"{"data":{"id":"1","public_metrics":{"retweet_count":2,"reply_count":3,
            "like_count":10,"quote_count":1,"bookmark_count":4,"impression_count":500}}}"#;
        let tweet: DataEnvelope<TweetData> = serde_json::from_str(body).unwrap();
        let metrics = post_metrics_from(tweet.data.public_metrics);

        assert_eq!(metrics.likes, 10);
        assert_eq!(metrics.comments, 3);
        assert_eq!(metrics.shares, 3);
        assert_eq!(metrics.saves, Some(4));
        assert_eq!(metrics.views, Some(500));
    }

    #[test]
    fn test_processing_info_parsing() {
        let body = r#"{"media_id":1,"media_id_string":"1","processing_info":{"state":"pending","check_after_secs":5}}"#;
        let parsed: MediaUploadResponse = serde_json::from_str(body).unwrap();
        let info = parsed.processing_info.unwrap();
        assert_eq!(info.state, "pending");
        assert_eq!(info.check_after_secs, Some(5));
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_is_denied() {
        let result = adapter().refresh_credential(&credential(None)).await;
        assert!(matches!(result, Err(PlatformError::RefreshDenied(_))));
    }

    #[tokio::test]
    async fn test_unsupported_media_fails_before_network() {
        let media = MediaFile::new("clip.avi", vec![1, 2, 3]).unwrap();
        let request = PublishRequest {
            account: "@alice",
            media: &media,
            caption: "hi",
            title: None,
        };
        let result = adapter().publish(&credential(Some("r")), &request).await;
        assert!(matches!(result, Err(PlatformError::InvalidMedia(_))));
    }
}
