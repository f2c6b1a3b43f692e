//! YouTube adapter
//!
//! Videos only. Uploads use the resumable protocol: one request opens the
//! upload session with the metadata, a second sends the bytes.

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;

use crate::error::PlatformError;
use crate::platforms::http::{self, ErrorDialect, TokenResponse};
use crate::platforms::{
    AppCredentials, PlatformAdapter, PlatformResult, PublishRequest, TokenGrant,
};
use crate::types::{AccountMetrics, Credential, Platform, PostMetrics};

const DEFAULT_API_BASE: &str = "https://www.googleapis.com";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const MAX_TITLE_CHARS: usize = 100;
const MAX_DESCRIPTION_CHARS: usize = 5000;

pub struct YouTubeAdapter {
    client: reqwest::Client,
    app: AppCredentials,
    api_base: String,
    token_url: String,
}

#[derive(Debug, Deserialize)]
struct UploadedVideo {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ItemList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct StatisticsItem<T> {
    statistics: T,
}

/// The Data API reports counters as decimal strings
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelStatistics {
    subscriber_count: Option<String>,
    video_count: Option<String>,
    view_count: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoStatistics {
    view_count: Option<String>,
    like_count: Option<String>,
    comment_count: Option<String>,
    favorite_count: Option<String>,
}

fn counter(raw: &Option<String>) -> PlatformResult<Option<u64>> {
    raw.as_deref()
        .map(|s| {
            s.parse::<u64>()
                .map_err(|_| PlatformError::Protocol(format!("Invalid counter '{}'", s)))
        })
        .transpose()
}

fn first_item<T>(list: ItemList<StatisticsItem<T>>, what: &str) -> PlatformResult<T> {
    list.items
        .into_iter()
        .next()
        .map(|item| item.statistics)
        .ok_or_else(|| PlatformError::Rejected(format!("{} not found", what)))
}

impl YouTubeAdapter {
    pub fn new(client: reqwest::Client, app: AppCredentials, api_base: Option<String>) -> Self {
        let token_url = match &api_base {
            Some(base) => http::join(base, "token"),
            None => TOKEN_URL.to_string(),
        };
        Self {
            client,
            app,
            api_base: api_base.unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            token_url,
        }
    }

    fn url(&self, path: &str) -> String {
        http::join(&self.api_base, path)
    }
}

fn video_metrics_from(stats: &VideoStatistics) -> PlatformResult<PostMetrics> {
    Ok(PostMetrics {
        views: counter(&stats.view_count)?,
        likes: counter(&stats.like_count)?.unwrap_or(0),
        comments: counter(&stats.comment_count)?.unwrap_or(0),
        shares: 0,
        saves: counter(&stats.favorite_count)?,
        reach: None,
        impressions: None,
    })
}

#[async_trait]
impl PlatformAdapter for YouTubeAdapter {
    fn platform(&self) -> Platform {
        Platform::YouTube
    }

    async fn publish(
        &self,
        credential: &Credential,
        request: &PublishRequest<'_>,
    ) -> PlatformResult<String> {
        self.validate_media(request.media)?;
        let token = credential.access_token.expose_secret();
        let description: String = request.caption.chars().take(MAX_DESCRIPTION_CHARS).collect();

        let session = http::send(
            self.client
                .post(self.url("upload/youtube/v3/videos"))
                .bearer_auth(token)
                .query(&[("uploadType", "resumable"), ("part", "snippet,status")])
                .header("X-Upload-Content-Type", request.media.media_type.mime())
                .header("X-Upload-Content-Length", request.media.len().to_string())
                .json(&json!({
                    "snippet": {
                        "title": request.title_or_caption(MAX_TITLE_CHARS),
                        "description": description,
                    },
                    "status": { "privacyStatus": "public" },
                })),
            ErrorDialect::Rest,
        )
        .await?;

        let upload_url = session
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                PlatformError::Protocol("Upload session response has no Location".to_string())
            })?;

        let video: UploadedVideo = http::send_json(
            self.client
                .put(upload_url)
                .bearer_auth(token)
                .header(CONTENT_TYPE, request.media.media_type.mime())
                .body(request.media.bytes.to_vec()),
            ErrorDialect::Rest,
        )
        .await?;

        Ok(video.id)
    }

    async fn fetch_account_metrics(
        &self,
        credential: &Credential,
        _account: &str,
    ) -> PlatformResult<AccountMetrics> {
        let list: ItemList<StatisticsItem<ChannelStatistics>> = http::send_json(
            self.client
                .get(self.url("youtube/v3/channels"))
                .bearer_auth(credential.access_token.expose_secret())
                .query(&[("part", "statistics"), ("mine", "true")]),
            ErrorDialect::Rest,
        )
        .await?;
        let stats = first_item(list, "Channel")?;

        Ok(AccountMetrics {
            followers: counter(&stats.subscriber_count)?.unwrap_or(0),
            following: None,
            posts: counter(&stats.video_count)?,
            total_views: counter(&stats.view_count)?,
        })
    }

    async fn fetch_post_metrics(
        &self,
        credential: &Credential,
        _account: &str,
        platform_post_id: &str,
    ) -> PlatformResult<PostMetrics> {
        let list: ItemList<StatisticsItem<VideoStatistics>> = http::send_json(
            self.client
                .get(self.url("youtube/v3/videos"))
                .bearer_auth(credential.access_token.expose_secret())
                .query(&[("part", "statistics"), ("id", platform_post_id)]),
            ErrorDialect::Rest,
        )
        .await?;

        video_metrics_from(&first_item(list, "Video")?)
    }

    async fn refresh_credential(&self, credential: &Credential) -> PlatformResult<TokenGrant> {
        let refresh_token = credential.refresh_token.as_ref().ok_or_else(|| {
            PlatformError::RefreshDenied("No refresh token stored for youtube".to_string())
        })?;
        let client_id = self.app.require_client_id(Platform::YouTube)?;
        let client_secret = self
            .app
            .client_secret
            .as_ref()
            .map(|s| s.expose_secret())
            .unwrap_or_default();

        let token: TokenResponse = http::send_json(
            self.client.post(&self.token_url).form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.expose_secret()),
                ("client_id", client_id),
                ("client_secret", client_secret),
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
    use secrecy::SecretString;
    use crate::media::MediaFile;
    use crate::types::CredentialStatus;

    #[test]
    fn test_video_statistics_are_parsed_from_strings() {
        let body = r#"{"items":[{"id":"abc","statistics":{"viewCount":"1200","likeCount":"80",
            "favoriteCount":"0","commentCount":"7"}}]}"#;
        let list: ItemList<StatisticsItem<VideoStatistics>> = serde_json::from_str(body).unwrap();
        let metrics = video_metrics_from(&first_item(list, "Video").unwrap()).unwrap();

        assert_eq!(metrics.views, Some(1200));
        assert_eq!(metrics.likes, 80);
        assert_eq!(metrics.comments, 7);
    }

    #[test]
    fn test_missing_video_is_rejected() {
        let list: ItemList<StatisticsItem<VideoStatistics>> =
            serde_json::from_str(r#"{"items":[]}"#).unwrap();
        assert!(matches!(
            first_item(list, "Video"),
            Err(PlatformError::Rejected(_))
        ));
    }

    #[test]
    fn test_garbage_counter_is_protocol_error() {
        assert!(matches!(
            counter(&Some("lots".to_string())),
            Err(PlatformError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_images_are_refused() {
        let adapter = YouTubeAdapter::new(
            reqwest::Client::new(),
            AppCredentials::default(),
            Some("http://127.0.0.1:9".into()),
        );
        let credential = Credential {
            user: "alice".to_string(),
            platform: Platform::YouTube,
            account: "UC1".to_string(),
            access_token: SecretString::from("token"),
            refresh_token: None,
            expires_at: None,
            status: CredentialStatus::Active,
            version: 0,
            updated_at: 0,
        };
        let media = MediaFile::new("cover.png", vec![1]).unwrap();
        let request = PublishRequest {
            account: "UC1",
            media: &media,
            caption: "hi",
            title: None,
        };

        assert!(matches!(
            adapter.publish(&credential, &request).await,
            Err(PlatformError::InvalidMedia(_))
        ));
    }
}
