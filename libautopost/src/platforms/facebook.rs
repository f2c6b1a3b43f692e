//! Facebook Page adapter (Graph API)
//!
//! Photos and videos are posted to the page feed with a multipart upload.
//! Page tokens are long-lived; "refreshing" one means exchanging it for a new
//! long-lived token, which needs the app secret.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use secrecy::ExposeSecret;
use serde::Deserialize;

use crate::error::PlatformError;
use crate::media::MediaFile;
use crate::platforms::http::{self, ErrorDialect, TokenResponse};
use crate::platforms::{
    AppCredentials, PlatformAdapter, PlatformResult, PublishRequest, TokenGrant,
};
use crate::types::{AccountMetrics, Credential, Platform, PostMetrics};

pub(crate) const DEFAULT_GRAPH_BASE: &str = "https://graph.facebook.com/v19.0";

pub struct FacebookAdapter {
    client: reqwest::Client,
    app: AppCredentials,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct CreatedObject {
    id: String,
    /// Photos report the feed post separately from the photo object
    post_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageFields {
    followers_count: Option<u64>,
    fan_count: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct Summary {
    #[serde(default)]
    total_count: u64,
}

#[derive(Debug, Default, Deserialize)]
struct Edge {
    #[serde(default)]
    summary: Summary,
}

#[derive(Debug, Default, Deserialize)]
struct Shares {
    #[serde(default)]
    count: u64,
}

#[derive(Debug, Deserialize)]
struct PostFields {
    #[serde(default)]
    reactions: Edge,
    #[serde(default)]
    comments: Edge,
    #[serde(default)]
    shares: Shares,
}

/// Multipart part carrying the raw file as `source`
pub(crate) fn source_part(media: &MediaFile) -> PlatformResult<Part> {
    Part::bytes(media.bytes.to_vec())
        .file_name(media.file_name.clone())
        .mime_str(media.media_type.mime())
        .map_err(|e| PlatformError::InvalidMedia(e.to_string()))
}

/// Exchange a Graph token for a fresh long-lived one
pub(crate) async fn exchange_long_lived_token(
    client: &reqwest::Client,
    api_base: &str,
    app: &AppCredentials,
    platform: Platform,
    credential: &Credential,
) -> PlatformResult<TokenGrant> {
    let client_id = app.require_client_id(platform)?;
    let client_secret = app.client_secret.as_ref().ok_or_else(|| {
        PlatformError::RefreshDenied(format!("No client_secret configured for {}", platform))
    })?;

    let token: TokenResponse = http::send_json(
        client
            .get(http::join(api_base, "oauth/access_token"))
            .query(&[
                ("grant_type", "fb_exchange_token"),
                ("client_id", client_id),
                ("client_secret", client_secret.expose_secret()),
                ("fb_exchange_token", credential.access_token.expose_secret()),
            ]),
        ErrorDialect::Graph,
    )
    .await
    .map_err(http::refresh_error)?;

    // Graph tokens carry no refresh token; the exchanged token replaces it
    Ok(TokenGrant {
        refresh_token: None,
        ..TokenGrant::from(token)
    })
}

impl FacebookAdapter {
    pub fn new(client: reqwest::Client, app: AppCredentials, api_base: Option<String>) -> Self {
        Self {
            client,
            app,
            api_base: api_base.unwrap_or_else(|| DEFAULT_GRAPH_BASE.to_string()),
        }
    }

    fn url(&self, path: &str) -> String {
        http::join(&self.api_base, path)
    }
}

fn post_metrics_from(fields: PostFields) -> PostMetrics {
    PostMetrics {
        views: None,
        likes: fields.reactions.summary.total_count,
        comments: fields.comments.summary.total_count,
        shares: fields.shares.count,
        saves: None,
        reach: None,
        impressions: None,
    }
}

#[async_trait]
impl PlatformAdapter for FacebookAdapter {
    fn platform(&self) -> Platform {
        Platform::Facebook
    }

    async fn publish(
        &self,
        credential: &Credential,
        request: &PublishRequest<'_>,
    ) -> PlatformResult<String> {
        self.validate_media(request.media)?;

        let (edge, form) = if request.media.media_type.is_video() {
            let form = Form::new()
                .text("description", request.caption.to_string())
                .text("title", request.title_or_caption(255))
                .part("source", source_part(request.media)?);
            ("videos", form)
        } else {
            let form = Form::new()
                .text("caption", request.caption.to_string())
                .part("source", source_part(request.media)?);
            ("photos", form)
        };

        let created: CreatedObject = http::send_json(
            self.client
                .post(self.url(&format!("{}/{}", request.account, edge)))
                .bearer_auth(credential.access_token.expose_secret())
                .multipart(form),
            ErrorDialect::Graph,
        )
        .await?;

        Ok(created.post_id.unwrap_or(created.id))
    }

    async fn fetch_account_metrics(
        &self,
        credential: &Credential,
        account: &str,
    ) -> PlatformResult<AccountMetrics> {
        let page: PageFields = http::send_json(
            self.client
                .get(self.url(account))
                .bearer_auth(credential.access_token.expose_secret())
                .query(&[("fields", "followers_count,fan_count")]),
            ErrorDialect::Graph,
        )
        .await?;

        Ok(AccountMetrics {
            followers: page.followers_count.or(page.fan_count).unwrap_or(0),
            following: None,
            posts: None,
            total_views: None,
        })
    }

    async fn fetch_post_metrics(
        &self,
        credential: &Credential,
        _account: &str,
        platform_post_id: &str,
    ) -> PlatformResult<PostMetrics> {
        let fields: PostFields = http::send_json(
            self.client
                .get(self.url(platform_post_id))
                .bearer_auth(credential.access_token.expose_secret())
                .query(&[(
                    "fields",
                    "reactions.summary(total_count),comments.summary(total_count),shares",
                )]),
            ErrorDialect::Graph,
        )
        .await?;

        Ok(post_metrics_from(fields))
    }

    async fn refresh_credential(&self, credential: &Credential) -> PlatformResult<TokenGrant> {
        exchange_long_lived_token(
            &self.client,
            &self.api_base,
            &self.app,
            Platform::Facebook,
            credential,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use crate::types::CredentialStatus;

    fn credential() -> Credential {
        Credential {
            user: "alice".to_string(),
            platform: Platform::Facebook,
            account: "1234".to_string(),
            access_token: SecretString::from("page-token"),
            refresh_token: None,
            expires_at: None,
            status: CredentialStatus::Active,
            version: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_post_fields_mapping() {
        let body = r#"{"id":"1_2","reactions":{"data":[],"summary":{"total_count":12}},
            "comments":{"data":[],"summary":{"total_count":3}},"shares":{"count":2}}"#;
        let fields: PostFields = serde_json::from_str(body).unwrap();
        let metrics = post_metrics_from(fields);

        assert_eq!(metrics.likes, 12);
        assert_eq!(metrics.comments, 3);
        assert_eq!(metrics.shares, 2);
        assert_eq!(metrics.views, None);
    }

    #[test]
    fn test_post_without_shares_defaults_to_zero() {
        let fields: PostFields = serde_json::from_str(r#"{"id":"1_2"}"#).unwrap();
        assert_eq!(post_metrics_from(fields).shares, 0);
    }

    #[test]
    fn test_photo_response_prefers_feed_post_id() {
        let created: CreatedObject =
            serde_json::from_str(r#"{"id":"photo-1","post_id":"1234_99"}"#).unwrap();
        assert_eq!(created.post_id.unwrap_or(created.id), "1234_99");
    }

    #[tokio::test]
    async fn test_exchange_without_secret_is_denied() {
        let adapter = FacebookAdapter::new(
            reqwest::Client::new(),
            AppCredentials::new(Some("app".into()), None),
            Some("http://127.0.0.1:9".into()),
        );
        assert!(matches!(
            adapter.refresh_credential(&credential()).await,
            Err(PlatformError::RefreshDenied(_))
        ));
    }
}
