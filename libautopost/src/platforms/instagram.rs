//! Instagram adapter (Graph API)
//!
//! Publishing is two-phase: create a media container, wait for it to finish
//! processing, then publish the container to the account.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::Form;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::PlatformError;
use crate::platforms::facebook::{exchange_long_lived_token, source_part, DEFAULT_GRAPH_BASE};
use crate::platforms::http::{self, ErrorDialect};
use crate::platforms::{
    AppCredentials, PlatformAdapter, PlatformResult, PublishRequest, TokenGrant, PROCESSING_WAIT,
};
use crate::types::{AccountMetrics, Credential, Platform, PostMetrics};

const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_STATUS_POLLS: u64 = PROCESSING_WAIT.as_secs() / STATUS_POLL_INTERVAL.as_secs();
const MAX_CAPTION_CHARS: usize = 2200;

pub struct InstagramAdapter {
    client: reqwest::Client,
    app: AppCredentials,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct ObjectId {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ContainerStatus {
    status_code: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountFields {
    #[serde(default)]
    followers_count: u64,
    follows_count: Option<u64>,
    media_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Insights {
    #[serde(default)]
    data: Vec<Insight>,
}

#[derive(Debug, Deserialize)]
struct Insight {
    name: String,
    #[serde(default)]
    values: Vec<InsightValue>,
    total_value: Option<InsightValue>,
}

#[derive(Debug, Deserialize)]
struct InsightValue {
    value: Value,
}

impl Insight {
    /// Insights come either as a `total_value` or as a list of period values
    fn value(&self) -> Option<u64> {
        self.total_value
            .as_ref()
            .or_else(|| self.values.last())
            .and_then(|v| v.value.as_u64())
    }
}

fn post_metrics_from(insights: &Insights) -> PostMetrics {
    let find = |name: &str| {
        insights
            .data
            .iter()
            .find(|i| i.name == name)
            .and_then(Insight::value)
    };

    PostMetrics {
        views: find("views").or_else(|| find("plays")),
        likes: find("likes").unwrap_or(0),
        comments: find("comments").unwrap_or(0),
        shares: find("shares").unwrap_or(0),
        saves: find("saved"),
        reach: find("reach"),
        impressions: find("impressions"),
    }
}

impl InstagramAdapter {
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

    async fn wait_for_container(&self, token: &str, container_id: &str) -> PlatformResult<()> {
        for _ in 0..MAX_STATUS_POLLS {
            let status: ContainerStatus = http::send_json(
                self.client
                    .get(self.url(container_id))
                    .bearer_auth(token)
                    .query(&[("fields", "status_code,status")]),
                ErrorDialect::Graph,
            )
            .await?;

            match status.status_code.as_deref() {
                Some("FINISHED") | Some("PUBLISHED") => return Ok(()),
                Some("ERROR") => {
                    return Err(PlatformError::InvalidMedia(
                        status
                            .status
                            .unwrap_or_else(|| "container processing failed".to_string()),
                    ))
                }
                Some("EXPIRED") => {
                    return Err(PlatformError::Rejected(format!(
                        "Container {} expired before publishing",
                        container_id
                    )))
                }
                _ => {
                    debug!(container_id, "Waiting for Instagram container");
                    tokio::time::sleep(STATUS_POLL_INTERVAL).await;
                }
            }
        }

        Err(PlatformError::Unavailable(format!(
            "Container {} still processing",
            container_id
        )))
    }
}

#[async_trait]
impl PlatformAdapter for InstagramAdapter {
    fn platform(&self) -> Platform {
        Platform::Instagram
    }

    async fn publish(
        &self,
        credential: &Credential,
        request: &PublishRequest<'_>,
    ) -> PlatformResult<String> {
        self.validate_media(request.media)?;
        let token = credential.access_token.expose_secret();
        let caption: String = request.caption.chars().take(MAX_CAPTION_CHARS).collect();

        let mut form = Form::new().text("caption", caption);
        if request.media.media_type.is_video() {
            form = form.text("media_type", "REELS");
        }
        form = form.part("source", source_part(request.media)?);

        let container: ObjectId = http::send_json(
            self.client
                .post(self.url(&format!("{}/media", request.account)))
                .bearer_auth(token)
                .multipart(form),
            ErrorDialect::Graph,
        )
        .await?;

        self.wait_for_container(token, &container.id).await?;

        let published: ObjectId = http::send_json(
            self.client
                .post(self.url(&format!("{}/media_publish", request.account)))
                .bearer_auth(token)
                .form(&[("creation_id", container.id.as_str())]),
            ErrorDialect::Graph,
        )
        .await?;

        Ok(published.id)
    }

    async fn fetch_account_metrics(
        &self,
        credential: &Credential,
        account: &str,
    ) -> PlatformResult<AccountMetrics> {
        let fields: AccountFields = http::send_json(
            self.client
                .get(self.url(account))
                .bearer_auth(credential.access_token.expose_secret())
                .query(&[("fields", "followers_count,follows_count,media_count")]),
            ErrorDialect::Graph,
        )
        .await?;

        Ok(AccountMetrics {
            followers: fields.followers_count,
            following: fields.follows_count,
            posts: fields.media_count,
            total_views: None,
        })
    }

    async fn fetch_post_metrics(
        &self,
        credential: &Credential,
        _account: &str,
        platform_post_id: &str,
    ) -> PlatformResult<PostMetrics> {
        let insights: Insights = http::send_json(
            self.client
                .get(self.url(&format!("{}/insights", platform_post_id)))
                .bearer_auth(credential.access_token.expose_secret())
                .query(&[("metric", "views,reach,likes,comments,shares,saved")]),
            ErrorDialect::Graph,
        )
        .await?;

        Ok(post_metrics_from(&insights))
    }

    async fn refresh_credential(&self, credential: &Credential) -> PlatformResult<TokenGrant> {
        exchange_long_lived_token(
            &self.client,
            &self.api_base,
            &self.app,
            Platform::Instagram,
            credential,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insights_mapping() {
        let body = r#"{"data":[
            {"name":"reach","period":"lifetime","values":[{"value":900}]},
            {"name":"likes","period":"lifetime","values":[{"value":45}]},
            {"name":"comments","period":"lifetime","values":[{"value":6}]},
            {"name":"saved","period":"lifetime","values":[{"value":3}]},
            {"name":"views","total_value":{"value":1500}}
        ]}"#;
        let insights: Insights = serde_json::from_str(body).unwrap();
        let metrics = post_metrics_from(&insights);

        assert_eq!(metrics.views, Some(1500));
        assert_eq!(metrics.reach, Some(900));
        assert_eq!(metrics.likes, 45);
        assert_eq!(metrics.comments, 6);
        assert_eq!(metrics.saves, Some(3));
        assert_eq!(metrics.shares, 0);
        assert_eq!(metrics.impressions, None);
    }

    #[test]
    fn test_empty_insights() {
        let insights: Insights = serde_json::from_str(r#"{"data":[]}"#).unwrap();
        let metrics = post_metrics_from(&insights);
        assert_eq!(metrics, PostMetrics::default());
    }

    #[test]
    fn test_account_fields_parsing() {
        let fields: AccountFields = serde_json::from_str(
            r#"{"followers_count":320,"follows_count":12,"media_count":40,"id":"178"}"#,
        )
        .unwrap();
        assert_eq!(fields.followers_count, 320);
        assert_eq!(fields.media_count, Some(40));
    }
}
