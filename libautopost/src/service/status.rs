//! Read-only views of posts and account analytics

use std::sync::Arc;

use serde::Serialize;

use crate::clock::Clock;
use crate::db::Database;
use crate::error::{AutopostError, Result};
use crate::service::load_owned;
use crate::types::{
    AccountMetrics, FailureClass, LifecycleState, MetricSet, Platform, PostMetrics, PostRecord,
    Recurrence, Target, TargetStatus,
};

/// A post, its targets, and the latest metrics of each published target
#[derive(Debug, Clone, Serialize)]
pub struct PostStatusReport {
    pub id: String,
    pub owner: String,
    pub state: LifecycleState,
    pub media_ref: String,
    pub caption: String,
    pub title: Option<String>,
    pub due_at: Option<i64>,
    pub recurrence: Recurrence,
    pub recurrence_paused: bool,
    pub next_occurrence_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub targets: Vec<TargetReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub platform: Platform,
    pub account: String,
    pub status: TargetStatus,
    pub attempts: u32,
    pub next_attempt_at: Option<i64>,
    pub platform_post_id: Option<String>,
    pub posted_at: Option<i64>,
    pub failure: Option<FailureClass>,
    pub last_error: Option<String>,
    pub metrics: Option<PostMetrics>,
    pub metrics_captured_at: Option<i64>,
    /// Likes, comments and shares per hundred followers, using the latest
    /// account reading
    pub engagement_rate: Option<f64>,
}

impl TargetReport {
    fn new(target: Target) -> Self {
        Self {
            platform: target.platform,
            account: target.account,
            status: target.status,
            attempts: target.attempts,
            next_attempt_at: target.next_attempt_at,
            platform_post_id: target.platform_post_id,
            posted_at: target.posted_at,
            failure: target.failure,
            last_error: target.last_error,
            metrics: None,
            metrics_captured_at: None,
            engagement_rate: None,
        }
    }
}

/// One account reading
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountReading {
    pub captured_at: i64,
    pub metrics: AccountMetrics,
}

/// How an account moved between its first and latest reading in a window
#[derive(Debug, Clone, Serialize)]
pub struct AccountGrowth {
    pub platform: Platform,
    pub account: String,
    pub since: i64,
    pub samples: usize,
    pub first: Option<AccountReading>,
    pub latest: Option<AccountReading>,
    pub follower_change: i64,
    /// Only when both readings report the count
    pub post_change: Option<i64>,
    pub view_change: Option<i64>,
}

fn change(first: Option<u64>, latest: Option<u64>) -> Option<i64> {
    Some(latest? as i64 - first? as i64)
}

#[derive(Clone)]
pub struct StatusService {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl StatusService {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Current state of one of `user`'s posts
    pub async fn get_status(&self, user: &str, post_id: &str) -> Result<PostStatusReport> {
        let post = load_owned(&self.db, user, post_id).await?;

        let mut targets = Vec::new();
        for target in self.db.get_targets(post_id).await? {
            let platform = target.platform;
            let published = target.status == TargetStatus::Posted;
            let mut report = TargetReport::new(target);

            if published {
                if let Some(snapshot) = self.db.latest_post_snapshot(post_id, platform).await? {
                    if let MetricSet::Post(metrics) = snapshot.metrics {
                        let followers = self.followers(platform, &report.account).await?;
                        report.engagement_rate =
                            followers.and_then(|count| metrics.engagement_rate(count));
                        report.metrics = Some(metrics);
                        report.metrics_captured_at = Some(snapshot.captured_at);
                    }
                }
            }
            targets.push(report);
        }

        Ok(PostStatusReport {
            id: post.id,
            owner: post.owner,
            state: post.state,
            media_ref: post.media_ref,
            caption: post.caption,
            title: post.title,
            due_at: post.due_at,
            recurrence: post.recurrence,
            recurrence_paused: post.recurrence_paused,
            next_occurrence_id: post.next_occurrence_id,
            created_at: post.created_at,
            updated_at: post.updated_at,
            targets,
        })
    }

    async fn followers(&self, platform: Platform, account: &str) -> Result<Option<u64>> {
        let snapshot = self.db.latest_account_snapshot(platform, account).await?;
        Ok(snapshot.and_then(|s| match s.metrics {
            MetricSet::Account(metrics) => Some(metrics.followers),
            MetricSet::Post(_) => None,
        }))
    }

    /// `user`'s scheduled posts due within `window` from now, soonest first
    pub async fn list_due_soon(
        &self,
        user: &str,
        window: chrono::Duration,
    ) -> Result<Vec<PostRecord>> {
        if window < chrono::Duration::zero() {
            return Err(AutopostError::InvalidInput(
                "Window must not be negative".to_string(),
            ));
        }
        let until = self.clock.now().saturating_add(window.num_seconds());
        self.db.due_soon(user, until).await
    }

    /// Follower, post and view movement of `user`'s `platform` account over
    /// the last `window`
    pub async fn account_growth(
        &self,
        user: &str,
        platform: Platform,
        window: chrono::Duration,
    ) -> Result<AccountGrowth> {
        if window < chrono::Duration::zero() {
            return Err(AutopostError::InvalidInput(
                "Window must not be negative".to_string(),
            ));
        }
        let credential = self.db.get_credential(user, platform).await?.ok_or_else(|| {
            AutopostError::CredentialMissing {
                user: user.to_string(),
                platform,
            }
        })?;

        let since = self.clock.now().saturating_sub(window.num_seconds());
        let readings: Vec<AccountReading> = self
            .db
            .account_history(platform, &credential.account, since)
            .await?
            .into_iter()
            .filter_map(|snapshot| match snapshot.metrics {
                MetricSet::Account(metrics) => Some(AccountReading {
                    captured_at: snapshot.captured_at,
                    metrics,
                }),
                MetricSet::Post(_) => None,
            })
            .collect();

        let first = readings.first().cloned();
        let latest = readings.last().cloned();
        let (follower_change, post_change, view_change) = match (&first, &latest) {
            (Some(a), Some(b)) => (
                b.metrics.followers as i64 - a.metrics.followers as i64,
                change(a.metrics.posts, b.metrics.posts),
                change(a.metrics.total_views, b.metrics.total_views),
            ),
            _ => (0, None, None),
        };

        Ok(AccountGrowth {
            platform,
            account: credential.account,
            since,
            samples: readings.len(),
            first,
            latest,
            follower_change,
            post_change,
            view_change,
        })
    }
}
