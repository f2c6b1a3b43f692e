//! Periodic analytics sync
//!
//! Each cycle appends one account snapshot per active credential and one post
//! snapshot per published target. Snapshots are never updated; history is the
//! sequence of rows. A failing account or post is logged and skipped so the
//! rest of the cycle still runs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::credentials::CredentialStore;
use crate::db::Database;
use crate::error::{AutopostError, PlatformError, Result};
use crate::platforms::{AdapterRegistry, PlatformAdapter, PlatformResult};
use crate::types::{AnalyticsSnapshot, Credential, MetricSet, Platform, Target};

/// Counts for one sync cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub snapshots: usize,
    pub failures: usize,
}

pub struct AnalyticsSync {
    db: Database,
    registry: Arc<AdapterRegistry>,
    credentials: Arc<CredentialStore>,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
}

impl AnalyticsSync {
    pub fn new(
        db: Database,
        registry: Arc<AdapterRegistry>,
        credentials: Arc<CredentialStore>,
        clock: Arc<dyn Clock>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            db,
            registry,
            credentials,
            clock,
            call_timeout,
        }
    }

    /// Capture one round of account and post snapshots
    pub async fn run_cycle(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        for stored in self.db.active_credentials().await? {
            let (user, platform) = (stored.user.clone(), stored.platform);
            match self.sync_account(stored).await {
                Ok(()) => report.snapshots += 1,
                Err(e) => {
                    warn!(user = %user, %platform, error = %e, "Account metrics skipped");
                    report.failures += 1;
                }
            }
        }

        for (owner, target) in self.db.published_targets().await? {
            match self.sync_post(&owner, &target).await {
                Ok(()) => report.snapshots += 1,
                Err(e) => {
                    warn!(
                        post_id = %target.post_id,
                        platform = %target.platform,
                        error = %e,
                        "Post metrics skipped"
                    );
                    report.failures += 1;
                }
            }
        }

        info!(
            snapshots = report.snapshots,
            failures = report.failures,
            "Analytics cycle finished"
        );
        Ok(report)
    }

    async fn sync_account(&self, stored: Credential) -> Result<()> {
        let credential = self.credentials.resolve(&stored.user, stored.platform).await?;
        let adapter = self.adapter(stored.platform)?;

        let metrics = self
            .with_timeout(adapter.fetch_account_metrics(&credential, &credential.account))
            .await?;

        self.db
            .append_snapshot(&AnalyticsSnapshot {
                id: None,
                platform: stored.platform,
                account: credential.account.clone(),
                post_id: None,
                platform_post_id: None,
                captured_at: self.clock.now(),
                metrics: MetricSet::Account(metrics),
            })
            .await?;
        debug!(user = %stored.user, platform = %stored.platform, "Account snapshot stored");
        Ok(())
    }

    async fn sync_post(&self, owner: &str, target: &Target) -> Result<()> {
        let Some(platform_post_id) = target.platform_post_id.as_deref() else {
            return Ok(());
        };
        let credential = self.credentials.resolve(owner, target.platform).await?;
        let adapter = self.adapter(target.platform)?;

        let metrics = self
            .with_timeout(adapter.fetch_post_metrics(&credential, &target.account, platform_post_id))
            .await?;

        self.db
            .append_snapshot(&AnalyticsSnapshot {
                id: None,
                platform: target.platform,
                account: target.account.clone(),
                post_id: Some(target.post_id.clone()),
                platform_post_id: Some(platform_post_id.to_string()),
                captured_at: self.clock.now(),
                metrics: MetricSet::Post(metrics),
            })
            .await?;
        Ok(())
    }

    fn adapter(&self, platform: Platform) -> Result<Arc<dyn PlatformAdapter>> {
        self.registry.get(platform).ok_or_else(|| {
            AutopostError::Config(crate::error::ConfigError::MissingField(format!(
                "platforms.{}",
                platform
            )))
        })
    }

    async fn with_timeout<T>(
        &self,
        call: impl std::future::Future<Output = PlatformResult<T>>,
    ) -> PlatformResult<T> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(PlatformError::Unavailable(format!(
                "Metrics call timed out after {}s",
                self.call_timeout.as_secs()
            ))),
        }
    }

    /// Run a cycle every `interval` until `shutdown` flips to true
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = interval.as_secs(), "Analytics sync started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "Analytics cycle failed");
            }
        }

        info!("Analytics sync stopped");
    }
}
