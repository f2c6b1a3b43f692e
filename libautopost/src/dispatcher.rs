//! Dispatcher: publishes the targets of admitted records
//!
//! Record ids arrive on a queue. Every due target of a record is attempted
//! independently, behind a semaphore that bounds concurrent publish calls
//! across the whole pool. A target is only ever worked on by the worker that
//! won its compare-and-set claim. An id that is already being processed is
//! dropped when it arrives again, so a backlog does not pile up duplicate
//! tasks waiting for permits they would only use to lose a claim.
//!
//! Failed attempts are never slept on: the target is written back as
//! `retrying` with a `next_attempt_at`, and the scheduler sweep enqueues the
//! record again once that time has passed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::{DispatcherConfig, SchedulerConfig};
use crate::credentials::CredentialStore;
use crate::db::Database;
use crate::error::{AutopostError, PlatformError, Result};
use crate::lifecycle;
use crate::media::MediaStore;
use crate::platforms::{AdapterRegistry, PlatformAdapter, PublishRequest};
use crate::retry::{give_up, RetryPolicy};
use crate::types::{
    Credential, FailureClass, LifecycleState, PostRecord, Target, TargetStatus,
};

/// Result of one target attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Posted(String),
    /// Written back as `retrying`
    Deferred,
    Failed(FailureClass),
    /// Claimed by someone else, or not due
    Skipped,
}

/// What processing one record did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordReport {
    pub posted: usize,
    pub deferred: usize,
    pub failed: usize,
    pub skipped: usize,
    /// State after settling; `None` if the record was not dispatchable
    pub state: Option<LifecycleState>,
}

impl RecordReport {
    fn record(&mut self, outcome: &AttemptOutcome) {
        match outcome {
            AttemptOutcome::Posted(_) => self.posted += 1,
            AttemptOutcome::Deferred => self.deferred += 1,
            AttemptOutcome::Failed(_) => self.failed += 1,
            AttemptOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Why an attempt did not produce a post
enum AttemptError {
    Platform(PlatformError),
    /// Not an adapter error, but equally final (unusable credential, no adapter)
    Permanent(String),
}

impl From<PlatformError> for AttemptError {
    fn from(error: PlatformError) -> Self {
        AttemptError::Platform(error)
    }
}

pub struct Dispatcher {
    db: Database,
    registry: Arc<AdapterRegistry>,
    credentials: Arc<CredentialStore>,
    media: Arc<dyn MediaStore>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    publish_timeout: Duration,
    stale_claim_secs: i64,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Marks a record id as being processed until dropped
pub struct RecordGuard {
    ids: Arc<Mutex<HashSet<String>>>,
    post_id: String,
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        lock_ids(&self.ids).remove(&self.post_id);
    }
}

fn lock_ids(ids: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Dispatcher {
    pub fn new(
        db: Database,
        registry: Arc<AdapterRegistry>,
        credentials: Arc<CredentialStore>,
        media: Arc<dyn MediaStore>,
        clock: Arc<dyn Clock>,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            db,
            registry,
            credentials,
            media,
            clock,
            policy: RetryPolicy::from_config(config),
            publish_timeout: config.publish_timeout(),
            stale_claim_secs: SchedulerConfig::default().stale_claim_secs as i64,
            permits: Arc::new(Semaphore::new(config.workers.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Mark `post_id` as being processed, unless it already is
    pub fn track(&self, post_id: &str) -> Option<RecordGuard> {
        if !lock_ids(&self.in_flight).insert(post_id.to_string()) {
            return None;
        }
        Some(RecordGuard {
            ids: Arc::clone(&self.in_flight),
            post_id: post_id.to_string(),
        })
    }

    /// Records currently queued for a permit or being published
    pub fn in_flight_records(&self) -> usize {
        lock_ids(&self.in_flight).len()
    }

    /// In-flight claims older than `secs` may be taken over
    pub fn with_stale_claim_secs(mut self, secs: u64) -> Self {
        self.stale_claim_secs = secs as i64;
        self
    }

    /// Attempt every due target of `post_id`, then settle the record
    pub async fn process_record(&self, post_id: &str) -> Result<RecordReport> {
        let mut report = RecordReport::default();

        let Some(post) = self.db.get_post(post_id).await? else {
            warn!(post_id, "Queued post no longer exists");
            return Ok(report);
        };
        if !matches!(
            post.state,
            LifecycleState::Dispatching | LifecycleState::PartiallyPosted | LifecycleState::Failed
        ) {
            debug!(post_id, state = %post.state, "Post is not dispatchable");
            return Ok(report);
        }

        let now = self.clock.now();
        let stale_before = now - self.stale_claim_secs;
        let targets: Vec<Target> = self
            .db
            .get_targets(post_id)
            .await?
            .into_iter()
            .filter(|t| {
                t.is_due(now)
                    || (t.status == TargetStatus::InFlight
                        && t.claimed_at.map_or(false, |at| at <= stale_before))
            })
            .collect();

        let attempts = targets
            .into_iter()
            .map(|target| self.attempt_target(&post, target));
        for outcome in join_all(attempts).await {
            match outcome {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    // The claim stays in flight and is picked up again once stale
                    error!(post_id, error = %e, "Target attempt aborted");
                    report.skipped += 1;
                }
            }
        }

        report.state = Some(lifecycle::settle(&self.db, self.clock.as_ref(), post_id).await?);
        Ok(report)
    }

    /// Claim and attempt one target
    pub async fn attempt_target(&self, post: &PostRecord, target: Target) -> Result<AttemptOutcome> {
        let Ok(_permit) = self.permits.acquire().await else {
            return Ok(AttemptOutcome::Skipped);
        };

        let now = self.clock.now();
        let Some(claimed) = self
            .db
            .claim_target(&target, now, now - self.stale_claim_secs)
            .await?
        else {
            debug!(post_id = %post.id, platform = %target.platform, "Target claimed elsewhere");
            return Ok(AttemptOutcome::Skipped);
        };

        debug!(
            post_id = %post.id,
            platform = %claimed.platform,
            attempt = claimed.attempts,
            "Publishing target"
        );
        let result = self.publish(post, &claimed).await?;

        let now = self.clock.now();
        let (next, outcome) = match result {
            Ok(platform_post_id) => {
                info!(
                    post_id = %post.id,
                    platform = %claimed.platform,
                    platform_post_id = %platform_post_id,
                    "Target published"
                );
                let next = Target {
                    status: TargetStatus::Posted,
                    platform_post_id: Some(platform_post_id.clone()),
                    posted_at: Some(now),
                    next_attempt_at: None,
                    last_error: None,
                    failure: None,
                    ..claimed.clone()
                };
                (next, AttemptOutcome::Posted(platform_post_id))
            }
            Err(AttemptError::Platform(error)) => {
                let next = self
                    .policy
                    .on_failure(&claimed, &error, now, &mut rand::thread_rng());
                (next.clone(), self.failure_outcome(post, &next, &error.to_string()))
            }
            Err(AttemptError::Permanent(message)) => {
                let next = give_up(&claimed, FailureClass::Permanent, message.clone());
                (next.clone(), self.failure_outcome(post, &next, &message))
            }
        };

        if !self.db.update_target(&next).await? {
            // Our claim went stale and another worker took the target over
            warn!(
                post_id = %post.id,
                platform = %claimed.platform,
                "Lost target claim before recording the outcome"
            );
            return Ok(AttemptOutcome::Skipped);
        }
        Ok(outcome)
    }

    fn failure_outcome(&self, post: &PostRecord, next: &Target, message: &str) -> AttemptOutcome {
        if next.status == TargetStatus::Retrying {
            info!(
                post_id = %post.id,
                platform = %next.platform,
                next_attempt_at = next.next_attempt_at,
                error = message,
                "Target deferred"
            );
            AttemptOutcome::Deferred
        } else {
            warn!(
                post_id = %post.id,
                platform = %next.platform,
                error = message,
                "Target failed"
            );
            AttemptOutcome::Failed(next.failure.unwrap_or(FailureClass::Permanent))
        }
    }

    /// Everything between a won claim and the outcome to record.
    ///
    /// The outer `Result` carries system failures only.
    async fn publish(
        &self,
        post: &PostRecord,
        target: &Target,
    ) -> Result<std::result::Result<String, AttemptError>> {
        let credential = match self.credentials.resolve(&post.owner, target.platform).await {
            Ok(credential) => credential,
            Err(e) => return credential_failure(e),
        };

        let Some(adapter) = self.registry.get(target.platform) else {
            return Ok(Err(AttemptError::Permanent(format!(
                "No adapter registered for {}",
                target.platform
            ))));
        };

        let media = match self.media.open(&post.media_ref).await {
            Ok(media) => media,
            Err(e) => return Ok(Err(e.into())),
        };

        let request = PublishRequest {
            account: &target.account,
            media: &media,
            caption: &post.caption,
            title: post.title.as_deref(),
        };

        match self.call_publish(adapter.as_ref(), &credential, &request).await {
            Err(PlatformError::AuthExpired(reason)) => {
                info!(
                    post_id = %post.id,
                    platform = %target.platform,
                    reason = %reason,
                    "Token rejected, forcing a refresh"
                );
                let refreshed = match self
                    .credentials
                    .force_refresh(&post.owner, target.platform, &credential.access_token)
                    .await
                {
                    Ok(refreshed) => refreshed,
                    Err(e) => return credential_failure(e),
                };
                // The retry does not count against the attempt budget
                Ok(self
                    .call_publish(adapter.as_ref(), &refreshed, &request)
                    .await
                    .map_err(AttemptError::from))
            }
            other => Ok(other.map_err(AttemptError::from)),
        }
    }

    async fn call_publish(
        &self,
        adapter: &dyn PlatformAdapter,
        credential: &Credential,
        request: &PublishRequest<'_>,
    ) -> std::result::Result<String, PlatformError> {
        match tokio::time::timeout(self.publish_timeout, adapter.publish(credential, request)).await
        {
            Ok(result) => result,
            Err(_) => Err(PlatformError::Unavailable(format!(
                "Publish timed out after {}s",
                self.publish_timeout.as_secs()
            ))),
        }
    }

    /// Consume record ids until the queue closes or `shutdown` flips to true,
    /// then wait for in-flight records to finish
    pub async fn run(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tasks = JoinSet::new();
        info!("Dispatcher started");

        loop {
            tokio::select! {
                received = queue.recv() => {
                    let Some(post_id) = received else { break };
                    let Some(guard) = self.track(&post_id) else {
                        debug!(post_id = %post_id, "Post already being processed");
                        continue;
                    };
                    let dispatcher = Arc::clone(&self);
                    tasks.spawn(async move {
                        let _guard = guard;
                        if let Err(e) = dispatcher.process_record(&post_id).await {
                            error!(post_id = %post_id, error = %e, "Failed to process post");
                        }
                    });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Dispatch task panicked");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "Waiting for in-flight posts");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Dispatch task panicked");
            }
        }
        info!("Dispatcher stopped");
    }
}

/// Map a credential lookup error onto the attempt
fn credential_failure(error: AutopostError) -> Result<std::result::Result<String, AttemptError>> {
    match error {
        AutopostError::CredentialInvalid { .. }
        | AutopostError::CredentialMissing { .. }
        | AutopostError::Config(_) => Ok(Err(AttemptError::Permanent(error.to_string()))),
        AutopostError::Platform(e) => Ok(Err(AttemptError::Platform(e))),
        other => Err(other),
    }
}
