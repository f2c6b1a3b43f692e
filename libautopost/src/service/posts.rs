//! Post lifecycle operations
//!
//! Every transition reads the record, checks the state it is allowed from,
//! and writes with a compare-and-set on the version it read. A lost race is
//! re-evaluated against the fresh record rather than blindly retried: a
//! cancel that loses to admission becomes a cancel of a dispatching record.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::clock::Clock;
use crate::db::Database;
use crate::error::{AutopostError, Result};
use crate::lifecycle;
use crate::recurrence;
use crate::service::load_owned;
use crate::service::validation::ValidationService;
use crate::types::{
    LifecycleState, MediaType, Platform, PostRecord, Recurrence, TargetSpec, TargetStatus,
};

/// Rounds a transition is re-evaluated after losing a race
const MAX_TRANSITION_ROUNDS: usize = 4;

#[derive(Clone)]
pub struct PostService {
    db: Database,
    clock: Arc<dyn Clock>,
    validation: ValidationService,
}

impl PostService {
    pub fn new(db: Database, clock: Arc<dyn Clock>, validation: ValidationService) -> Self {
        Self {
            db,
            clock,
            validation,
        }
    }

    /// Record an uploaded media item as a new `Uploaded` post
    pub async fn register_upload(
        &self,
        user: &str,
        media_ref: &str,
        caption: &str,
        title: Option<&str>,
    ) -> Result<PostRecord> {
        if user.trim().is_empty() {
            return Err(AutopostError::InvalidInput("User must not be empty".to_string()));
        }
        let supported = Path::new(media_ref)
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(MediaType::from_extension)
            .is_some();
        if media_ref.trim().is_empty() || !supported {
            return Err(AutopostError::InvalidInput(format!(
                "Unsupported media reference '{}'",
                media_ref
            )));
        }

        let mut post = PostRecord::new(
            user.to_string(),
            media_ref.to_string(),
            caption.to_string(),
            self.clock.now(),
        );
        post.title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        self.db.create_post(&post).await?;
        info!(post_id = %post.id, owner = user, "Upload registered");
        Ok(post)
    }

    /// `Uploaded -> Scheduled` with a due time and targets
    pub async fn schedule(
        &self,
        user: &str,
        post_id: &str,
        due_at: i64,
        targets: &[TargetSpec],
    ) -> Result<PostRecord> {
        let post = load_owned(&self.db, user, post_id).await?;
        if post.state != LifecycleState::Uploaded {
            return Err(invalid(&post, "schedule"));
        }

        self.validation
            .validate_schedule(&post, targets)
            .await?
            .into_result()?;

        let now = self.clock.now();
        if !self
            .db
            .schedule_post(post_id, post.version, due_at, targets, now)
            .await?
        {
            let current = load_owned(&self.db, user, post_id).await?;
            return Err(invalid(&current, "schedule"));
        }

        info!(post_id, due_at, targets = targets.len(), "Post scheduled");
        load_owned(&self.db, user, post_id).await
    }

    /// Move the due time of a `Scheduled` post
    pub async fn reschedule(&self, user: &str, post_id: &str, due_at: i64) -> Result<PostRecord> {
        for _ in 0..MAX_TRANSITION_ROUNDS {
            let post = load_owned(&self.db, user, post_id).await?;
            if post.state != LifecycleState::Scheduled {
                return Err(invalid(&post, "reschedule"));
            }

            if self
                .db
                .reschedule_post(post_id, post.version, due_at, self.clock.now())
                .await?
            {
                info!(post_id, due_at, "Post rescheduled");
                return load_owned(&self.db, user, post_id).await;
            }
        }
        Err(contended(post_id))
    }

    /// Cancel a post.
    ///
    /// A `Scheduled` post goes back to `Uploaded`. On a `Dispatching` post
    /// the waiting targets are cancelled and attempts already in flight run
    /// to completion; the post settles from whatever is left.
    pub async fn cancel(&self, user: &str, post_id: &str) -> Result<PostRecord> {
        for _ in 0..MAX_TRANSITION_ROUNDS {
            let post = load_owned(&self.db, user, post_id).await?;
            match post.state {
                LifecycleState::Scheduled => {
                    if self
                        .db
                        .unschedule_post(post_id, post.version, self.clock.now())
                        .await?
                    {
                        info!(post_id, "Scheduled post cancelled");
                        return load_owned(&self.db, user, post_id).await;
                    }
                }
                LifecycleState::Dispatching => {
                    let cancelled = self.db.cancel_waiting_targets(post_id).await?;
                    lifecycle::settle(&self.db, self.clock.as_ref(), post_id).await?;
                    info!(post_id, cancelled, "Dispatching post cancelled");
                    return load_owned(&self.db, user, post_id).await;
                }
                _ => return Err(invalid(&post, "cancel")),
            }
        }
        Err(contended(post_id))
    }

    /// Give one permanently failed target a fresh retry budget.
    ///
    /// The target is picked up by the next scheduler sweep and the post is
    /// re-settled once it reaches a final outcome.
    pub async fn retry_target(
        &self,
        user: &str,
        post_id: &str,
        platform: Platform,
    ) -> Result<PostRecord> {
        for _ in 0..MAX_TRANSITION_ROUNDS {
            let post = load_owned(&self.db, user, post_id).await?;
            if !matches!(
                post.state,
                LifecycleState::PartiallyPosted | LifecycleState::Failed
            ) {
                return Err(invalid(&post, "retry a target"));
            }

            let target = self
                .db
                .get_targets(post_id)
                .await?
                .into_iter()
                .find(|t| t.platform == platform)
                .ok_or_else(|| {
                    AutopostError::NotFound(format!("{} target of post {}", platform, post_id))
                })?;
            if target.status != TargetStatus::Failed {
                return Err(AutopostError::InvalidInput(format!(
                    "The {} target is {}, only failed targets can be retried",
                    platform,
                    target.status.as_str()
                )));
            }

            if self
                .db
                .reset_failed_target(&target, self.clock.now())
                .await?
            {
                info!(post_id, %platform, "Target queued for retry");
                return load_owned(&self.db, user, post_id).await;
            }
        }
        Err(contended(post_id))
    }

    /// Make a post repeat daily, weekly or monthly, or stop it repeating.
    ///
    /// The series counts from the post's due time. Settled occurrences
    /// cannot be changed; change the latest one instead.
    pub async fn set_recurrence(
        &self,
        user: &str,
        post_id: &str,
        recurrence: Recurrence,
    ) -> Result<PostRecord> {
        for _ in 0..MAX_TRANSITION_ROUNDS {
            let post = load_owned(&self.db, user, post_id).await?;
            if post.state.is_terminal() {
                return Err(invalid(&post, "change recurrence"));
            }
            if post.recurrence == recurrence {
                return Ok(post);
            }

            if self
                .db
                .set_recurrence(post_id, post.version, recurrence, self.clock.now())
                .await?
            {
                info!(post_id, %recurrence, "Recurrence changed");
                return load_owned(&self.db, user, post_id).await;
            }
        }
        Err(contended(post_id))
    }

    /// Stop the series `post_id` belongs to from creating further
    /// occurrences. Returns its latest occurrence.
    pub async fn pause_recurrence(&self, user: &str, post_id: &str) -> Result<PostRecord> {
        self.set_paused(user, post_id, true).await
    }

    /// Let a paused series continue.
    ///
    /// If its latest occurrence has already settled, the next one is
    /// scheduled right away and returned.
    pub async fn resume_recurrence(&self, user: &str, post_id: &str) -> Result<PostRecord> {
        let latest = self.set_paused(user, post_id, false).await?;
        match recurrence::schedule_next(&self.db, self.clock.as_ref(), &latest).await? {
            Some(next) => Ok(next),
            None => Ok(latest),
        }
    }

    async fn set_paused(&self, user: &str, post_id: &str, paused: bool) -> Result<PostRecord> {
        for _ in 0..MAX_TRANSITION_ROUNDS {
            let latest = self.latest_occurrence(user, post_id).await?;
            if !latest.recurrence.repeats() {
                return Err(AutopostError::InvalidInput(format!(
                    "Post {} does not repeat",
                    latest.id
                )));
            }
            if latest.recurrence_paused == paused {
                return Ok(latest);
            }

            if self
                .db
                .set_recurrence_paused(&latest.id, latest.version, paused, self.clock.now())
                .await?
            {
                info!(post_id = %latest.id, paused, "Series pause changed");
                return load_owned(&self.db, user, &latest.id).await;
            }
        }
        Err(contended(post_id))
    }

    /// Follow the series links from `post_id` to the newest occurrence
    async fn latest_occurrence(&self, user: &str, post_id: &str) -> Result<PostRecord> {
        let mut post = load_owned(&self.db, user, post_id).await?;
        while let Some(next_id) = post.next_occurrence_id.take() {
            post = load_owned(&self.db, user, &next_id).await?;
        }
        Ok(post)
    }
}

fn invalid(post: &PostRecord, action: &'static str) -> AutopostError {
    AutopostError::InvalidTransition {
        post_id: post.id.clone(),
        state: post.state,
        action,
    }
}

fn contended(post_id: &str) -> AutopostError {
    AutopostError::Database(crate::error::DbError::Corrupt {
        table: "posts",
        reason: format!("post {} kept changing during the update", post_id),
    })
}
