//! Scheduler: admits due records and re-enqueues unfinished work
//!
//! Admission is a compare-and-set from `Scheduled` to `Dispatching`, so a
//! record is handed to the dispatcher exactly once no matter how many
//! schedulers tick at the same time. The sweep that follows only re-enqueues
//! ids; per-target claims decide who actually does the work. Each tick also
//! continues repeating series whose next occurrence was not created when
//! they settled.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::db::Database;
use crate::error::Result;
use crate::recurrence;

/// What one tick handed to the dispatcher
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Records this tick moved to `Dispatching`
    pub admitted: Vec<String>,
    /// Already admitted records with due retries or abandoned claims
    pub resumed: Vec<String>,
    /// Occurrences created for repeating series; not due yet
    pub continued: Vec<String>,
}

impl TickReport {
    /// Every record id to enqueue, admitted first
    pub fn record_ids(&self) -> impl Iterator<Item = &String> {
        self.admitted.iter().chain(self.resumed.iter())
    }

    /// Nothing to dispatch
    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty() && self.resumed.is_empty()
    }
}

#[derive(Clone)]
pub struct Scheduler {
    db: Database,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(db: Database, clock: Arc<dyn Clock>, config: SchedulerConfig) -> Self {
        Self { db, clock, config }
    }

    /// Run one admission pass and one sweep
    pub async fn tick(&self) -> Result<TickReport> {
        let now = self.clock.now();
        let mut report = TickReport::default();

        for post in self.db.due_posts(now, self.config.batch_size).await? {
            if self.db.admit_post(&post.id, post.version, now).await? {
                info!(post_id = %post.id, owner = %post.owner, "Post admitted for dispatch");
                report.admitted.push(post.id);
            } else {
                debug!(post_id = %post.id, "Post admitted by another scheduler");
            }
        }

        let stale_before = now - self.config.stale_claim_secs as i64;
        let admitted: HashSet<&String> = report.admitted.iter().collect();
        let resumed: Vec<String> = self
            .db
            .resumable_posts(now, stale_before, self.config.batch_size)
            .await?
            .into_iter()
            .filter(|id| !admitted.contains(id))
            .collect();
        report.resumed = resumed;

        if !report.resumed.is_empty() {
            debug!(count = report.resumed.len(), "Re-enqueueing unfinished posts");
        }

        for post in self.db.series_awaiting_next(self.config.batch_size).await? {
            match recurrence::schedule_next(&self.db, self.clock.as_ref(), &post).await {
                Ok(Some(next)) => report.continued.push(next.id),
                Ok(None) => {}
                Err(e) => warn!(post_id = %post.id, error = %e, "Series not continued"),
            }
        }
        Ok(report)
    }

    /// Tick on the configured interval, sending record ids to `queue`, until
    /// `shutdown` flips to true or the queue closes
    pub async fn run(&self, queue: mpsc::Sender<String>, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.tick_interval_secs.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.config.tick_interval_secs,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            let report = match self.tick().await {
                Ok(report) => report,
                Err(e) => {
                    // Nothing was committed; the next tick sees the same rows
                    error!(error = %e, "Scheduler tick failed");
                    continue;
                }
            };

            for post_id in report.record_ids() {
                if queue.send(post_id.clone()).await.is_err() {
                    info!("Dispatch queue closed, stopping scheduler");
                    return;
                }
            }
        }

        info!("Scheduler stopped");
    }
}
