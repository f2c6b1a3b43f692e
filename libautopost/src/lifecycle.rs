//! Aggregate lifecycle state of a post
//!
//! The state of an admitted record is derived from its targets and nothing
//! else. [`aggregate`] is that derivation; [`settle`] writes it back.

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::db::Database;
use crate::error::{AutopostError, Result};
use crate::recurrence;
use crate::types::{LifecycleState, Target, TargetStatus};

/// Give up settling after this many lost compare-and-set rounds
const MAX_SETTLE_ROUNDS: usize = 16;

/// The state implied by `targets`, or `None` while any target still has work.
///
/// Cancelled targets are ignored. A record whose targets were all cancelled
/// goes back to `Uploaded`.
pub fn aggregate(targets: &[Target]) -> Option<LifecycleState> {
    if targets.iter().any(|t| !t.status.is_final()) {
        return None;
    }

    let posted = targets
        .iter()
        .filter(|t| t.status == TargetStatus::Posted)
        .count();
    let failed = targets
        .iter()
        .filter(|t| t.status == TargetStatus::Failed)
        .count();

    Some(match (posted, failed) {
        (0, 0) => LifecycleState::Uploaded,
        (_, 0) => LifecycleState::Posted,
        (0, _) => LifecycleState::Failed,
        _ => LifecycleState::PartiallyPosted,
    })
}

/// Recompute and store the aggregate state of an admitted record.
///
/// Records that are not yet admitted (`Uploaded`, `Scheduled`) are left
/// alone. A repeating record that settles gets its next occurrence.
/// Returns the state the record ends up in.
pub async fn settle(db: &Database, clock: &dyn Clock, post_id: &str) -> Result<LifecycleState> {
    for _ in 0..MAX_SETTLE_ROUNDS {
        let post = db
            .get_post(post_id)
            .await?
            .ok_or_else(|| AutopostError::NotFound(format!("post {}", post_id)))?;

        if matches!(
            post.state,
            LifecycleState::Uploaded | LifecycleState::Scheduled
        ) {
            return Ok(post.state);
        }

        let targets = db.get_targets(post_id).await?;
        let Some(next) = aggregate(&targets) else {
            return Ok(post.state);
        };
        if next == post.state {
            return Ok(next);
        }

        if db
            .set_post_state(post_id, post.version, next, clock.now())
            .await?
        {
            debug!(post_id = %post_id, from = %post.state, to = %next, "Post settled");
            if next.is_terminal() {
                continue_series(db, clock, post_id).await;
            }
            return Ok(next);
        }
    }

    Err(AutopostError::Database(crate::error::DbError::Corrupt {
        table: "posts",
        reason: format!("post {} kept changing while settling", post_id),
    }))
}

/// The scheduler sweep picks up anything missed here
async fn continue_series(db: &Database, clock: &dyn Clock, post_id: &str) {
    let post = match db.get_post(post_id).await {
        Ok(Some(post)) => post,
        Ok(None) => return,
        Err(e) => {
            warn!(post_id = %post_id, error = %e, "Could not load settled post");
            return;
        }
    };
    if let Err(e) = recurrence::schedule_next(db, clock, &post).await {
        warn!(post_id = %post_id, error = %e, "Next occurrence not scheduled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Platform, TargetSpec};

    fn targets(statuses: &[TargetStatus]) -> Vec<Target> {
        let platforms = Platform::ALL;
        statuses
            .iter()
            .enumerate()
            .map(|(i, status)| {
                let spec = TargetSpec {
                    platform: platforms[i],
                    account: "acct".to_string(),
                };
                Target {
                    status: *status,
                    ..Target::new("p1".to_string(), &spec)
                }
            })
            .collect()
    }

    use TargetStatus::*;

    #[test]
    fn test_not_final_while_work_remains() {
        assert_eq!(aggregate(&targets(&[Posted, Pending])), None);
        assert_eq!(aggregate(&targets(&[Posted, InFlight])), None);
        assert_eq!(aggregate(&targets(&[Failed, Retrying])), None);
    }

    #[test]
    fn test_all_posted() {
        assert_eq!(
            aggregate(&targets(&[Posted, Posted])),
            Some(LifecycleState::Posted)
        );
    }

    #[test]
    fn test_mixed_outcomes() {
        assert_eq!(
            aggregate(&targets(&[Posted, Failed, Posted])),
            Some(LifecycleState::PartiallyPosted)
        );
    }

    #[test]
    fn test_all_failed() {
        assert_eq!(
            aggregate(&targets(&[Failed, Failed])),
            Some(LifecycleState::Failed)
        );
    }

    #[test]
    fn test_cancelled_targets_are_ignored() {
        assert_eq!(
            aggregate(&targets(&[Posted, Cancelled])),
            Some(LifecycleState::Posted)
        );
        assert_eq!(
            aggregate(&targets(&[Failed, Cancelled])),
            Some(LifecycleState::Failed)
        );
        assert_eq!(
            aggregate(&targets(&[Cancelled, Cancelled])),
            Some(LifecycleState::Uploaded)
        );
    }

    #[test]
    fn test_no_targets_means_nothing_to_publish() {
        assert_eq!(aggregate(&[]), Some(LifecycleState::Uploaded));
    }

    #[test]
    fn test_aggregate_is_order_independent() {
        let forward = targets(&[Posted, Failed, Cancelled]);
        let mut reversed = forward.clone();
        reversed.reverse();
        assert_eq!(aggregate(&forward), aggregate(&reversed));
    }
}
