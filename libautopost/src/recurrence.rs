//! Repeating posts
//!
//! A repeating post is a chain of records, one per occurrence. When an
//! occurrence settles, the next one is stored as a `Scheduled` copy with the
//! same media, caption and targets. The link from the settled record to its
//! follower is written in the same transaction as the follower itself, so a
//! series never forks even when several components settle the same record.

use tracing::{debug, info};

use crate::clock::Clock;
use crate::db::Database;
use crate::error::Result;
use crate::scheduling::next_occurrence;
use crate::types::{LifecycleState, PostRecord, TargetSpec};

/// Create the occurrence following `post` if the series calls for one.
///
/// Returns the new record, or `None` when `post` does not repeat, is paused,
/// has not settled, or already has a follower. Occurrences missed while
/// nothing was running are skipped; the next one is always in the future.
pub async fn schedule_next(
    db: &Database,
    clock: &dyn Clock,
    post: &PostRecord,
) -> Result<Option<PostRecord>> {
    if !post.recurrence.repeats()
        || post.recurrence_paused
        || post.next_occurrence_id.is_some()
        || !post.state.is_terminal()
    {
        return Ok(None);
    }

    let now = clock.now();
    let anchor = post.series_anchor.or(post.due_at).unwrap_or(now);
    let after = post.due_at.unwrap_or(anchor).max(now);
    let Some(due_at) = next_occurrence(post.recurrence, anchor, after) else {
        return Ok(None);
    };

    let targets: Vec<TargetSpec> = db
        .get_targets(&post.id)
        .await?
        .into_iter()
        .map(|t| TargetSpec {
            platform: t.platform,
            account: t.account,
        })
        .collect();

    let next = PostRecord {
        title: post.title.clone(),
        due_at: Some(due_at),
        state: LifecycleState::Scheduled,
        recurrence: post.recurrence,
        series_anchor: Some(anchor),
        ..PostRecord::new(
            post.owner.clone(),
            post.media_ref.clone(),
            post.caption.clone(),
            now,
        )
    };

    if db.create_next_occurrence(&post.id, &next, &targets).await? {
        info!(
            post_id = %post.id,
            next_id = %next.id,
            due_at,
            recurrence = %post.recurrence,
            "Next occurrence scheduled"
        );
        Ok(Some(next))
    } else {
        debug!(post_id = %post.id, "Series already continued or paused");
        Ok(None)
    }
}
