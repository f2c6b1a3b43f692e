//! Database operations for Autopost
//!
//! Every mutation of a post, target or credential is a compare-and-set on its
//! `version` column: the `UPDATE` carries `WHERE version = ?` and the caller
//! learns from the affected row count whether it won. Multi-statement writes
//! open their transaction with the guarded `UPDATE` so SQLite takes the write
//! lock up front.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::error::{DbError, Result};
use crate::types::{
    AnalyticsSnapshot, Credential, CredentialStatus, FailureClass, LifecycleState, MetricSet,
    Platform, PostRecord, PostWithTargets, Recurrence, Target, TargetSpec, TargetStatus,
};

const POST_COLUMNS: &str = "id, owner, media_ref, caption, title, due_at, state, recurrence, \
     recurrence_paused, series_anchor, next_occurrence_id, version, created_at, updated_at";

const TARGET_COLUMNS: &str = "post_id, platform, account, status, attempts, transient_failures, \
     rate_limit_hits, next_attempt_at, claimed_at, platform_post_id, posted_at, last_error, \
     failure_class, version";

const CREDENTIAL_COLUMNS: &str = "user_id, platform, account, access_token, refresh_token, \
     expires_at, status, version, updated_at";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, running migrations on it
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Posts
    // ------------------------------------------------------------------

    pub async fn create_post(&self, post: &PostRecord) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO posts ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            POST_COLUMNS
        ))
        .bind(&post.id)
        .bind(&post.owner)
        .bind(&post.media_ref)
        .bind(&post.caption)
        .bind(&post.title)
        .bind(post.due_at)
        .bind(post.state.as_str())
        .bind(post.recurrence.as_str())
        .bind(post.recurrence_paused)
        .bind(post.series_anchor)
        .bind(&post.next_occurrence_id)
        .bind(post.version)
        .bind(post.created_at)
        .bind(post.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_post(&self, post_id: &str) -> Result<Option<PostRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM posts WHERE id = ?", POST_COLUMNS))
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_post).transpose()
    }

    /// Targets of a post, ordered by platform name
    pub async fn get_targets(&self, post_id: &str) -> Result<Vec<Target>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM post_targets WHERE post_id = ? ORDER BY platform",
            TARGET_COLUMNS
        ))
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_target).collect()
    }

    pub async fn get_post_with_targets(&self, post_id: &str) -> Result<Option<PostWithTargets>> {
        let Some(post) = self.get_post(post_id).await? else {
            return Ok(None);
        };
        let targets = self.get_targets(post_id).await?;
        Ok(Some(PostWithTargets { post, targets }))
    }

    /// `Uploaded -> Scheduled`, replacing any leftover targets.
    ///
    /// Returns `false` if the record changed since `expected_version` was read.
    pub async fn schedule_post(
        &self,
        post_id: &str,
        expected_version: i64,
        due_at: i64,
        targets: &[TargetSpec],
        now: i64,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let updated = sqlx::query(
            r#"
            UPDATE posts
            SET state = 'scheduled', due_at = ?, series_anchor = ?, version = version + 1,
                updated_at = ?
            WHERE id = ? AND version = ? AND state = 'uploaded'
            "#,
        )
        .bind(due_at)
        .bind(due_at)
        .bind(now)
        .bind(post_id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(DbError::SqlxError)?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM post_targets WHERE post_id = ?")
            .bind(post_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        for spec in targets {
            sqlx::query(
                r#"
                INSERT INTO post_targets (post_id, platform, account, status)
                VALUES (?, ?, ?, 'pending')
                "#,
            )
            .bind(post_id)
            .bind(spec.platform.as_str())
            .bind(&spec.account)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;
        }

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(true)
    }

    /// Move the due time of a `Scheduled` record. A repeating series
    /// continues from the new time.
    pub async fn reschedule_post(
        &self,
        post_id: &str,
        expected_version: i64,
        due_at: i64,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET due_at = ?, series_anchor = ?, version = version + 1, updated_at = ?
            WHERE id = ? AND version = ? AND state = 'scheduled'
            "#,
        )
        .bind(due_at)
        .bind(due_at)
        .bind(now)
        .bind(post_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// `Scheduled -> Uploaded`, dropping the targets
    pub async fn unschedule_post(&self, post_id: &str, expected_version: i64, now: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let updated = sqlx::query(
            r#"
            UPDATE posts
            SET state = 'uploaded', due_at = NULL, version = version + 1, updated_at = ?
            WHERE id = ? AND version = ? AND state = 'scheduled'
            "#,
        )
        .bind(now)
        .bind(post_id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(DbError::SqlxError)?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM post_targets WHERE post_id = ?")
            .bind(post_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(true)
    }

    /// `Scheduled -> Dispatching` for a record that is due at `now`.
    ///
    /// Exactly one caller wins for a given version.
    pub async fn admit_post(&self, post_id: &str, expected_version: i64, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET state = 'dispatching', version = version + 1, updated_at = ?
            WHERE id = ? AND version = ? AND state = 'scheduled'
              AND due_at IS NOT NULL AND due_at <= ?
            "#,
        )
        .bind(now)
        .bind(post_id)
        .bind(expected_version)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Write a settled lifecycle state. Returning to `Uploaded` clears `due_at`.
    pub async fn set_post_state(
        &self,
        post_id: &str,
        expected_version: i64,
        state: LifecycleState,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET state = ?,
                due_at = CASE WHEN ? THEN NULL ELSE due_at END,
                version = version + 1,
                updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(state.as_str())
        .bind(state == LifecycleState::Uploaded)
        .bind(now)
        .bind(post_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Change how a record repeats
    pub async fn set_recurrence(
        &self,
        post_id: &str,
        expected_version: i64,
        recurrence: Recurrence,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET recurrence = ?, series_anchor = COALESCE(series_anchor, due_at),
                version = version + 1, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(recurrence.as_str())
        .bind(now)
        .bind(post_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Pause or resume the newest occurrence of a series. Fails once the
    /// record has a follower.
    pub async fn set_recurrence_paused(
        &self,
        post_id: &str,
        expected_version: i64,
        paused: bool,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET recurrence_paused = ?, version = version + 1, updated_at = ?
            WHERE id = ? AND version = ? AND next_occurrence_id IS NULL
            "#,
        )
        .bind(paused)
        .bind(now)
        .bind(post_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Link `previous` to `next` and store `next` as a `Scheduled` record with
    /// `targets`.
    ///
    /// Returns `false` if `previous` already has a follower, was paused or
    /// stopped repeating.
    pub async fn create_next_occurrence(
        &self,
        previous: &str,
        next: &PostRecord,
        targets: &[TargetSpec],
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let linked = sqlx::query(
            r#"
            UPDATE posts
            SET next_occurrence_id = ?
            WHERE id = ? AND next_occurrence_id IS NULL
              AND recurrence != 'once' AND recurrence_paused = 0
            "#,
        )
        .bind(&next.id)
        .bind(previous)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        if linked.rows_affected() == 0 {
            tx.rollback().await.map_err(DbError::SqlxError)?;
            return Ok(false);
        }

        sqlx::query(&format!(
            "INSERT INTO posts ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            POST_COLUMNS
        ))
        .bind(&next.id)
        .bind(&next.owner)
        .bind(&next.media_ref)
        .bind(&next.caption)
        .bind(&next.title)
        .bind(next.due_at)
        .bind(next.state.as_str())
        .bind(next.recurrence.as_str())
        .bind(next.recurrence_paused)
        .bind(next.series_anchor)
        .bind(&next.next_occurrence_id)
        .bind(next.version)
        .bind(next.created_at)
        .bind(next.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        for spec in targets {
            sqlx::query(
                r#"
                INSERT INTO post_targets (post_id, platform, account, status)
                VALUES (?, ?, ?, 'pending')
                "#,
            )
            .bind(&next.id)
            .bind(spec.platform.as_str())
            .bind(&spec.account)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;
        }

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(true)
    }

    /// Settled, repeating, unpaused records whose next occurrence is missing
    pub async fn series_awaiting_next(&self, limit: u32) -> Result<Vec<PostRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM posts
            WHERE recurrence != 'once' AND recurrence_paused = 0
              AND next_occurrence_id IS NULL
              AND state IN ('posted', 'partially_posted', 'failed')
            ORDER BY updated_at ASC, id ASC
            LIMIT ?
            "#,
            POST_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_post).collect()
    }

    /// `Scheduled` records with `due_at <= now`, oldest first
    pub async fn due_posts(&self, now: i64, limit: u32) -> Result<Vec<PostRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM posts
            WHERE state = 'scheduled' AND due_at IS NOT NULL AND due_at <= ?
            ORDER BY due_at ASC, id ASC
            LIMIT ?
            "#,
            POST_COLUMNS
        ))
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_post).collect()
    }

    /// An owner's `Scheduled` records due at or before `until`
    pub async fn due_soon(&self, owner: &str, until: i64) -> Result<Vec<PostRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM posts
            WHERE owner = ? AND state = 'scheduled' AND due_at IS NOT NULL AND due_at <= ?
            ORDER BY due_at ASC, id ASC
            "#,
            POST_COLUMNS
        ))
        .bind(owner)
        .bind(until)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_post).collect()
    }

    /// Ids of admitted records that still have work to do at `now`.
    ///
    /// Matches records with a deferred target that is due, an in-flight claim
    /// taken at or before `stale_before`, or a `Dispatching` record whose
    /// targets are all final but which was never settled.
    pub async fn resumable_posts(&self, now: i64, stale_before: i64, limit: u32) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT p.id FROM posts p
            WHERE p.state IN ('dispatching', 'partially_posted', 'failed')
              AND (
                EXISTS (
                    SELECT 1 FROM post_targets t
                    WHERE t.post_id = p.id
                      AND (
                        (t.status IN ('pending', 'retrying')
                            AND (t.next_attempt_at IS NULL OR t.next_attempt_at <= ?))
                        OR (t.status = 'in_flight' AND t.claimed_at <= ?)
                      )
                )
                OR (
                    p.state = 'dispatching'
                    AND NOT EXISTS (
                        SELECT 1 FROM post_targets t
                        WHERE t.post_id = p.id
                          AND t.status IN ('pending', 'in_flight', 'retrying')
                    )
                )
              )
            ORDER BY p.id
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(stale_before)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    // ------------------------------------------------------------------
    // Targets
    // ------------------------------------------------------------------

    /// Claim a target for one attempt.
    ///
    /// A claim succeeds on a due `pending`/`retrying` target or on an
    /// `in_flight` target whose claim is at or before `stale_before`. On
    /// success the returned target reflects the stored row.
    pub async fn claim_target(&self, target: &Target, now: i64, stale_before: i64) -> Result<Option<Target>> {
        let result = sqlx::query(
            r#"
            UPDATE post_targets
            SET status = 'in_flight', attempts = attempts + 1, claimed_at = ?, version = version + 1
            WHERE post_id = ? AND platform = ? AND version = ?
              AND (
                (status IN ('pending', 'retrying') AND (next_attempt_at IS NULL OR next_attempt_at <= ?))
                OR (status = 'in_flight' AND claimed_at <= ?)
              )
            "#,
        )
        .bind(now)
        .bind(&target.post_id)
        .bind(target.platform.as_str())
        .bind(target.version)
        .bind(now)
        .bind(stale_before)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(Target {
            status: TargetStatus::InFlight,
            attempts: target.attempts + 1,
            claimed_at: Some(now),
            version: target.version + 1,
            ..target.clone()
        }))
    }

    /// Write every mutable field of `target`, guarded by `target.version`
    pub async fn update_target(&self, target: &Target) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE post_targets
            SET status = ?, attempts = ?, transient_failures = ?, rate_limit_hits = ?,
                next_attempt_at = ?, claimed_at = ?, platform_post_id = ?, posted_at = ?,
                last_error = ?, failure_class = ?, version = version + 1
            WHERE post_id = ? AND platform = ? AND version = ?
            "#,
        )
        .bind(target.status.as_str())
        .bind(i64::from(target.attempts))
        .bind(i64::from(target.transient_failures))
        .bind(i64::from(target.rate_limit_hits))
        .bind(target.next_attempt_at)
        .bind(target.claimed_at)
        .bind(&target.platform_post_id)
        .bind(target.posted_at)
        .bind(&target.last_error)
        .bind(target.failure.map(|f| f.as_str()))
        .bind(&target.post_id)
        .bind(target.platform.as_str())
        .bind(target.version)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Cancel every `pending`/`retrying` target of a post; returns how many
    pub async fn cancel_waiting_targets(&self, post_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE post_targets
            SET status = 'cancelled', next_attempt_at = NULL, version = version + 1
            WHERE post_id = ? AND status IN ('pending', 'retrying')
            "#,
        )
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }

    /// Permanently fail an owner's waiting targets on `platform`.
    ///
    /// Returns the ids of the affected posts.
    pub async fn fail_waiting_targets(&self, owner: &str, platform: Platform, reason: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            UPDATE post_targets
            SET status = 'failed', failure_class = 'permanent', last_error = ?,
                next_attempt_at = NULL, version = version + 1
            WHERE platform = ? AND status IN ('pending', 'retrying')
              AND post_id IN (SELECT id FROM posts WHERE owner = ?)
            RETURNING post_id
            "#,
        )
        .bind(reason)
        .bind(platform.as_str())
        .bind(owner)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let mut post_ids: Vec<String> = rows.iter().map(|r| r.get("post_id")).collect();
        post_ids.sort();
        post_ids.dedup();
        Ok(post_ids)
    }

    /// `failed -> pending` with a fresh retry budget
    pub async fn reset_failed_target(&self, target: &Target, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE post_targets
            SET status = 'pending', transient_failures = 0, rate_limit_hits = 0,
                next_attempt_at = ?, claimed_at = NULL, failure_class = NULL,
                version = version + 1
            WHERE post_id = ? AND platform = ? AND version = ? AND status = 'failed'
            "#,
        )
        .bind(now)
        .bind(&target.post_id)
        .bind(target.platform.as_str())
        .bind(target.version)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Successful targets of `Posted`/`PartiallyPosted` records, with the
    /// owning user
    pub async fn published_targets(&self) -> Result<Vec<(String, Target)>> {
        let rows = sqlx::query(
            r#"
            SELECT p.owner, t.post_id, t.platform, t.account, t.status, t.attempts,
                   t.transient_failures, t.rate_limit_hits, t.next_attempt_at, t.claimed_at,
                   t.platform_post_id, t.posted_at, t.last_error, t.failure_class, t.version
            FROM post_targets t
            JOIN posts p ON p.id = t.post_id
            WHERE p.state IN ('posted', 'partially_posted')
              AND t.status = 'posted' AND t.platform_post_id IS NOT NULL
            ORDER BY p.id, t.platform
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|row| Ok((row.get("owner"), row_to_target(row)?)))
            .collect()
    }

    // ------------------------------------------------------------------
    // Credentials
    // ------------------------------------------------------------------

    pub async fn get_credential(&self, user: &str, platform: Platform) -> Result<Option<Credential>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM credentials WHERE user_id = ? AND platform = ?",
            CREDENTIAL_COLUMNS
        ))
        .bind(user)
        .bind(platform.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_credential).transpose()
    }

    /// Insert or replace a credential as `active`
    pub async fn upsert_credential(&self, credential: &Credential) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credentials (user_id, platform, account, access_token, refresh_token, expires_at, status, version, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 'active', 0, ?)
            ON CONFLICT (user_id, platform) DO UPDATE SET
                account = excluded.account,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                status = 'active',
                version = credentials.version + 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&credential.user)
        .bind(credential.platform.as_str())
        .bind(&credential.account)
        .bind(credential.access_token.expose_secret())
        .bind(credential.refresh_token.as_ref().map(|t| t.expose_secret()))
        .bind(credential.expires_at)
        .bind(credential.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Replace tokens and status, guarded by `credential.version`
    pub async fn update_credential(&self, credential: &Credential) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE credentials
            SET access_token = ?, refresh_token = ?, expires_at = ?, status = ?,
                version = version + 1, updated_at = ?
            WHERE user_id = ? AND platform = ? AND version = ?
            "#,
        )
        .bind(credential.access_token.expose_secret())
        .bind(credential.refresh_token.as_ref().map(|t| t.expose_secret()))
        .bind(credential.expires_at)
        .bind(credential.status.as_str())
        .bind(credential.updated_at)
        .bind(&credential.user)
        .bind(credential.platform.as_str())
        .bind(credential.version)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn delete_credential(&self, user: &str, platform: Platform) -> Result<bool> {
        let result = sqlx::query("DELETE FROM credentials WHERE user_id = ? AND platform = ?")
            .bind(user)
            .bind(platform.as_str())
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn active_credentials(&self) -> Result<Vec<Credential>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM credentials WHERE status = 'active' ORDER BY user_id, platform",
            CREDENTIAL_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_credential).collect()
    }

    // ------------------------------------------------------------------
    // Analytics
    // ------------------------------------------------------------------

    /// Append a snapshot; returns its row id
    pub async fn append_snapshot(&self, snapshot: &AnalyticsSnapshot) -> Result<i64> {
        let metrics = serde_json::to_string(&snapshot.metrics).map_err(|e| DbError::Corrupt {
            table: "analytics_snapshots",
            reason: e.to_string(),
        })?;

        let result = sqlx::query(
            r#"
            INSERT INTO analytics_snapshots (platform, account, post_id, platform_post_id, captured_at, metrics)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(snapshot.platform.as_str())
        .bind(&snapshot.account)
        .bind(&snapshot.post_id)
        .bind(&snapshot.platform_post_id)
        .bind(snapshot.captured_at)
        .bind(metrics)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent post-level snapshot for one target
    pub async fn latest_post_snapshot(&self, post_id: &str, platform: Platform) -> Result<Option<AnalyticsSnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT id, platform, account, post_id, platform_post_id, captured_at, metrics
            FROM analytics_snapshots
            WHERE post_id = ? AND platform = ?
            ORDER BY captured_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(post_id)
        .bind(platform.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_snapshot).transpose()
    }

    /// Most recent account-level snapshot
    pub async fn latest_account_snapshot(&self, platform: Platform, account: &str) -> Result<Option<AnalyticsSnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT id, platform, account, post_id, platform_post_id, captured_at, metrics
            FROM analytics_snapshots
            WHERE platform = ? AND account = ? AND post_id IS NULL
            ORDER BY captured_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(platform.as_str())
        .bind(account)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_snapshot).transpose()
    }

    /// Account-level snapshots captured at or after `since`, oldest first
    pub async fn account_history(&self, platform: Platform, account: &str, since: i64) -> Result<Vec<AnalyticsSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT id, platform, account, post_id, platform_post_id, captured_at, metrics
            FROM analytics_snapshots
            WHERE platform = ? AND account = ? AND post_id IS NULL AND captured_at >= ?
            ORDER BY captured_at ASC, id ASC
            "#,
        )
        .bind(platform.as_str())
        .bind(account)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_snapshot).collect()
    }

    /// All snapshots for an account, oldest first
    pub async fn account_snapshots(&self, platform: Platform, account: &str) -> Result<Vec<AnalyticsSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT id, platform, account, post_id, platform_post_id, captured_at, metrics
            FROM analytics_snapshots
            WHERE platform = ? AND account = ?
            ORDER BY captured_at ASC, id ASC
            "#,
        )
        .bind(platform.as_str())
        .bind(account)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_snapshot).collect()
    }
}

fn parse_column<T: FromStr>(row: &SqliteRow, table: &'static str, column: &str) -> Result<T> {
    let raw: String = row.get(column);
    raw.parse().map_err(|_| {
        DbError::Corrupt {
            table,
            reason: format!("unexpected {} '{}'", column, raw),
        }
        .into()
    })
}

fn count_column(row: &SqliteRow, table: &'static str, column: &str) -> Result<u32> {
    let raw: i64 = row.get(column);
    u32::try_from(raw).map_err(|_| {
        DbError::Corrupt {
            table,
            reason: format!("{} out of range: {}", column, raw),
        }
        .into()
    })
}

fn row_to_post(row: &SqliteRow) -> Result<PostRecord> {
    Ok(PostRecord {
        id: row.get("id"),
        owner: row.get("owner"),
        media_ref: row.get("media_ref"),
        caption: row.get("caption"),
        title: row.get("title"),
        due_at: row.get("due_at"),
        state: parse_column(row, "posts", "state")?,
        recurrence: parse_column(row, "posts", "recurrence")?,
        recurrence_paused: row.get("recurrence_paused"),
        series_anchor: row.get("series_anchor"),
        next_occurrence_id: row.get("next_occurrence_id"),
        version: row.get("version"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_target(row: &SqliteRow) -> Result<Target> {
    let failure: Option<String> = row.get("failure_class");
    let failure = failure
        .map(|raw| {
            raw.parse::<FailureClass>().map_err(|_| DbError::Corrupt {
                table: "post_targets",
                reason: format!("unexpected failure_class '{}'", raw),
            })
        })
        .transpose()?;

    Ok(Target {
        post_id: row.get("post_id"),
        platform: parse_column(row, "post_targets", "platform")?,
        account: row.get("account"),
        status: parse_column(row, "post_targets", "status")?,
        attempts: count_column(row, "post_targets", "attempts")?,
        transient_failures: count_column(row, "post_targets", "transient_failures")?,
        rate_limit_hits: count_column(row, "post_targets", "rate_limit_hits")?,
        next_attempt_at: row.get("next_attempt_at"),
        claimed_at: row.get("claimed_at"),
        platform_post_id: row.get("platform_post_id"),
        posted_at: row.get("posted_at"),
        last_error: row.get("last_error"),
        failure,
        version: row.get("version"),
    })
}

fn row_to_credential(row: &SqliteRow) -> Result<Credential> {
    let status = match row.get::<String, _>("status").as_str() {
        "active" => CredentialStatus::Active,
        "invalid" => CredentialStatus::Invalid,
        other => {
            return Err(DbError::Corrupt {
                table: "credentials",
                reason: format!("unexpected status '{}'", other),
            }
            .into())
        }
    };
    let access_token: String = row.get("access_token");
    let refresh_token: Option<String> = row.get("refresh_token");

    Ok(Credential {
        user: row.get("user_id"),
        platform: parse_column(row, "credentials", "platform")?,
        account: row.get("account"),
        access_token: SecretString::from(access_token),
        refresh_token: refresh_token.map(SecretString::from),
        expires_at: row.get("expires_at"),
        status,
        version: row.get("version"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_snapshot(row: &SqliteRow) -> Result<AnalyticsSnapshot> {
    let raw: String = row.get("metrics");
    let metrics: MetricSet = serde_json::from_str(&raw).map_err(|e| DbError::Corrupt {
        table: "analytics_snapshots",
        reason: e.to_string(),
    })?;

    Ok(AnalyticsSnapshot {
        id: Some(row.get("id")),
        platform: parse_column(row, "analytics_snapshots", "platform")?,
        account: row.get("account"),
        post_id: row.get("post_id"),
        platform_post_id: row.get("platform_post_id"),
        captured_at: row.get("captured_at"),
        metrics,
    })
}
