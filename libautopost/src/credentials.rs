//! Credential store with deduplicated refresh
//!
//! Tokens live in the `credentials` table, one row per (user, platform).
//! [`CredentialStore::resolve`] hands out a token that stays valid for at
//! least the configured margin, refreshing it through the platform adapter
//! when needed. Refreshes are serialized per (user, platform): concurrent
//! callers queue on the same lock and pick up the first caller's result from
//! the database instead of refreshing again.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use libautopost::clock::SystemClock;
//! use libautopost::config::CredentialsConfig;
//! use libautopost::credentials::CredentialStore;
//! use libautopost::platforms::AdapterRegistry;
//! use libautopost::types::Platform;
//! use libautopost::Database;
//!
//! # async fn example() -> libautopost::Result<()> {
//! let db = Database::new("~/.local/share/autopost/autopost.db").await?;
//! let store = CredentialStore::new(
//!     db,
//!     Arc::new(AdapterRegistry::new()),
//!     Arc::new(SystemClock),
//!     &CredentialsConfig::default(),
//! );
//!
//! let credential = store.resolve("alice", Platform::Twitter).await?;
//! println!("posting as {}", credential.account);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::CredentialsConfig;
use crate::db::Database;
use crate::error::{AutopostError, PlatformError, Result};
use crate::lifecycle;
use crate::platforms::AdapterRegistry;
use crate::types::{Credential, CredentialStatus, Platform};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

type RefreshLocks = HashMap<(String, Platform), Arc<tokio::sync::Mutex<()>>>;

pub struct CredentialStore {
    db: Database,
    registry: Arc<AdapterRegistry>,
    clock: Arc<dyn Clock>,
    margin_secs: i64,
    call_timeout: Duration,
    locks: Mutex<RefreshLocks>,
}

impl CredentialStore {
    pub fn new(
        db: Database,
        registry: Arc<AdapterRegistry>,
        clock: Arc<dyn Clock>,
        config: &CredentialsConfig,
    ) -> Self {
        Self {
            db,
            registry,
            clock,
            margin_secs: config.refresh_margin_secs as i64,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Bound every refresh call by `timeout`
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// A usable credential for `user` on `platform`.
    ///
    /// # Errors
    ///
    /// - `CredentialMissing` if the account was never linked
    /// - `CredentialInvalid` if the credential was invalidated, including by a
    ///   refresh denied during this call
    /// - `Platform` for transient refresh failures
    pub async fn resolve(&self, user: &str, platform: Platform) -> Result<Credential> {
        let credential = self.load(user, platform).await?;
        if credential.is_fresh(self.clock.now(), self.margin_secs) {
            return Ok(credential);
        }

        let lock = self.refresh_lock(user, platform);
        let _guard = lock.lock().await;

        // Whoever held the lock before us may have refreshed already
        let credential = self.load(user, platform).await?;
        if credential.is_fresh(self.clock.now(), self.margin_secs) {
            debug!(user, %platform, "Credential refreshed by another caller");
            return Ok(credential);
        }

        self.refresh(credential).await
    }

    /// Refresh after the platform rejected `stale_token`.
    ///
    /// If the stored token no longer matches `stale_token`, someone else
    /// already replaced it and the stored credential is returned without an
    /// adapter call.
    pub async fn force_refresh(
        &self,
        user: &str,
        platform: Platform,
        stale_token: &SecretString,
    ) -> Result<Credential> {
        let lock = self.refresh_lock(user, platform);
        let _guard = lock.lock().await;

        let credential = self.load(user, platform).await?;
        if credential.access_token.expose_secret() != stale_token.expose_secret() {
            debug!(user, %platform, "Stale token already replaced");
            return Ok(credential);
        }

        self.refresh(credential).await
    }

    /// Link (or re-link) an account, storing it as active
    pub async fn link(
        &self,
        user: &str,
        platform: Platform,
        account: &str,
        access_token: SecretString,
        refresh_token: Option<SecretString>,
        expires_at: Option<i64>,
    ) -> Result<Credential> {
        if user.trim().is_empty() || account.trim().is_empty() {
            return Err(AutopostError::InvalidInput(
                "User and account must not be empty".to_string(),
            ));
        }

        let credential = Credential {
            user: user.to_string(),
            platform,
            account: account.to_string(),
            access_token,
            refresh_token,
            expires_at,
            status: CredentialStatus::Active,
            version: 0,
            updated_at: self.clock.now(),
        };
        self.db.upsert_credential(&credential).await?;
        info!(user, %platform, account, "Account linked");

        self.load(user, platform).await
    }

    /// Remove a linked account and fail the user's waiting targets on it.
    ///
    /// Returns the ids of the posts whose targets were failed; those posts are
    /// settled before returning.
    pub async fn unlink(&self, user: &str, platform: Platform) -> Result<Vec<String>> {
        if !self.db.delete_credential(user, platform).await? {
            return Err(AutopostError::CredentialMissing {
                user: user.to_string(),
                platform,
            });
        }

        let reason = format!("{} account was unlinked", platform);
        let affected = self
            .db
            .fail_waiting_targets(user, platform, &reason)
            .await?;
        for post_id in &affected {
            lifecycle::settle(&self.db, self.clock.as_ref(), post_id).await?;
        }

        info!(user, %platform, failed_posts = affected.len(), "Account unlinked");
        Ok(affected)
    }

    async fn load(&self, user: &str, platform: Platform) -> Result<Credential> {
        let credential = self
            .db
            .get_credential(user, platform)
            .await?
            .ok_or_else(|| AutopostError::CredentialMissing {
                user: user.to_string(),
                platform,
            })?;

        match credential.status {
            CredentialStatus::Active => Ok(credential),
            CredentialStatus::Invalid => Err(AutopostError::CredentialInvalid {
                user: user.to_string(),
                platform,
            }),
        }
    }

    /// Refresh `current` through its adapter; the caller holds the key's lock
    async fn refresh(&self, current: Credential) -> Result<Credential> {
        let platform = current.platform;
        let adapter = self.registry.get(platform).ok_or_else(|| {
            AutopostError::Config(crate::error::ConfigError::MissingField(format!(
                "platforms.{}",
                platform
            )))
        })?;

        debug!(user = %current.user, %platform, "Refreshing credential");
        let outcome = match tokio::time::timeout(
            self.call_timeout,
            adapter.refresh_credential(&current),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(PlatformError::Unavailable(format!(
                "Refresh timed out after {}s",
                self.call_timeout.as_secs()
            ))),
        };

        let grant = match outcome {
            Ok(grant) => grant,
            Err(PlatformError::RefreshDenied(reason)) => {
                self.invalidate(&current, &reason).await?;
                return Err(AutopostError::CredentialInvalid {
                    user: current.user,
                    platform,
                });
            }
            Err(error) => {
                warn!(user = %current.user, %platform, error = %error, "Credential refresh failed");
                return Err(error.into());
            }
        };

        let now = self.clock.now();
        let stored = Credential {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.or_else(|| current.refresh_token.clone()),
            expires_at: grant.expires_in.map(|ttl| now + ttl.as_secs() as i64),
            status: CredentialStatus::Active,
            updated_at: now,
            ..current.clone()
        };

        if !self.db.update_credential(&stored).await? {
            // Re-linked while we were refreshing; the re-linked tokens win
            debug!(user = %current.user, %platform, "Credential changed during refresh");
            return self.load(&current.user, platform).await;
        }

        info!(user = %current.user, %platform, "Credential refreshed");
        Ok(Credential {
            version: current.version + 1,
            ..stored
        })
    }

    async fn invalidate(&self, current: &Credential, reason: &str) -> Result<()> {
        let invalid = Credential {
            status: CredentialStatus::Invalid,
            updated_at: self.clock.now(),
            ..current.clone()
        };
        if self.db.update_credential(&invalid).await? {
            warn!(
                user = %current.user,
                platform = %current.platform,
                reason,
                "Refresh denied, credential marked invalid"
            );
        } else {
            debug!(
                user = %current.user,
                platform = %current.platform,
                "Credential re-linked before it could be invalidated"
            );
        }
        Ok(())
    }

    fn refresh_lock(&self, user: &str, platform: Platform) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = lock_map(&self.locks);
        locks
            .entry((user.to_string(), platform))
            .or_default()
            .clone()
    }
}

fn lock_map(locks: &Mutex<RefreshLocks>) -> MutexGuard<'_, RefreshLocks> {
    locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
