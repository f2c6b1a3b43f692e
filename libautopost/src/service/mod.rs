//! Service layer for Autopost
//!
//! The outward API consumed by the CLI and by embedding applications. Every
//! call takes the acting user explicitly; there is no ambient current user.
//!
//! # Architecture
//!
//! `PublishingService` is the entry point and owns the shared components
//! (database, adapter registry, credential store, media store, clock). It
//! hands out specialized sub-services:
//!
//! - `PostService`: register uploads, schedule, reschedule, cancel, retry,
//!   repeating series
//! - `StatusService`: per-post status with metrics, upcoming posts, account growth
//! - `AccountService`: link and unlink platform accounts
//! - `ValidationService`: checks a schedule request before it is stored
//!
//! and builds the three background components the daemon runs.
//!
//! # Example
//!
//! ```no_run
//! use libautopost::service::PublishingService;
//! use libautopost::types::TargetSpec;
//!
//! # async fn example() -> libautopost::Result<()> {
//! let service = PublishingService::new().await?;
//!
//! let post = service
//!     .posts()
//!     .register_upload("alice", "alice/launch.mp4", "Launch day!", None)
//!     .await?;
//! let targets: Vec<TargetSpec> = vec!["youtube:UC123".parse()?, "tiktok:@alice".parse()?];
//! let due_at = chrono::Utc::now().timestamp() + 3600;
//! service.posts().schedule("alice", &post.id, due_at, &targets).await?;
//! # Ok(())
//! # }
//! ```

pub mod accounts;
pub mod posts;
pub mod status;
pub mod validation;

use std::sync::Arc;

use crate::analytics::AnalyticsSync;
use crate::clock::{Clock, SystemClock};
use crate::credentials::CredentialStore;
use crate::db::Database;
use crate::dispatcher::Dispatcher;
use crate::error::{AutopostError, Result};
use crate::media::{FsMediaStore, MediaStore};
use crate::platforms::AdapterRegistry;
use crate::scheduler::Scheduler;
use crate::types::PostRecord;
use crate::Config;

use self::accounts::AccountService;
use self::posts::PostService;
use self::status::StatusService;
use self::validation::ValidationService;

/// Main service facade
///
/// All sub-services share one `Database`, one `AdapterRegistry` and one
/// `CredentialStore`, so a refresh triggered through any of them is seen by
/// all the others.
pub struct PublishingService {
    config: Arc<Config>,
    db: Database,
    registry: Arc<AdapterRegistry>,
    credentials: Arc<CredentialStore>,
    media: Arc<dyn MediaStore>,
    clock: Arc<dyn Clock>,
    posts: PostService,
    status: StatusService,
    accounts: AccountService,
}

impl PublishingService {
    /// Create a service from the default configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be loaded, the database
    /// cannot be opened or migrated, or a platform section is invalid.
    pub async fn new() -> Result<Self> {
        let config = Config::load()?;
        Self::from_config(config).await
    }

    /// Create a service with HTTP adapters and a filesystem media store
    pub async fn from_config(config: Config) -> Result<Self> {
        let db = Database::new(&config.db_path()).await?;
        let registry = AdapterRegistry::from_config(&config)?;
        let media = FsMediaStore::new(config.media.root_path());

        Ok(Self::from_parts(
            config,
            db,
            registry,
            Arc::new(media),
            Arc::new(SystemClock),
        ))
    }

    /// Assemble a service from already built components
    ///
    /// Tests use this to plug in mock adapters, an in-memory media store and
    /// a manual clock.
    pub fn from_parts(
        config: Config,
        db: Database,
        registry: AdapterRegistry,
        media: Arc<dyn MediaStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(registry);
        let credentials = Arc::new(
            CredentialStore::new(
                db.clone(),
                Arc::clone(&registry),
                Arc::clone(&clock),
                &config.credentials,
            )
            .with_call_timeout(config.dispatcher.call_timeout()),
        );

        let validation = ValidationService::new(db.clone(), Arc::clone(&registry));
        let posts = PostService::new(db.clone(), Arc::clone(&clock), validation);
        let status = StatusService::new(db.clone(), Arc::clone(&clock));
        let accounts = AccountService::new(Arc::clone(&credentials));

        Self {
            config,
            db,
            registry,
            credentials,
            media,
            clock,
            posts,
            status,
            accounts,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// Upload registration and lifecycle transitions
    pub fn posts(&self) -> &PostService {
        &self.posts
    }

    /// Read-only views of posts
    pub fn status(&self) -> &StatusService {
        &self.status
    }

    /// Account linking
    pub fn accounts(&self) -> &AccountService {
        &self.accounts
    }

    /// Scheduler over this service's database and clock
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.db.clone(),
            Arc::clone(&self.clock),
            self.config.scheduler.clone(),
        )
    }

    /// Dispatcher sharing this service's adapters and credential store
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.db.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.credentials),
            Arc::clone(&self.media),
            Arc::clone(&self.clock),
            &self.config.dispatcher,
        )
        .with_stale_claim_secs(self.config.scheduler.stale_claim_secs)
    }

    /// Analytics sync sharing this service's adapters and credential store
    pub fn analytics(&self) -> AnalyticsSync {
        AnalyticsSync::new(
            self.db.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.credentials),
            Arc::clone(&self.clock),
            self.config.dispatcher.call_timeout(),
        )
    }
}

/// Load a post on behalf of `user`.
///
/// Another user's post is reported exactly like a missing one.
pub(crate) async fn load_owned(db: &Database, user: &str, post_id: &str) -> Result<PostRecord> {
    match db.get_post(post_id).await? {
        Some(post) if post.owner == user => Ok(post),
        _ => Err(AutopostError::NotFound(format!("post {}", post_id))),
    }
}
