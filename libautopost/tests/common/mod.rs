//! Shared setup for the pipeline integration tests
//!
//! Every harness gets its own file database in a temp dir, scripted mock
//! adapters, an in-memory media store and a manual clock.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use libautopost::clock::{Clock, ManualClock};
use libautopost::media::InMemoryMediaStore;
use libautopost::platforms::mock::MockAdapter;
use libautopost::platforms::{AdapterRegistry, PlatformAdapter};
use libautopost::scheduler::TickReport;
use libautopost::service::accounts::AccountTokens;
use libautopost::{Config, Database, Platform, PublishingService, TargetSpec};
use secrecy::SecretString;
use tempfile::TempDir;

pub const START: i64 = 1_700_000_000;

pub struct Harness {
    pub service: PublishingService,
    pub clock: ManualClock,
    pub media: Arc<InMemoryMediaStore>,
    adapters: HashMap<Platform, MockAdapter>,
    _temp_dir: TempDir,
}

impl Harness {
    pub async fn new(platforms: &[Platform]) -> Self {
        Self::with_config(platforms, |_| {}).await
    }

    pub async fn with_config(platforms: &[Platform], tweak: impl FnOnce(&mut Config)) -> Self {
        Self::with_adapters(
            platforms.iter().map(|p| MockAdapter::new(*p)).collect(),
            tweak,
        )
        .await
    }

    pub async fn with_adapters(mocks: Vec<MockAdapter>, tweak: impl FnOnce(&mut Config)) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("autopost.db");

        let mut config = Config::default_config();
        config.database.path = db_path.to_string_lossy().to_string();
        tweak(&mut config);

        let db = Database::new(&config.database.path).await.unwrap();

        let mut registry = AdapterRegistry::new();
        let mut adapters = HashMap::new();
        for mock in mocks {
            adapters.insert(mock.platform(), mock.clone());
            registry.register(Arc::new(mock));
        }

        let clock = ManualClock::new(START);
        let media = Arc::new(InMemoryMediaStore::new());
        let service = PublishingService::from_parts(
            config,
            db,
            registry,
            media.clone(),
            Arc::new(clock.clone()),
        );

        Self {
            service,
            clock,
            media,
            adapters,
            _temp_dir: temp_dir,
        }
    }

    pub fn db(&self) -> &Database {
        self.service.database()
    }

    pub fn adapter(&self, platform: Platform) -> &MockAdapter {
        &self.adapters[&platform]
    }

    /// Link `user`'s account on `platform`
    pub async fn link(&self, user: &str, platform: Platform, expires_at: Option<i64>) {
        self.service
            .accounts()
            .link_account(
                user,
                platform,
                &account_name(user, platform),
                AccountTokens {
                    access_token: SecretString::from(format!("{}-{}-token", user, platform)),
                    refresh_token: Some(SecretString::from("refresh")),
                    expires_at,
                },
            )
            .await
            .unwrap();
    }

    /// Upload `media_ref` for `user` and schedule it `delay` seconds from now
    pub async fn schedule(
        &self,
        user: &str,
        media_ref: &str,
        platforms: &[Platform],
        delay: i64,
    ) -> String {
        self.media.insert(media_ref, vec![7u8; 64]).unwrap();
        let post = self
            .service
            .posts()
            .register_upload(user, media_ref, "Hello from the test suite", None)
            .await
            .unwrap();

        let targets: Vec<TargetSpec> = platforms
            .iter()
            .map(|p| TargetSpec {
                platform: *p,
                account: account_name(user, *p),
            })
            .collect();
        self.service
            .posts()
            .schedule(user, &post.id, self.clock.now() + delay, &targets)
            .await
            .unwrap();
        post.id
    }

    /// One scheduler tick followed by processing of every record it returned
    pub async fn drive(&self) -> TickReport {
        let report = self.service.scheduler().tick().await.unwrap();
        let dispatcher = self.service.dispatcher();
        for post_id in report.record_ids() {
            dispatcher.process_record(post_id).await.unwrap();
        }
        report
    }
}

pub fn account_name(user: &str, platform: Platform) -> String {
    format!("{}@{}", user, platform)
}
