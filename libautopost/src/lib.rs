//! Autopost - scheduled multi-platform publishing
//!
//! This library schedules uploaded media for publication on several social
//! platforms, publishes it at the due time through per-platform adapters,
//! retries transient failures, and keeps an append-only history of account
//! and post metrics.
//!
//! The background work is split in three components that share one SQLite
//! database: the [`scheduler::Scheduler`] admits due posts, the
//! [`dispatcher::Dispatcher`] publishes their targets, and
//! [`analytics::AnalyticsSync`] collects metrics. The outward API lives in
//! [`service::PublishingService`].

pub mod analytics;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod media;
pub mod platforms;
pub mod recurrence;
pub mod retry;
pub mod scheduler;
pub mod scheduling;
pub mod service;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{AutopostError, PlatformError, Result};
pub use service::PublishingService;
pub use types::{
    LifecycleState, Platform, PostRecord, Recurrence, Target, TargetSpec, TargetStatus,
};
