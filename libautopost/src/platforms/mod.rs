//! Platform abstraction and implementations
//!
//! Every external platform is reached through one [`PlatformAdapter`]. The
//! dispatcher and the analytics job only ever see the trait; adapters are
//! looked up by [`Platform`] in an [`AdapterRegistry`].
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use libautopost::platforms::{mock::MockAdapter, AdapterRegistry};
//! use libautopost::types::Platform;
//!
//! let mut registry = AdapterRegistry::new();
//! registry.register(Arc::new(MockAdapter::new(Platform::Twitter)));
//! assert!(registry.get(Platform::Twitter).is_some());
//! ```

use std::collections::HashMap;
use std::time::Duration;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::config::Config;
use crate::error::{PlatformError, Result};
use crate::media::MediaFile;
use crate::types::{AccountMetrics, Credential, MediaType, Platform, PostMetrics};

pub mod facebook;
pub mod http;
pub mod instagram;
pub mod tiktok;
pub mod twitter;
pub mod youtube;

// Available outside tests so integration tests and dry runs can use it
pub mod mock;

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// Longest an adapter polls while a platform processes an upload. The
/// dispatcher's publish timeout must leave room for it.
pub const PROCESSING_WAIT: Duration = Duration::from_secs(300);

/// What to publish, and where
#[derive(Debug, Clone, Copy)]
pub struct PublishRequest<'a> {
    /// Platform-side account (page id, channel, handle)
    pub account: &'a str,
    pub media: &'a MediaFile,
    pub caption: &'a str,
    /// Used by video platforms; adapters fall back to the caption
    pub title: Option<&'a str>,
}

impl PublishRequest<'_> {
    /// Title for platforms that require one, at most `max_chars` long
    pub fn title_or_caption(&self, max_chars: usize) -> String {
        let raw = self
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| self.caption.lines().next().unwrap_or(""));
        let title: String = raw.trim().chars().take(max_chars).collect();
        if title.is_empty() {
            "Untitled".to_string()
        } else {
            title
        }
    }
}

/// Tokens issued by a successful refresh
///
/// The lifetime is relative; the credential store turns it into an expiry
/// with its own clock.
#[derive(Clone)]
pub struct TokenGrant {
    pub access_token: SecretString,
    /// `None` when the platform did not rotate the refresh token
    pub refresh_token: Option<SecretString>,
    pub expires_in: Option<Duration>,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Capability surface every platform implements
///
/// Adapters are shared between workers, take the credential as an argument
/// and keep no per-call mutable state. Every method is a network call and is
/// wrapped in a timeout by the caller.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// The platform this adapter talks to
    fn platform(&self) -> Platform;

    /// Publish one media item with its caption
    ///
    /// # Returns
    ///
    /// The platform's identifier for the new post.
    ///
    /// # Errors
    ///
    /// - `AuthExpired` if the access token was rejected
    /// - `RateLimited` with the platform's requested wait
    /// - `InvalidMedia` if the platform refuses the file
    /// - `Unavailable` / `Network` for server or transport trouble
    /// - `Rejected` / `Protocol` for refused requests and unexpected responses
    async fn publish(
        &self,
        credential: &Credential,
        request: &PublishRequest<'_>,
    ) -> PlatformResult<String>;

    /// Fetch follower-level metrics for `account`
    async fn fetch_account_metrics(
        &self,
        credential: &Credential,
        account: &str,
    ) -> PlatformResult<AccountMetrics>;

    /// Fetch engagement metrics for one published post
    async fn fetch_post_metrics(
        &self,
        credential: &Credential,
        account: &str,
        platform_post_id: &str,
    ) -> PlatformResult<PostMetrics>;

    /// Exchange the credential's refresh token for fresh tokens
    ///
    /// # Errors
    ///
    /// Returns `RefreshDenied` when the platform refuses the refresh; the
    /// credential is unusable until the user re-links the account.
    async fn refresh_credential(&self, credential: &Credential) -> PlatformResult<TokenGrant>;

    /// Check the media against this platform's format and size limits
    fn validate_media(&self, media: &MediaFile) -> PlatformResult<()> {
        MediaConstraints::for_platform(self.platform()).check(media)
    }
}

/// Accepted formats and sizes for one platform
#[derive(Debug, Clone)]
pub struct MediaConstraints {
    pub platform: Platform,
    /// Empty when the platform does not accept images at all
    pub image_types: &'static [MediaType],
    pub max_image_bytes: u64,
    pub video_types: &'static [MediaType],
    pub max_video_bytes: u64,
}

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

impl MediaConstraints {
    pub fn for_platform(platform: Platform) -> Self {
        use MediaType::*;

        match platform {
            Platform::Instagram => Self {
                platform,
                image_types: &[Jpeg, Png],
                max_image_bytes: 8 * MB,
                video_types: &[Mp4, Mov],
                max_video_bytes: 100 * MB,
            },
            Platform::Facebook => Self {
                platform,
                image_types: &[Jpeg, Png, Gif, WebP],
                max_image_bytes: 4 * MB,
                video_types: &[Mp4, Mov, Avi],
                max_video_bytes: 4 * GB,
            },
            Platform::Twitter => Self {
                platform,
                image_types: &[Jpeg, Png, Gif, WebP],
                max_image_bytes: 5 * MB,
                video_types: &[Mp4, Mov],
                max_video_bytes: 512 * MB,
            },
            Platform::YouTube => Self {
                platform,
                image_types: &[],
                max_image_bytes: 0,
                video_types: &[Mp4, Mov, Avi],
                max_video_bytes: 2 * GB,
            },
            Platform::TikTok => Self {
                platform,
                image_types: &[],
                max_image_bytes: 0,
                video_types: &[Mp4, Mov, Avi],
                max_video_bytes: 4 * GB,
            },
        }
    }

    pub fn check(&self, media: &MediaFile) -> PlatformResult<()> {
        let (allowed, max_bytes, kind) = if media.media_type.is_video() {
            (self.video_types, self.max_video_bytes, "video")
        } else {
            (self.image_types, self.max_image_bytes, "image")
        };

        if allowed.is_empty() {
            return Err(PlatformError::InvalidMedia(format!(
                "{} only accepts video uploads",
                self.platform
            )));
        }
        if !allowed.contains(&media.media_type) {
            return Err(PlatformError::InvalidMedia(format!(
                "{} does not accept {} files",
                self.platform, media.media_type
            )));
        }
        if media.len() as u64 > max_bytes {
            return Err(PlatformError::InvalidMedia(format!(
                "{} {} limit is {} MB (got {} bytes)",
                self.platform,
                kind,
                max_bytes / MB,
                media.len()
            )));
        }
        Ok(())
    }
}

/// OAuth application identity shared by an adapter's token refreshes
#[derive(Clone, Default)]
pub struct AppCredentials {
    pub client_id: Option<String>,
    pub client_secret: Option<SecretString>,
}

impl AppCredentials {
    pub fn new(client_id: Option<String>, client_secret: Option<String>) -> Self {
        Self {
            client_id,
            client_secret: client_secret.map(SecretString::from),
        }
    }

    pub(crate) fn require_client_id(&self, platform: Platform) -> PlatformResult<&str> {
        self.client_id.as_deref().ok_or_else(|| {
            PlatformError::RefreshDenied(format!("No client_id configured for {}", platform))
        })
    }
}

/// Adapters keyed by platform
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Platform, Arc<dyn PlatformAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for its platform
    pub fn register(&mut self, adapter: Arc<dyn PlatformAdapter>) {
        self.adapters.insert(adapter.platform(), adapter);
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters.get(&platform).cloned()
    }

    /// Registered platforms in a stable order
    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<_> = self.adapters.keys().copied().collect();
        platforms.sort();
        platforms
    }

    /// Build the HTTP adapters for every enabled `[platforms.*]` section
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = http::build_client(
            config.dispatcher.call_timeout(),
            config.dispatcher.publish_timeout(),
        )?;
        let mut registry = Self::new();

        for (platform, platform_config) in config.enabled_platforms()? {
            let app = AppCredentials::new(
                platform_config.client_id.clone(),
                platform_config.client_secret.clone(),
            );
            let api_base = platform_config.api_base.clone();
            let adapter: Arc<dyn PlatformAdapter> = match platform {
                Platform::Instagram => {
                    Arc::new(instagram::InstagramAdapter::new(client.clone(), app, api_base))
                }
                Platform::Facebook => {
                    Arc::new(facebook::FacebookAdapter::new(client.clone(), app, api_base))
                }
                Platform::Twitter => {
                    Arc::new(twitter::TwitterAdapter::new(client.clone(), app, api_base))
                }
                Platform::YouTube => {
                    Arc::new(youtube::YouTubeAdapter::new(client.clone(), app, api_base))
                }
                Platform::TikTok => {
                    Arc::new(tiktok::TikTokAdapter::new(client.clone(), app, api_base))
                }
            };
            registry.register(adapter);
        }

        Ok(registry)
    }
}
