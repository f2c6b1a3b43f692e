//! Core types for Autopost

use std::fmt;
use std::str::FromStr;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AutopostError;

/// External platforms a post can be published to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Instagram,
    Facebook,
    Twitter,
    YouTube,
    TikTok,
}

impl Platform {
    pub const ALL: [Platform; 5] = [
        Platform::Instagram,
        Platform::Facebook,
        Platform::Twitter,
        Platform::YouTube,
        Platform::TikTok,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Instagram => "instagram",
            Platform::Facebook => "facebook",
            Platform::Twitter => "twitter",
            Platform::YouTube => "youtube",
            Platform::TikTok => "tiktok",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = AutopostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "instagram" | "ig" => Ok(Platform::Instagram),
            "facebook" | "fb" => Ok(Platform::Facebook),
            "twitter" | "x" => Ok(Platform::Twitter),
            "youtube" | "yt" => Ok(Platform::YouTube),
            "tiktok" => Ok(Platform::TikTok),
            other => Err(AutopostError::InvalidInput(format!(
                "Unknown platform '{}'. Valid options: instagram, facebook, twitter, youtube, tiktok",
                other
            ))),
        }
    }
}

/// Lifecycle of a post record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uploaded,
    Scheduled,
    Dispatching,
    Posted,
    PartiallyPosted,
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Uploaded => "uploaded",
            LifecycleState::Scheduled => "scheduled",
            LifecycleState::Dispatching => "dispatching",
            LifecycleState::Posted => "posted",
            LifecycleState::PartiallyPosted => "partially_posted",
            LifecycleState::Failed => "failed",
        }
    }

    /// Posted, PartiallyPosted and Failed are only ever set by settling targets
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Posted | LifecycleState::PartiallyPosted | LifecycleState::Failed
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = AutopostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(LifecycleState::Uploaded),
            "scheduled" => Ok(LifecycleState::Scheduled),
            "dispatching" => Ok(LifecycleState::Dispatching),
            "posted" => Ok(LifecycleState::Posted),
            "partially_posted" => Ok(LifecycleState::PartiallyPosted),
            "failed" => Ok(LifecycleState::Failed),
            other => Err(AutopostError::InvalidInput(format!(
                "Unknown lifecycle state '{}'",
                other
            ))),
        }
    }
}

/// How often a post repeats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recurrence {
    #[default]
    Once,
    Daily,
    Weekly,
    Monthly,
}

impl Recurrence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recurrence::Once => "once",
            Recurrence::Daily => "daily",
            Recurrence::Weekly => "weekly",
            Recurrence::Monthly => "monthly",
        }
    }

    pub fn repeats(&self) -> bool {
        *self != Recurrence::Once
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Recurrence {
    type Err = AutopostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "once" | "none" => Ok(Recurrence::Once),
            "daily" => Ok(Recurrence::Daily),
            "weekly" => Ok(Recurrence::Weekly),
            "monthly" => Ok(Recurrence::Monthly),
            other => Err(AutopostError::InvalidInput(format!(
                "Unknown recurrence '{}'. Valid options: once, daily, weekly, monthly",
                other
            ))),
        }
    }
}

/// Per-target publish status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    /// Waiting for its first attempt
    Pending,
    /// Claimed by exactly one worker
    InFlight,
    /// Deferred until `next_attempt_at`
    Retrying,
    Posted,
    /// Permanently failed
    Failed,
    Cancelled,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Pending => "pending",
            TargetStatus::InFlight => "in_flight",
            TargetStatus::Retrying => "retrying",
            TargetStatus::Posted => "posted",
            TargetStatus::Failed => "failed",
            TargetStatus::Cancelled => "cancelled",
        }
    }

    /// A final status needs no further work in the current attempt cycle
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TargetStatus::Posted | TargetStatus::Failed | TargetStatus::Cancelled
        )
    }

    pub fn is_claimable(&self) -> bool {
        matches!(self, TargetStatus::Pending | TargetStatus::Retrying)
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetStatus {
    type Err = AutopostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TargetStatus::Pending),
            "in_flight" => Ok(TargetStatus::InFlight),
            "retrying" => Ok(TargetStatus::Retrying),
            "posted" => Ok(TargetStatus::Posted),
            "failed" => Ok(TargetStatus::Failed),
            "cancelled" => Ok(TargetStatus::Cancelled),
            other => Err(AutopostError::InvalidInput(format!(
                "Unknown target status '{}'",
                other
            ))),
        }
    }
}

/// Classified cause of a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network trouble, platform unavailable, rate limited
    Transient,
    /// Token rejected; one forced refresh-and-retry
    AuthExpired,
    /// No retry
    Permanent,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::AuthExpired => "auth_expired",
            FailureClass::Permanent => "permanent",
        }
    }
}

impl FromStr for FailureClass {
    type Err = AutopostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(FailureClass::Transient),
            "auth_expired" => Ok(FailureClass::AuthExpired),
            "permanent" => Ok(FailureClass::Permanent),
            other => Err(AutopostError::InvalidInput(format!(
                "Unknown failure class '{}'",
                other
            ))),
        }
    }
}

/// A content item and its lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostRecord {
    pub id: String,
    pub owner: String,
    /// Opaque handle into the media store
    pub media_ref: String,
    pub caption: String,
    pub title: Option<String>,
    pub due_at: Option<i64>,
    pub state: LifecycleState,
    pub recurrence: Recurrence,
    /// A paused series creates no further occurrences
    pub recurrence_paused: bool,
    /// Due time the series counts its occurrences from
    pub series_anchor: Option<i64>,
    /// Set once the following occurrence has been created
    pub next_occurrence_id: Option<String>,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl PostRecord {
    /// Create a freshly uploaded record
    pub fn new(owner: String, media_ref: String, caption: String, now: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner,
            media_ref,
            caption,
            title: None,
            due_at: None,
            state: LifecycleState::Uploaded,
            recurrence: Recurrence::Once,
            recurrence_paused: false,
            series_anchor: None,
            next_occurrence_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One (platform, account) publish obligation of a post
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub post_id: String,
    pub platform: Platform,
    pub account: String,
    pub status: TargetStatus,
    /// Publish attempts, including rate-limited ones
    pub attempts: u32,
    pub transient_failures: u32,
    pub rate_limit_hits: u32,
    pub next_attempt_at: Option<i64>,
    pub claimed_at: Option<i64>,
    pub platform_post_id: Option<String>,
    pub posted_at: Option<i64>,
    pub last_error: Option<String>,
    pub failure: Option<FailureClass>,
    pub version: i64,
}

impl Target {
    pub fn new(post_id: String, spec: &TargetSpec) -> Self {
        Self {
            post_id,
            platform: spec.platform,
            account: spec.account.clone(),
            status: TargetStatus::Pending,
            attempts: 0,
            transient_failures: 0,
            rate_limit_hits: 0,
            next_attempt_at: None,
            claimed_at: None,
            platform_post_id: None,
            posted_at: None,
            last_error: None,
            failure: None,
            version: 0,
        }
    }

    /// Whether a worker may claim this target at `now`
    pub fn is_due(&self, now: i64) -> bool {
        self.status.is_claimable() && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// Requested target when scheduling, e.g. `twitter:@acme`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub platform: Platform,
    pub account: String,
}

impl FromStr for TargetSpec {
    type Err = AutopostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (platform, account) = s.split_once(':').ok_or_else(|| {
            AutopostError::InvalidInput(format!(
                "Target '{}' must look like PLATFORM:ACCOUNT (e.g. twitter:@acme)",
                s
            ))
        })?;
        let account = account.trim();
        if account.is_empty() {
            return Err(AutopostError::InvalidInput(format!(
                "Target '{}' is missing an account",
                s
            )));
        }
        Ok(Self {
            platform: platform.parse()?,
            account: account.to_string(),
        })
    }
}

/// A post with all its targets
#[derive(Debug, Clone)]
pub struct PostWithTargets {
    pub post: PostRecord,
    pub targets: Vec<Target>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    Active,
    /// Refresh was denied; the user must re-link
    Invalid,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::Invalid => "invalid",
        }
    }
}

/// Access and refresh tokens for one (user, platform) pair
#[derive(Debug, Clone)]
pub struct Credential {
    pub user: String,
    pub platform: Platform,
    /// Platform-side account id (page id, channel, handle)
    pub account: String,
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    /// Unix seconds; `None` for tokens that never expire
    pub expires_at: Option<i64>,
    pub status: CredentialStatus,
    pub version: i64,
    pub updated_at: i64,
}

impl Credential {
    /// Whether the token is still usable for at least `margin_secs`
    pub fn is_fresh(&self, now: i64, margin_secs: i64) -> bool {
        self.expires_at.map_or(true, |at| at > now + margin_secs)
    }
}

/// Media types accepted by the adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaType {
    Jpeg,
    Png,
    Gif,
    WebP,
    Mp4,
    Mov,
    Avi,
}

impl MediaType {
    /// Detect media type from file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "gif" => Some(Self::Gif),
            "webp" => Some(Self::WebP),
            "mp4" => Some(Self::Mp4),
            "mov" => Some(Self::Mov),
            "avi" => Some(Self::Avi),
            _ => None,
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::WebP => "image/webp",
            Self::Mp4 => "video/mp4",
            Self::Mov => "video/quicktime",
            Self::Avi => "video/x-msvideo",
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, Self::Mp4 | Self::Mov | Self::Avi)
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime())
    }
}

/// Account-level metrics reported by a platform
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountMetrics {
    pub followers: u64,
    pub following: Option<u64>,
    pub posts: Option<u64>,
    pub total_views: Option<u64>,
}

/// Post-level metrics reported by a platform
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostMetrics {
    pub views: Option<u64>,
    pub likes: u64,
    pub comments: u64,
    pub shares: u64,
    pub saves: Option<u64>,
    pub reach: Option<u64>,
    pub impressions: Option<u64>,
}

impl PostMetrics {
    /// Likes, comments and shares per hundred followers of the posting account
    pub fn engagement_rate(&self, followers: u64) -> Option<f64> {
        if followers == 0 {
            return None;
        }
        let interactions = self.likes + self.comments + self.shares;
        Some(interactions as f64 / followers as f64 * 100.0)
    }
}

/// The measured values carried by a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricSet {
    Account(AccountMetrics),
    Post(PostMetrics),
}

/// One immutable, timestamped metrics reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    pub id: Option<i64>,
    pub platform: Platform,
    pub account: String,
    pub post_id: Option<String>,
    pub platform_post_id: Option<String>,
    pub captured_at: i64,
    pub metrics: MetricSet,
}
