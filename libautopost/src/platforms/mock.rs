//! Scripted mock adapter
//!
//! Each capability pops its next outcome from a queue; an empty queue means
//! success with a generated value. Clones share the script and the call
//! counters, so a test can keep one handle and register another.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::time::sleep;

use crate::error::PlatformError;
use crate::platforms::{PlatformAdapter, PlatformResult, PublishRequest, TokenGrant};
use crate::types::{AccountMetrics, Credential, Platform, PostMetrics};

/// Tokens handed out by a scripted refresh
#[derive(Debug, Clone)]
pub struct MockTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Lifetime in seconds
    pub expires_in: Option<u64>,
}

/// One observed publish call
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedItem {
    pub account: String,
    pub caption: String,
    pub title: Option<String>,
    pub file_name: String,
    /// Access token the call was made with
    pub access_token: String,
}

#[derive(Default)]
struct MockState {
    publish: Mutex<VecDeque<PlatformResult<String>>>,
    publish_stalls: Mutex<VecDeque<Duration>>,
    refresh: Mutex<VecDeque<PlatformResult<MockTokens>>>,
    account_metrics: Mutex<VecDeque<PlatformResult<AccountMetrics>>>,
    post_metrics: Mutex<VecDeque<PlatformResult<PostMetrics>>>,
    published: Mutex<Vec<PublishedItem>>,
    publish_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    account_metrics_calls: AtomicUsize,
    post_metrics_calls: AtomicUsize,
}

#[derive(Clone)]
pub struct MockAdapter {
    platform: Platform,
    delay: Duration,
    state: Arc<MockState>,
}

/// Poisoning only happens after a panic in another test thread
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockAdapter {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            delay: Duration::ZERO,
            state: Arc::new(MockState::default()),
        }
    }

    /// Delay every call, simulating network latency
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_publish(&self, outcome: PlatformResult<String>) -> &Self {
        lock(&self.state.publish).push_back(outcome);
        self
    }

    pub fn push_publish_error(&self, error: PlatformError) -> &Self {
        self.push_publish(Err(error))
    }

    /// Make the next publish call hang for `stall` before answering
    pub fn push_publish_stall(&self, stall: Duration) -> &Self {
        lock(&self.state.publish_stalls).push_back(stall);
        self
    }

    pub fn push_refresh(&self, outcome: PlatformResult<MockTokens>) -> &Self {
        lock(&self.state.refresh).push_back(outcome);
        self
    }

    pub fn push_account_metrics(&self, outcome: PlatformResult<AccountMetrics>) -> &Self {
        lock(&self.state.account_metrics).push_back(outcome);
        self
    }

    pub fn push_post_metrics(&self, outcome: PlatformResult<PostMetrics>) -> &Self {
        lock(&self.state.post_metrics).push_back(outcome);
        self
    }

    pub fn publish_calls(&self) -> usize {
        self.state.publish_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.state.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn account_metrics_calls(&self) -> usize {
        self.state.account_metrics_calls.load(Ordering::SeqCst)
    }

    pub fn post_metrics_calls(&self) -> usize {
        self.state.post_metrics_calls.load(Ordering::SeqCst)
    }

    /// Every publish call in order, including failed ones
    pub fn published(&self) -> Vec<PublishedItem> {
        lock(&self.state.published).clone()
    }

    async fn simulate_latency(&self) {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl PlatformAdapter for MockAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn publish(
        &self,
        credential: &Credential,
        request: &PublishRequest<'_>,
    ) -> PlatformResult<String> {
        let call = self.state.publish_calls.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.state.published).push(PublishedItem {
            account: request.account.to_string(),
            caption: request.caption.to_string(),
            title: request.title.map(str::to_string),
            file_name: request.media.file_name.clone(),
            access_token: credential.access_token.expose_secret().to_string(),
        });

        self.simulate_latency().await;
        let stall = lock(&self.state.publish_stalls).pop_front();
        if let Some(stall) = stall {
            sleep(stall).await;
        }

        let scripted = lock(&self.state.publish).pop_front();
        scripted.unwrap_or_else(|| Ok(format!("{}-post-{}", self.platform, call)))
    }

    async fn fetch_account_metrics(
        &self,
        _credential: &Credential,
        _account: &str,
    ) -> PlatformResult<AccountMetrics> {
        self.state
            .account_metrics_calls
            .fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let scripted = lock(&self.state.account_metrics).pop_front();
        scripted.unwrap_or_else(|| Ok(AccountMetrics::default()))
    }

    async fn fetch_post_metrics(
        &self,
        _credential: &Credential,
        _account: &str,
        _platform_post_id: &str,
    ) -> PlatformResult<PostMetrics> {
        self.state.post_metrics_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let scripted = lock(&self.state.post_metrics).pop_front();
        scripted.unwrap_or_else(|| Ok(PostMetrics::default()))
    }

    async fn refresh_credential(&self, _credential: &Credential) -> PlatformResult<TokenGrant> {
        let call = self.state.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.simulate_latency().await;

        let scripted = lock(&self.state.refresh).pop_front();
        let tokens = match scripted {
            Some(outcome) => outcome?,
            None => MockTokens {
                access_token: format!("refreshed-{}", call),
                refresh_token: None,
                expires_in: None,
            },
        };

        Ok(TokenGrant {
            access_token: SecretString::from(tokens.access_token),
            refresh_token: tokens.refresh_token.map(SecretString::from),
            expires_in: tokens.expires_in.map(Duration::from_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaFile;
    use crate::types::CredentialStatus;

    fn credential() -> Credential {
        Credential {
            user: "alice".to_string(),
            platform: Platform::Twitter,
            account: "@alice".to_string(),
            access_token: SecretString::from("token-1"),
            refresh_token: Some(SecretString::from("refresh-1")),
            expires_at: Some(100),
            status: CredentialStatus::Active,
            version: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn test_publish_follows_script_then_succeeds() {
        let adapter = MockAdapter::new(Platform::Twitter);
        adapter
            .push_publish_error(PlatformError::Unavailable("503".into()))
            .push_publish(Ok("tweet-9".into()));

        let media = MediaFile::new("a.png", vec![1]).unwrap();
        let request = PublishRequest {
            account: "@alice",
            media: &media,
            caption: "hello",
            title: None,
        };

        assert!(adapter.publish(&credential(), &request).await.is_err());
        assert_eq!(adapter.publish(&credential(), &request).await.unwrap(), "tweet-9");
        assert_eq!(
            adapter.publish(&credential(), &request).await.unwrap(),
            "twitter-post-3"
        );
        assert_eq!(adapter.publish_calls(), 3);
        assert_eq!(adapter.published()[0].access_token, "token-1");
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let adapter = MockAdapter::new(Platform::YouTube);
        let handle = adapter.clone();

        adapter
            .fetch_account_metrics(&credential(), "UC1")
            .await
            .unwrap();
        assert_eq!(handle.account_metrics_calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_follows_script_then_generates_tokens() {
        let adapter = MockAdapter::new(Platform::Twitter);
        adapter.push_refresh(Ok(MockTokens {
            access_token: "token-2".into(),
            refresh_token: None,
            expires_in: Some(3_600),
        }));

        let scripted = adapter.refresh_credential(&credential()).await.unwrap();
        assert_eq!(scripted.access_token.expose_secret(), "token-2");
        assert!(scripted.refresh_token.is_none());
        assert_eq!(scripted.expires_in, Some(Duration::from_secs(3_600)));

        let generated = adapter.refresh_credential(&credential()).await.unwrap();
        assert_eq!(generated.access_token.expose_secret(), "refreshed-2");
        assert_eq!(generated.expires_in, None);
    }

    #[tokio::test]
    async fn test_refresh_denied() {
        let adapter = MockAdapter::new(Platform::Twitter);
        adapter.push_refresh(Err(PlatformError::RefreshDenied("revoked".into())));

        assert!(matches!(
            adapter.refresh_credential(&credential()).await,
            Err(PlatformError::RefreshDenied(_))
        ));
        assert_eq!(adapter.refresh_calls(), 1);
    }
}
