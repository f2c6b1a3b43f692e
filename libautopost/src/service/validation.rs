//! Schedule request validation
//!
//! Catches what can be known before anything is stored: an empty or
//! duplicated target list, platforms without an adapter or a linked account,
//! media the platform does not take, and captions over the platform limit.
//! Size limits need the file itself and are checked by the adapter at publish
//! time.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use crate::db::Database;
use crate::error::{AutopostError, Result};
use crate::platforms::{AdapterRegistry, MediaConstraints};
use crate::types::{CredentialStatus, MediaType, Platform, PostRecord, TargetSpec};

/// Caption length limit in characters
pub fn caption_limit(platform: Platform) -> usize {
    match platform {
        Platform::Twitter => 280,
        Platform::Instagram => 2_200,
        Platform::TikTok => 2_200,
        Platform::YouTube => 5_000,
        Platform::Facebook => 63_206,
    }
}

/// Problems found with a schedule request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// `InvalidInput` listing every problem, or `Ok` if there were none
    pub fn into_result(self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(AutopostError::InvalidInput(self.errors.join("; ")))
        }
    }
}

#[derive(Clone)]
pub struct ValidationService {
    db: Database,
    registry: Arc<AdapterRegistry>,
}

impl ValidationService {
    pub fn new(db: Database, registry: Arc<AdapterRegistry>) -> Self {
        Self { db, registry }
    }

    /// Check that `post` can be scheduled to `targets`
    pub async fn validate_schedule(
        &self,
        post: &PostRecord,
        targets: &[TargetSpec],
    ) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();

        if targets.is_empty() {
            report.errors.push("At least one target is required".to_string());
            return Ok(report);
        }

        let media_type = Path::new(&post.media_ref)
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(MediaType::from_extension);

        let mut seen = HashSet::new();
        for target in targets {
            let platform = target.platform;
            if !seen.insert(platform) {
                report
                    .errors
                    .push(format!("{} is targeted more than once", platform));
                continue;
            }

            if self.registry.get(platform).is_none() {
                report
                    .errors
                    .push(format!("{} is not enabled in the configuration", platform));
            }

            match self.db.get_credential(&post.owner, platform).await? {
                None => report
                    .errors
                    .push(format!("No {} account linked for {}", platform, post.owner)),
                Some(c) if c.status == CredentialStatus::Invalid => report.errors.push(format!(
                    "The {} account must be re-linked before scheduling",
                    platform
                )),
                Some(_) => {}
            }

            if let Some(media_type) = media_type {
                let constraints = MediaConstraints::for_platform(platform);
                let allowed = if media_type.is_video() {
                    constraints.video_types
                } else {
                    constraints.image_types
                };
                if !allowed.contains(&media_type) {
                    report
                        .errors
                        .push(format!("{} does not accept {} files", platform, media_type));
                }
            }

            let limit = caption_limit(platform);
            let length = post.caption.chars().count();
            if length > limit {
                report.errors.push(format!(
                    "Caption is {} characters; {} allows {}",
                    length, platform, limit
                ));
            }
        }

        if media_type.is_none() {
            report
                .errors
                .push(format!("Unsupported media type: {}", post.media_ref));
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::mock::MockAdapter;
    use crate::types::Credential;
    use secrecy::SecretString;
    use sqlx::SqlitePool;

    async fn service(platforms: &[Platform], linked: &[Platform]) -> ValidationService {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let db = Database::from_pool(pool).await.unwrap();

        let mut registry = AdapterRegistry::new();
        for platform in platforms {
            registry.register(Arc::new(MockAdapter::new(*platform)));
        }
        for platform in linked {
            db.upsert_credential(&Credential {
                user: "alice".into(),
                platform: *platform,
                account: "acct".into(),
                access_token: SecretString::from("t"),
                refresh_token: None,
                expires_at: None,
                status: CredentialStatus::Active,
                version: 0,
                updated_at: 0,
            })
            .await
            .unwrap();
        }

        ValidationService::new(db, Arc::new(registry))
    }

    fn post(media_ref: &str, caption: &str) -> PostRecord {
        PostRecord::new("alice".into(), media_ref.into(), caption.into(), 0)
    }

    fn target(platform: Platform) -> TargetSpec {
        TargetSpec {
            platform,
            account: "acct".into(),
        }
    }

    #[tokio::test]
    async fn test_valid_request() {
        let service = service(&[Platform::YouTube], &[Platform::YouTube]).await;
        let report = service
            .validate_schedule(&post("clip.mp4", "hi"), &[target(Platform::YouTube)])
            .await
            .unwrap();
        assert!(report.is_valid(), "{:?}", report);
    }

    #[tokio::test]
    async fn test_empty_targets() {
        let service = service(&[], &[]).await;
        let report = service
            .validate_schedule(&post("clip.mp4", "hi"), &[])
            .await
            .unwrap();
        assert!(matches!(
            report.into_result(),
            Err(AutopostError::InvalidInput(msg)) if msg.contains("At least one target")
        ));
    }

    #[tokio::test]
    async fn test_duplicate_platform_and_unlinked_account() {
        let service = service(&[Platform::Twitter], &[]).await;
        let report = service
            .validate_schedule(
                &post("a.png", "hi"),
                &[target(Platform::Twitter), target(Platform::Twitter)],
            )
            .await
            .unwrap();
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors.iter().any(|e| e.contains("more than once")));
        assert!(report.errors.iter().any(|e| e.contains("No twitter account")));
    }

    #[tokio::test]
    async fn test_image_to_video_platform() {
        let service = service(&[Platform::TikTok], &[Platform::TikTok]).await;
        let report = service
            .validate_schedule(&post("a.jpg", "hi"), &[target(Platform::TikTok)])
            .await
            .unwrap();
        assert!(report.errors[0].contains("does not accept"));
    }

    #[tokio::test]
    async fn test_caption_limit() {
        let service = service(&[Platform::Twitter], &[Platform::Twitter]).await;
        let caption = "x".repeat(281);
        let report = service
            .validate_schedule(&post("a.png", &caption), &[target(Platform::Twitter)])
            .await
            .unwrap();
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("281 characters"));
    }
}
