//! End-to-end dispatch scenarios: scheduler tick, dispatcher, settling

mod common;

use std::time::Duration;

use common::Harness;
use libautopost::clock::Clock;
use libautopost::platforms::mock::MockAdapter;
use libautopost::types::FailureClass;
use libautopost::{LifecycleState, Platform, PlatformError, TargetStatus};

fn rate_limited(secs: u64) -> PlatformError {
    PlatformError::RateLimited {
        retry_after: Duration::from_secs(secs),
        message: "slow down".to_string(),
    }
}

#[tokio::test]
async fn test_rate_limited_target_is_retried_until_posted() {
    let h = Harness::new(&[Platform::Facebook, Platform::Instagram]).await;
    h.link("alice", Platform::Facebook, None).await;
    h.link("alice", Platform::Instagram, None).await;
    for _ in 0..3 {
        h.adapter(Platform::Instagram)
            .push_publish_error(rate_limited(30));
    }

    let post_id = h
        .schedule(
            "alice",
            "alice/photo.png",
            &[Platform::Facebook, Platform::Instagram],
            60,
        )
        .await;

    // Nothing is due yet
    assert!(h.drive().await.is_empty());

    h.clock.advance(60);
    let report = h.drive().await;
    assert_eq!(report.admitted, vec![post_id.clone()]);

    let status = h.service.status().get_status("alice", &post_id).await.unwrap();
    assert_eq!(status.state, LifecycleState::Dispatching);
    let facebook = &status.targets[0];
    let instagram = &status.targets[1];
    assert_eq!(facebook.platform, Platform::Facebook);
    assert_eq!(facebook.status, TargetStatus::Posted);
    assert_eq!(instagram.status, TargetStatus::Retrying);
    assert_eq!(instagram.next_attempt_at, Some(h.clock.now() + 30));

    for _ in 0..3 {
        h.clock.advance(30);
        let report = h.drive().await;
        assert!(report.admitted.is_empty());
        assert_eq!(report.resumed, vec![post_id.clone()]);
    }

    let status = h.service.status().get_status("alice", &post_id).await.unwrap();
    assert_eq!(status.state, LifecycleState::Posted);
    let instagram = &status.targets[1];
    assert_eq!(instagram.status, TargetStatus::Posted);
    assert_eq!(instagram.attempts, 4);
    assert_eq!(
        instagram.platform_post_id.as_deref(),
        Some("instagram-post-4")
    );
    assert_eq!(h.adapter(Platform::Facebook).publish_calls(), 1);
    assert_eq!(h.adapter(Platform::Instagram).publish_calls(), 4);

    // Settled records are not picked up again
    h.clock.advance(3_600);
    assert!(h.drive().await.is_empty());
}

#[tokio::test]
async fn test_invalid_media_fails_after_one_call() {
    let h = Harness::new(&[Platform::TikTok]).await;
    h.link("alice", Platform::TikTok, None).await;
    h.adapter(Platform::TikTok)
        .push_publish_error(PlatformError::InvalidMedia("codec".into()));

    let post_id = h
        .schedule("alice", "alice/clip.mp4", &[Platform::TikTok], 0)
        .await;
    h.drive().await;

    let status = h.service.status().get_status("alice", &post_id).await.unwrap();
    assert_eq!(status.state, LifecycleState::Failed);
    assert_eq!(status.targets[0].status, TargetStatus::Failed);
    assert_eq!(status.targets[0].failure, Some(FailureClass::Permanent));
    assert!(status.targets[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("codec"));

    h.clock.advance(3_600);
    h.drive().await;
    assert_eq!(h.adapter(Platform::TikTok).publish_calls(), 1);
}

#[tokio::test]
async fn test_transient_failures_back_off_then_give_up() {
    let h = Harness::new(&[Platform::Twitter]).await;
    h.link("alice", Platform::Twitter, None).await;
    for _ in 0..5 {
        h.adapter(Platform::Twitter)
            .push_publish_error(PlatformError::Unavailable("503".into()));
    }

    let post_id = h
        .schedule("alice", "alice/photo.png", &[Platform::Twitter], 0)
        .await;

    let mut delays = Vec::new();
    for _ in 0..10 {
        h.drive().await;
        let target = h.db().get_targets(&post_id).await.unwrap().remove(0);
        match target.status {
            TargetStatus::Retrying => {
                let next = target.next_attempt_at.unwrap();
                delays.push(next - h.clock.now());
                h.clock.set(next);
            }
            _ => break,
        }
    }

    assert_eq!(delays.len(), 4);
    assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{:?}", delays);
    assert!(delays.iter().all(|d| *d >= 1 && *d <= 300), "{:?}", delays);

    let target = h.db().get_targets(&post_id).await.unwrap().remove(0);
    assert_eq!(target.status, TargetStatus::Failed);
    assert_eq!(target.attempts, 5);
    assert_eq!(target.failure, Some(FailureClass::Permanent));
    assert!(target.last_error.unwrap().contains("Gave up after 5"));
    assert_eq!(h.adapter(Platform::Twitter).publish_calls(), 5);

    let post = h.db().get_post(&post_id).await.unwrap().unwrap();
    assert_eq!(post.state, LifecycleState::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_dispatchers_publish_once() {
    let slow = MockAdapter::new(Platform::YouTube).with_delay(Duration::from_millis(200));
    let h = Harness::with_adapters(vec![slow], |_| {}).await;
    h.link("alice", Platform::YouTube, None).await;

    let post_id = h
        .schedule("alice", "alice/clip.mp4", &[Platform::YouTube], 0)
        .await;
    let tick = h.service.scheduler().tick().await.unwrap();
    assert_eq!(tick.admitted, vec![post_id.clone()]);

    let first = h.service.dispatcher();
    let second = h.service.dispatcher();
    let (a, b) = tokio::join!(
        first.process_record(&post_id),
        second.process_record(&post_id)
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.posted + b.posted, 1);
    assert_eq!(h.adapter(Platform::YouTube).publish_calls(), 1);

    let post = h.db().get_post(&post_id).await.unwrap().unwrap();
    assert_eq!(post.state, LifecycleState::Posted);
}

#[tokio::test]
async fn test_partial_failure_then_retry_target() {
    let h = Harness::new(&[Platform::Facebook, Platform::Twitter]).await;
    h.link("alice", Platform::Facebook, None).await;
    h.link("alice", Platform::Twitter, None).await;
    h.adapter(Platform::Twitter)
        .push_publish_error(PlatformError::Rejected("duplicate status".into()));

    let post_id = h
        .schedule(
            "alice",
            "alice/photo.png",
            &[Platform::Facebook, Platform::Twitter],
            0,
        )
        .await;
    h.drive().await;

    let post = h.db().get_post(&post_id).await.unwrap().unwrap();
    assert_eq!(post.state, LifecycleState::PartiallyPosted);

    let post = h
        .service
        .posts()
        .retry_target("alice", &post_id, Platform::Twitter)
        .await
        .unwrap();
    assert_eq!(post.state, LifecycleState::PartiallyPosted);

    let report = h.drive().await;
    assert_eq!(report.resumed, vec![post_id.clone()]);

    let status = h.service.status().get_status("alice", &post_id).await.unwrap();
    assert_eq!(status.state, LifecycleState::Posted);
    assert_eq!(status.targets[1].status, TargetStatus::Posted);
    assert_eq!(status.targets[1].attempts, 2);
    assert_eq!(h.adapter(Platform::Facebook).publish_calls(), 1);
    assert_eq!(h.adapter(Platform::Twitter).publish_calls(), 2);
}

#[tokio::test]
async fn test_cancel_while_dispatching_keeps_published_targets() {
    let h = Harness::new(&[Platform::Facebook, Platform::Instagram]).await;
    h.link("alice", Platform::Facebook, None).await;
    h.link("alice", Platform::Instagram, None).await;
    h.adapter(Platform::Instagram)
        .push_publish_error(rate_limited(600));

    let post_id = h
        .schedule(
            "alice",
            "alice/photo.png",
            &[Platform::Facebook, Platform::Instagram],
            0,
        )
        .await;
    h.drive().await;

    let post = h.service.posts().cancel("alice", &post_id).await.unwrap();
    assert_eq!(post.state, LifecycleState::Posted);

    let targets = h.db().get_targets(&post_id).await.unwrap();
    assert_eq!(targets[0].status, TargetStatus::Posted);
    assert_eq!(targets[1].status, TargetStatus::Cancelled);

    h.clock.advance(600);
    h.drive().await;
    assert_eq!(h.adapter(Platform::Instagram).publish_calls(), 1);
}

#[tokio::test]
async fn test_cancel_before_any_attempt_returns_to_uploaded() {
    let h = Harness::new(&[Platform::Twitter]).await;
    h.link("alice", Platform::Twitter, None).await;

    let post_id = h
        .schedule("alice", "alice/photo.png", &[Platform::Twitter], 0)
        .await;
    // Admitted but not yet dispatched
    h.service.scheduler().tick().await.unwrap();

    let post = h.service.posts().cancel("alice", &post_id).await.unwrap();
    assert_eq!(post.state, LifecycleState::Uploaded);

    let report = h.service.dispatcher().process_record(&post_id).await.unwrap();
    assert_eq!(report.state, None);
    assert_eq!(h.adapter(Platform::Twitter).publish_calls(), 0);
}

#[tokio::test]
async fn test_publish_timeout_counts_as_unavailable() {
    let h = Harness::with_config(&[Platform::YouTube], |config| {
        config.dispatcher.publish_timeout_secs = 1;
    })
    .await;
    h.link("alice", Platform::YouTube, None).await;
    h.adapter(Platform::YouTube)
        .push_publish_stall(Duration::from_secs(3));

    let post_id = h
        .schedule("alice", "alice/clip.mp4", &[Platform::YouTube], 0)
        .await;
    h.drive().await;

    let target = h.db().get_targets(&post_id).await.unwrap().remove(0);
    assert_eq!(target.status, TargetStatus::Retrying);
    assert_eq!(target.transient_failures, 1);
    assert_eq!(target.failure, Some(FailureClass::Transient));
    assert!(target.last_error.as_deref().unwrap().contains("timed out"));

    // The stall is over; the next due attempt goes through
    h.clock.set(target.next_attempt_at.unwrap());
    let report = h.drive().await;
    assert_eq!(report.resumed, vec![post_id.clone()]);

    let status = h.service.status().get_status("alice", &post_id).await.unwrap();
    assert_eq!(status.state, LifecycleState::Posted);
    assert_eq!(status.targets[0].attempts, 2);
    assert_eq!(h.adapter(Platform::YouTube).publish_calls(), 2);
}
