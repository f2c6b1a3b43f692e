//! Token refresh as seen by the dispatcher and by concurrent callers

mod common;

use std::time::Duration;

use common::{Harness, START};
use futures::future::join_all;
use libautopost::platforms::mock::MockAdapter;
use libautopost::types::{CredentialStatus, FailureClass};
use libautopost::{
    AutopostError, LifecycleState, Platform, PlatformError, TargetSpec, TargetStatus,
};
use secrecy::ExposeSecret;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolves_refresh_once() {
    let slow = MockAdapter::new(Platform::Twitter).with_delay(Duration::from_millis(100));
    let h = Harness::with_adapters(vec![slow], |_| {}).await;
    // Inside the default five minute margin
    h.link("alice", Platform::Twitter, Some(START + 10)).await;

    let store = h.service.credentials();
    let resolved = join_all((0..8).map(|_| store.resolve("alice", Platform::Twitter))).await;

    for credential in resolved {
        let credential = credential.unwrap();
        assert_eq!(credential.access_token.expose_secret(), "refreshed-1");
    }
    assert_eq!(h.adapter(Platform::Twitter).refresh_calls(), 1);

    let stored = h
        .db()
        .get_credential("alice", Platform::Twitter)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.access_token.expose_secret(), "refreshed-1");
    assert_eq!(stored.refresh_token.unwrap().expose_secret(), "refresh");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dispatching_two_posts_shares_one_refresh() {
    let slow = MockAdapter::new(Platform::Twitter).with_delay(Duration::from_millis(50));
    let h = Harness::with_adapters(vec![slow], |_| {}).await;
    h.link("alice", Platform::Twitter, Some(START + 3_600)).await;

    let first = h
        .schedule("alice", "alice/one.png", &[Platform::Twitter], 3_500)
        .await;
    let second = h
        .schedule("alice", "alice/two.png", &[Platform::Twitter], 3_500)
        .await;

    h.clock.advance(3_500);
    let tick = h.service.scheduler().tick().await.unwrap();
    assert_eq!(tick.admitted.len(), 2);

    let dispatcher = h.service.dispatcher();
    let (a, b) = tokio::join!(
        dispatcher.process_record(&first),
        dispatcher.process_record(&second)
    );
    assert_eq!(a.unwrap().posted, 1);
    assert_eq!(b.unwrap().posted, 1);

    let adapter = h.adapter(Platform::Twitter);
    assert_eq!(adapter.refresh_calls(), 1);
    assert!(adapter
        .published()
        .iter()
        .all(|item| item.access_token == "refreshed-1"));
}

#[tokio::test]
async fn test_refresh_denied_fails_target_without_publishing() {
    let h = Harness::new(&[Platform::YouTube]).await;
    h.link("alice", Platform::YouTube, Some(START + 3_600)).await;
    h.adapter(Platform::YouTube)
        .push_refresh(Err(PlatformError::RefreshDenied("invalid_grant".into())));

    let post_id = h
        .schedule("alice", "alice/clip.mp4", &[Platform::YouTube], 3_600)
        .await;
    h.clock.advance(3_600);
    h.drive().await;

    let status = h.service.status().get_status("alice", &post_id).await.unwrap();
    assert_eq!(status.state, LifecycleState::Failed);
    assert_eq!(status.targets[0].status, TargetStatus::Failed);
    assert_eq!(status.targets[0].failure, Some(FailureClass::Permanent));
    assert!(status.targets[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("re-link"));

    let adapter = h.adapter(Platform::YouTube);
    assert_eq!(adapter.publish_calls(), 0);
    assert_eq!(adapter.refresh_calls(), 1);

    let stored = h
        .db()
        .get_credential("alice", Platform::YouTube)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, CredentialStatus::Invalid);

    // Invalid credentials are not refreshed again
    let err = h
        .service
        .credentials()
        .resolve("alice", Platform::YouTube)
        .await
        .unwrap_err();
    assert!(matches!(err, AutopostError::CredentialInvalid { .. }));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(adapter.refresh_calls(), 1);

    // Nor can new work be scheduled until the account is linked again
    h.media.insert("alice/again.mp4", vec![1; 8]).unwrap();
    let post = h
        .service
        .posts()
        .register_upload("alice", "alice/again.mp4", "again", None)
        .await
        .unwrap();
    let targets: Vec<TargetSpec> =
        vec![format!("youtube:{}", common::account_name("alice", Platform::YouTube))
            .parse()
            .unwrap()];
    let err = h
        .service
        .posts()
        .schedule("alice", &post.id, START + 7_200, &targets)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("re-linked"), "{}", err);

    h.link("alice", Platform::YouTube, None).await;
    h.service
        .posts()
        .schedule("alice", &post.id, START + 7_200, &targets)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unlink_fails_waiting_targets() {
    let h = Harness::new(&[Platform::Twitter, Platform::Facebook]).await;
    h.link("alice", Platform::Twitter, None).await;
    h.link("alice", Platform::Facebook, None).await;
    h.link("bob", Platform::Twitter, None).await;

    let alice_post = h
        .schedule(
            "alice",
            "alice/photo.png",
            &[Platform::Twitter, Platform::Facebook],
            60,
        )
        .await;
    let bob_post = h
        .schedule("bob", "bob/photo.png", &[Platform::Twitter], 60)
        .await;

    let affected = h
        .service
        .accounts()
        .unlink_account("alice", Platform::Twitter)
        .await
        .unwrap();
    assert_eq!(affected, vec![alice_post.clone()]);

    h.clock.advance(60);
    h.drive().await;

    let alice = h
        .service
        .status()
        .get_status("alice", &alice_post)
        .await
        .unwrap();
    assert_eq!(alice.state, LifecycleState::PartiallyPosted);
    let twitter = alice
        .targets
        .iter()
        .find(|t| t.platform == Platform::Twitter)
        .unwrap();
    assert_eq!(twitter.status, TargetStatus::Failed);
    assert_eq!(twitter.attempts, 0);

    let bob = h.service.status().get_status("bob", &bob_post).await.unwrap();
    assert_eq!(bob.state, LifecycleState::Posted);
    assert_eq!(h.adapter(Platform::Twitter).publish_calls(), 1);

    let err = h
        .service
        .accounts()
        .unlink_account("alice", Platform::Twitter)
        .await
        .unwrap_err();
    assert!(matches!(err, AutopostError::CredentialMissing { .. }));
}
