//! Integration tests for the autopost-send daemon

use assert_cmd::Command;
use libautopost::types::{Credential, CredentialStatus, TargetSpec};
use libautopost::{Database, LifecycleState, Platform, PostRecord, TargetStatus};
use predicates::prelude::*;
use secrecy::SecretString;
use std::fs;
use tempfile::TempDir;

struct TestEnv {
    temp_dir: TempDir,
    config_path: String,
    db_path: String,
}

/// Config whose YouTube endpoint refuses connections
fn setup_test_env() -> TestEnv {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    let db_path = temp_dir.path().join("test.db");
    let media_root = temp_dir.path().join("media");
    fs::create_dir_all(media_root.join("alice")).unwrap();
    fs::write(media_root.join("alice").join("clip.mp4"), b"not really a video").unwrap();

    let config_content = format!(
        r#"
[database]
path = "{}"

[media]
root = "{}"

[dispatcher]
call_timeout_secs = 5
base_delay_secs = 60

[analytics]
enabled = false

[platforms.youtube]
enabled = true
client_id = "test-client"
api_base = "http://127.0.0.1:1/"
"#,
        db_path.display().to_string().replace('\\', "/"),
        media_root.display().to_string().replace('\\', "/")
    );
    fs::write(&config_path, config_content).unwrap();

    TestEnv {
        config_path: config_path.to_string_lossy().to_string(),
        db_path: db_path.to_string_lossy().to_string(),
        temp_dir,
    }
}

/// A YouTube post that was due ten seconds ago
async fn create_due_post(db_path: &str) -> String {
    let db = Database::new(db_path).await.unwrap();
    let now = unix_now();

    db.upsert_credential(&Credential {
        user: "alice".into(),
        platform: Platform::YouTube,
        account: "UC123".into(),
        access_token: SecretString::from("token"),
        refresh_token: None,
        expires_at: None,
        status: CredentialStatus::Active,
        version: 0,
        updated_at: now,
    })
    .await
    .unwrap();

    let post = PostRecord::new(
        "alice".into(),
        "alice/clip.mp4".into(),
        "Daemon test".into(),
        now - 60,
    );
    db.create_post(&post).await.unwrap();
    let targets = [TargetSpec {
        platform: Platform::YouTube,
        account: "UC123".into(),
    }];
    assert!(db
        .schedule_post(&post.id, post.version, now - 10, &targets, now - 60)
        .await
        .unwrap());

    post.id
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn send(config_path: &str) -> Command {
    let mut cmd = Command::cargo_bin("autopost-send").unwrap();
    cmd.env("AUTOPOST_CONFIG", config_path)
        .env_remove("AUTOPOST_DB_PATH")
        .env_remove("AUTOPOST_LOG_LEVEL")
        .env_remove("AUTOPOST_LOG_FORMAT")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help_message() {
    Command::cargo_bin("autopost-send")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Background daemon"))
        .stdout(predicate::str::contains("--log-format"));
}

#[test]
fn test_missing_config_is_configuration_error() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("absent.toml");

    send(&missing.to_string_lossy())
        .arg("--once")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("Cannot load configuration"));
}

#[test]
fn test_invalid_log_format() {
    let env = setup_test_env();

    send(&env.config_path)
        .args(["--once", "--log-format", "xml"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("Invalid log format"));
}

#[test]
fn test_once_with_empty_queue() {
    let env = setup_test_env();

    send(&env.config_path)
        .args(["--once", "--verbose"])
        .assert()
        .success()
        .stderr(predicate::str::contains("No posts due"));
}

#[tokio::test]
async fn test_once_admits_and_defers_unreachable_platform() {
    let env = setup_test_env();
    let post_id = create_due_post(&env.db_path).await;

    send(&env.config_path).arg("--once").assert().success();

    let db = Database::new(&env.db_path).await.unwrap();
    let post = db.get_post(&post_id).await.unwrap().unwrap();
    assert_eq!(post.state, LifecycleState::Dispatching);

    let targets = db.get_targets(&post_id).await.unwrap();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].status, TargetStatus::Retrying);
    assert_eq!(targets[0].attempts, 1);
    assert!(targets[0].next_attempt_at.unwrap() > unix_now());
    assert!(targets[0].last_error.is_some());

    // Not due again yet: a second run leaves the target alone
    send(&env.config_path).arg("--once").assert().success();
    let targets = db.get_targets(&post_id).await.unwrap();
    assert_eq!(targets[0].attempts, 1);

    drop(env.temp_dir);
}
