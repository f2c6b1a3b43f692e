//! autopost-queue - Manage scheduled posts
//!
//! Unix-style front end for the publishing service: register uploads,
//! schedule them, watch their progress and link platform accounts.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use libautopost::logging::{LoggingConfig, LOG_LEVEL_ENV};
use libautopost::scheduling::{parse_schedule, parse_window};
use libautopost::service::accounts::AccountTokens;
use libautopost::service::status::{AccountGrowth, PostStatusReport};
use libautopost::types::Credential;
use libautopost::{
    AutopostError, Config, Platform, PostRecord, PublishingService, Recurrence, Result,
    TargetSpec,
};
use secrecy::SecretString;

#[derive(Parser, Debug)]
#[command(name = "autopost-queue")]
#[command(version)]
#[command(about = "Manage scheduled posts")]
#[command(long_about = "\
autopost-queue - Manage scheduled posts

DESCRIPTION:
    autopost-queue manages the Autopost publishing queue. Register an
    uploaded media file, schedule it to one or more platforms, and follow
    each target until it is published. The autopost-send daemon does the
    actual publishing.

COMMANDS:
    create      Register an uploaded media file as a new post
    schedule    Schedule a post to one or more platforms
    reschedule  Move a scheduled post to a different time
    cancel      Cancel a scheduled or dispatching post
    retry       Retry a permanently failed target
    repeat      Make a post repeat daily, weekly or monthly
    pause       Stop a repeating post from scheduling more occurrences
    resume      Let a paused repeating post continue
    status      Show a post, its targets and their latest metrics
    due         List posts due within a time window
    stats       Show how a linked account grew over a time window
    link        Link a platform account
    unlink      Unlink a platform account

USAGE EXAMPLES:
    # Register an upload
    autopost-queue --user alice create alice/launch.mp4 --caption \"Launch day\"

    # Publish it to YouTube and TikTok in two hours
    autopost-queue --user alice schedule <POST_ID> \"2h\" youtube:UC123 tiktok:@alice

    # Reschedule it
    autopost-queue --user alice reschedule <POST_ID> \"tomorrow 3pm\"

    # Publish every Monday at 9am, then take a break from it
    autopost-queue --user alice schedule <POST_ID> \"next monday 9am\" twitter:@alice --repeat weekly
    autopost-queue --user alice pause <POST_ID>

    # Follow its progress as JSON
    autopost-queue --user alice --format json status <POST_ID>

    # What goes out in the next hour
    autopost-queue --user alice due --within 1h

    # Follower growth on YouTube over the last month
    autopost-queue --user alice stats youtube --within 30d

CONFIGURATION:
    Configuration file: ~/.config/autopost/config.toml
    Database location: ~/.local/share/autopost/autopost.db

    Override with environment variables:
        AUTOPOST_CONFIG    - Path to config file
        AUTOPOST_DB_PATH   - Path to database file
        AUTOPOST_USER      - Acting user

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Account missing or must be re-linked
    3 - Invalid input (bad time format, disallowed transition, etc.)
    4 - Post not found
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// User acting on the queue
    #[arg(short, long, global = true, env = "AUTOPOST_USER")]
    user: Option<String>,

    /// Output format: text or json
    #[arg(short, long, global = true, default_value = "text")]
    format: String,

    /// Path to the configuration file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    #[arg(help = "Enable verbose logging to stderr (useful for debugging)")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register an uploaded media file
    Create {
        /// Media reference inside the media root (e.g. alice/clip.mp4)
        media_ref: String,

        /// Caption published with the media
        #[arg(short, long, default_value = "")]
        caption: String,

        /// Title for video platforms
        #[arg(short, long)]
        title: Option<String>,
    },

    /// Schedule a post
    Schedule {
        /// Post ID to schedule
        post_id: String,

        /// When to publish (e.g., "now", "30m", "tomorrow 3pm")
        time: String,

        /// Targets as PLATFORM:ACCOUNT (e.g. twitter:@acme)
        #[arg(required = true)]
        targets: Vec<String>,

        /// Repeat the post: once, daily, weekly or monthly
        #[arg(short, long, default_value = "once")]
        repeat: String,
    },

    /// Reschedule a post
    Reschedule {
        /// Post ID to reschedule
        post_id: String,

        /// New schedule time (e.g., "tomorrow 3pm", "2h")
        time: String,
    },

    /// Cancel a post
    Cancel {
        /// Post ID to cancel
        post_id: String,
    },

    /// Retry a failed target
    Retry {
        /// Post ID
        post_id: String,

        /// Platform of the failed target
        platform: String,
    },

    /// Set how a post repeats
    Repeat {
        /// Post ID
        post_id: String,

        /// once, daily, weekly or monthly
        recurrence: String,
    },

    /// Pause a repeating post
    Pause {
        /// Any post ID of the series
        post_id: String,
    },

    /// Resume a paused repeating post
    Resume {
        /// Any post ID of the series
        post_id: String,
    },

    /// Show post status
    Status {
        /// Post ID
        post_id: String,
    },

    /// List posts due soon
    Due {
        /// Time window (e.g., "15m", "2h", "1d")
        #[arg(short, long, default_value = "1h")]
        within: String,
    },

    /// Show account growth
    Stats {
        /// Platform name
        platform: String,

        /// Time window (e.g., "7d", "30d")
        #[arg(short, long, default_value = "7d")]
        within: String,
    },

    /// Link a platform account
    Link {
        /// Platform name
        platform: String,

        /// Account handle or id on the platform
        account: String,

        /// Access token from the OAuth flow
        #[arg(long, env = "AUTOPOST_ACCESS_TOKEN", hide_env_values = true)]
        access_token: String,

        /// Refresh token from the OAuth flow
        #[arg(long, env = "AUTOPOST_REFRESH_TOKEN", hide_env_values = true)]
        refresh_token: Option<String>,

        /// Access token lifetime (e.g., "1h", "60d")
        #[arg(long)]
        expires_in: Option<String>,
    },

    /// Unlink a platform account
    Unlink {
        /// Platform name
        platform: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Quiet unless asked otherwise; stdout carries the command output
    let mut logging = LoggingConfig::from_env(cli.verbose);
    if std::env::var(LOG_LEVEL_ENV).is_err() {
        logging.level = "error".to_string();
    }
    logging.init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let format = OutputFormat::parse(&cli.format)?;
    let user = cli.user.ok_or_else(|| {
        AutopostError::InvalidInput("No user given; pass --user or set AUTOPOST_USER".to_string())
    })?;

    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    let service = PublishingService::from_config(config).await?;

    match cli.command {
        Commands::Create {
            media_ref,
            caption,
            title,
        } => cmd_create(&service, &user, format, &media_ref, &caption, title.as_deref()).await,
        Commands::Schedule {
            post_id,
            time,
            targets,
            repeat,
        } => cmd_schedule(&service, &user, format, &post_id, &time, &targets, &repeat).await,
        Commands::Reschedule { post_id, time } => {
            cmd_reschedule(&service, &user, format, &post_id, &time).await
        }
        Commands::Cancel { post_id } => cmd_cancel(&service, &user, format, &post_id).await,
        Commands::Retry { post_id, platform } => {
            cmd_retry(&service, &user, format, &post_id, &platform).await
        }
        Commands::Repeat {
            post_id,
            recurrence,
        } => cmd_repeat(&service, &user, format, &post_id, &recurrence).await,
        Commands::Pause { post_id } => cmd_pause(&service, &user, format, &post_id, true).await,
        Commands::Resume { post_id } => cmd_pause(&service, &user, format, &post_id, false).await,
        Commands::Status { post_id } => cmd_status(&service, &user, format, &post_id).await,
        Commands::Due { within } => cmd_due(&service, &user, format, &within).await,
        Commands::Stats { platform, within } => {
            cmd_stats(&service, &user, format, &platform, &within).await
        }
        Commands::Link {
            platform,
            account,
            access_token,
            refresh_token,
            expires_in,
        } => {
            let tokens = AccountTokens {
                access_token: SecretString::from(access_token),
                refresh_token: refresh_token.map(SecretString::from),
                expires_at: expires_in
                    .as_deref()
                    .map(|s| expiry_from_now(s, Utc::now().timestamp()))
                    .transpose()?,
            };
            cmd_link(&service, &user, format, &platform, &account, tokens).await
        }
        Commands::Unlink { platform } => cmd_unlink(&service, &user, format, &platform).await,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(AutopostError::InvalidInput(format!(
                "Invalid format '{}'. Must be 'text' or 'json'",
                other
            ))),
        }
    }
}

/// Register an upload
async fn cmd_create(
    service: &PublishingService,
    user: &str,
    format: OutputFormat,
    media_ref: &str,
    caption: &str,
    title: Option<&str>,
) -> Result<()> {
    let post = service
        .posts()
        .register_upload(user, media_ref, caption, title)
        .await?;

    match format {
        OutputFormat::Json => print_json(&post)?,
        OutputFormat::Text => println!("{}", post.id),
    }
    Ok(())
}

/// Schedule a post
async fn cmd_schedule(
    service: &PublishingService,
    user: &str,
    format: OutputFormat,
    post_id: &str,
    time: &str,
    targets: &[String],
    repeat: &str,
) -> Result<()> {
    let due_at = parse_schedule(time, Utc::now())?.timestamp();
    let recurrence: Recurrence = repeat.parse()?;
    let targets = targets
        .iter()
        .map(|t| t.parse::<TargetSpec>())
        .collect::<Result<Vec<_>>>()?;

    let mut post = service
        .posts()
        .schedule(user, post_id, due_at, &targets)
        .await?;
    if recurrence.repeats() {
        post = service
            .posts()
            .set_recurrence(user, post_id, recurrence)
            .await?;
    }
    output_post(&post, format)
}

/// Change how a post repeats
async fn cmd_repeat(
    service: &PublishingService,
    user: &str,
    format: OutputFormat,
    post_id: &str,
    recurrence: &str,
) -> Result<()> {
    let recurrence: Recurrence = recurrence.parse()?;
    let post = service
        .posts()
        .set_recurrence(user, post_id, recurrence)
        .await?;
    output_post(&post, format)
}

/// Pause or resume a repeating post
async fn cmd_pause(
    service: &PublishingService,
    user: &str,
    format: OutputFormat,
    post_id: &str,
    pause: bool,
) -> Result<()> {
    let posts = service.posts();
    let post = if pause {
        posts.pause_recurrence(user, post_id).await?
    } else {
        posts.resume_recurrence(user, post_id).await?
    };
    output_post(&post, format)
}

/// Reschedule a post
async fn cmd_reschedule(
    service: &PublishingService,
    user: &str,
    format: OutputFormat,
    post_id: &str,
    time: &str,
) -> Result<()> {
    let due_at = parse_schedule(time, Utc::now())?.timestamp();
    let post = service.posts().reschedule(user, post_id, due_at).await?;
    output_post(&post, format)
}

/// Cancel a post
async fn cmd_cancel(
    service: &PublishingService,
    user: &str,
    format: OutputFormat,
    post_id: &str,
) -> Result<()> {
    let post = service.posts().cancel(user, post_id).await?;
    output_post(&post, format)
}

/// Retry a failed target
async fn cmd_retry(
    service: &PublishingService,
    user: &str,
    format: OutputFormat,
    post_id: &str,
    platform: &str,
) -> Result<()> {
    let platform: Platform = platform.parse()?;
    let post = service
        .posts()
        .retry_target(user, post_id, platform)
        .await?;
    output_post(&post, format)
}

/// Show a post with its targets
async fn cmd_status(
    service: &PublishingService,
    user: &str,
    format: OutputFormat,
    post_id: &str,
) -> Result<()> {
    let report = service.status().get_status(user, post_id).await?;
    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => output_status_text(&report, Utc::now().timestamp()),
    }
    Ok(())
}

/// List posts due soon
async fn cmd_due(
    service: &PublishingService,
    user: &str,
    format: OutputFormat,
    within: &str,
) -> Result<()> {
    let window = parse_window(within)?;
    let posts = service.status().list_due_soon(user, window).await?;

    match format {
        OutputFormat::Json => print_json(&posts)?,
        OutputFormat::Text => output_due_text(&posts, Utc::now().timestamp()),
    }
    Ok(())
}

/// Show account growth
async fn cmd_stats(
    service: &PublishingService,
    user: &str,
    format: OutputFormat,
    platform: &str,
    within: &str,
) -> Result<()> {
    let platform: Platform = platform.parse()?;
    let window = parse_window(within)?;
    let growth = service
        .status()
        .account_growth(user, platform, window)
        .await?;

    match format {
        OutputFormat::Json => print_json(&growth)?,
        OutputFormat::Text => output_growth_text(&growth),
    }
    Ok(())
}

/// Link an account
async fn cmd_link(
    service: &PublishingService,
    user: &str,
    format: OutputFormat,
    platform: &str,
    account: &str,
    tokens: AccountTokens,
) -> Result<()> {
    let platform: Platform = platform.parse()?;
    let credential = service
        .accounts()
        .link_account(user, platform, account, tokens)
        .await?;

    match format {
        OutputFormat::Json => print_json(&credential_json(&credential))?,
        OutputFormat::Text => println!("Linked {} account {}", platform, credential.account),
    }
    Ok(())
}

/// Unlink an account
async fn cmd_unlink(
    service: &PublishingService,
    user: &str,
    format: OutputFormat,
    platform: &str,
) -> Result<()> {
    let platform: Platform = platform.parse()?;
    let affected = service.accounts().unlink_account(user, platform).await?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "platform": platform,
            "affected_posts": affected,
        }))?,
        OutputFormat::Text => {
            println!("Unlinked {} account", platform);
            for post_id in affected {
                println!("  target failed on {}", post_id);
            }
        }
    }
    Ok(())
}

fn credential_json(credential: &Credential) -> serde_json::Value {
    serde_json::json!({
        "platform": credential.platform,
        "account": credential.account,
        "status": credential.status.as_str(),
        "expires_at": credential.expires_at,
    })
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| AutopostError::InvalidInput(format!("Cannot encode output: {}", e)))?;
    println!("{}", json);
    Ok(())
}

/// Output a single post after a transition
fn output_post(post: &PostRecord, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(post)?,
        OutputFormat::Text => {
            let due = post
                .due_at
                .map(format_timestamp)
                .unwrap_or_else(|| "-".to_string());
            println!("{} | {} | {}", post.id, post.state, due);
        }
    }
    Ok(())
}

fn output_status_text(report: &PostStatusReport, now: i64) {
    println!("Post:    {}", report.id);
    println!("State:   {}", report.state);
    println!("Media:   {}", report.media_ref);
    if let Some(title) = &report.title {
        println!("Title:   {}", title);
    }
    println!("Caption: {}", truncate_content(&report.caption, 60));
    if let Some(due_at) = report.due_at {
        println!(
            "Due:     {} ({})",
            format_timestamp(due_at),
            format_time_until(now, due_at)
        );
    }
    if report.recurrence.repeats() {
        let paused = if report.recurrence_paused { " (paused)" } else { "" };
        println!("Repeats: {}{}", report.recurrence, paused);
        if let Some(next) = &report.next_occurrence_id {
            println!("Next:    {}", next);
        }
    }

    if report.targets.is_empty() {
        return;
    }
    println!();
    for target in &report.targets {
        let mut line = format!(
            "  {:<10} {:<20} {:<10} attempts={}",
            target.platform.as_str(),
            target.account,
            target.status.as_str(),
            target.attempts
        );
        if let Some(id) = &target.platform_post_id {
            line.push_str(&format!(" id={}", id));
        }
        if let Some(at) = target.next_attempt_at {
            line.push_str(&format!(" next={}", format_time_until(now, at)));
        }
        if let Some(error) = &target.last_error {
            line.push_str(&format!(" error=\"{}\"", truncate_content(error, 60)));
        }
        println!("{}", line);

        if let Some(metrics) = &target.metrics {
            let rate = target
                .engagement_rate
                .map(|r| format!("{:.2}%", r))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {:<10} views={} likes={} comments={} shares={} engagement={}",
                "",
                metrics
                    .views
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                metrics.likes,
                metrics.comments,
                metrics.shares,
                rate
            );
        }
    }
}

fn output_growth_text(growth: &AccountGrowth) {
    println!("Account: {} {}", growth.platform, growth.account);
    println!("Since:   {}", format_timestamp(growth.since));
    println!("Samples: {}", growth.samples);

    let (Some(first), Some(latest)) = (&growth.first, &growth.latest) else {
        println!("No account snapshots in this window");
        return;
    };
    println!(
        "Followers: {} -> {} ({})",
        first.metrics.followers,
        latest.metrics.followers,
        signed(growth.follower_change)
    );
    if let Some(change) = growth.post_change {
        println!("Posts:     {}", signed(change));
    }
    if let Some(change) = growth.view_change {
        println!("Views:     {}", signed(change));
    }
}

fn signed(value: i64) -> String {
    format!("{:+}", value)
}

fn output_due_text(posts: &[PostRecord], now: i64) {
    for post in posts {
        let time_until = post
            .due_at
            .map(|ts| format_time_until(now, ts))
            .unwrap_or_else(|| "unknown".to_string());

        println!(
            "{} | {} | {}",
            post.id,
            truncate_content(&post.caption, 50),
            time_until
        );
    }
}

/// Absolute expiry for a token lifetime such as "60d"
fn expiry_from_now(lifetime: &str, now: i64) -> Result<i64> {
    let duration: Duration = humantime::parse_duration(lifetime).map_err(|e| {
        AutopostError::InvalidInput(format!("Could not parse lifetime '{}': {}", lifetime, e))
    })?;
    let secs = i64::try_from(duration.as_secs()).unwrap_or(i64::MAX);
    Ok(now.saturating_add(secs))
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Truncate content to max characters with ellipsis
fn truncate_content(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        content.to_string()
    } else {
        let prefix: String = content.chars().take(max_chars).collect();
        format!("{}...", prefix)
    }
}

/// Format time until scheduled time in human-readable format
fn format_time_until(now: i64, scheduled_at: i64) -> String {
    let diff = scheduled_at - now;

    if diff < 0 {
        return "overdue".to_string();
    }

    let minutes = diff / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("in {} day{}", days, if days == 1 { "" } else { "s" })
    } else if hours > 0 {
        format!("in {} hour{}", hours, if hours == 1 { "" } else { "s" })
    } else if minutes > 0 {
        format!("in {} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else {
        "in <1 minute".to_string()
    }
}
