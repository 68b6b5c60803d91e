//! karasync command-line tool.
//!
//! One-shot operator commands: update repositories, preview and push
//! maintainer changes, inspect status and the audit log, and generate or
//! validate configuration files.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use tracing_subscriber::EnvFilter;

use karasync_core::config::AppConfig;
use karasync_core::db::Database;
use karasync_core::lock::RepoLocks;
use karasync_core::models::{MediaOutcome, Push, StashOutcome, SyncReport};
use karasync_core::remote::HttpRemote;
use karasync_core::sync_engine::SyncEngine;

/// karasync command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "karasync",
    version,
    about = "Synchronize karaoke content repositories with their origin"
)]
struct Cli {
    /// Path to the TOML configuration file
    /// (default: <config dir>/karasync/config.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Update one repository, or every updatable repository.
    Update {
        /// Repository name.
        repository: Option<String>,

        /// Print reports as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the commits a push would create.
    Plan {
        /// Repository name.
        repository: String,
    },

    /// Upload media, commit and push local changes of a maintainer repository.
    Push {
        /// Repository name.
        repository: String,

        /// Fold every planned commit into one with this message.
        #[arg(long)]
        squash: Option<String>,
    },

    /// Show revision and last run of every repository.
    Status,

    /// Print the audit trail, newest first.
    Audit {
        /// Only entries of this repository.
        #[arg(short, long)]
        repository: Option<String>,

        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },

    /// Check the configuration file and report missing credentials.
    Validate,

    /// Write a starter configuration file.
    Init {
        /// Where to write it; an existing file is never overwritten.
        #[arg(short, long, default_value = "./karasync.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("karasync: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every requested operation succeeded.
async fn run(cli: Cli) -> Result<bool> {
    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };

    match cli.command {
        Commands::Init { output } => cmd_init(&output).map(|()| true),
        Commands::Validate => cmd_validate(&config_path).map(|()| true),
        command => {
            let config = AppConfig::load_and_resolve(&config_path)
                .with_context(|| format!("failed to load {}", config_path.display()))?;
            let engine = build_engine(config)?;
            match command {
                Commands::Update { repository, json } => {
                    cmd_update(&engine, repository, json).await
                }
                Commands::Plan { repository } => {
                    cmd_plan(&engine, &repository).await.map(|()| true)
                }
                Commands::Push { repository, squash } => {
                    cmd_push(&engine, &repository, squash).await.map(|()| true)
                }
                Commands::Status => cmd_status(&engine).map(|()| true),
                Commands::Audit { repository, limit } => {
                    cmd_audit(engine.db(), repository.as_deref(), limit).map(|()| true)
                }
                Commands::Init { .. } | Commands::Validate => Ok(true),
            }
        }
    }
}

fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("could not determine the user configuration directory")?;
    Ok(dir.join("karasync").join("config.toml"))
}

fn build_engine(config: AppConfig) -> Result<SyncEngine> {
    let db = Database::open_in(&config.daemon.data_dir).context("failed to open database")?;
    let remote = HttpRemote::new(&config.http).context("failed to build HTTP client")?;
    Ok(SyncEngine::new(
        config,
        Arc::new(db),
        Arc::new(remote),
        RepoLocks::new(),
    ))
}

const DEFAULT_CONFIG: &str = r#"# karasync configuration

[daemon]
poll_interval_secs = 3600
log_level = "info"
data_dir = "/var/lib/karasync"
# log_dir = "/var/log/karasync"

[http]
base_scheme = "https"
timeout_secs = 30
media_timeout_secs = 3600
media_concurrency = 4

# Read-only mirror: manifest + patch, archive snapshot as fallback.
[[repository]]
name = "kara.moe"
base_dir = "/var/lib/karasync/repos/kara.moe"
auto_media_downloads = false

# Maintainer working copy: git transport, media pushed over FTP.
# [[repository]]
# name = "gitlab.example.com"
# base_dir = "/var/lib/karasync/repos/maintained"
# maintainer_mode = true
#
# [repository.git]
# url = "https://gitlab.example.com/karaokes/base.git"
# branch = "master"
# username = "maintainer"
# password_env = "KARASYNC_GIT_TOKEN"
# author_name = "Maintainer"
# author_email = "maintainer@example.com"
#
# [repository.ftp]
# host = "ftp.example.com"
# username = "maintainer"
# password_env = "KARASYNC_FTP_PASSWORD"
# base_dir = "/medias"
"#;

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!("{} exists, refusing to overwrite it", output.display());
    }
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("failed to create config directory")?;
    }
    std::fs::write(output, DEFAULT_CONFIG).context("failed to write config file")?;

    println!("wrote {}", output.display());
    println!("edit the [[repository]] entries, then run:");
    println!("  karasync --config {} validate", output.display());
    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    let mut config = AppConfig::load_from_file(config_path)
        .with_context(|| format!("cannot read {}", config_path.display()))?;
    config.resolve_env_vars()?;
    config
        .validate()
        .with_context(|| format!("{} is invalid", config_path.display()))?;

    println!(
        "{}: {} repositories, polling every {}s, data in {}",
        config_path.display(),
        config.repositories.len(),
        config.daemon.poll_interval_secs,
        config.daemon.data_dir.display()
    );

    let mut table = new_table(&["REPOSITORY", "MODE", "ENABLED", "BASE DIR", "CREDENTIALS"]);
    for repo in &config.repositories {
        let git = repo.git.as_ref().map(|g| {
            if g.password_env.is_none() || g.password.is_some() {
                "git: ok"
            } else {
                "git: NOT SET"
            }
        });
        let ftp = repo.ftp.as_ref().map(|f| {
            if f.password.is_some() {
                "ftp: ok"
            } else {
                "ftp: NOT SET"
            }
        });
        let credentials = [git, ftp].into_iter().flatten().collect::<Vec<_>>().join(", ");
        table.add_row(vec![
            repo.name.clone(),
            repo.transport_mode().to_string(),
            yes_no(repo.enabled).to_string(),
            repo.base_dir.display().to_string(),
            if credentials.is_empty() { "-".into() } else { credentials },
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn cmd_update(engine: &SyncEngine, repository: Option<String>, json: bool) -> Result<bool> {
    let results = match repository {
        Some(name) => vec![engine.update_repo(&name).await],
        None => engine.update_all().await,
    };
    if results.is_empty() {
        println!("No repository to update.");
        return Ok(true);
    }

    let mut ok = true;
    for result in results {
        match result {
            Ok(report) if json => println!("{}", serde_json::to_string_pretty(&report)?),
            Ok(report) => print_report(&report),
            Err(e) => {
                ok = false;
                eprintln!("{e}");
            }
        }
    }
    Ok(ok)
}

fn print_report(report: &SyncReport) {
    println!("{} ({})", report.repository, report.mode);
    println!(
        "  Revision : {} -> {}",
        report.from_revision.as_deref().unwrap_or("none"),
        report.to_revision.as_deref().unwrap_or("none")
    );
    if report.snapshot_installed {
        println!("  Snapshot : installed");
    }
    println!("  Changes  : {}", report.changes);
    let a = &report.applied;
    println!(
        "  Applied  : {} song(s), {} tag(s) integrated; {} song(s), {} tag(s) removed; \
         fonts +{} -{}",
        a.karas_integrated,
        a.tags_integrated,
        a.karas_removed,
        a.tags_removed,
        a.fonts_added,
        a.fonts_removed
    );
    let media = match &report.media {
        MediaOutcome::Skipped => "skipped".to_string(),
        MediaOutcome::Spawned => "running in background".to_string(),
        MediaOutcome::Done { changed: true } => "updated".to_string(),
        MediaOutcome::Done { changed: false } => "up to date".to_string(),
        MediaOutcome::Failed { error } => format!("FAILED: {error}"),
    };
    println!("  Media    : {media}");
    for outcome in &report.stash_outcomes {
        match outcome {
            StashOutcome::Applied { message } => println!("  Stash    : reapplied '{message}'"),
            StashOutcome::ConflictedDiscarded { message, reason } => {
                println!("  Stash    : DISCARDED '{message}' ({reason})")
            }
        }
    }
}

async fn cmd_plan(engine: &SyncEngine, repository: &str) -> Result<()> {
    let push = engine.plan_repo(repository).await?;
    print_plan(&push);
    Ok(())
}

fn print_plan(push: &Push) {
    if push.commits.is_empty() {
        println!("Nothing to commit.");
    }
    for (i, commit) in push.commits.iter().enumerate() {
        println!("{}. {}", i + 1, commit.message);
        for path in &commit.added_files {
            println!("     + {path}");
        }
        for path in &commit.removed_files {
            println!("     - {path}");
        }
    }
    if !push.modified_medias.is_empty() {
        println!();
        let mut table = new_table(&["MEDIA ACTION", "OLD", "NEW", "COMMIT"]);
        for media in &push.modified_medias {
            table.add_row(vec![
                format!("{:?}", media.action()),
                media.old.clone().unwrap_or_else(|| "-".into()),
                media.new.clone().unwrap_or_else(|| "-".into()),
                media.commit.clone(),
            ]);
        }
        println!("{table}");
    }
    if !push.unplanned.is_empty() {
        println!();
        println!("Not part of any commit:");
        for path in &push.unplanned {
            println!("  {path}");
        }
    }
}

async fn cmd_push(engine: &SyncEngine, repository: &str, squash: Option<String>) -> Result<()> {
    let summary = engine.push_repo(repository, squash).await?;
    if summary.commits.is_empty() {
        println!("Nothing to push.");
        return Ok(());
    }
    for message in &summary.messages {
        println!("  committed: {message}");
    }
    for name in &summary.uploaded {
        println!("  uploaded : {name}");
    }
    for (from, to) in &summary.renamed {
        println!("  renamed  : {from} -> {to}");
    }
    for name in &summary.deleted {
        println!("  deleted  : {name}");
    }
    println!(
        "Pushed {} commit(s), head {}",
        summary.commits.len(),
        summary.head.as_deref().unwrap_or("-")
    );
    Ok(())
}

fn cmd_status(engine: &SyncEngine) -> Result<()> {
    let statuses = engine.status().context("failed to read status")?;
    if statuses.is_empty() {
        println!("No repository configured.");
        return Ok(());
    }
    let mut table = new_table(&[
        "REPOSITORY",
        "MODE",
        "ENABLED",
        "REVISION",
        "RUNNING",
        "LAST RUN",
    ]);
    for status in statuses {
        let last_run = match (status.last_run_status, status.last_run_at) {
            (Some(s), Some(at)) => format!("{s} at {at}"),
            _ => "never".into(),
        };
        table.add_row(vec![
            status.name,
            status.mode.to_string(),
            yes_no(status.enabled).to_string(),
            status
                .revision
                .map(|r| truncate(&r, 12))
                .unwrap_or_else(|| "none".into()),
            yes_no(status.running).to_string(),
            last_run,
        ]);
    }
    println!("{table}");
    Ok(())
}

fn cmd_audit(db: &Database, repository: Option<&str>, limit: u32) -> Result<()> {
    let entries = db
        .list_audit_log(repository, limit)
        .context("reading the audit trail")?;
    if entries.is_empty() {
        println!("audit trail is empty");
        return Ok(());
    }
    let mut table = new_table(&["TIMESTAMP", "ACTION", "REPOSITORY", "OK", "DETAILS"]);
    for entry in &entries {
        table.add_row(vec![
            entry.created_at.clone(),
            entry.action.clone(),
            entry.repository.clone(),
            yes_no(entry.success).to_string(),
            truncate(entry.details.as_deref().unwrap_or(""), 60),
        ]);
    }
    println!("{table}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

fn new_table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.to_vec());
    table
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
