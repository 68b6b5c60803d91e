//! Configuration file model.
//!
//! Secrets never appear in the file: git and FTP passwords are named by an
//! environment variable (`password_env`) and read by
//! [`AppConfig::resolve_env_vars`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;

/// Contents of `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// HTTP client settings shared by every repository.
    #[serde(default)]
    pub http: HttpConfig,

    /// Content repositories to keep in sync.
    #[serde(default, rename = "repository")]
    pub repositories: Vec<RepositoryConfig>,
}

/// Scheduler, logging and storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between update passes (default 3600).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// `EnvFilter` directive, e.g. `info` or `karasync_core=debug`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional directory for daily-rotated log files.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Directory for persistent data (settings database, content index).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_poll_interval() -> u64 {
    60 * 60
}
fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/karasync")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// URL scheme used to reach `https://<repository name>/...`.
    #[serde(default = "default_base_scheme")]
    pub base_scheme: String,

    /// Per-request timeout for metadata calls.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Per-request timeout for a single media download.
    #[serde(default = "default_media_timeout")]
    pub media_timeout_secs: u64,

    /// Maximum number of concurrent media downloads.
    #[serde(default = "default_media_concurrency")]
    pub media_concurrency: usize,

    /// User agent sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_base_scheme() -> String {
    "https".into()
}
fn default_timeout() -> u64 {
    30
}
fn default_media_timeout() -> u64 {
    3600
}
fn default_media_concurrency() -> usize {
    4
}
fn default_user_agent() -> String {
    concat!("karasync/", env!("CARGO_PKG_VERSION")).into()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_scheme: default_base_scheme(),
            timeout_secs: default_timeout(),
            media_timeout_secs: default_media_timeout(),
            media_concurrency: default_media_concurrency(),
            user_agent: default_user_agent(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn media_timeout(&self) -> Duration {
        Duration::from_secs(self.media_timeout_secs)
    }
}

/// How a repository is synchronized, derived from `online` and
/// `maintainer_mode`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Read-only consumer: manifest + patch, archive snapshot as fallback.
    Archive,
    /// Full git working copy capable of pushing changes.
    Git,
    /// Never contacts a remote.
    LocalOnly,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Archive => write!(f, "archive"),
            Self::Git => write!(f, "git"),
            Self::LocalOnly => write!(f, "local_only"),
        }
    }
}

/// Per-category subdirectories, relative to the repository base directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepositoryPaths {
    #[serde(default = "default_karaokes")]
    pub karaokes: String,
    #[serde(default = "default_tags")]
    pub tags: String,
    #[serde(default = "default_lyrics")]
    pub lyrics: String,
    #[serde(default = "default_medias")]
    pub medias: String,
    #[serde(default = "default_fonts")]
    pub fonts: String,
}

fn default_karaokes() -> String {
    "karaokes".into()
}
fn default_tags() -> String {
    "tags".into()
}
fn default_lyrics() -> String {
    "lyrics".into()
}
fn default_medias() -> String {
    "medias".into()
}
fn default_fonts() -> String {
    "fonts".into()
}

impl Default for RepositoryPaths {
    fn default() -> Self {
        Self {
            karaokes: default_karaokes(),
            tags: default_tags(),
            lyrics: default_lyrics(),
            medias: default_medias(),
            fonts: default_fonts(),
        }
    }
}

/// Version-control credentials for maintainer mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitRemoteConfig {
    /// Clone URL of the content repository.
    pub url: String,

    /// Branch to track (default `master`).
    #[serde(default = "default_git_branch")]
    pub branch: String,

    /// Username for HTTP(S) authentication.
    #[serde(default)]
    pub username: Option<String>,

    /// Environment variable holding the password or access token.
    #[serde(default)]
    pub password_env: Option<String>,

    /// Author name for commits created by the push path.
    #[serde(default = "default_author_name")]
    pub author_name: String,

    /// Author email for commits created by the push path.
    #[serde(default = "default_author_email")]
    pub author_email: String,

    /// Value of `password_env`, filled in at load time.
    #[serde(skip)]
    pub password: Option<String>,
}

impl GitRemoteConfig {
    /// Remote tracking `master` with the default author.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            branch: default_git_branch(),
            username: None,
            password_env: None,
            author_name: default_author_name(),
            author_email: default_author_email(),
            password: None,
        }
    }
}

fn default_git_branch() -> String {
    "master".into()
}
fn default_author_name() -> String {
    "karasync".into()
}
fn default_author_email() -> String {
    "karasync@localhost".into()
}

/// File-transfer credentials used to push media files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpConfig {
    pub host: String,

    #[serde(default = "default_ftp_port")]
    pub port: u16,

    pub username: String,

    /// Environment variable holding the FTP password.
    pub password_env: String,

    /// Remote directory media files live in.
    #[serde(default)]
    pub base_dir: Option<String>,

    #[serde(skip)]
    pub password: Option<String>,
}

fn default_ftp_port() -> u16 {
    21
}

/// A single content repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Repository name; also the host serving its HTTP API.
    pub name: String,

    /// Whether the repository has a remote origin at all.
    #[serde(default = "default_true")]
    pub online: bool,

    /// Whether the local copy is a git working copy that can push.
    #[serde(default)]
    pub maintainer_mode: bool,

    /// Whether the repository is used at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether the periodic updater should pull this repository.
    #[serde(default = "default_true")]
    pub update: bool,

    /// Whether every remote media file should be downloaded, not just
    /// refreshed when already present.
    #[serde(default)]
    pub auto_media_downloads: bool,

    /// Local base directory of the repository.
    pub base_dir: PathBuf,

    /// Per-category subdirectories.
    #[serde(default)]
    pub paths: RepositoryPaths,

    /// Version-control settings (required in maintainer mode).
    #[serde(default)]
    pub git: Option<GitRemoteConfig>,

    /// File-transfer settings (required to push media).
    #[serde(default)]
    pub ftp: Option<FtpConfig>,
}

fn default_true() -> bool {
    true
}

impl RepositoryConfig {
    /// Minimal online, read-only repository rooted at `base_dir`.
    pub fn new(name: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            online: true,
            maintainer_mode: false,
            enabled: true,
            update: true,
            auto_media_downloads: false,
            base_dir: base_dir.into(),
            paths: RepositoryPaths::default(),
            git: None,
            ftp: None,
        }
    }

    pub fn transport_mode(&self) -> TransportMode {
        match (self.online, self.maintainer_mode) {
            (true, true) => TransportMode::Git,
            (true, false) => TransportMode::Archive,
            (false, _) => TransportMode::LocalOnly,
        }
    }

    pub fn karaokes_dir(&self) -> PathBuf {
        self.base_dir.join(&self.paths.karaokes)
    }

    pub fn tags_dir(&self) -> PathBuf {
        self.base_dir.join(&self.paths.tags)
    }

    pub fn lyrics_dir(&self) -> PathBuf {
        self.base_dir.join(&self.paths.lyrics)
    }

    pub fn medias_dir(&self) -> PathBuf {
        self.base_dir.join(&self.paths.medias)
    }

    pub fn fonts_dir(&self) -> PathBuf {
        self.base_dir.join(&self.paths.fonts)
    }
}

impl AppConfig {
    /// Parse `path` without touching the environment or validating.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::FileNotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let config: Self =
            toml::from_str(&text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        info!(
            path = %path.display(),
            repositories = config.repositories.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Read every `password_env` variable into its `password` field.
    ///
    /// An unset variable only warns; git and FTP report missing credentials
    /// once they actually need them.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        for repo in &mut self.repositories {
            let name = repo.name.as_str();
            if let Some(git) = repo.git.as_mut() {
                git.password = git
                    .password_env
                    .as_deref()
                    .and_then(|var| read_secret(var, name, "git"));
            }
            if let Some(ftp) = repo.ftp.as_mut() {
                ftp.password = read_secret(&ftp.password_env, name, "ftp");
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: String, detail: &str| ConfigError::InvalidValue {
            field,
            detail: detail.to_string(),
        };

        if self.daemon.poll_interval_secs == 0 {
            return Err(invalid("daemon.poll_interval_secs".into(), "must be at least 1"));
        }
        if self.http.media_concurrency == 0 {
            return Err(invalid("http.media_concurrency".into(), "must be at least 1"));
        }

        let mut names = HashSet::new();
        for repo in &self.repositories {
            if repo.name.trim().is_empty() {
                return Err(invalid("repository.name".into(), "empty repository name"));
            }
            if !names.insert(repo.name.as_str()) {
                return Err(invalid(
                    format!("repository.{}", repo.name),
                    "repository declared twice",
                ));
            }
            if repo.base_dir.as_os_str().is_empty() {
                return Err(invalid(
                    format!("repository.{}.base_dir", repo.name),
                    "empty base directory",
                ));
            }
            if repo.transport_mode() == TransportMode::Git && repo.git.is_none() {
                return Err(invalid(
                    format!("repository.{}.git", repo.name),
                    "maintainer mode needs a [repository.git] table",
                ));
            }
        }
        Ok(())
    }

    /// [`load_from_file`](Self::load_from_file), then secrets, then validation.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    pub fn repository(&self, name: &str) -> Result<&RepositoryConfig, ConfigError> {
        self.repositories
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| ConfigError::UnknownRepository(name.to_string()))
    }

    /// Repositories the periodic updater should pull.
    pub fn updatable_repositories(&self) -> impl Iterator<Item = &RepositoryConfig> {
        self.repositories
            .iter()
            .filter(|r| r.enabled && r.update && r.online)
    }
}

fn read_secret(var: &str, repository: &str, kind: &str) -> Option<String> {
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => {
            debug!(repository, kind, var, "secret resolved");
            Some(value)
        }
        _ => {
            warn!(repository, kind, var, "secret variable unset or empty");
            None
        }
    }
}
