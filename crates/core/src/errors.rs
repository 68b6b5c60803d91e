//! One `thiserror` enum per subsystem. [`SyncError`] is what the
//! orchestrator returns and carries a stable [`code`](SyncError::code);
//! [`RepoSyncError`] adds the repository name for batch results.

use thiserror::Error;

/// Any error the core crate can produce.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Meta(#[from] MetaError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Errors talking to a repository's HTTP origin.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote returned HTTP {status} for {url}: {body}")]
    Status { url: String, status: u16, body: String },

    /// A URL could not be built for the repository.
    #[error("invalid remote URL '{0}'")]
    InvalidUrl(String),

    /// The response body could not be decoded.
    #[error("remote response parse error: {0}")]
    Parse(String),

    /// Writing a downloaded body to disk failed.
    #[error("remote I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reading song (`.kara.json`) or tag (`.tag.json`) files.
#[derive(Debug, Error)]
pub enum MetaError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in '{path}': {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("'{path}' has no previous revision to read")]
    MissingPrevious { path: String },
}

/// Errors from the diff/patch transport.
#[derive(Debug, Error)]
pub enum PatchError {
    /// The diff text could not be split or parsed.
    #[error("malformed patch for '{path}': {detail}")]
    Malformed { path: String, detail: String },

    /// A hunk did not apply to the local file.
    #[error("patch does not apply to '{path}': {detail}")]
    ApplyFailed { path: String, detail: String },

    /// The patch path and the full-file fallback both failed.
    #[error("patch failed ({patch}) and full-file fallback failed ({fallback})")]
    FallbackFailed { patch: String, fallback: String },

    #[error("patch remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("patch metadata error: {0}")]
    Meta(#[from] MetaError),

    #[error("patch I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the full-archive snapshot installer.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot download failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("snapshot archive error: {0}")]
    Archive(String),

    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Working-copy errors (maintainer mode).
#[derive(Debug, Error)]
pub enum GitError {
    #[error("'{0}' is not a git working copy")]
    NotARepository(String),

    #[error(transparent)]
    Git2(#[from] git2::Error),

    #[error("cannot resolve '{0}'")]
    RefNotFound(String),

    /// The origin refused the branch update.
    #[error("origin refused push of '{branch}': {detail}")]
    PushRejected { branch: String, detail: String },

    #[error("conflict in {} file(s): {}", .paths.len(), .paths.join(", "))]
    MergeConflict { paths: Vec<String> },

    /// After rebasing, the local head no longer contains upstream.
    #[error("local history regressed against upstream: {0}")]
    Regression(String),

    #[error("working copy I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the change applier and the content index behind it.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("apply metadata error: {0}")]
    Meta(#[from] MetaError),

    #[error("content index error: {0}")]
    Index(String),

    #[error("apply database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Errors from the media synchronizer.
#[derive(Debug, Error)]
pub enum MediaError {
    /// Some files failed while every other file was still attempted.
    #[error("{} media file(s) failed: {}", .failed.len(), .failed.join(", "))]
    Partial { failed: Vec<String> },

    #[error("media listing failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("media I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the FTP media pusher.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("FTP error: {0}")]
    Ftp(String),

    #[error("file transfer is not connected")]
    NotConnected,

    #[error("no file transfer credentials configured for repository '{0}'")]
    NoCredentials(String),

    #[error("transfer I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<suppaftp::FtpError> for TransferError {
    fn from(e: suppaftp::FtpError) -> Self {
        Self::Ftp(e.to_string())
    }
}

/// Errors from the per-repository orchestrator.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another synchronization of the same repository is running.
    #[error("synchronization of '{repository}' already in progress")]
    AlreadyRunning { repository: String },

    /// The manifest could not be fetched.
    #[error("repository unreachable: {0}")]
    Unreachable(RemoteError),

    /// Operation requires a maintainer-mode repository.
    #[error("repository '{0}' is not in maintainer mode")]
    NotMaintainer(String),

    /// Operation requires an online repository.
    #[error("repository '{0}' is local-only")]
    LocalOnly(String),

    #[error("sync remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("sync patch error: {0}")]
    Patch(#[from] PatchError),

    #[error("sync snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("sync git error: {0}")]
    Git(#[from] GitError),

    #[error("sync metadata error: {0}")]
    Meta(#[from] MetaError),

    #[error("sync apply error: {0}")]
    Apply(#[from] ApplyError),

    #[error("sync media error: {0}")]
    Media(#[from] MediaError),

    #[error("sync transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("sync database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("sync configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A blocking worker task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

impl SyncError {
    /// Stable, machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyRunning { .. } => "already_running",
            Self::Unreachable(_) => "unreachable",
            Self::NotMaintainer(_) => "not_maintainer",
            Self::LocalOnly(_) => "local_only",
            Self::Remote(_) => "remote_failed",
            Self::Patch(_) => "patch_failed",
            Self::Snapshot(_) => "snapshot_failed",
            Self::Git(GitError::MergeConflict { .. }) => "merge_conflict",
            Self::Git(GitError::PushRejected { .. }) => "push_rejected",
            Self::Git(_) => "git_failed",
            Self::Meta(_) => "invalid_metadata",
            Self::Apply(_) => "apply_failed",
            Self::Media(MediaError::Partial { .. }) => "media_partial",
            Self::Media(_) => "media_failed",
            Self::Transfer(_) => "transfer_failed",
            Self::Database(_) => "database_failed",
            Self::Config(_) => "config_invalid",
            Self::Task(_) => "task_failed",
        }
    }
}

/// A [`SyncError`] tagged with the repository it happened on.
#[derive(Debug, Error)]
#[error("[{}] {repository}: {source}", .source.code())]
pub struct RepoSyncError {
    pub repository: String,
    #[source]
    pub source: SyncError,
}

impl RepoSyncError {
    pub fn new(repository: impl Into<String>, source: impl Into<SyncError>) -> Self {
        Self {
            repository: repository.into(),
            source: source.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        self.source.code()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration at {0}")]
    FileNotFound(String),

    #[error("bad TOML: {0}")]
    ParseError(String),

    #[error("{field}: {detail}")]
    InvalidValue { field: String, detail: String },

    #[error("unknown repository '{0}'")]
    UnknownRepository(String),

    #[error("reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Settings database and content index storage.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration to schema {version} failed: {detail}")]
    MigrationFailed { version: u32, detail: String },

    #[error("no {entity} '{id}'")]
    NotFound { entity: String, id: String },

    #[error("encoding stored JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database directory: {0}")]
    Io(#[from] std::io::Error),
}
