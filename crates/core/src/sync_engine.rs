//! Per-repository synchronization orchestrator.
//!
//! The [`SyncEngine`] runs one update (or push) of one repository at a time,
//! guarded by a [`RepoLocks`] lease:
//!
//! 1. Archive repositories fetch the manifest, then either install a full
//!    snapshot or pull a patch from the last applied revision. A patch that
//!    cannot be applied by any means downgrades to a snapshot.
//! 2. Git repositories reconcile their working copy (clone, pull, or stash
//!    around a pull).
//! 3. The resulting changes go through the change applier; only then is the
//!    revision pointer moved.
//! 4. Media files are reconciled last. Their failures are reported but do
//!    not fail the run.
//!
//! Every run is recorded in `sync_runs` and the audit log.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::applier::{self, ContentIndex};
use crate::config::{AppConfig, FtpConfig, RepositoryConfig, TransportMode};
use crate::db::{Database, SqliteIndex};
use crate::errors::{ConfigError, RepoSyncError, SyncError, TransferError};
use crate::git::vcs::{self, PushResult};
use crate::lock::{RepoLocks, SyncLease};
use crate::media;
use crate::models::{ApplyStats, Change, ChangeKind, MediaAction, MediaOutcome, Push, SyncReport};
use crate::patch;
use crate::remote::{Manifest, RepositoryRemote};
use crate::snapshot;
use crate::transfer::{self, FileTransfer, FtpTransfer, TransferReport};

/// Builds the content index of a repository.
pub type IndexFactory = Arc<dyn Fn(&RepositoryConfig) -> Arc<dyn ContentIndex> + Send + Sync>;

/// Builds the media file transfer of a repository.
pub type TransferFactory = Arc<dyn Fn(&FtpConfig) -> Box<dyn FileTransfer> + Send + Sync>;

/// Outcome of [`SyncEngine::push_repo`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct PushSummary {
    pub commits: Vec<String>,
    pub head: Option<String>,
    pub messages: Vec<String>,
    pub uploaded: Vec<String>,
    pub renamed: Vec<(String, String)>,
    pub deleted: Vec<String>,
    pub unplanned: Vec<String>,
}

impl PushSummary {
    fn new(push: &Push, result: PushResult, transfer: TransferReport) -> Self {
        let messages = match &push.squash_message {
            Some(message) => vec![message.clone()],
            None => push.commits.iter().map(|c| c.message.clone()).collect(),
        };
        Self {
            commits: result.commits,
            head: result.head,
            messages,
            uploaded: transfer.uploaded,
            renamed: transfer.renamed,
            deleted: transfer.deleted,
            unplanned: push.unplanned.clone(),
        }
    }
}

/// Point-in-time view of one configured repository.
#[derive(Debug, Clone, Serialize)]
pub struct RepositoryStatus {
    pub name: String,
    pub mode: TransportMode,
    pub enabled: bool,
    pub revision: Option<String>,
    pub running: bool,
    pub last_run_status: Option<String>,
    pub last_run_at: Option<String>,
}

/// The synchronization engine.
pub struct SyncEngine {
    config: AppConfig,
    db: Arc<Database>,
    remote: Arc<dyn RepositoryRemote>,
    locks: RepoLocks,
    index: IndexFactory,
    transfer: TransferFactory,
}

impl SyncEngine {
    /// Engine backed by the bundled SQLite content index and FTP transfer.
    pub fn new(
        config: AppConfig,
        db: Arc<Database>,
        remote: Arc<dyn RepositoryRemote>,
        locks: RepoLocks,
    ) -> Self {
        info!(repositories = config.repositories.len(), "initializing sync engine");
        let index_db = Arc::clone(&db);
        Self {
            config,
            db,
            remote,
            locks,
            index: Arc::new(move |repo: &RepositoryConfig| {
                Arc::new(SqliteIndex::new(Arc::clone(&index_db), repo.name.clone()))
                    as Arc<dyn ContentIndex>
            }),
            transfer: Arc::new(|ftp: &FtpConfig| {
                Box::new(FtpTransfer::new(ftp)) as Box<dyn FileTransfer>
            }),
        }
    }

    /// Replace the content index used for every repository.
    pub fn with_index_factory(mut self, factory: IndexFactory) -> Self {
        self.index = factory;
        self
    }

    /// Replace the media file transfer used by pushes.
    pub fn with_transfer_factory(mut self, factory: TransferFactory) -> Self {
        self.transfer = factory;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn locks(&self) -> &RepoLocks {
        &self.locks
    }

    fn repository(&self, name: &str) -> Result<RepositoryConfig, RepoSyncError> {
        self.config
            .repository(name)
            .cloned()
            .map_err(|e| RepoSyncError::new(name, e))
    }

    // -----------------------------------------------------------------------
    // Update
    // -----------------------------------------------------------------------

    /// Update every enabled online repository concurrently.
    pub async fn update_all(&self) -> Vec<Result<SyncReport, RepoSyncError>> {
        let names: Vec<String> = self
            .config
            .updatable_repositories()
            .map(|r| r.name.clone())
            .collect();
        futures::future::join_all(names.iter().map(|name| self.update_repo(name))).await
    }

    /// Bring one repository up to date with its origin.
    #[instrument(skip(self))]
    pub async fn update_repo(&self, name: &str) -> Result<SyncReport, RepoSyncError> {
        let repo = self.repository(name)?;
        // Shared with a background media task so the lease outlives this call.
        let lease = Arc::new(
            self.locks
                .try_acquire(&repo.name)
                .map_err(|e| RepoSyncError::new(name, e))?,
        );

        let mut report = SyncReport::new(&repo.name, repo.transport_mode());
        report.from_revision = self
            .db
            .get_revision(&repo.name)
            .map_err(|e| RepoSyncError::new(name, e))?;
        let run_id = report.run_id.to_string();
        let _ = self.db.start_sync_run(
            &run_id,
            &repo.name,
            "update",
            &report.mode.to_string(),
            report.from_revision.as_deref(),
        );

        let result = match repo.transport_mode() {
            TransportMode::Archive => self.update_archive(&repo, &lease, &mut report).await,
            TransportMode::Git => self.update_git(&repo, &mut report).await,
            TransportMode::LocalOnly => Err(SyncError::LocalOnly(repo.name.clone())),
        };

        match result {
            Ok(()) => {
                let details = serde_json::to_string(&report).ok();
                let _ = self.db.complete_sync_run(
                    &run_id,
                    "completed",
                    report.to_revision.as_deref(),
                    details.as_deref(),
                );
                let summary = format!(
                    "{} -> {}: {} change(s)",
                    report.from_revision.as_deref().unwrap_or("none"),
                    report.to_revision.as_deref().unwrap_or("none"),
                    report.changes
                );
                let _ = self
                    .db
                    .insert_audit_log("update", &repo.name, true, Some(&summary));
                info!(
                    repository = %repo.name,
                    changes = report.changes,
                    applied = report.applied.total(),
                    snapshot = report.snapshot_installed,
                    "repository updated"
                );
                Ok(report)
            }
            Err(e) => {
                let err = RepoSyncError::new(&repo.name, e);
                let message = err.to_string();
                let _ = self
                    .db
                    .complete_sync_run(&run_id, "failed", None, Some(&message));
                let _ = self
                    .db
                    .insert_audit_log("update", &repo.name, false, Some(&message));
                error!(
                    repository = %repo.name,
                    code = err.code(),
                    error = %err.source,
                    "update failed"
                );
                Err(err)
            }
        }
    }

    async fn update_archive(
        &self,
        repo: &RepositoryConfig,
        lease: &Arc<SyncLease>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let manifest = self
            .remote
            .metadata(repo)
            .await
            .map_err(SyncError::Unreachable)?;
        let pointer = report.from_revision.clone();

        let changes = if snapshot::needs_snapshot(repo, pointer.as_deref()) {
            self.install_snapshot(repo, &manifest, lease, report).await?
        } else if pointer.as_deref() == Some(manifest.latest_revision.as_str()) {
            debug!(revision = %manifest.latest_revision, "already at latest revision");
            Vec::new()
        } else {
            let from = pointer.unwrap_or_default();
            match patch::pull(self.remote.as_ref(), repo, &from).await {
                Ok(outcome) => outcome.changes,
                Err(e) => {
                    warn!(error = %e, "patch transport exhausted, installing snapshot");
                    self.db.clear_revision(&repo.name)?;
                    self.install_snapshot(repo, &manifest, lease, report).await?
                }
            }
        };

        report.changes = changes.len();
        report.applied = self.apply(repo, changes).await?;
        self.db.set_revision(&repo.name, &manifest.latest_revision)?;
        report.to_revision = Some(manifest.latest_revision.clone());

        if !report.snapshot_installed {
            report.media = self.sync_media(repo).await;
        }
        Ok(())
    }

    /// Install the archive and return the changes that take the content
    /// index from the old tree to the new one.
    ///
    /// A background media download keeps a clone of `lease` until it ends.
    async fn install_snapshot(
        &self,
        repo: &RepositoryConfig,
        manifest: &Manifest,
        lease: &Arc<SyncLease>,
        report: &mut SyncReport,
    ) -> Result<Vec<Change>, SyncError> {
        let before = {
            let repo = repo.clone();
            tokio::task::spawn_blocking(move || snapshot::enumerate_changes(&repo))
                .await
                .map_err(|e| SyncError::Task(e.to_string()))??
        };

        let install = snapshot::install_fresh(
            Arc::clone(&self.remote),
            repo,
            manifest,
            self.config.http.media_concurrency,
        )
        .await?;
        report.snapshot_installed = true;

        report.media = match install.media_task {
            Some(handle) => {
                let lease = Arc::clone(lease);
                tokio::spawn(async move {
                    let name = lease.repository();
                    match handle.await {
                        Ok(Ok(changed)) => {
                            info!(repository = %name, changed, "background media sync done")
                        }
                        Ok(Err(e)) => {
                            warn!(repository = %name, error = %e, "background media sync failed")
                        }
                        Err(e) => {
                            error!(repository = %name, error = %e, "background media sync panicked")
                        }
                    }
                    drop(lease);
                });
                MediaOutcome::Spawned
            }
            None => self.sync_media(repo).await,
        };

        let after = {
            let repo = repo.clone();
            tokio::task::spawn_blocking(move || snapshot::enumerate_changes(&repo))
                .await
                .map_err(|e| SyncError::Task(e.to_string()))??
        };
        Ok(snapshot_changes(before, after))
    }

    async fn update_git(
        &self,
        repo: &RepositoryConfig,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let git = repo.git.clone().ok_or_else(|| ConfigError::InvalidValue {
            field: format!("repository.{}.git", repo.name),
            detail: "maintainer mode requires a [repository.git] section".into(),
        })?;
        let update = {
            let repo = repo.clone();
            tokio::task::spawn_blocking(move || vcs::update(&repo, &git))
                .await
                .map_err(|e| SyncError::Task(e.to_string()))??
        };
        for outcome in &update.stash_outcomes {
            debug!(?outcome, "stash outcome");
        }
        report.stash_outcomes = update.stash_outcomes;
        report.changes = update.changes.len();
        report.applied = self.apply(repo, update.changes).await?;
        if let Some(head) = &update.new_head {
            self.db.set_revision(&repo.name, head)?;
        }
        report.to_revision = update.new_head;
        report.media = self.sync_media(repo).await;
        Ok(())
    }

    async fn apply(
        &self,
        repo: &RepositoryConfig,
        changes: Vec<Change>,
    ) -> Result<ApplyStats, SyncError> {
        if changes.is_empty() {
            return Ok(ApplyStats::default());
        }
        let index = (self.index)(repo);
        let repo = repo.clone();
        let stats =
            tokio::task::spawn_blocking(move || applier::apply(&repo, index.as_ref(), &changes))
                .await
                .map_err(|e| SyncError::Task(e.to_string()))??;
        Ok(stats)
    }

    /// Full media reconciliation when automatic downloads are on, otherwise
    /// refresh only the files already present.
    async fn sync_media(&self, repo: &RepositoryConfig) -> MediaOutcome {
        let update_only = !repo.auto_media_downloads;
        match media::sync_repository(
            self.remote.as_ref(),
            repo,
            self.config.http.media_concurrency,
            update_only,
        )
        .await
        {
            Ok(changed) => MediaOutcome::Done { changed },
            Err(e) => {
                warn!(repository = %repo.name, error = %e, "media synchronization failed");
                MediaOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Push
    // -----------------------------------------------------------------------

    fn maintainer_repository(&self, name: &str) -> Result<RepositoryConfig, RepoSyncError> {
        let repo = self.repository(name)?;
        match repo.transport_mode() {
            TransportMode::Git => Ok(repo),
            TransportMode::LocalOnly => {
                Err(RepoSyncError::new(name, SyncError::LocalOnly(repo.name)))
            }
            TransportMode::Archive => {
                Err(RepoSyncError::new(name, SyncError::NotMaintainer(repo.name)))
            }
        }
    }

    /// Preview the commits a push would create.
    pub async fn plan_repo(&self, name: &str) -> Result<Push, RepoSyncError> {
        let repo = self.maintainer_repository(name)?;
        tokio::task::spawn_blocking(move || vcs::plan(&repo))
            .await
            .map_err(|e| RepoSyncError::new(name, SyncError::Task(e.to_string())))?
            .map_err(|e| RepoSyncError::new(name, e))
    }

    /// Plan, upload media, then commit and push the working copy of `name`.
    ///
    /// Shares the update lease: a push never overlaps an update of the same
    /// repository.
    #[instrument(skip(self))]
    pub async fn push_repo(
        &self,
        name: &str,
        squash_message: Option<String>,
    ) -> Result<PushSummary, RepoSyncError> {
        let repo = self.maintainer_repository(name)?;
        let _lease = self
            .locks
            .try_acquire(&repo.name)
            .map_err(|e| RepoSyncError::new(name, e))?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let from = self.db.get_revision(&repo.name).ok().flatten();
        let _ = self.db.start_sync_run(
            &run_id,
            &repo.name,
            "push",
            &repo.transport_mode().to_string(),
            from.as_deref(),
        );

        match self.do_push(&repo, squash_message).await {
            Ok(summary) => {
                let details = serde_json::to_string(&summary).ok();
                let _ = self.db.complete_sync_run(
                    &run_id,
                    "completed",
                    summary.head.as_deref(),
                    details.as_deref(),
                );
                let _ = self.db.insert_audit_log(
                    "push",
                    &repo.name,
                    true,
                    Some(&format!("{} commit(s)", summary.commits.len())),
                );
                info!(repository = %repo.name, commits = summary.commits.len(), "push completed");
                Ok(summary)
            }
            Err(e) => {
                let err = RepoSyncError::new(&repo.name, e);
                let message = err.to_string();
                let _ = self
                    .db
                    .complete_sync_run(&run_id, "failed", None, Some(&message));
                let _ = self
                    .db
                    .insert_audit_log("push", &repo.name, false, Some(&message));
                error!(
                    repository = %repo.name,
                    code = err.code(),
                    error = %err.source,
                    "push failed"
                );
                Err(err)
            }
        }
    }

    async fn do_push(
        &self,
        repo: &RepositoryConfig,
        squash_message: Option<String>,
    ) -> Result<PushSummary, SyncError> {
        let mut push = {
            let repo = repo.clone();
            tokio::task::spawn_blocking(move || vcs::plan(&repo))
                .await
                .map_err(|e| SyncError::Task(e.to_string()))??
        };
        if push.commits.is_empty() {
            info!(repository = %repo.name, "nothing to push");
            return Ok(PushSummary {
                unplanned: push.unplanned,
                ..Default::default()
            });
        }
        push.squash_message = squash_message;
        let push = Arc::new(push);

        let needs_transfer = push
            .modified_medias
            .iter()
            .any(|m| m.action() != MediaAction::Unchanged);
        let transfer_report = if needs_transfer {
            let ftp = repo
                .ftp
                .clone()
                .ok_or_else(|| TransferError::NoCredentials(repo.name.clone()))?;
            let mut transfer = (self.transfer)(&ftp);
            let medias_dir = repo.medias_dir();
            let push = Arc::clone(&push);
            tokio::task::spawn_blocking(move || {
                transfer::push_medias(transfer.as_mut(), &medias_dir, &push.modified_medias)
            })
            .await
            .map_err(|e| SyncError::Task(e.to_string()))??
        } else {
            TransferReport::default()
        };

        let git = repo.git.clone().ok_or_else(|| ConfigError::InvalidValue {
            field: format!("repository.{}.git", repo.name),
            detail: "maintainer mode requires a [repository.git] section".into(),
        })?;
        let result = {
            let repo = repo.clone();
            let push = Arc::clone(&push);
            tokio::task::spawn_blocking(move || vcs::push(&repo, &git, &push))
                .await
                .map_err(|e| SyncError::Task(e.to_string()))??
        };
        if let Some(head) = &result.head {
            self.db.set_revision(&repo.name, head)?;
        }
        Ok(PushSummary::new(&push, result, transfer_report))
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Status of every configured repository.
    pub fn status(&self) -> Result<Vec<RepositoryStatus>, SyncError> {
        let mut statuses = Vec::with_capacity(self.config.repositories.len());
        for repo in &self.config.repositories {
            let last = self.db.get_latest_sync_run(&repo.name)?;
            statuses.push(RepositoryStatus {
                name: repo.name.clone(),
                mode: repo.transport_mode(),
                enabled: repo.enabled,
                revision: self.db.get_revision(&repo.name)?,
                running: self.locks.is_running(&repo.name),
                last_run_status: last.as_ref().map(|r| r.status.clone()),
                last_run_at: last.map(|r| r.completed_at.unwrap_or(r.started_at)),
            });
        }
        Ok(statuses)
    }
}

/// Changes taking the index from the `before` tree to the `after` tree:
/// everything in `after` as new, plus deletions for uids that disappeared.
fn snapshot_changes(before: Vec<Change>, mut after: Vec<Change>) -> Vec<Change> {
    let kept_uids: HashSet<&str> = after.iter().filter_map(|c| c.uid.as_deref()).collect();
    let kept_paths: HashSet<&str> = after.iter().map(|c| c.path.as_str()).collect();
    let deletions: Vec<Change> = before
        .into_iter()
        .filter(|c| match c.uid.as_deref() {
            Some(uid) => !kept_uids.contains(uid),
            None => !kept_paths.contains(c.path.as_str()),
        })
        .map(|c| Change::new(c.path, ChangeKind::Delete, c.uid))
        .collect();
    after.extend(deletions);
    after
}
