//! Working-copy reconciliation on top of [`GitClient`].
//!
//! Every function here is blocking; callers on the async runtime go through
//! `spawn_blocking`.

use std::collections::BTreeSet;

use git2::Signature;
use tracing::{debug, info, instrument, warn};

use super::client::{GitClient, GitCredentials};
use crate::config::{GitRemoteConfig, RepositoryConfig};
use crate::errors::{GitError, MetaError, SyncError};
use crate::models::{Change, Push, StashOutcome};
use crate::planner::{self, FileSource};

/// Where a working copy stands relative to its upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingCopyState {
    Absent,
    CleanSynced,
    CleanBehind,
    Dirty,
}

impl std::fmt::Display for WorkingCopyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::CleanSynced => write!(f, "clean_synced"),
            Self::CleanBehind => write!(f, "clean_behind"),
            Self::Dirty => write!(f, "dirty"),
        }
    }
}

/// Result of bringing a working copy up to date.
#[derive(Debug, Clone)]
pub struct GitUpdate {
    pub initial_state: WorkingCopyState,
    pub old_head: Option<String>,
    pub new_head: Option<String>,
    pub changes: Vec<Change>,
    pub stash_outcomes: Vec<StashOutcome>,
}

/// Commits created and pushed by [`push`].
#[derive(Debug, Clone, Default)]
pub struct PushResult {
    pub commits: Vec<String>,
    pub head: Option<String>,
}

fn credentials(git: &GitRemoteConfig) -> GitCredentials {
    GitCredentials {
        username: git.username.clone(),
        password: git.password.clone(),
    }
}

fn signature(git: &GitRemoteConfig) -> Result<Signature<'static>, GitError> {
    Ok(Signature::now(&git.author_name, &git.author_email)?)
}

/// Open the working copy with the media directory excluded from git.
fn open(repo: &RepositoryConfig) -> Result<GitClient, GitError> {
    let client = GitClient::open(&repo.base_dir)?;
    client.exclude_dir(&repo.paths.medias)?;
    Ok(client)
}

fn classify(client: &GitClient, branch: &str) -> Result<WorkingCopyState, GitError> {
    if !client.status()?.is_clean() {
        return Ok(WorkingCopyState::Dirty);
    }
    if client.behind(branch)? > 0 {
        Ok(WorkingCopyState::CleanBehind)
    } else {
        Ok(WorkingCopyState::CleanSynced)
    }
}

/// Bring the working copy to `CleanSynced` and report what changed.
///
/// Local edits of a dirty tree are stashed around the pull and reapplied
/// afterwards. A stash that no longer applies is dropped and the tree reset;
/// its outcome says so. A conflict in the pull itself is returned as
/// [`GitError::MergeConflict`] after the stashes are unwound.
#[instrument(skip(repo, git), fields(repository = %repo.name))]
pub fn update(repo: &RepositoryConfig, git: &GitRemoteConfig) -> Result<GitUpdate, GitError> {
    let creds = credentials(git);
    let sig = signature(git)?;

    if !GitClient::exists(&repo.base_dir) {
        if let Some(parent) = repo.base_dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let client = GitClient::clone_repo(&git.url, &repo.base_dir, &git.branch, &creds)?;
        client.exclude_dir(&repo.paths.medias)?;
        let head = client
            .head_oid()?
            .ok_or_else(|| GitError::RefNotFound("HEAD".into()))?;
        let changes = client.diff_changes(None, head)?;
        info!(files = changes.len(), "working copy cloned");
        return Ok(GitUpdate {
            initial_state: WorkingCopyState::Absent,
            old_head: None,
            new_head: Some(head.to_string()),
            changes,
            stash_outcomes: Vec::new(),
        });
    }

    let mut client = open(repo)?;
    client.fetch(&git.branch, &creds)?;
    let initial_state = classify(&client, &git.branch)?;
    let old_head = client.head_oid()?;
    debug!(state = %initial_state, "working copy state");

    let mut stash_outcomes = Vec::new();
    match initial_state {
        WorkingCopyState::CleanSynced | WorkingCopyState::Absent => {}
        WorkingCopyState::CleanBehind => {
            client.merge_upstream(&git.branch, &sig)?;
        }
        WorkingCopyState::Dirty => {
            let buckets = planner::plan_passthrough(&client.status()?);
            let mut stashed = Vec::new();
            for commit in &buckets.commits {
                if client.status()?.is_clean() {
                    break;
                }
                client.stash_save(&commit.message, &sig)?;
                stashed.push(commit.message.clone());
            }
            debug!(stashes = stashed.len(), "local changes stashed");

            let pulled = client.merge_upstream(&git.branch, &sig);
            stash_outcomes = unwind_stashes(&mut client, stashed)?;
            pulled?;
        }
    }

    let new_head = client.head_oid()?;
    let changes = match new_head {
        Some(to) if Some(to) != old_head => client.diff_changes(old_head, to)?,
        _ => Vec::new(),
    };
    info!(
        state = %initial_state,
        changes = changes.len(),
        stashes = stash_outcomes.len(),
        "working copy updated"
    );
    Ok(GitUpdate {
        initial_state,
        old_head: old_head.map(|o| o.to_string()),
        new_head: new_head.map(|o| o.to_string()),
        changes,
        stash_outcomes,
    })
}

/// Pop stashes most-recent-first. A stash that fails to apply is dropped
/// and the tree is hard-reset before the next one.
fn unwind_stashes(
    client: &mut GitClient,
    stashed: Vec<String>,
) -> Result<Vec<StashOutcome>, GitError> {
    let mut outcomes = Vec::with_capacity(stashed.len());
    for message in stashed.into_iter().rev() {
        match client.stash_pop() {
            Ok(()) => outcomes.push(StashOutcome::Applied { message }),
            Err(e) => {
                warn!(stash = %message, error = %e, "stash no longer applies, discarding");
                client.stash_drop()?;
                client.reset_hard()?;
                outcomes.push(StashOutcome::ConflictedDiscarded {
                    message,
                    reason: e.to_string(),
                });
            }
        }
    }
    Ok(outcomes)
}

/// Reads the working tree for current content and HEAD for previous content.
pub struct WorkingTreeSource<'a> {
    client: &'a GitClient,
}

impl<'a> WorkingTreeSource<'a> {
    pub fn new(client: &'a GitClient) -> Self {
        Self { client }
    }
}

impl FileSource for WorkingTreeSource<'_> {
    fn read_current(&self, path: &str) -> Result<Vec<u8>, MetaError> {
        std::fs::read(self.client.repo_path().join(path)).map_err(|source| MetaError::Io {
            path: path.to_string(),
            source,
        })
    }

    fn read_previous(&self, path: &str) -> Result<Vec<u8>, MetaError> {
        match self.client.read_head_file(path) {
            Ok(Some(bytes)) => Ok(bytes),
            _ => Err(MetaError::MissingPrevious {
                path: path.to_string(),
            }),
        }
    }
}

/// Plan the commits a push of the current working tree would create.
pub fn plan(repo: &RepositoryConfig) -> Result<Push, SyncError> {
    let client = open(repo)?;
    let status = client.status()?;
    let push = planner::plan(&status, &WorkingTreeSource::new(&client), &repo.paths)?;
    Ok(push)
}

/// Commit `push` (or one squashed commit when `squash_message` is set),
/// rebase onto upstream and push.
#[instrument(skip(repo, git, push), fields(repository = %repo.name, commits = push.commits.len()))]
pub fn push(
    repo: &RepositoryConfig,
    git: &GitRemoteConfig,
    push: &Push,
) -> Result<PushResult, GitError> {
    if push.commits.is_empty() {
        debug!("nothing to commit");
        return Ok(PushResult::default());
    }
    let creds = credentials(git);
    let sig = signature(git)?;
    let client = open(repo)?;

    let mut commits = Vec::new();
    match &push.squash_message {
        Some(message) => {
            let (added, removed) = squash(push);
            commits.push(client.commit_paths(&added, &removed, message, &sig)?);
        }
        None => {
            for commit in &push.commits {
                commits.push(client.commit_paths(
                    &commit.added_files,
                    &commit.removed_files,
                    &commit.message,
                    &sig,
                )?);
            }
        }
    }

    client.fetch(&git.branch, &creds)?;
    client.rebase_onto_upstream(&git.branch, &sig)?;
    client.verify_descends_from_upstream(&git.branch)?;
    client.push(&git.branch, &creds)?;

    let head = client.head_oid()?.map(|o| o.to_string());
    info!(commits = commits.len(), head = ?head, "pushed");
    Ok(PushResult {
        commits: commits.iter().map(|o| o.to_string()).collect(),
        head,
    })
}

fn squash(push: &Push) -> (Vec<String>, Vec<String>) {
    let mut added = BTreeSet::new();
    let mut removed = BTreeSet::new();
    for commit in &push.commits {
        added.extend(commit.added_files.iter().cloned());
        removed.extend(commit.removed_files.iter().cloned());
    }
    (added.into_iter().collect(), removed.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Commit;

    #[test]
    fn test_squash_merges_paths() {
        let push = Push {
            commits: vec![
                Commit {
                    added_files: vec!["b".into(), "a".into()],
                    removed_files: vec!["x".into()],
                    message: "one".into(),
                },
                Commit {
                    added_files: vec!["a".into()],
                    removed_files: vec![],
                    message: "two".into(),
                },
            ],
            squash_message: Some("all".into()),
            ..Default::default()
        };
        let (added, removed) = squash(&push);
        assert_eq!(added, vec!["a", "b"]);
        assert_eq!(removed, vec!["x"]);
    }

    #[test]
    fn test_plan_ignores_media_dir() {
        let dir = tempfile::tempdir().unwrap();
        git2::Repository::init(dir.path()).unwrap();
        let mut repo = RepositoryConfig::new("r", dir.path().to_path_buf());
        repo.paths.medias = "videos".into();
        std::fs::create_dir_all(dir.path().join("videos")).unwrap();
        std::fs::write(dir.path().join("videos/ENG - Song.mp4"), "video").unwrap();

        let push = plan(&repo).unwrap();
        assert!(push.commits.is_empty());
        assert!(push.unplanned.is_empty());
        let rules = std::fs::read_to_string(dir.path().join(".git/info/exclude")).unwrap();
        assert!(rules.lines().any(|l| l == "/videos/"));
    }
}
