//! Local Git repository operations via `git2`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use git2::build::CheckoutBuilder;
use git2::{
    Cred, Delta, DiffOptions, ErrorCode, FetchOptions, Oid, PushOptions, RemoteCallbacks,
    Repository, ResetType, Signature, StashApplyOptions, StashFlags, Status, StatusOptions,
};
use tracing::{debug, info, instrument, warn};

use crate::errors::GitError;
use crate::meta;
use crate::models::{Change, ChangeKind, WorkingTreeStatus};

const REMOTE: &str = "origin";

/// Username/password pair used for HTTP(S) remotes.
#[derive(Clone, Default)]
pub struct GitCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for GitCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitCredentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl GitCredentials {
    fn callbacks(&self) -> RemoteCallbacks<'static> {
        let mut callbacks = RemoteCallbacks::new();
        if let Some(password) = self.password.clone() {
            let username = self.username.clone();
            callbacks.credentials(move |_url, url_user, _allowed| {
                let user = username.as_deref().or(url_user).unwrap_or("git");
                Cred::userpass_plaintext(user, &password)
            });
        }
        callbacks
    }

    fn fetch_options(&self) -> FetchOptions<'static> {
        let mut opts = FetchOptions::new();
        opts.remote_callbacks(self.callbacks());
        opts
    }
}

/// What a pull did to HEAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullResult {
    UpToDate,
    FastForward { from: Option<Oid>, to: Oid },
    Merged { from: Oid, to: Oid },
}

/// High-level Git client wrapping a `git2::Repository`.
pub struct GitClient {
    repo: Repository,
    repo_path: PathBuf,
}

impl GitClient {
    /// Open an existing Git repository at `repo_path`.
    pub fn open<P: AsRef<Path>>(repo_path: P) -> Result<Self, GitError> {
        let path = repo_path.as_ref();
        debug!(path = %path.display(), "opening git repository");
        let repo = Repository::open(path)
            .map_err(|_| GitError::NotARepository(path.display().to_string()))?;
        Ok(Self {
            repo,
            repo_path: path.to_path_buf(),
        })
    }

    /// Whether `path` holds a working copy.
    pub fn exists(path: &Path) -> bool {
        path.join(".git").exists()
    }

    /// Clone `branch` of `url` into `path`.
    ///
    /// A non-empty `path` is adopted in place: the clone happens next to it
    /// and its `.git` directory is moved in, then the tree is force-checked
    /// out over the existing files.
    #[instrument(skip(creds), fields(path = %path.display()))]
    pub fn clone_repo(
        url: &str,
        path: &Path,
        branch: &str,
        creds: &GitCredentials,
    ) -> Result<Self, GitError> {
        info!("cloning git repository");
        let occupied = path.exists() && std::fs::read_dir(path)?.next().is_some();

        let mut builder = git2::build::RepoBuilder::new();
        builder.branch(branch);
        builder.fetch_options(creds.fetch_options());

        if !occupied {
            let repo = builder.clone(url, path)?;
            info!("clone completed");
            return Ok(Self {
                repo,
                repo_path: path.to_path_buf(),
            });
        }

        let parent = path.parent().unwrap_or(Path::new("."));
        let staging = tempfile::tempdir_in(parent)?;
        builder.clone(url, staging.path())?;
        std::fs::rename(staging.path().join(".git"), path.join(".git"))?;

        let client = Self::open(path)?;
        {
            let head = client.repo.head()?.peel_to_commit()?;
            client.repo.reset(
                head.as_object(),
                ResetType::Hard,
                Some(CheckoutBuilder::new().force()),
            )?;
        }
        info!("clone adopted existing directory");
        Ok(client)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Keep `dir` (relative to the work tree) out of status, stashes and
    /// cleanups by listing it in `.git/info/exclude`.
    pub fn exclude_dir(&self, dir: &str) -> Result<(), GitError> {
        let rule = format!("/{}/", dir.trim_matches('/'));
        let info = self.repo.path().join("info");
        let file = info.join("exclude");
        let current = match std::fs::read_to_string(&file) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        if current.lines().any(|line| line.trim() == rule) {
            return Ok(());
        }
        std::fs::create_dir_all(&info)?;
        let mut text = current;
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&rule);
        text.push('\n');
        std::fs::write(&file, text)?;
        debug!(rule, "local exclude rule added");
        Ok(())
    }

    /// Fetch `branch` from origin.
    #[instrument(skip(self, creds))]
    pub fn fetch(&self, branch: &str, creds: &GitCredentials) -> Result<(), GitError> {
        let mut remote = self.repo.find_remote(REMOTE)?;
        let refspec = format!("+refs/heads/{branch}:refs/remotes/{REMOTE}/{branch}");
        remote.fetch(&[refspec.as_str()], Some(&mut creds.fetch_options()), None)?;
        debug!("fetch completed");
        Ok(())
    }

    /// Commit id of HEAD, `None` on an unborn branch.
    pub fn head_oid(&self) -> Result<Option<Oid>, GitError> {
        match self.repo.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?.id())),
            Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Commit id of the remote-tracking ref for `branch`.
    pub fn upstream_oid(&self, branch: &str) -> Result<Oid, GitError> {
        let name = format!("refs/remotes/{REMOTE}/{branch}");
        let reference = self
            .repo
            .find_reference(&name)
            .map_err(|_| GitError::RefNotFound(name.clone()))?;
        Ok(reference.peel_to_commit()?.id())
    }

    /// Number of upstream commits HEAD does not have yet.
    pub fn behind(&self, branch: &str) -> Result<usize, GitError> {
        let upstream = self.upstream_oid(branch)?;
        match self.head_oid()? {
            Some(head) => Ok(self.repo.graph_ahead_behind(head, upstream)?.1),
            None => Ok(1),
        }
    }

    /// Integrate the already-fetched upstream `branch` into HEAD.
    ///
    /// A merge that conflicts is aborted and the tree reset to HEAD; the
    /// conflicting paths are returned in [`GitError::MergeConflict`].
    #[instrument(skip(self, signature))]
    pub fn merge_upstream(
        &self,
        branch: &str,
        signature: &Signature<'_>,
    ) -> Result<PullResult, GitError> {
        let upstream_ref = self
            .repo
            .find_reference(&format!("refs/remotes/{REMOTE}/{branch}"))?;
        let upstream = self.repo.reference_to_annotated_commit(&upstream_ref)?;
        let (analysis, _) = self.repo.merge_analysis(&[&upstream])?;
        let head = self.head_oid()?;

        if analysis.is_up_to_date() {
            debug!("already up to date");
            return Ok(PullResult::UpToDate);
        }

        if analysis.is_fast_forward() || analysis.is_unborn() {
            let target = upstream.id();
            let refname = format!("refs/heads/{branch}");
            match self.repo.find_reference(&refname) {
                Ok(mut local) => {
                    local.set_target(target, "karasync: fast-forward")?;
                }
                Err(_) => {
                    self.repo
                        .reference(&refname, target, true, "karasync: fast-forward")?;
                }
            }
            self.repo.set_head(&refname)?;
            self.repo
                .checkout_head(Some(CheckoutBuilder::new().safe()))?;
            info!(to = %target, "fast-forwarded");
            return Ok(PullResult::FastForward {
                from: head,
                to: target,
            });
        }

        let from = head.ok_or_else(|| GitError::RefNotFound("HEAD".into()))?;
        self.repo.merge(&[&upstream], None, None)?;
        let mut index = self.repo.index()?;
        if index.has_conflicts() {
            let paths = conflict_paths(&index)?;
            warn!(count = paths.len(), "merge conflict, aborting");
            self.repo.cleanup_state()?;
            self.reset_hard()?;
            return Err(GitError::MergeConflict { paths });
        }

        let tree = self.repo.find_tree(index.write_tree()?)?;
        let ours = self.repo.find_commit(from)?;
        let theirs = self.repo.find_commit(upstream.id())?;
        let message = format!("Merge remote-tracking branch '{REMOTE}/{branch}'");
        let to = self
            .repo
            .commit(Some("HEAD"), signature, signature, &message, &tree, &[&ours, &theirs])?;
        self.repo.cleanup_state()?;
        self.repo
            .checkout_head(Some(CheckoutBuilder::new().force()))?;
        info!(%to, "merged upstream");
        Ok(PullResult::Merged { from, to })
    }

    /// Uncommitted changes, untracked files included.
    pub fn status(&self) -> Result<WorkingTreeStatus, GitError> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = self.repo.statuses(Some(&mut opts))?;

        let mut status = WorkingTreeStatus::default();
        for entry in statuses.iter() {
            let Some(path) = entry.path() else { continue };
            let path = path.to_string();
            let s = entry.status();
            if s.intersects(Status::INDEX_DELETED | Status::WT_DELETED) {
                status.deleted.push(path);
            } else if s.intersects(Status::INDEX_NEW | Status::WT_NEW) {
                status.added.push(path);
            } else if s.intersects(
                Status::INDEX_MODIFIED
                    | Status::WT_MODIFIED
                    | Status::INDEX_TYPECHANGE
                    | Status::WT_TYPECHANGE
                    | Status::INDEX_RENAMED
                    | Status::WT_RENAMED
                    | Status::CONFLICTED,
            ) {
                status.modified.push(path);
            }
        }
        status.added.sort();
        status.modified.sort();
        status.deleted.sort();
        Ok(status)
    }

    /// Stash every uncommitted change, untracked files included.
    pub fn stash_save(
        &mut self,
        message: &str,
        signature: &Signature<'_>,
    ) -> Result<Oid, GitError> {
        let oid = self
            .repo
            .stash_save2(signature, Some(message), Some(StashFlags::INCLUDE_UNTRACKED))?;
        debug!(%oid, message, "stash saved");
        Ok(oid)
    }

    /// Re-apply and drop the most recent stash. On failure the stash is
    /// left in place.
    pub fn stash_pop(&mut self) -> Result<(), GitError> {
        let mut opts = StashApplyOptions::new();
        self.repo.stash_pop(0, Some(&mut opts))?;
        if self.repo.index()?.has_conflicts() {
            let paths = conflict_paths(&self.repo.index()?)?;
            return Err(GitError::MergeConflict { paths });
        }
        Ok(())
    }

    pub fn stash_drop(&mut self) -> Result<(), GitError> {
        self.repo.stash_drop(0)?;
        Ok(())
    }

    /// Reset the working tree to HEAD and remove untracked files.
    pub fn reset_hard(&self) -> Result<(), GitError> {
        let Some(head) = self.head_oid()? else {
            return Ok(());
        };
        let commit = self.repo.find_commit(head)?;
        self.repo.reset(
            commit.as_object(),
            ResetType::Hard,
            Some(CheckoutBuilder::new().force().remove_untracked(true)),
        )?;
        debug!(%head, "working tree reset");
        Ok(())
    }

    /// Changes between two commits; `from: None` lists every file of `to`
    /// as new. Uids come from the blob on the relevant side.
    pub fn diff_changes(&self, from: Option<Oid>, to: Oid) -> Result<Vec<Change>, GitError> {
        let old_tree = match from {
            Some(oid) => Some(self.repo.find_commit(oid)?.tree()?),
            None => None,
        };
        let new_tree = self.repo.find_commit(to)?.tree()?;
        let mut opts = DiffOptions::new();
        opts.include_typechange(true);
        let diff = self
            .repo
            .diff_tree_to_tree(old_tree.as_ref(), Some(&new_tree), Some(&mut opts))?;

        let mut changes = Vec::new();
        for delta in diff.deltas() {
            let (file, kind) = match delta.status() {
                Delta::Added | Delta::Copied => (delta.new_file(), ChangeKind::New),
                Delta::Deleted => (delta.old_file(), ChangeKind::Delete),
                Delta::Modified | Delta::Typechange | Delta::Renamed => {
                    (delta.new_file(), ChangeKind::Modified)
                }
                _ => continue,
            };
            let Some(path) = file.path().and_then(|p| p.to_str()) else {
                continue;
            };
            let uid = self.blob_uid(path, file.id());
            changes.push(Change::new(path.to_string(), kind, uid));
        }
        Ok(changes)
    }

    fn blob_uid(&self, path: &str, id: Oid) -> Option<String> {
        let blob = self.repo.find_blob(id).ok()?;
        match meta::uid_of(path, blob.content()) {
            Ok(uid) => uid,
            Err(e) => {
                warn!(path, error = %e, "could not resolve uid");
                None
            }
        }
    }

    /// Content of `path` as of HEAD, `None` if it is not tracked there.
    pub fn read_head_file(&self, path: &str) -> Result<Option<Vec<u8>>, GitError> {
        let Some(head) = self.head_oid()? else {
            return Ok(None);
        };
        let tree = self.repo.find_commit(head)?.tree()?;
        let entry = match tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let blob = self.repo.find_blob(entry.id())?;
        Ok(Some(blob.content().to_vec()))
    }

    /// Stage exactly `added` and `removed`, then commit on HEAD.
    #[instrument(
        skip(self, added, removed, signature),
        fields(files = added.len() + removed.len())
    )]
    pub fn commit_paths(
        &self,
        added: &[String],
        removed: &[String],
        message: &str,
        signature: &Signature<'_>,
    ) -> Result<Oid, GitError> {
        let mut index = self.repo.index()?;
        for path in added {
            if self.repo_path.join(path).exists() {
                index.add_path(Path::new(path))?;
            } else {
                index.remove_path(Path::new(path))?;
            }
        }
        for path in removed {
            index.remove_path(Path::new(path))?;
        }
        index.write()?;

        let tree = self.repo.find_tree(index.write_tree()?)?;
        let parent = match self.head_oid()? {
            Some(oid) => Some(self.repo.find_commit(oid)?),
            None => None,
        };
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), signature, signature, message, &tree, &parents)?;
        info!(sha = %oid, message, "created commit");
        Ok(oid)
    }

    /// Replay local commits on top of the fetched upstream `branch`.
    #[instrument(skip(self, signature))]
    pub fn rebase_onto_upstream(
        &self,
        branch: &str,
        signature: &Signature<'_>,
    ) -> Result<(), GitError> {
        let upstream = self.upstream_oid(branch)?;
        let head = self
            .head_oid()?
            .ok_or_else(|| GitError::RefNotFound("HEAD".into()))?;
        if head == upstream || self.repo.graph_descendant_of(head, upstream)? {
            debug!("already on top of upstream");
            return Ok(());
        }

        let onto = self.repo.find_annotated_commit(upstream)?;
        let mut rebase = self.repo.rebase(None, Some(&onto), None, None)?;
        while let Some(op) = rebase.next() {
            if let Err(e) = op {
                rebase.abort()?;
                return Err(e.into());
            }
            let index = self.repo.index()?;
            if index.has_conflicts() {
                let paths = conflict_paths(&index)?;
                rebase.abort()?;
                return Err(GitError::MergeConflict { paths });
            }
            match rebase.commit(None, signature, None) {
                Ok(_) => {}
                Err(e) if e.code() == ErrorCode::Applied => {
                    debug!("commit already upstream, skipped");
                }
                Err(e) => {
                    rebase.abort()?;
                    return Err(e.into());
                }
            }
        }
        rebase.finish(Some(signature))?;
        info!(%upstream, "rebased onto upstream");
        Ok(())
    }

    /// Fail with [`GitError::Regression`] unless HEAD contains upstream.
    pub fn verify_descends_from_upstream(&self, branch: &str) -> Result<(), GitError> {
        let upstream = self.upstream_oid(branch)?;
        let head = self
            .head_oid()?
            .ok_or_else(|| GitError::RefNotFound("HEAD".into()))?;
        if head == upstream || self.repo.graph_descendant_of(head, upstream)? {
            Ok(())
        } else {
            Err(GitError::Regression(format!(
                "HEAD {head} does not contain {REMOTE}/{branch} {upstream}"
            )))
        }
    }

    /// Push local `branch` to origin.
    #[instrument(skip(self, creds))]
    pub fn push(&self, branch: &str, creds: &GitCredentials) -> Result<(), GitError> {
        info!(branch, "pushing");
        let mut remote = self.repo.find_remote(REMOTE)?;
        let mut callbacks = creds.callbacks();
        let push_error = Arc::new(Mutex::new(None::<String>));
        let push_error_clone = Arc::clone(&push_error);
        callbacks.push_update_reference(move |refname, status| {
            if let Some(msg) = status {
                warn!(refname, msg, "push rejected");
                if let Ok(mut slot) = push_error_clone.lock() {
                    *slot = Some(msg.to_string());
                }
            }
            Ok(())
        });
        let mut push_opts = PushOptions::new();
        push_opts.remote_callbacks(callbacks);
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        remote.push(&[refspec.as_str()], Some(&mut push_opts))?;

        let rejected = push_error.lock().ok().and_then(|mut slot| slot.take());
        if let Some(detail) = rejected {
            return Err(GitError::PushRejected {
                branch: branch.to_string(),
                detail,
            });
        }
        info!("push completed");
        Ok(())
    }
}

fn conflict_paths(index: &git2::Index) -> Result<Vec<String>, GitError> {
    let mut paths = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        let entry = conflict
            .our
            .as_ref()
            .or(conflict.their.as_ref())
            .or(conflict.ancestor.as_ref());
        if let Some(entry) = entry {
            paths.push(String::from_utf8_lossy(&entry.path).into_owned());
        }
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}
