//! Media synchronizer: brings the local `medias` directory in line with the
//! origin's media listing.
//!
//! Files are compared by basename and size only.

use std::collections::BTreeMap;
use std::path::Path;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, instrument, warn};

use crate::config::RepositoryConfig;
use crate::errors::MediaError;
use crate::models::MediaFile;
use crate::remote::RepositoryRemote;

const PART_SUFFIX: &str = ".part";

/// What [`reconcile`] has to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaPlan {
    /// Remote files missing locally.
    pub added: Vec<MediaFile>,
    /// Remote files whose local copy has another size.
    pub updated: Vec<MediaFile>,
    /// Local files the origin no longer lists.
    pub removed: Vec<MediaFile>,
}

impl MediaPlan {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Files to download, in basename order.
    pub fn downloads(&self) -> Vec<MediaFile> {
        let mut files: Vec<MediaFile> = self
            .added
            .iter()
            .chain(self.updated.iter())
            .cloned()
            .collect();
        files.sort();
        files
    }
}

/// Classify `remote` against `local`. With `update_only`, nothing is added
/// and nothing is removed. Outputs are sorted by basename and disjoint.
pub fn classify(local: &[MediaFile], remote: &[MediaFile], update_only: bool) -> MediaPlan {
    let local_by_name: BTreeMap<&str, u64> =
        local.iter().map(|f| (f.basename.as_str(), f.size)).collect();
    let remote_by_name: BTreeMap<&str, u64> =
        remote.iter().map(|f| (f.basename.as_str(), f.size)).collect();

    let mut plan = MediaPlan::default();
    for (&name, &size) in &remote_by_name {
        match local_by_name.get(name) {
            Some(&local_size) if local_size == size => {}
            Some(_) => plan.updated.push(MediaFile::new(name, size)),
            None if update_only => {}
            None => plan.added.push(MediaFile::new(name, size)),
        }
    }
    if !update_only {
        for (&name, &size) in &local_by_name {
            if !remote_by_name.contains_key(name) {
                plan.removed.push(MediaFile::new(name, size));
            }
        }
    }
    plan
}

/// Inventory of `dir`. A missing directory is empty; partial downloads and
/// subdirectories are ignored.
pub fn local_inventory(dir: &Path) -> Result<Vec<MediaFile>, MediaError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(PART_SUFFIX) {
            continue;
        }
        files.push(MediaFile::new(name, metadata.len()));
    }
    files.sort();
    Ok(files)
}

fn is_safe_basename(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}

/// Carry out `plan` in `repo`'s media directory.
///
/// Removals and stale copies go first. Downloads then stream into a
/// `.part` file that is renamed into place once complete. Every download is
/// attempted; failures are reported together as [`MediaError::Partial`].
/// Returns whether anything on disk changed.
#[instrument(skip(remote, repo, plan), fields(repository = %repo.name))]
pub async fn reconcile(
    remote: &dyn RepositoryRemote,
    repo: &RepositoryConfig,
    plan: &MediaPlan,
    concurrency: usize,
) -> Result<bool, MediaError> {
    let dir = repo.medias_dir();
    tokio::fs::create_dir_all(&dir).await?;
    let mut changed = false;
    let mut failed = Vec::new();

    for file in plan.removed.iter().chain(plan.updated.iter()) {
        if !is_safe_basename(&file.basename) {
            continue;
        }
        match tokio::fs::remove_file(dir.join(&file.basename)).await {
            Ok(()) => {
                debug!(media = %file.basename, "local copy removed");
                changed = true;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(media = %file.basename, error = %e, "could not remove local copy");
                failed.push(file.basename.clone());
            }
        }
    }

    let downloads = plan.downloads();
    let total = downloads.len();
    let results: Vec<(String, Result<(), String>)> = stream::iter(downloads)
        .map(|file| {
            let dir = dir.clone();
            async move {
                let result = download_one(remote, repo, &dir, &file.basename).await;
                (file.basename, result)
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    for (name, result) in results {
        match result {
            Ok(()) => changed = true,
            Err(e) => {
                warn!(media = %name, error = %e, "media download failed");
                failed.push(name);
            }
        }
    }

    if !failed.is_empty() {
        failed.sort();
        return Err(MediaError::Partial { failed });
    }
    info!(downloaded = total, removed = plan.removed.len(), changed, "media reconciled");
    Ok(changed)
}

async fn download_one(
    remote: &dyn RepositoryRemote,
    repo: &RepositoryConfig,
    dir: &Path,
    basename: &str,
) -> Result<(), String> {
    if !is_safe_basename(basename) {
        return Err(format!("refusing unsafe media name '{basename}'"));
    }
    let part = dir.join(format!("{basename}{PART_SUFFIX}"));
    debug!(media = basename, "downloading");
    if let Err(e) = remote.download_media(repo, basename, &part).await {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(e.to_string());
    }
    tokio::fs::rename(&part, dir.join(basename))
        .await
        .map_err(|e| e.to_string())
}

/// List both sides, classify and reconcile.
pub async fn sync_repository(
    remote: &dyn RepositoryRemote,
    repo: &RepositoryConfig,
    concurrency: usize,
    update_only: bool,
) -> Result<bool, MediaError> {
    let local = local_inventory(&repo.medias_dir())?;
    let listing = remote.media_listing(repo).await?;
    let plan = classify(&local, &listing, update_only);
    debug!(
        added = plan.added.len(),
        updated = plan.updated.len(),
        removed = plan.removed.len(),
        update_only,
        "media plan"
    );
    if plan.is_empty() {
        return Ok(false);
    }
    reconcile(remote, repo, &plan, concurrency).await
}
