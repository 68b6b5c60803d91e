//! Full-archive installation of a repository's metadata tree.

use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::config::RepositoryConfig;
use crate::errors::{MediaError, SnapshotError};
use crate::media;
use crate::meta;
use crate::models::{Change, ChangeKind};
use crate::remote::{Manifest, RepositoryRemote};

/// Result of [`install_fresh`].
pub struct SnapshotInstall {
    pub revision: String,
    /// Background media synchronization, when the repository asks for it.
    pub media_task: Option<JoinHandle<Result<bool, MediaError>>>,
}

impl std::fmt::Debug for SnapshotInstall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotInstall")
            .field("revision", &self.revision)
            .field("media_task", &self.media_task.is_some())
            .finish()
    }
}

/// Whether the repository has to be installed from the archive instead of
/// patched: no revision pointer, or no songs on disk.
pub fn needs_snapshot(repo: &RepositoryConfig, pointer: Option<&str>) -> bool {
    if pointer.is_none() {
        return true;
    }
    match std::fs::read_dir(repo.karaokes_dir()) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}

fn metadata_dirs(repo: &RepositoryConfig) -> [PathBuf; 4] {
    [
        repo.karaokes_dir(),
        repo.tags_dir(),
        repo.lyrics_dir(),
        repo.fonts_dir(),
    ]
}

/// Download the archive named by `manifest` and replace the metadata tree
/// with its contents. The media directory is never touched.
#[instrument(
    skip(remote, repo, manifest),
    fields(repository = %repo.name, revision = %manifest.latest_revision)
)]
pub async fn install_fresh(
    remote: Arc<dyn RepositoryRemote>,
    repo: &RepositoryConfig,
    manifest: &Manifest,
    media_concurrency: usize,
) -> Result<SnapshotInstall, SnapshotError> {
    tokio::fs::create_dir_all(&repo.base_dir).await?;
    let archive = tempfile::NamedTempFile::new()?;
    remote
        .download_archive(repo, manifest, archive.path())
        .await?;

    let base_dir = repo.base_dir.clone();
    let dirs = metadata_dirs(repo);
    let skip = repo.paths.medias.clone();
    let extracted = tokio::task::spawn_blocking(move || {
        wipe(&dirs)?;
        extract(archive.path(), &base_dir, &skip)
    })
    .await
    .map_err(|e| SnapshotError::Archive(format!("extraction task failed: {e}")))??;
    info!(files = extracted, "snapshot installed");

    let media_task = if repo.auto_media_downloads {
        let remote = Arc::clone(&remote);
        let repo = repo.clone();
        debug!("spawning media synchronization");
        Some(tokio::spawn(async move {
            media::sync_repository(remote.as_ref(), &repo, media_concurrency, false).await
        }))
    } else {
        None
    };

    Ok(SnapshotInstall {
        revision: manifest.latest_revision.clone(),
        media_task,
    })
}

fn wipe(dirs: &[PathBuf]) -> Result<(), SnapshotError> {
    for dir in dirs {
        match std::fs::remove_dir_all(dir) {
            Ok(()) => debug!(dir = %dir.display(), "wiped"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Normal components of an archive entry path, `None` if it tries to
/// leave the destination.
fn entry_components(path: &Path) -> Option<Vec<String>> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts)
}

fn open(path: &Path) -> Result<tar::Archive<GzDecoder<File>>, SnapshotError> {
    Ok(tar::Archive::new(GzDecoder::new(File::open(path)?)))
}

fn archive_err(e: std::io::Error) -> SnapshotError {
    SnapshotError::Archive(e.to_string())
}

/// Top-level directory every entry lives under, if there is exactly one.
fn single_root(path: &Path) -> Result<Option<String>, SnapshotError> {
    let mut archive = open(path)?;
    let mut roots = BTreeSet::new();
    let mut has_top_level_file = false;
    for entry in archive.entries().map_err(archive_err)? {
        let entry = entry.map_err(archive_err)?;
        let Some(parts) = entry_components(&entry.path().map_err(archive_err)?) else {
            continue;
        };
        match parts.len() {
            0 => {}
            1 if !entry.header().entry_type().is_dir() => has_top_level_file = true,
            _ => {
                roots.insert(parts[0].clone());
            }
        }
    }
    if roots.len() == 1 && !has_top_level_file {
        Ok(roots.into_iter().next())
    } else {
        Ok(None)
    }
}

/// Extract the gzipped tarball at `path` into `dest`, dropping a single
/// top-level directory and anything under `skip_dir`. Returns the number
/// of files written.
pub fn extract(path: &Path, dest: &Path, skip_dir: &str) -> Result<usize, SnapshotError> {
    let root = single_root(path)?;
    let mut archive = open(path)?;
    let mut written = 0;
    for entry in archive.entries().map_err(archive_err)? {
        let mut entry = entry.map_err(archive_err)?;
        let entry_path = entry.path().map_err(archive_err)?.into_owned();
        let Some(mut parts) = entry_components(&entry_path) else {
            warn!(path = %entry_path.display(), "skipping unsafe archive entry");
            continue;
        };
        if let Some(root) = &root {
            if parts.first() == Some(root) {
                parts.remove(0);
            }
        }
        if parts.is_empty() || parts[0] == skip_dir {
            continue;
        }
        let target = parts.iter().fold(dest.to_path_buf(), |acc, p| acc.join(p));
        let kind = entry.header().entry_type();
        if kind.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if kind.is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            entry.unpack(&target).map_err(archive_err)?;
            written += 1;
        } else {
            debug!(path = %entry_path.display(), "skipping non-regular archive entry");
        }
    }
    Ok(written)
}

/// Every metadata file under the repository, as `New` changes sorted by
/// path.
pub fn enumerate_changes(repo: &RepositoryConfig) -> Result<Vec<Change>, SnapshotError> {
    let mut changes = Vec::new();
    for dir in metadata_dirs(repo) {
        if !dir.exists() {
            continue;
        }
        for entry in WalkDir::new(&dir) {
            let entry = entry.map_err(|e| SnapshotError::Archive(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&repo.base_dir) else {
                continue;
            };
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let uid = if rel.ends_with(".kara.json") || rel.ends_with(".tag.json") {
                let bytes = std::fs::read(entry.path())?;
                match meta::uid_of(&rel, &bytes) {
                    Ok(uid) => uid,
                    Err(e) => {
                        warn!(path = %rel, error = %e, "unreadable metadata file");
                        None
                    }
                }
            } else {
                None
            };
            changes.push(Change::new(rel, ChangeKind::New, uid));
        }
    }
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(changes)
}
