//! Core domain models shared by the synchronization engine.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{RepositoryPaths, TransportMode};

// ---------------------------------------------------------------------------
// Changes
// ---------------------------------------------------------------------------

/// Kind of change applied to one metadata file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    New,
    Modified,
    Delete,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Modified => write!(f, "modified"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// A normalized add/modify/delete record for one file, produced by both the
/// patch transport and the version-control adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// Path relative to the repository base directory, `/`-separated.
    pub path: String,
    pub kind: ChangeKind,
    /// Stable id of the song or tag, when the file is one.
    pub uid: Option<String>,
}

impl Change {
    pub fn new(path: impl Into<String>, kind: ChangeKind, uid: Option<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            uid,
        }
    }
}

/// What a repository-relative path holds, derived from naming conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileCategory {
    Kara,
    Tag,
    Lyrics,
    Font,
    Media,
    Other,
}

impl FileCategory {
    /// Classify a `/`-separated path relative to the repository base dir.
    ///
    /// Song and tag files are recognized by suffix wherever they live; the
    /// other categories by their top-level subdirectory.
    pub fn of(path: &str, paths: &RepositoryPaths) -> Self {
        if path.ends_with(".kara.json") {
            return Self::Kara;
        }
        if path.ends_with(".tag.json") {
            return Self::Tag;
        }
        let top = path.split('/').next().unwrap_or_default();
        if top == paths.lyrics {
            Self::Lyrics
        } else if top == paths.fonts {
            Self::Font
        } else if top == paths.medias {
            Self::Media
        } else {
            Self::Other
        }
    }
}

/// Basename of a `/`-separated path.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Basename with the category suffix (`.kara.json`, `.tag.json`) or the last
/// extension removed. Used to pair a song file with its lyrics.
pub fn stem(path: &str) -> &str {
    let name = basename(path);
    for suffix in [".kara.json", ".tag.json"] {
        if let Some(s) = name.strip_suffix(suffix) {
            return s;
        }
    }
    match name.rfind('.') {
        Some(0) | None => name,
        Some(i) => &name[..i],
    }
}

// ---------------------------------------------------------------------------
// Working tree status
// ---------------------------------------------------------------------------

/// Uncommitted changes of a maintainer working copy, untracked files
/// included in `added`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingTreeStatus {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

impl WorkingTreeStatus {
    pub fn is_clean(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.is_clean()
    }

    /// Every path, in added / modified / deleted order.
    pub fn all_paths(&self) -> impl Iterator<Item = &String> {
        self.added
            .iter()
            .chain(self.modified.iter())
            .chain(self.deleted.iter())
    }
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

/// Media inventory record. Equality of the `(basename, size)` pair is the
/// only criterion used when comparing inventories.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MediaFile {
    pub basename: String,
    pub size: u64,
}

impl MediaFile {
    pub fn new(basename: impl Into<String>, size: u64) -> Self {
        Self {
            basename: basename.into(),
            size,
        }
    }
}

/// What has to happen to the remote copy of one media file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaAction {
    Upload,
    Delete,
    /// Same name, new content.
    Update,
    /// New name, same content: rename remotely.
    Rename,
    /// New name and new content: upload new, delete old.
    Reupload,
    Unchanged,
}

/// How one media file must change remotely to match a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifiedMedia {
    pub old: Option<String>,
    pub new: Option<String>,
    pub size_differs: bool,
    /// Message of the commit that owns this media change.
    pub commit: String,
}

impl ModifiedMedia {
    pub fn action(&self) -> MediaAction {
        match (&self.old, &self.new) {
            (None, Some(_)) => MediaAction::Upload,
            (Some(_), None) => MediaAction::Delete,
            (Some(old), Some(new)) if old == new => {
                if self.size_differs {
                    MediaAction::Update
                } else {
                    MediaAction::Unchanged
                }
            }
            (Some(_), Some(_)) => {
                if self.size_differs {
                    MediaAction::Reupload
                } else {
                    MediaAction::Rename
                }
            }
            (None, None) => MediaAction::Unchanged,
        }
    }
}

// ---------------------------------------------------------------------------
// Commits & pushes
// ---------------------------------------------------------------------------

/// A semantically grouped set of file additions and removals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub added_files: Vec<String>,
    pub removed_files: Vec<String>,
    pub message: String,
}

impl Commit {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.added_files.iter().chain(self.removed_files.iter())
    }
}

/// The unit handed from the commit planner to the push executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Push {
    pub commits: Vec<Commit>,
    pub modified_medias: Vec<ModifiedMedia>,
    pub squash_message: Option<String>,
    /// Changed paths that belong to no song/tag/lyrics commit.
    #[serde(default)]
    pub unplanned: Vec<String>,
}

impl Push {
    pub fn is_empty(&self) -> bool {
        self.commits.is_empty() && self.modified_medias.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Outcomes & reports
// ---------------------------------------------------------------------------

/// What became of one stash pushed around a dirty pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StashOutcome {
    Applied { message: String },
    ConflictedDiscarded { message: String, reason: String },
}

impl StashOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Counters returned by one change-applier call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyStats {
    pub tags_integrated: usize,
    pub karas_integrated: usize,
    pub tags_removed: usize,
    pub karas_removed: usize,
    pub fonts_added: usize,
    pub fonts_removed: usize,
    pub cycles_broken: usize,
}

impl ApplyStats {
    pub fn total(&self) -> usize {
        self.tags_integrated
            + self.karas_integrated
            + self.tags_removed
            + self.karas_removed
            + self.fonts_added
            + self.fonts_removed
    }
}

/// Result of a media reconciliation attempted during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MediaOutcome {
    Skipped,
    /// Running in the background after a snapshot install.
    Spawned,
    Done { changed: bool },
    Failed { error: String },
}

/// Summary of one update run of one repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub repository: String,
    pub mode: TransportMode,
    pub from_revision: Option<String>,
    pub to_revision: Option<String>,
    pub snapshot_installed: bool,
    pub changes: usize,
    pub applied: ApplyStats,
    pub media: MediaOutcome,
    #[serde(default)]
    pub stash_outcomes: Vec<StashOutcome>,
}

impl SyncReport {
    pub fn new(repository: impl Into<String>, mode: TransportMode) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            repository: repository.into(),
            mode,
            from_revision: None,
            to_revision: None,
            snapshot_installed: false,
            changes: 0,
            applied: ApplyStats::default(),
            media: MediaOutcome::Skipped,
            stash_outcomes: Vec::new(),
        }
    }
}
