//! Commit planner: groups the raw changes of a maintainer working tree into
//! one commit per song, tag or lyrics file, and works out which media files
//! the file-transfer side has to touch.
//!
//! Renames are found in two passes: deleted songs are indexed by kid, then
//! every added song is resolved against that index. An added song sharing a
//! kid with a deleted one becomes a single "modify" commit.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use crate::config::RepositoryPaths;
use crate::errors::MetaError;
use crate::meta::{KaraData, KaraMetaFile, TagMetaFile};
use crate::models::{basename, stem, Commit, FileCategory, ModifiedMedia, Push, WorkingTreeStatus};

/// Reads file contents on both sides of the uncommitted changes.
pub trait FileSource {
    /// Content in the working tree.
    fn read_current(&self, path: &str) -> Result<Vec<u8>, MetaError>;
    /// Content as last committed.
    fn read_previous(&self, path: &str) -> Result<Vec<u8>, MetaError>;
}

/// Single commit holding every changed path. Used to stash local edits
/// around a pull.
pub fn plan_passthrough(status: &WorkingTreeStatus) -> Push {
    if status.is_clean() {
        return Push::default();
    }
    let mut commit = Commit::new("Local changes");
    commit.added_files = status
        .added
        .iter()
        .chain(status.modified.iter())
        .cloned()
        .collect();
    commit.removed_files = status.deleted.clone();
    Push {
        commits: vec![commit],
        ..Default::default()
    }
}

/// Compare the media of two versions of a song.
pub fn compare_media(old: &KaraData, new: &KaraData, commit: &str) -> Option<ModifiedMedia> {
    let media = |old: Option<&String>, new: Option<&String>, size_differs| {
        Some(ModifiedMedia {
            old: old.cloned(),
            new: new.cloned(),
            size_differs,
            commit: commit.to_string(),
        })
    };
    match (&old.media_filename, &new.media_filename) {
        (None, None) => None,
        (None, Some(n)) => media(None, Some(n), true),
        (Some(o), None) => media(Some(o), None, true),
        (Some(o), Some(n)) => {
            let size_differs = old.media_size != new.media_size;
            if o == n && !size_differs {
                None
            } else {
                media(Some(o), Some(n), size_differs)
            }
        }
    }
}

#[derive(Default)]
struct Buckets {
    karas_added: Vec<String>,
    karas_modified: Vec<String>,
    karas_deleted: Vec<String>,
    tags_added: Vec<String>,
    tags_modified: Vec<String>,
    tags_deleted: Vec<String>,
    lyrics: BTreeMap<String, LyricsChange>,
    unplanned: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LyricsChange {
    Added,
    Modified,
    Deleted,
}

struct Planner<'a> {
    source: &'a dyn FileSource,
    buckets: Buckets,
    /// tid -> path of added/modified tag files.
    tags_by_tid: HashMap<String, String>,
    tag_names: HashMap<String, String>,
    claimed: HashSet<String>,
}

/// Plan semantic commits for `status`.
///
/// Commits are returned as: song deletions, tag deletions, song additions
/// (including renames), song modifications, remaining tags, remaining
/// lyrics. Paths outside those categories end up in [`Push::unplanned`].
pub fn plan(
    status: &WorkingTreeStatus,
    source: &dyn FileSource,
    paths: &RepositoryPaths,
) -> Result<Push, MetaError> {
    let mut planner = Planner {
        source,
        buckets: bucketize(status, paths),
        tags_by_tid: HashMap::new(),
        tag_names: HashMap::new(),
        claimed: HashSet::new(),
    };
    planner.plan()
}

fn bucketize(status: &WorkingTreeStatus, paths: &RepositoryPaths) -> Buckets {
    let mut b = Buckets::default();
    let sides = [
        (&status.added, LyricsChange::Added),
        (&status.modified, LyricsChange::Modified),
        (&status.deleted, LyricsChange::Deleted),
    ];
    for (list, side) in sides {
        for path in list {
            let path = path.clone();
            match (FileCategory::of(&path, paths), side) {
                (FileCategory::Kara, LyricsChange::Added) => b.karas_added.push(path),
                (FileCategory::Kara, LyricsChange::Modified) => b.karas_modified.push(path),
                (FileCategory::Kara, LyricsChange::Deleted) => b.karas_deleted.push(path),
                (FileCategory::Tag, LyricsChange::Added) => b.tags_added.push(path),
                (FileCategory::Tag, LyricsChange::Modified) => b.tags_modified.push(path),
                (FileCategory::Tag, LyricsChange::Deleted) => b.tags_deleted.push(path),
                (FileCategory::Lyrics, side) => {
                    b.lyrics.insert(path, side);
                }
                _ => b.unplanned.push(path),
            }
        }
    }
    for list in [
        &mut b.karas_added,
        &mut b.karas_modified,
        &mut b.karas_deleted,
        &mut b.tags_added,
        &mut b.tags_modified,
        &mut b.tags_deleted,
        &mut b.unplanned,
    ] {
        list.sort();
    }
    b
}

impl Planner<'_> {
    fn plan(&mut self) -> Result<Push, MetaError> {
        for path in self
            .buckets
            .tags_added
            .iter()
            .chain(self.buckets.tags_modified.iter())
        {
            let tag = TagMetaFile::parse(path, &self.source.read_current(path)?)?;
            self.tag_names.insert(path.clone(), tag.name);
            self.tags_by_tid.insert(tag.tid, path.clone());
        }

        // Pass 1: deleted songs by kid.
        let mut deleted_by_kid: HashMap<String, KaraMetaFile> = HashMap::new();
        for path in &self.buckets.karas_deleted {
            let kara = KaraMetaFile::parse(path, &self.source.read_previous(path)?)?;
            deleted_by_kid.insert(kara.data.kid.clone(), kara);
        }

        let mut additions = Vec::new();
        let mut modifications = Vec::new();
        let mut medias_additions = Vec::new();
        let mut medias_modifications = Vec::new();

        // Pass 2: added songs, resolved against the deletions.
        for path in self.buckets.karas_added.clone() {
            let kara = KaraMetaFile::parse(&path, &self.source.read_current(&path)?)?;
            let (commit, media) = match deleted_by_kid.remove(&kara.data.kid) {
                Some(old) => {
                    debug!(from = %old.path, to = %path, kid = %kara.data.kid, "song renamed");
                    let message = format!("Modify song: {}", stem(&path));
                    let mut commit = Commit::new(&message);
                    commit.added_files.push(path.clone());
                    commit.removed_files.push(old.path.clone());
                    self.claimed.insert(old.path.clone());
                    self.claim_tags(&mut commit, kara.data.tag_ids.iter());
                    self.claim_lyrics(&mut commit, &kara.data, Some(&old.data));
                    let media = compare_media(&old.data, &kara.data, &message);
                    (commit, media)
                }
                None => {
                    let message = format!("New song: {}", stem(&path));
                    let mut commit = Commit::new(&message);
                    commit.added_files.push(path.clone());
                    self.claim_tags(&mut commit, kara.data.tag_ids.iter());
                    self.claim_lyrics(&mut commit, &kara.data, None);
                    let media = kara.data.media_filename.as_ref().map(|m| ModifiedMedia {
                        old: None,
                        new: Some(m.clone()),
                        size_differs: true,
                        commit: message.clone(),
                    });
                    (commit, media)
                }
            };
            self.claimed.insert(path);
            additions.push(commit);
            medias_additions.extend(media);
        }

        for path in self.buckets.karas_modified.clone() {
            let current = KaraMetaFile::parse(&path, &self.source.read_current(&path)?)?;
            let previous = KaraMetaFile::parse(&path, &self.source.read_previous(&path)?)?;
            let message = format!("Modify song: {}", stem(&path));
            let mut commit = Commit::new(&message);
            commit.added_files.push(path.clone());
            let old_tags: HashSet<&String> = previous.data.tag_ids.iter().collect();
            let new_tags: Vec<&String> = current
                .data
                .tag_ids
                .iter()
                .filter(|t| !old_tags.contains(t))
                .collect();
            self.claim_tags(&mut commit, new_tags.into_iter());
            self.claim_lyrics(&mut commit, &current.data, Some(&previous.data));
            self.claimed.insert(path);
            medias_modifications.extend(compare_media(&previous.data, &current.data, &message));
            modifications.push(commit);
        }

        // Unconsumed deletions are real deletions.
        let mut deletions = Vec::new();
        let mut medias_deletions = Vec::new();
        let mut remaining: Vec<KaraMetaFile> = deleted_by_kid.into_values().collect();
        remaining.sort_by(|a, b| a.path.cmp(&b.path));
        for old in remaining {
            let message = format!("Delete song: {}", stem(&old.path));
            let mut commit = Commit::new(&message);
            commit.removed_files.push(old.path.clone());
            self.claim_deleted_lyrics(&mut commit, &old);
            if let Some(media) = &old.data.media_filename {
                medias_deletions.push(ModifiedMedia {
                    old: Some(media.clone()),
                    new: None,
                    size_differs: true,
                    commit: message.clone(),
                });
            }
            self.claimed.insert(old.path);
            deletions.push(commit);
        }

        let mut tag_deletions = Vec::new();
        for path in &self.buckets.tags_deleted {
            let name = match self
                .source
                .read_previous(path)
                .and_then(|bytes| TagMetaFile::parse(path, &bytes))
            {
                Ok(tag) => tag.name,
                Err(_) => stem(path).to_string(),
            };
            let mut commit = Commit::new(format!("Delete tag: {name}"));
            commit.removed_files.push(path.clone());
            tag_deletions.push(commit);
        }

        let mut tags = Vec::new();
        for (path, verb) in self
            .buckets
            .tags_added
            .iter()
            .map(|p| (p, "New"))
            .chain(self.buckets.tags_modified.iter().map(|p| (p, "Modify")))
        {
            if self.claimed.contains(path) {
                continue;
            }
            let name = self
                .tag_names
                .get(path)
                .cloned()
                .unwrap_or_else(|| stem(path).to_string());
            let mut commit = Commit::new(format!("{verb} tag: {name}"));
            commit.added_files.push(path.clone());
            tags.push(commit);
        }
        tags.sort_by(|a, b| a.added_files.cmp(&b.added_files));

        let mut lyrics = Vec::new();
        for (path, change) in &self.buckets.lyrics {
            if self.claimed.contains(path) {
                continue;
            }
            let name = basename(path);
            let commit = match change {
                LyricsChange::Added => Commit {
                    added_files: vec![path.clone()],
                    message: format!("New lyrics: {name}"),
                    ..Default::default()
                },
                LyricsChange::Modified => Commit {
                    added_files: vec![path.clone()],
                    message: format!("Modify lyrics: {name}"),
                    ..Default::default()
                },
                LyricsChange::Deleted => Commit {
                    removed_files: vec![path.clone()],
                    message: format!("Delete lyrics: {name}"),
                    ..Default::default()
                },
            };
            lyrics.push(commit);
        }

        let mut commits = deletions;
        commits.extend(tag_deletions);
        commits.extend(additions);
        commits.extend(modifications);
        commits.extend(tags);
        commits.extend(lyrics);

        let mut modified_medias = medias_deletions;
        modified_medias.extend(medias_additions);
        modified_medias.extend(medias_modifications);

        debug!(
            commits = commits.len(),
            medias = modified_medias.len(),
            unplanned = self.buckets.unplanned.len(),
            "push planned"
        );
        Ok(Push {
            commits,
            modified_medias,
            squash_message: None,
            unplanned: std::mem::take(&mut self.buckets.unplanned),
        })
    }

    fn claim_tags<'t>(&mut self, commit: &mut Commit, tids: impl Iterator<Item = &'t String>) {
        for tid in tids {
            if let Some(path) = self.tags_by_tid.get(tid) {
                if self.claimed.insert(path.clone()) {
                    commit.added_files.push(path.clone());
                }
            }
        }
    }

    /// Pull in the song's added/modified lyrics, and deleted lyrics the
    /// previous version referenced.
    fn claim_lyrics(
        &mut self,
        commit: &mut Commit,
        current: &KaraData,
        previous: Option<&KaraData>,
    ) {
        let current_names: HashSet<&str> =
            current.lyrics_filenames.iter().map(String::as_str).collect();
        let previous_names: HashSet<&str> = previous
            .map(|p| p.lyrics_filenames.iter().map(String::as_str).collect())
            .unwrap_or_default();

        for (path, change) in &self.buckets.lyrics {
            let name = basename(path);
            let wanted = match change {
                LyricsChange::Added | LyricsChange::Modified => current_names.contains(name),
                LyricsChange::Deleted => {
                    previous_names.contains(name) && !current_names.contains(name)
                }
            };
            if wanted && self.claimed.insert(path.clone()) {
                match change {
                    LyricsChange::Deleted => commit.removed_files.push(path.clone()),
                    _ => commit.added_files.push(path.clone()),
                }
            }
        }
    }

    /// Bundle the deleted lyrics of a deleted song, matched by the lyrics
    /// it referenced or by basename.
    fn claim_deleted_lyrics(&mut self, commit: &mut Commit, old: &KaraMetaFile) {
        let song_stem = stem(&old.path);
        for (path, change) in &self.buckets.lyrics {
            if *change != LyricsChange::Deleted {
                continue;
            }
            let referenced = old.data.lyrics_filenames.iter().any(|l| l == basename(path));
            if (referenced || stem(path) == song_stem) && self.claimed.insert(path.clone()) {
                commit.removed_files.push(path.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::fixtures::{kara_json, tag_json};
    use crate::models::MediaAction;

    /// In-memory working tree: `current` and `previous` contents by path.
    #[derive(Default)]
    struct MemorySource {
        current: HashMap<String, String>,
        previous: HashMap<String, String>,
    }

    impl FileSource for MemorySource {
        fn read_current(&self, path: &str) -> Result<Vec<u8>, MetaError> {
            self.current
                .get(path)
                .map(|s| s.clone().into_bytes())
                .ok_or_else(|| MetaError::Io {
                    path: path.into(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                })
        }
        fn read_previous(&self, path: &str) -> Result<Vec<u8>, MetaError> {
            self.previous
                .get(path)
                .map(|s| s.clone().into_bytes())
                .ok_or_else(|| MetaError::MissingPrevious { path: path.into() })
        }
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_rename_as_modify() {
        let mut source = MemorySource::default();
        source.previous.insert(
            "karaokes/old.kara.json".into(),
            kara_json("k1", &[], ("old.mp4", 500), &[]),
        );
        source.current.insert(
            "karaokes/new.kara.json".into(),
            kara_json("k1", &[], ("new.mp4", 500), &[]),
        );
        let status = WorkingTreeStatus {
            added: strings(&["karaokes/new.kara.json"]),
            modified: vec![],
            deleted: strings(&["karaokes/old.kara.json"]),
        };

        let push = plan(&status, &source, &RepositoryPaths::default()).unwrap();
        assert_eq!(push.commits.len(), 1);
        let commit = &push.commits[0];
        assert_eq!(commit.message, "Modify song: new");
        assert_eq!(commit.added_files, strings(&["karaokes/new.kara.json"]));
        assert_eq!(commit.removed_files, strings(&["karaokes/old.kara.json"]));

        assert_eq!(
            push.modified_medias,
            vec![ModifiedMedia {
                old: Some("old.mp4".into()),
                new: Some("new.mp4".into()),
                size_differs: false,
                commit: "Modify song: new".into(),
            }]
        );
        assert_eq!(push.modified_medias[0].action(), MediaAction::Rename);
    }

    #[test]
    fn test_new_song_pulls_in_tag_and_lyrics() {
        let mut source = MemorySource::default();
        source.current.insert(
            "karaokes/song.kara.json".into(),
            kara_json("k1", &[], ("song.mp4", 10), &["t1"]),
        );
        source
            .current
            .insert("tags/rock.tag.json".into(), tag_json("t1", "Rock"));
        source
            .current
            .insert("tags/pop.tag.json".into(), tag_json("t2", "Pop"));
        let status = WorkingTreeStatus {
            added: strings(&[
                "karaokes/song.kara.json",
                "lyrics/song.ass",
                "tags/pop.tag.json",
                "tags/rock.tag.json",
                "fonts/f.ttf",
            ]),
            modified: vec![],
            deleted: vec![],
        };

        let push = plan(&status, &source, &RepositoryPaths::default()).unwrap();
        let messages: Vec<&str> = push.commits.iter().map(|c| c.message.as_str()).collect();
        assert_eq!(messages, vec!["New song: song", "New tag: Pop"]);
        assert_eq!(
            push.commits[0].added_files,
            strings(&["karaokes/song.kara.json", "tags/rock.tag.json", "lyrics/song.ass"])
        );
        assert_eq!(push.modified_medias[0].action(), MediaAction::Upload);
        assert_eq!(push.unplanned, strings(&["fonts/f.ttf"]));
    }

    #[test]
    fn test_emit_order_and_deleted_lyrics_bundling() {
        let mut source = MemorySource::default();
        source.previous.insert(
            "karaokes/gone.kara.json".into(),
            kara_json("kg", &[], ("gone.mp4", 1), &[]),
        );
        source
            .previous
            .insert("tags/old.tag.json".into(), tag_json("t9", "Old"));
        source.current.insert(
            "karaokes/added.kara.json".into(),
            kara_json("ka", &[], ("added.mp4", 1), &[]),
        );
        source.current.insert(
            "karaokes/mod.kara.json".into(),
            kara_json("km", &[], ("mod.mp4", 2), &[]),
        );
        source.previous.insert(
            "karaokes/mod.kara.json".into(),
            kara_json("km", &[], ("mod.mp4", 1), &[]),
        );
        source
            .current
            .insert("tags/t.tag.json".into(), tag_json("t1", "Solo"));

        let status = WorkingTreeStatus {
            added: strings(&["karaokes/added.kara.json", "lyrics/orphan.ass"]),
            modified: strings(&["karaokes/mod.kara.json", "tags/t.tag.json"]),
            deleted: strings(&["karaokes/gone.kara.json", "lyrics/gone.ass", "tags/old.tag.json"]),
        };

        let push = plan(&status, &source, &RepositoryPaths::default()).unwrap();
        let messages: Vec<&str> = push.commits.iter().map(|c| c.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "Delete song: gone",
                "Delete tag: Old",
                "New song: added",
                "Modify song: mod",
                "Modify tag: Solo",
                "New lyrics: orphan.ass",
            ]
        );
        assert_eq!(
            push.commits[0].removed_files,
            strings(&["karaokes/gone.kara.json", "lyrics/gone.ass"])
        );

        let actions: Vec<MediaAction> = push.modified_medias.iter().map(|m| m.action()).collect();
        assert_eq!(actions, vec![MediaAction::Delete, MediaAction::Upload, MediaAction::Update]);
    }

    #[test]
    fn test_compare_media_rules() {
        let data = |name: &str, size: u64| KaraData {
            kid: "k".into(),
            parents: vec![],
            media_filename: Some(name.into()),
            media_size: Some(size),
            lyrics_filenames: vec![],
            tag_ids: vec![],
        };
        assert!(compare_media(&data("a.mp4", 1), &data("a.mp4", 1), "c").is_none());
        assert_eq!(
            compare_media(&data("a.mp4", 1), &data("a.mp4", 2), "c").unwrap().action(),
            MediaAction::Update
        );
        assert_eq!(
            compare_media(&data("a.mp4", 1), &data("b.mp4", 1), "c").unwrap().action(),
            MediaAction::Rename
        );
        assert_eq!(
            compare_media(&data("a.mp4", 1), &data("b.mp4", 2), "c").unwrap().action(),
            MediaAction::Reupload
        );
    }

    #[test]
    fn test_passthrough() {
        let status = WorkingTreeStatus {
            added: strings(&["a"]),
            modified: strings(&["b"]),
            deleted: strings(&["c"]),
        };
        let push = plan_passthrough(&status);
        assert_eq!(push.commits.len(), 1);
        assert_eq!(push.commits[0].added_files, strings(&["a", "b"]));
        assert_eq!(push.commits[0].removed_files, strings(&["c"]));
        assert!(plan_passthrough(&WorkingTreeStatus::default()).commits.is_empty());
    }

    #[test]
    fn test_unparseable_song_is_an_error() {
        let mut source = MemorySource::default();
        source
            .current
            .insert("karaokes/bad.kara.json".into(), "{oops".into());
        let status = WorkingTreeStatus {
            added: strings(&["karaokes/bad.kara.json"]),
            ..Default::default()
        };
        assert!(plan(&status, &source, &RepositoryPaths::default()).is_err());
    }
}
