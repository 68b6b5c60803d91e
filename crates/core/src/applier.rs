//! Change applier: turns a batch of [`Change`]s into content index calls.
//!
//! Songs are parsed before any of them is integrated and integrated in
//! parent-before-child order. Deletions run after every addition so a
//! rename (delete old path, add new path, same uid) never drops the uid
//! from the index, and the index is refreshed exactly once per batch.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::config::RepositoryConfig;
use crate::errors::ApplyError;
use crate::meta::{KaraMetaFile, TagMetaFile};
use crate::models::{ApplyStats, Change, ChangeKind, FileCategory};

/// The relational content index the engine feeds. Implementations must
/// treat `integrate_*` as upserts keyed by uid.
pub trait ContentIndex: Send + Sync {
    fn integrate_tag(&self, tag: &TagMetaFile) -> Result<(), ApplyError>;
    fn integrate_kara(&self, kara: &KaraMetaFile) -> Result<(), ApplyError>;
    fn remove_tags(&self, tids: &[String]) -> Result<(), ApplyError>;
    fn remove_karas(&self, kids: &[String]) -> Result<(), ApplyError>;
    fn add_font(&self, path: &str) -> Result<(), ApplyError>;
    fn remove_font(&self, path: &str) -> Result<(), ApplyError>;
    /// Rebuild derived views after a batch.
    fn refresh(&self) -> Result<(), ApplyError>;
}

/// Apply `changes` to `index`, reading file contents from `repo.base_dir`.
pub fn apply(
    repo: &RepositoryConfig,
    index: &dyn ContentIndex,
    changes: &[Change],
) -> Result<ApplyStats, ApplyError> {
    let mut stats = ApplyStats::default();
    if changes.is_empty() {
        debug!(repository = %repo.name, "no changes to apply");
        return Ok(stats);
    }

    let mut tag_upserts = Vec::new();
    let mut tag_deletes = Vec::new();
    let mut kara_upserts = Vec::new();
    let mut kara_deletes = Vec::new();
    let mut fonts = Vec::new();

    for change in changes {
        match FileCategory::of(&change.path, &repo.paths) {
            FileCategory::Tag => match change.kind {
                ChangeKind::Delete => tag_deletes.push(change),
                _ => tag_upserts.push(change),
            },
            FileCategory::Kara => match change.kind {
                ChangeKind::Delete => kara_deletes.push(change),
                _ => kara_upserts.push(change),
            },
            FileCategory::Font => fonts.push(change),
            _ => {}
        }
    }

    // Tags first: songs reference them.
    let mut integrated_tids = HashSet::new();
    for change in tag_upserts {
        let tag = TagMetaFile::read(&repo.base_dir, &change.path)?;
        index.integrate_tag(&tag)?;
        integrated_tids.insert(tag.tid);
        stats.tags_integrated += 1;
    }

    let mut karas = Vec::with_capacity(kara_upserts.len());
    for change in kara_upserts {
        karas.push(KaraMetaFile::read(&repo.base_dir, &change.path)?);
    }
    karas.sort_by(|a, b| a.path.cmp(&b.path));

    let (order, cycles_broken) = topo_order(&karas);
    stats.cycles_broken = cycles_broken;
    let mut integrated_kids = HashSet::new();
    for idx in order {
        let kara = &karas[idx];
        index.integrate_kara(kara)?;
        integrated_kids.insert(kara.data.kid.clone());
        stats.karas_integrated += 1;
    }

    let kids = collect_removals(&kara_deletes, &integrated_kids);
    if !kids.is_empty() {
        index.remove_karas(&kids)?;
        stats.karas_removed = kids.len();
    }
    let tids = collect_removals(&tag_deletes, &integrated_tids);
    if !tids.is_empty() {
        index.remove_tags(&tids)?;
        stats.tags_removed = tids.len();
    }

    for change in fonts {
        match change.kind {
            ChangeKind::Delete => {
                index.remove_font(&change.path)?;
                stats.fonts_removed += 1;
            }
            _ => {
                index.add_font(&change.path)?;
                stats.fonts_added += 1;
            }
        }
    }

    index.refresh()?;

    info!(
        repository = %repo.name,
        tags = stats.tags_integrated,
        karas = stats.karas_integrated,
        karas_removed = stats.karas_removed,
        tags_removed = stats.tags_removed,
        fonts = stats.fonts_added + stats.fonts_removed,
        "changes applied"
    );
    Ok(stats)
}

/// Uids of deleted files, minus those re-integrated in the same batch.
fn collect_removals(deletes: &[&Change], integrated: &HashSet<String>) -> Vec<String> {
    let mut uids = Vec::new();
    for change in deletes {
        match &change.uid {
            Some(uid) if integrated.contains(uid) => {
                debug!(path = %change.path, uid, "deletion superseded by re-integration");
            }
            Some(uid) => uids.push(uid.clone()),
            None => warn!(path = %change.path, "deleted file has no known uid, skipping"),
        }
    }
    uids.sort();
    uids.dedup();
    uids
}

/// Order `karas` so every song comes after its in-batch parents.
///
/// Returns indices into `karas` plus the number of cycles that had to be
/// broken. Ties and cycle breaks resolve by index, so callers that sort by
/// path get a path-ordered, deterministic result.
pub fn topo_order(karas: &[KaraMetaFile]) -> (Vec<usize>, usize) {
    let n = karas.len();
    let mut by_kid: HashMap<&str, usize> = HashMap::with_capacity(n);
    for (i, kara) in karas.iter().enumerate() {
        by_kid.entry(kara.data.kid.as_str()).or_insert(i);
    }

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut indegree = vec![0usize; n];
    for (i, kara) in karas.iter().enumerate() {
        let mut seen = HashSet::new();
        for parent in &kara.data.parents {
            if let Some(&p) = by_kid.get(parent.as_str()) {
                if p != i && seen.insert(p) {
                    children[p].push(i);
                    indegree[i] += 1;
                }
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| indegree[i] == 0)
        .map(Reverse)
        .collect();
    let mut done = vec![false; n];
    let mut order = Vec::with_capacity(n);
    let mut cycles_broken = 0;

    while order.len() < n {
        let next = match ready.pop() {
            Some(Reverse(i)) => i,
            None => {
                // Everything left sits on a cycle or behind one.
                let Some(i) = (0..n).find(|&i| !done[i]) else {
                    break;
                };
                warn!(
                    path = %karas[i].path,
                    kid = %karas[i].data.kid,
                    "parent cycle detected, integrating song before its parents"
                );
                cycles_broken += 1;
                i
            }
        };
        if done[next] {
            continue;
        }
        done[next] = true;
        order.push(next);
        for &child in &children[next] {
            indegree[child] = indegree[child].saturating_sub(1);
            if indegree[child] == 0 && !done[child] {
                ready.push(Reverse(child));
            }
        }
    }

    (order, cycles_broken)
}
