//! Patch transport: applies the origin's unified diff to the local tree,
//! falling back to the full-file payload when the diff does not apply.
//!
//! Every new file content is computed in memory before anything touches the
//! disk. Writes back up overwritten files as `<file>.orig`; a failed write
//! restores them, a successful one removes them.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex_lite::Regex;
use tracing::{debug, info, instrument, warn};

use crate::config::RepositoryConfig;
use crate::errors::PatchError;
use crate::meta;
use crate::models::{Change, ChangeKind};
use crate::remote::{FullFile, FullFileChange, RepositoryRemote};

const DEV_NULL: &str = "/dev/null";

/// One `diff --git` section of a unified diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    /// Path before the change; `None` for an added file.
    pub old_path: Option<String>,
    /// Path after the change; `None` for a deleted file.
    pub new_path: Option<String>,
    pub binary: bool,
    /// Text from the `---` header through the last hunk, empty when the
    /// section carries no hunks (pure rename, mode change).
    pub body: String,
}

impl FileDiff {
    /// Change records described by this section, uids unresolved.
    fn shape(&self) -> Vec<(String, ChangeKind)> {
        match (&self.old_path, &self.new_path) {
            (None, Some(new)) => vec![(new.clone(), ChangeKind::New)],
            (Some(old), None) => vec![(old.clone(), ChangeKind::Delete)],
            (Some(old), Some(new)) if old != new => vec![
                (old.clone(), ChangeKind::Delete),
                (new.clone(), ChangeKind::New),
            ],
            (Some(_), Some(new)) => vec![(new.clone(), ChangeKind::Modified)],
            (None, None) => Vec::new(),
        }
    }
}

/// Result of a successful pull.
#[derive(Debug, Clone, Default)]
pub struct PatchOutcome {
    pub changes: Vec<Change>,
    /// Whether the full-file payload had to be used.
    pub used_fallback: bool,
}

/// Pull everything after `from_revision` into `repo.base_dir`.
///
/// Tries the diff first, then the full-file payload. Fails only when both
/// fail; the caller decides what happens next.
#[instrument(skip(remote, repo), fields(repository = %repo.name))]
pub async fn pull(
    remote: &dyn RepositoryRemote,
    repo: &RepositoryConfig,
    from_revision: &str,
) -> Result<PatchOutcome, PatchError> {
    let (diff_text, patch_err) = match remote.diff(repo, from_revision).await {
        Ok(text) if text.trim().is_empty() => {
            debug!("empty diff, nothing to pull");
            return Ok(PatchOutcome::default());
        }
        Ok(text) => match apply_diff(&repo.base_dir, &text) {
            Ok(changes) => {
                info!(changes = changes.len(), "patch applied");
                return Ok(PatchOutcome {
                    changes,
                    used_fallback: false,
                });
            }
            Err(e) => {
                warn!(error = %e, "patch did not apply, requesting full files");
                (Some(text), e)
            }
        },
        Err(e) => {
            warn!(error = %e, "diff unavailable, requesting full files");
            (None, PatchError::from(e))
        }
    };

    let fallback = async {
        let files = remote.full_files(repo, from_revision).await?;
        write_full_files(&repo.base_dir, diff_text.as_deref(), &files)
    };
    match fallback.await {
        Ok(changes) => {
            info!(changes = changes.len(), "full-file payload applied");
            Ok(PatchOutcome {
                changes,
                used_fallback: true,
            })
        }
        Err(fallback_err) => Err(PatchError::FallbackFailed {
            patch: patch_err.to_string(),
            fallback: fallback_err.to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Diff parsing
// ---------------------------------------------------------------------------

/// Split a `git diff` text into per-file sections.
pub fn split_diff(text: &str) -> Result<Vec<FileDiff>, PatchError> {
    let mut sections: Vec<Vec<&str>> = Vec::new();
    for line in text.split_inclusive('\n') {
        if line.starts_with("diff --git ") {
            sections.push(vec![line]);
        } else if let Some(current) = sections.last_mut() {
            current.push(line);
        } else if !line.trim().is_empty() {
            return Err(PatchError::Malformed {
                path: String::new(),
                detail: format!("unexpected text before first file header: {}", line.trim_end()),
            });
        }
    }
    sections.iter().map(|lines| parse_section(lines)).collect()
}

fn parse_section(lines: &[&str]) -> Result<FileDiff, PatchError> {
    let header = lines[0].trim_end_matches(['\n', '\r']);
    let (git_old, git_new) = parse_git_header(&header["diff --git ".len()..]).unzip();

    let mut is_new = false;
    let mut is_deleted = false;
    let mut binary = false;
    let mut rename_from = None;
    let mut rename_to = None;
    let mut minus: Option<String> = None;
    let mut plus: Option<String> = None;
    let mut body_start = None;

    for (i, raw) in lines.iter().enumerate().skip(1) {
        let line = raw.trim_end_matches(['\n', '\r']);
        if line.starts_with("@@") {
            body_start.get_or_insert(i);
            break;
        }
        if let Some(rest) = line.strip_prefix("--- ") {
            body_start = Some(i);
            minus = Some(header_path(rest));
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            plus = Some(header_path(rest));
        } else if line.starts_with("new file mode") {
            is_new = true;
        } else if line.starts_with("deleted file mode") {
            is_deleted = true;
        } else if let Some(rest) = line
            .strip_prefix("rename from ")
            .or_else(|| line.strip_prefix("copy from "))
        {
            rename_from = Some(unquote(rest));
        } else if let Some(rest) = line
            .strip_prefix("rename to ")
            .or_else(|| line.strip_prefix("copy to "))
        {
            rename_to = Some(unquote(rest));
        } else if line.starts_with("Binary files") || line.starts_with("GIT binary patch") {
            binary = true;
        }
    }

    let old_path = match minus.as_deref() {
        Some(DEV_NULL) => None,
        Some(p) => Some(strip_side(p, "a/")),
        None => rename_from.or(git_old),
    };
    let new_path = match plus.as_deref() {
        Some(DEV_NULL) => None,
        Some(p) => Some(strip_side(p, "b/")),
        None => rename_to.or(git_new),
    };
    let old_path = if is_new { None } else { old_path };
    let new_path = if is_deleted { None } else { new_path };

    let display = new_path
        .clone()
        .or_else(|| old_path.clone())
        .unwrap_or_else(|| header.to_string());
    if old_path.is_none() && new_path.is_none() {
        return Err(PatchError::Malformed {
            path: display,
            detail: "section names no file".into(),
        });
    }
    for path in old_path.iter().chain(new_path.iter()) {
        if !is_safe_relative(path) {
            return Err(PatchError::Malformed {
                path: path.clone(),
                detail: "path escapes the repository".into(),
            });
        }
    }

    let body = match body_start {
        Some(start) => lines[start..].concat(),
        None => String::new(),
    };

    Ok(FileDiff {
        old_path,
        new_path,
        binary,
        body,
    })
}

fn git_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^("(?:[^"\\]|\\.)*"|\S+) ("(?:[^"\\]|\\.)*"|\S+)$"#)
            .unwrap_or_else(|e| panic!("invalid diff header regex: {e}"))
    })
}

/// Paths named by the `diff --git a/X b/Y` line.
fn parse_git_header(rest: &str) -> Option<(String, String)> {
    if let Some(caps) = git_header_re().captures(rest) {
        let old = strip_side(&unquote(&caps[1]), "a/");
        let new = strip_side(&unquote(&caps[2]), "b/");
        return Some((old, new));
    }
    // Unquoted names with spaces: only decidable when both sides match.
    let name_len = rest.len().checked_sub(5)? / 2;
    let (old, new) = (rest.get(2..2 + name_len)?, rest.get(5 + name_len..)?);
    (rest.starts_with("a/") && old == new).then(|| (old.to_string(), new.to_string()))
}

fn header_path(rest: &str) -> String {
    // Git pads names containing spaces with a tab; GNU diff puts a
    // timestamp after it.
    let rest = rest.split('\t').next().unwrap_or(rest);
    unquote(rest)
}

fn strip_side(path: &str, prefix: &str) -> String {
    path.strip_prefix(prefix).unwrap_or(path).to_string()
}

/// Undo git's C-style quoting of unusual path names.
fn unquote(s: &str) -> String {
    let Some(inner) = s.strip_prefix('"').and_then(|s| s.strip_suffix('"')) else {
        return s.to_string();
    };
    let bytes = inner.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' || i + 1 >= bytes.len() {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let esc = bytes[i + 1];
        i += 2;
        match esc {
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'r' => out.push(b'\r'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'v' => out.push(0x0b),
            b'0'..=b'7' => {
                let mut value = u32::from(esc - b'0');
                let mut digits = 1;
                while digits < 3 && i < bytes.len() && (b'0'..=b'7').contains(&bytes[i]) {
                    value = value * 8 + u32::from(bytes[i] - b'0');
                    i += 1;
                    digits += 1;
                }
                out.push((value & 0xff) as u8);
            }
            other => out.push(other),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn is_safe_relative(path: &str) -> bool {
    !path.is_empty()
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

/// Content of the `+` side of a hunk body (for added files).
fn added_content(body: &str) -> String {
    side_content(body, '+')
}

/// Content of the `-` side of a hunk body (for deleted files).
fn removed_content(body: &str) -> String {
    side_content(body, '-')
}

fn side_content(body: &str, marker: char) -> String {
    let mut out = String::new();
    let mut in_hunk = false;
    let mut last_was_side = false;
    for line in body.split_inclusive('\n') {
        if line.starts_with("@@") {
            in_hunk = true;
            continue;
        }
        if !in_hunk {
            continue;
        }
        if line.starts_with('\\') {
            // "\ No newline at end of file" applies to the previous line.
            if last_was_side && out.ends_with('\n') {
                out.pop();
            }
            continue;
        }
        let mut chars = line.chars();
        let first = chars.next();
        last_was_side = first == Some(marker) || first == Some(' ');
        if last_was_side {
            out.push_str(chars.as_str());
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Applying
// ---------------------------------------------------------------------------

/// A computed write: `content: None` deletes the file.
#[derive(Debug)]
struct PlannedWrite {
    path: String,
    content: Option<String>,
}

/// Apply diff `text` to `base_dir`, returning the resulting changes.
pub fn apply_diff(base_dir: &Path, text: &str) -> Result<Vec<Change>, PatchError> {
    let diffs = split_diff(text)?;
    let previous = capture_previous(base_dir, &diffs);

    let mut writes = Vec::new();
    for diff in &diffs {
        compute_writes(base_dir, diff, &mut writes)?;
    }
    write_with_backups(base_dir, &writes)?;

    Ok(resolve_changes(base_dir, &diffs, &previous))
}

fn compute_writes(
    base_dir: &Path,
    diff: &FileDiff,
    writes: &mut Vec<PlannedWrite>,
) -> Result<(), PatchError> {
    let display = diff
        .new_path
        .as_deref()
        .or(diff.old_path.as_deref())
        .unwrap_or_default()
        .to_string();
    if diff.binary {
        return Err(PatchError::ApplyFailed {
            path: display,
            detail: "binary patches are not supported".into(),
        });
    }

    match (&diff.old_path, &diff.new_path) {
        (None, Some(new)) => {
            writes.push(PlannedWrite {
                path: new.clone(),
                content: Some(added_content(&diff.body)),
            });
        }
        (Some(old), None) => {
            if !base_dir.join(old).exists() {
                return Err(PatchError::ApplyFailed {
                    path: old.clone(),
                    detail: "file to delete does not exist".into(),
                });
            }
            writes.push(PlannedWrite {
                path: old.clone(),
                content: None,
            });
        }
        (Some(old), Some(new)) => {
            let current = std::fs::read_to_string(base_dir.join(old)).map_err(|e| {
                PatchError::ApplyFailed {
                    path: old.clone(),
                    detail: e.to_string(),
                }
            })?;
            let updated = if diff.body.is_empty() {
                current
            } else {
                let patch = diffy::Patch::from_str(&diff.body).map_err(|e| PatchError::Malformed {
                    path: display.clone(),
                    detail: e.to_string(),
                })?;
                diffy::apply(&current, &patch).map_err(|e| PatchError::ApplyFailed {
                    path: display.clone(),
                    detail: e.to_string(),
                })?
            };
            if old != new {
                writes.push(PlannedWrite {
                    path: old.clone(),
                    content: None,
                });
            }
            writes.push(PlannedWrite {
                path: new.clone(),
                content: Some(updated),
            });
        }
        (None, None) => {}
    }
    Ok(())
}

/// Content of every file the diffs delete or rename away, read before any
/// change lands.
fn capture_previous(base_dir: &Path, diffs: &[FileDiff]) -> Vec<(String, String)> {
    let mut previous = Vec::new();
    for diff in diffs {
        let Some(old) = &diff.old_path else { continue };
        if diff.new_path.as_deref() == Some(old.as_str()) {
            continue;
        }
        let content = std::fs::read_to_string(base_dir.join(old))
            .unwrap_or_else(|_| removed_content(&diff.body));
        previous.push((old.clone(), content));
    }
    previous
}

fn resolve_changes(
    base_dir: &Path,
    diffs: &[FileDiff],
    previous: &[(String, String)],
) -> Vec<Change> {
    let mut changes = Vec::new();
    for diff in diffs {
        for (path, kind) in diff.shape() {
            let uid = match kind {
                ChangeKind::Delete => previous
                    .iter()
                    .find(|(p, _)| *p == path)
                    .and_then(|(_, content)| uid_or_warn(&path, content.as_bytes())),
                _ => match std::fs::read(base_dir.join(&path)) {
                    Ok(bytes) => uid_or_warn(&path, &bytes),
                    Err(e) => {
                        warn!(path, error = %e, "changed file unreadable after write");
                        None
                    }
                },
            };
            changes.push(Change::new(path, kind, uid));
        }
    }
    changes
}

fn uid_or_warn(path: &str, bytes: &[u8]) -> Option<String> {
    match meta::uid_of(path, bytes) {
        Ok(uid) => uid,
        Err(e) => {
            warn!(path, error = %e, "could not resolve uid");
            None
        }
    }
}

/// Perform `writes`, backing up overwritten files as `.orig` and rolling
/// everything back on the first failure.
fn write_with_backups(base_dir: &Path, writes: &[PlannedWrite]) -> Result<(), PatchError> {
    let mut backups: Vec<(PathBuf, PathBuf)> = Vec::new();
    let mut created: Vec<PathBuf> = Vec::new();
    let mut touched = HashSet::new();

    let result = (|| -> Result<(), std::io::Error> {
        for write in writes {
            let target = base_dir.join(&write.path);
            if touched.insert(target.clone()) {
                if target.exists() {
                    let backup = orig_path(&target);
                    std::fs::copy(&target, &backup)?;
                    backups.push((target.clone(), backup));
                } else {
                    created.push(target.clone());
                }
            }
            match &write.content {
                Some(content) => {
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&target, content)?;
                }
                None => match std::fs::remove_file(&target) {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
                    _ => {}
                },
            }
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            for (_, backup) in &backups {
                let _ = std::fs::remove_file(backup);
            }
            debug!(files = writes.len(), "patch written");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "patch write failed, rolling back");
            for path in &created {
                let _ = std::fs::remove_file(path);
            }
            for (target, backup) in &backups {
                if let Err(re) = std::fs::rename(backup, target) {
                    warn!(path = %target.display(), error = %re, "rollback failed");
                }
            }
            Err(PatchError::Io(e))
        }
    }
}

fn orig_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".orig");
    PathBuf::from(name)
}

// ---------------------------------------------------------------------------
// Full-file fallback
// ---------------------------------------------------------------------------

/// Write the full-file payload unconditionally. The change shape comes from
/// `diff_text` when it parses, otherwise from the payload itself.
pub fn write_full_files(
    base_dir: &Path,
    diff_text: Option<&str>,
    files: &[FullFile],
) -> Result<Vec<Change>, PatchError> {
    let diffs = diff_text.and_then(|text| split_diff(text).ok());
    let previous = match &diffs {
        Some(diffs) => capture_previous(base_dir, diffs),
        None => files
            .iter()
            .filter(|f| f.change_type == FullFileChange::Delete)
            .filter_map(|f| {
                std::fs::read_to_string(base_dir.join(&f.path))
                    .ok()
                    .map(|c| (f.path.clone(), c))
            })
            .collect(),
    };

    for file in files {
        if !is_safe_relative(&file.path) {
            return Err(PatchError::Malformed {
                path: file.path.clone(),
                detail: "path escapes the repository".into(),
            });
        }
        let target = base_dir.join(&file.path);
        match file.change_type {
            FullFileChange::Delete => match std::fs::remove_file(&target) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            },
            FullFileChange::New | FullFileChange::Modified => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&target, file.content.as_deref().unwrap_or_default())?;
            }
        }
    }

    let changes = match diffs {
        Some(diffs) => resolve_changes(base_dir, &diffs, &previous),
        None => {
            let shaped: Vec<FileDiff> = files
                .iter()
                .map(|f| FileDiff {
                    old_path: (f.change_type != FullFileChange::New).then(|| f.path.clone()),
                    new_path: (f.change_type != FullFileChange::Delete).then(|| f.path.clone()),
                    binary: false,
                    body: String::new(),
                })
                .collect();
            resolve_changes(base_dir, &shaped, &previous)
        }
    };
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::errors::RemoteError;
    use crate::meta::fixtures::{kara_json, tag_json};
    use crate::models::MediaFile;
    use crate::remote::Manifest;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn read(dir: &Path, rel: &str) -> String {
        std::fs::read_to_string(dir.join(rel)).unwrap()
    }

    fn orig_files(dir: &Path) -> Vec<PathBuf> {
        walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|p| p.extension().is_some_and(|e| e == "orig"))
            .collect()
    }

    /// Modifies a.kara.json, adds t.tag.json, deletes gone.kara.json.
    fn sample_diff() -> String {
        let old_a = kara_json("ka", &[], ("a.mp4", 1), &[]);
        let new_a = kara_json("ka", &[], ("a.mp4", 2), &[]);
        let tag = tag_json("t1", "Rock");
        let gone = kara_json("kg", &[], ("g.mp4", 1), &[]);
        format!(
            "diff --git a/karaokes/a.kara.json b/karaokes/a.kara.json\n\
             index 1111111..2222222 100644\n\
             --- a/karaokes/a.kara.json\n\
             +++ b/karaokes/a.kara.json\n\
             @@ -1 +1 @@\n\
             -{old_a}\n\
             +{new_a}\n\
             diff --git a/tags/t.tag.json b/tags/t.tag.json\n\
             new file mode 100644\n\
             index 0000000..3333333\n\
             --- /dev/null\n\
             +++ b/tags/t.tag.json\n\
             @@ -0,0 +1 @@\n\
             +{tag}\n\
             diff --git a/karaokes/gone.kara.json b/karaokes/gone.kara.json\n\
             deleted file mode 100644\n\
             index 4444444..0000000\n\
             --- a/karaokes/gone.kara.json\n\
             +++ /dev/null\n\
             @@ -1 +0,0 @@\n\
             -{gone}\n"
        )
    }

    fn seed(dir: &Path) {
        let a = kara_json("ka", &[], ("a.mp4", 1), &[]);
        let gone = kara_json("kg", &[], ("g.mp4", 1), &[]);
        write(dir, "karaokes/a.kara.json", &format!("{a}\n"));
        write(dir, "karaokes/gone.kara.json", &format!("{gone}\n"));
    }

    #[test]
    fn test_split_diff_shapes() {
        let diffs = split_diff(&sample_diff()).unwrap();
        assert_eq!(diffs.len(), 3);
        let shape = |path: &str, kind| vec![(path.to_string(), kind)];
        assert_eq!(diffs[0].shape(), shape("karaokes/a.kara.json", ChangeKind::Modified));
        assert_eq!(diffs[1].shape(), shape("tags/t.tag.json", ChangeKind::New));
        assert_eq!(diffs[2].shape(), shape("karaokes/gone.kara.json", ChangeKind::Delete));
    }

    #[test]
    fn test_split_diff_rename_and_quoting() {
        let text = "diff --git \"a/lyrics/caf\\303\\251.ass\" \"b/lyrics/caf\\303\\251 2.ass\"\n\
                    similarity index 100%\n\
                    rename from \"lyrics/caf\\303\\251.ass\"\n\
                    rename to \"lyrics/caf\\303\\251 2.ass\"\n";
        let diffs = split_diff(text).unwrap();
        assert_eq!(diffs[0].old_path.as_deref(), Some("lyrics/café.ass"));
        assert_eq!(diffs[0].new_path.as_deref(), Some("lyrics/café 2.ass"));
        assert!(diffs[0].body.is_empty());
        assert_eq!(diffs[0].shape().len(), 2);
    }

    #[test]
    fn test_removed_line_starting_with_dashes_is_not_a_header() {
        let text = "diff --git a/lyrics/a.ass b/lyrics/a.ass\n\
                    --- a/lyrics/a.ass\n\
                    +++ b/lyrics/a.ass\n\
                    @@ -1,2 +1,1 @@\n\
                    --- comment\n \
                    keep\n";
        let diffs = split_diff(text).unwrap();
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].old_path.as_deref(), Some("lyrics/a.ass"));
        assert!(diffs[0].body.contains("--- comment"));
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let text = "diff --git a/../etc/passwd b/../etc/passwd\n\
                    --- a/../etc/passwd\n\
                    +++ b/../etc/passwd\n\
                    @@ -1 +1 @@\n-x\n+y\n";
        assert!(matches!(split_diff(text), Err(PatchError::Malformed { .. })));
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("plain"), "plain");
        assert_eq!(unquote("\"a\\tb\\\"c\""), "a\tb\"c");
        assert_eq!(unquote("\"\\303\\251\""), "é");
    }

    #[test]
    fn test_side_content_no_newline_marker() {
        let body =
            "--- /dev/null\n+++ b/x\n@@ -0,0 +1,2 @@\n+one\n+two\n\\ No newline at end of file\n";
        assert_eq!(added_content(body), "one\ntwo");
    }

    #[test]
    fn test_apply_diff() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());

        let changes = apply_diff(dir.path(), &sample_diff()).unwrap();
        assert_eq!(
            changes,
            vec![
                Change::new("karaokes/a.kara.json", ChangeKind::Modified, Some("ka".into())),
                Change::new("tags/t.tag.json", ChangeKind::New, Some("t1".into())),
                Change::new("karaokes/gone.kara.json", ChangeKind::Delete, Some("kg".into())),
            ]
        );
        assert!(read(dir.path(), "karaokes/a.kara.json").contains("\"filesize\":2"));
        assert!(dir.path().join("tags/t.tag.json").exists());
        assert!(!dir.path().join("karaokes/gone.kara.json").exists());
        assert!(orig_files(dir.path()).is_empty());
    }

    #[test]
    fn test_failed_apply_leaves_tree_untouched() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        // Local edit makes the first hunk fail.
        write(dir.path(), "karaokes/a.kara.json", "locally edited\n");

        let err = apply_diff(dir.path(), &sample_diff()).unwrap_err();
        assert!(matches!(err, PatchError::ApplyFailed { .. }));
        assert_eq!(read(dir.path(), "karaokes/a.kara.json"), "locally edited\n");
        assert!(dir.path().join("karaokes/gone.kara.json").exists());
        assert!(!dir.path().join("tags/t.tag.json").exists());
        assert!(orig_files(dir.path()).is_empty());
    }

    #[test]
    fn test_write_rollback_restores_backups() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "karaokes/a.kara.json", "old\n");
        // A directory where a file should be written forces an I/O error.
        std::fs::create_dir_all(dir.path().join("tags/blocked.tag.json")).unwrap();

        let writes = vec![
            PlannedWrite {
                path: "karaokes/a.kara.json".into(),
                content: Some("new\n".into()),
            },
            PlannedWrite {
                path: "karaokes/created.kara.json".into(),
                content: Some("x\n".into()),
            },
            PlannedWrite {
                path: "tags/blocked.tag.json".into(),
                content: Some("y\n".into()),
            },
        ];
        assert!(write_with_backups(dir.path(), &writes).is_err());
        assert_eq!(read(dir.path(), "karaokes/a.kara.json"), "old\n");
        assert!(!dir.path().join("karaokes/created.kara.json").exists());
        assert!(orig_files(dir.path()).is_empty());
    }

    #[test]
    fn test_delete_uid_from_diff_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![FullFile {
            path: "karaokes/gone.kara.json".into(),
            content: None,
            change_type: FullFileChange::Delete,
        }];
        let gone = kara_json("kg", &[], ("g.mp4", 1), &[]);
        let text = format!(
            "diff --git a/karaokes/gone.kara.json b/karaokes/gone.kara.json\n\
             deleted file mode 100644\n\
             --- a/karaokes/gone.kara.json\n\
             +++ /dev/null\n\
             @@ -1 +0,0 @@\n\
             -{gone}\n"
        );
        let changes = write_full_files(dir.path(), Some(&text), &files).unwrap();
        assert_eq!(changes[0].uid.as_deref(), Some("kg"));
    }

    // -- pull with a fake origin -------------------------------------------

    struct FakeRemote {
        diff: Option<String>,
        full: Option<Vec<FullFile>>,
        full_calls: Mutex<usize>,
    }

    #[async_trait]
    impl RepositoryRemote for FakeRemote {
        async fn metadata(&self, _: &RepositoryConfig) -> Result<Manifest, RemoteError> {
            Err(RemoteError::Parse("unused".into()))
        }
        async fn diff(&self, _: &RepositoryConfig, _: &str) -> Result<String, RemoteError> {
            self.diff
                .clone()
                .ok_or_else(|| RemoteError::Parse("diff unavailable".into()))
        }
        async fn full_files(
            &self,
            _: &RepositoryConfig,
            _: &str,
        ) -> Result<Vec<FullFile>, RemoteError> {
            *self.full_calls.lock().unwrap() += 1;
            self.full
                .clone()
                .ok_or_else(|| RemoteError::Parse("full files unavailable".into()))
        }
        async fn media_listing(&self, _: &RepositoryConfig) -> Result<Vec<MediaFile>, RemoteError> {
            Ok(Vec::new())
        }
        async fn download_archive(
            &self,
            _: &RepositoryConfig,
            _: &Manifest,
            _: &Path,
        ) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn download_media(
            &self,
            _: &RepositoryConfig,
            _: &str,
            _: &Path,
        ) -> Result<(), RemoteError> {
            Ok(())
        }
    }

    fn full_payload() -> Vec<FullFile> {
        vec![
            FullFile {
                path: "karaokes/a.kara.json".into(),
                content: Some(kara_json("ka", &[], ("a.mp4", 2), &[])),
                change_type: FullFileChange::Modified,
            },
            FullFile {
                path: "tags/t.tag.json".into(),
                content: Some(tag_json("t1", "Rock")),
                change_type: FullFileChange::New,
            },
            FullFile {
                path: "karaokes/gone.kara.json".into(),
                content: None,
                change_type: FullFileChange::Delete,
            },
        ]
    }

    #[tokio::test]
    async fn test_pull_patch_path() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        let repo = RepositoryConfig::new("test", dir.path());
        let remote = FakeRemote {
            diff: Some(sample_diff()),
            full: None,
            full_calls: Mutex::new(0),
        };
        let outcome = pull(&remote, &repo, "r1").await.unwrap();
        assert!(!outcome.used_fallback);
        assert_eq!(outcome.changes.len(), 3);
        assert_eq!(*remote.full_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pull_falls_back_to_full_files() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        write(dir.path(), "karaokes/a.kara.json", "locally edited\n");
        let repo = RepositoryConfig::new("test", dir.path());
        let remote = FakeRemote {
            diff: Some(sample_diff()),
            full: Some(full_payload()),
            full_calls: Mutex::new(0),
        };

        let outcome = pull(&remote, &repo, "r1").await.unwrap();
        assert!(outcome.used_fallback);
        let kinds: Vec<ChangeKind> = outcome.changes.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Modified, ChangeKind::New, ChangeKind::Delete]);
        assert_eq!(outcome.changes[2].uid.as_deref(), Some("kg"));
        assert!(read(dir.path(), "karaokes/a.kara.json").contains("\"filesize\":2"));
        assert!(orig_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_pull_without_diff_uses_payload_shape() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        let repo = RepositoryConfig::new("test", dir.path());
        let remote = FakeRemote {
            diff: None,
            full: Some(full_payload()),
            full_calls: Mutex::new(0),
        };
        let outcome = pull(&remote, &repo, "r1").await.unwrap();
        assert!(outcome.used_fallback);
        assert_eq!(
            outcome.changes[1],
            Change::new("tags/t.tag.json", ChangeKind::New, Some("t1".into()))
        );
    }

    #[tokio::test]
    async fn test_pull_both_paths_failing_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        write(dir.path(), "karaokes/a.kara.json", "locally edited\n");
        let repo = RepositoryConfig::new("test", dir.path());
        let remote = FakeRemote {
            diff: Some(sample_diff()),
            full: None,
            full_calls: Mutex::new(0),
        };
        let err = pull(&remote, &repo, "r1").await.unwrap_err();
        assert!(matches!(err, PatchError::FallbackFailed { .. }));
    }

    #[tokio::test]
    async fn test_pull_empty_diff_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let repo = RepositoryConfig::new("test", dir.path());
        let remote = FakeRemote {
            diff: Some("\n".into()),
            full: None,
            full_calls: Mutex::new(0),
        };
        let outcome = pull(&remote, &repo, "r1").await.unwrap();
        assert!(outcome.changes.is_empty());
        assert!(!outcome.used_fallback);
    }
}
