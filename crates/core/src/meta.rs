//! Parsing of song (`*.kara.json`) and tag (`*.tag.json`) metadata files.
//!
//! Only the fields needed for diffing and ordering are typed; everything
//! else is carried along untouched in `raw`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::errors::MetaError;

#[derive(Debug, Deserialize)]
struct KaraDoc {
    #[serde(default)]
    medias: Vec<MediaDoc>,
    data: KaraDataDoc,
}

#[derive(Debug, Deserialize)]
struct MediaDoc {
    filename: String,
    #[serde(default)]
    filesize: u64,
    #[serde(default)]
    lyrics: Vec<LyricsDoc>,
}

#[derive(Debug, Deserialize)]
struct LyricsDoc {
    filename: String,
}

#[derive(Debug, Deserialize)]
struct KaraDataDoc {
    kid: String,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    tags: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TagDoc {
    tag: TagDataDoc,
}

#[derive(Debug, Deserialize)]
struct TagDataDoc {
    tid: String,
    #[serde(default)]
    name: String,
}

/// Fields of a song file used by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct KaraData {
    pub kid: String,
    pub parents: Vec<String>,
    pub media_filename: Option<String>,
    pub media_size: Option<u64>,
    pub lyrics_filenames: Vec<String>,
    /// Tag ids referenced by the song, deduplicated and sorted.
    pub tag_ids: Vec<String>,
}

/// A parsed song metadata file.
#[derive(Debug, Clone, PartialEq)]
pub struct KaraMetaFile {
    pub path: String,
    pub data: KaraData,
    pub raw: Value,
}

impl KaraMetaFile {
    pub fn parse(path: &str, bytes: &[u8]) -> Result<Self, MetaError> {
        let raw: Value = serde_json::from_slice(bytes).map_err(|source| MetaError::Json {
            path: path.to_string(),
            source,
        })?;
        let doc: KaraDoc =
            serde_json::from_value(raw.clone()).map_err(|source| MetaError::Json {
                path: path.to_string(),
                source,
            })?;

        let first_media = doc.medias.first();
        let mut tag_ids: Vec<String> = doc.data.tags.into_values().flatten().collect();
        tag_ids.sort();
        tag_ids.dedup();

        Ok(Self {
            path: path.to_string(),
            data: KaraData {
                kid: doc.data.kid,
                parents: doc.data.parents,
                media_filename: first_media.map(|m| m.filename.clone()),
                media_size: first_media.map(|m| m.filesize),
                lyrics_filenames: doc
                    .medias
                    .iter()
                    .flat_map(|m| m.lyrics.iter().map(|l| l.filename.clone()))
                    .collect(),
                tag_ids,
            },
            raw,
        })
    }

    /// Read and parse `rel_path` under `base_dir`.
    pub fn read(base_dir: &Path, rel_path: &str) -> Result<Self, MetaError> {
        let bytes = read_file(base_dir, rel_path)?;
        Self::parse(rel_path, &bytes)
    }
}

/// A parsed tag metadata file.
#[derive(Debug, Clone, PartialEq)]
pub struct TagMetaFile {
    pub path: String,
    pub tid: String,
    pub name: String,
    pub raw: Value,
}

impl TagMetaFile {
    pub fn parse(path: &str, bytes: &[u8]) -> Result<Self, MetaError> {
        let raw: Value = serde_json::from_slice(bytes).map_err(|source| MetaError::Json {
            path: path.to_string(),
            source,
        })?;
        let doc: TagDoc =
            serde_json::from_value(raw.clone()).map_err(|source| MetaError::Json {
                path: path.to_string(),
                source,
            })?;
        Ok(Self {
            path: path.to_string(),
            tid: doc.tag.tid,
            name: doc.tag.name,
            raw,
        })
    }

    pub fn read(base_dir: &Path, rel_path: &str) -> Result<Self, MetaError> {
        let bytes = read_file(base_dir, rel_path)?;
        Self::parse(rel_path, &bytes)
    }
}

/// Stable id carried by a song or tag file, `None` for any other path.
pub fn uid_of(path: &str, bytes: &[u8]) -> Result<Option<String>, MetaError> {
    if path.ends_with(".kara.json") {
        Ok(Some(KaraMetaFile::parse(path, bytes)?.data.kid))
    } else if path.ends_with(".tag.json") {
        Ok(Some(TagMetaFile::parse(path, bytes)?.tid))
    } else {
        Ok(None)
    }
}

fn read_file(base_dir: &Path, rel_path: &str) -> Result<Vec<u8>, MetaError> {
    std::fs::read(base_dir.join(rel_path)).map_err(|source| MetaError::Io {
        path: rel_path.to_string(),
        source,
    })
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_parse_kara() {
        let json = kara_json("k1", &["p1"], ("song.mp4", 1234), &["t2", "t1", "t2"]);
        let kara = KaraMetaFile::parse("karaokes/song.kara.json", json.as_bytes()).unwrap();
        assert_eq!(kara.data.kid, "k1");
        assert_eq!(kara.data.parents, vec!["p1"]);
        assert_eq!(kara.data.media_filename.as_deref(), Some("song.mp4"));
        assert_eq!(kara.data.media_size, Some(1234));
        assert_eq!(kara.data.lyrics_filenames, vec!["song.ass"]);
        assert_eq!(kara.data.tag_ids, vec!["t1", "t2"]);
        assert_eq!(kara.raw["data"]["titles"]["eng"], "k1");
    }

    #[test]
    fn test_parse_kara_without_medias() {
        let json = r#"{"data": {"kid": "k2"}}"#;
        let kara = KaraMetaFile::parse("k.kara.json", json.as_bytes()).unwrap();
        assert!(kara.data.parents.is_empty());
        assert!(kara.data.media_filename.is_none());
        assert!(kara.data.tag_ids.is_empty());
    }

    #[test]
    fn test_parse_tag() {
        let json = tag_json("t1", "Rock");
        let tag = TagMetaFile::parse("tags/rock.tag.json", json.as_bytes()).unwrap();
        assert_eq!(tag.tid, "t1");
        assert_eq!(tag.name, "Rock");
    }

    #[test]
    fn test_invalid_json_names_path() {
        let err = KaraMetaFile::parse("karaokes/bad.kara.json", b"{not json").unwrap_err();
        assert!(err.to_string().contains("karaokes/bad.kara.json"));
    }

    #[test]
    fn test_uid_of() {
        let kara = kara_json("k1", &[], ("a.mp4", 1), &[]);
        let tag = tag_json("t1", "x");
        assert_eq!(uid_of("a.kara.json", kara.as_bytes()).unwrap().as_deref(), Some("k1"));
        assert_eq!(uid_of("a.tag.json", tag.as_bytes()).unwrap().as_deref(), Some("t1"));
        assert_eq!(uid_of("lyrics/a.ass", b"whatever").unwrap(), None);
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = TagMetaFile::read(dir.path(), "tags/missing.tag.json").unwrap_err();
        assert!(matches!(err, MetaError::Io { .. }));
    }
}
