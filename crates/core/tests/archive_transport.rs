//! End-to-end tests of the read-only transport: snapshot install, patch
//! pulls with their full-file fallback, and media reconciliation.
//!
//! The origin is served from memory; the local tree lives in a temp dir and
//! the content index in an in-memory SQLite database.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use karasync_core::config::RepositoryConfig;
use karasync_core::media;
use karasync_core::models::{ChangeKind, MediaFile, MediaOutcome};
use karasync_core::remote::{FullFile, FullFileChange};

use common::{count, engine, kara_json, single, tag_json, tar_gz, MemoryOrigin};

const REPO: &str = "kara.example.org";

fn base_archive() -> Vec<u8> {
    let song = kara_json("k-1", "ENG - Song", 100, &["t-rock"]);
    let cover = kara_json("k-2", "ENG - Cover", 200, &["t-rock"]);
    let rock = tag_json("t-rock", "Rock");
    tar_gz(&[
        ("base/karaokes/ENG - Song.kara.json", song.as_str()),
        ("base/karaokes/ENG - Cover.kara.json", cover.as_str()),
        ("base/tags/rock.tag.json", rock.as_str()),
        ("base/lyrics/ENG - Song.ass", "[Script Info]"),
        ("base/lyrics/ENG - Cover.ass", "[Script Info]"),
        ("base/fonts/Sans.ttf", "font"),
    ])
}

#[tokio::test]
async fn test_fresh_install_populates_index() {
    let dir = tempfile::tempdir().unwrap();
    let origin = Arc::new(MemoryOrigin::at("r1"));
    *origin.archive.lock().unwrap() = Some(base_archive());
    let engine = engine(single(RepositoryConfig::new(REPO, dir.path())), origin.clone());

    let report = engine.update_repo(REPO).await.unwrap();
    assert!(report.snapshot_installed);
    assert_eq!(report.applied.karas_integrated, 2);
    assert_eq!(report.applied.tags_integrated, 1);
    assert_eq!(report.applied.fonts_added, 1);
    assert_eq!(report.media, MediaOutcome::Done { changed: false });
    assert!(dir.path().join("lyrics/ENG - Song.ass").exists());

    let db = engine.db();
    assert_eq!(count(db, "SELECT COUNT(*) FROM index_karas"), 2);
    assert_eq!(count(db, "SELECT COUNT(*) FROM index_kara_tags WHERE tid = 't-rock'"), 2);
    assert_eq!(db.get_revision(REPO).unwrap().as_deref(), Some("r1"));
    assert_eq!(
        origin.calls(),
        vec!["metadata", "download_archive", "media_listing"]
    );
}

#[tokio::test]
async fn test_patch_falls_back_to_full_files_then_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let origin = Arc::new(MemoryOrigin::at("r1"));
    *origin.archive.lock().unwrap() = Some(base_archive());
    let engine = engine(single(RepositoryConfig::new(REPO, dir.path())), origin.clone());
    engine.update_repo(REPO).await.unwrap();

    // The diff's context no longer matches the local file.
    let hard_rock = tag_json("t-rock", "Hard Rock");
    let pop = tag_json("t-pop", "Pop");
    origin.set_revision("r2");
    *origin.diff.lock().unwrap() = Some(format!(
        "diff --git a/tags/rock.tag.json b/tags/rock.tag.json\n\
         index 1111111..2222222 100644\n\
         --- a/tags/rock.tag.json\n\
         +++ b/tags/rock.tag.json\n\
         @@ -1 +1 @@\n\
         -{{\"stale\":true}}\n\
         +{hard_rock}\n"
    ));
    *origin.full_files.lock().unwrap() = Some(vec![
        FullFile {
            path: "tags/rock.tag.json".into(),
            content: Some(hard_rock.clone()),
            change_type: FullFileChange::Modified,
        },
        FullFile {
            path: "tags/pop.tag.json".into(),
            content: Some(pop.clone()),
            change_type: FullFileChange::New,
        },
    ]);

    let report = engine.update_repo(REPO).await.unwrap();
    assert!(!report.snapshot_installed);
    assert_eq!(report.changes, 2);
    assert_eq!(report.applied.tags_integrated, 2);
    assert_eq!(report.to_revision.as_deref(), Some("r2"));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("tags/rock.tag.json")).unwrap(),
        hard_rock
    );
    assert!(!dir.path().join("tags/rock.tag.json.orig").exists());
    let name: String = engine
        .db()
        .conn()
        .query_row(
            "SELECT name FROM index_tags WHERE tid = 't-rock'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(name, "Hard Rock");

    // Pulling again at the same revision changes nothing.
    let calls_before = origin.calls().len();
    let report = engine.update_repo(REPO).await.unwrap();
    assert_eq!(report.changes, 0);
    assert!(!origin.calls()[calls_before..]
        .iter()
        .any(|c| c.starts_with("diff:") || c.starts_with("full_files:")));
}

#[tokio::test]
async fn test_exhausted_patch_reinstalls_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let origin = Arc::new(MemoryOrigin::at("r1"));
    *origin.archive.lock().unwrap() = Some(base_archive());
    let engine = engine(single(RepositoryConfig::new(REPO, dir.path())), origin.clone());
    engine.update_repo(REPO).await.unwrap();

    let song = kara_json("k-1", "ENG - Song", 100, &["t-rock"]);
    let rock = tag_json("t-rock", "Rock");
    origin.set_revision("r3");
    *origin.archive.lock().unwrap() = Some(tar_gz(&[
        ("base/karaokes/ENG - Song.kara.json", song.as_str()),
        ("base/tags/rock.tag.json", rock.as_str()),
    ]));

    let report = engine.update_repo(REPO).await.unwrap();
    assert!(report.snapshot_installed);
    assert_eq!(report.applied.karas_removed, 1);
    assert_eq!(report.applied.fonts_removed, 1);
    assert_eq!(count(engine.db(), "SELECT COUNT(*) FROM index_karas"), 1);
    assert!(!dir.path().join("karaokes/ENG - Cover.kara.json").exists());
    assert_eq!(engine.db().get_revision(REPO).unwrap().as_deref(), Some("r3"));

    let calls = origin.calls();
    let diff = calls.iter().position(|c| c == "diff:r1").unwrap();
    let full = calls.iter().position(|c| c == "full_files:r1").unwrap();
    let archive = calls.iter().rposition(|c| c == "download_archive").unwrap();
    assert!(diff < full && full < archive);
}

#[tokio::test]
async fn test_background_media_download_holds_the_lease() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = RepositoryConfig::new(REPO, dir.path());
    repo.auto_media_downloads = true;
    let medias = repo.medias_dir();
    let origin = Arc::new(MemoryOrigin::at("r1"));
    *origin.archive.lock().unwrap() = Some(base_archive());
    origin
        .medias
        .lock()
        .unwrap()
        .insert("ENG - Song.mp4".to_string(), 100);
    let gate = Arc::new(Semaphore::new(0));
    *origin.media_gate.lock().unwrap() = Some(gate.clone());
    let engine = engine(single(repo), origin.clone());

    let report = engine.update_repo(REPO).await.unwrap();
    assert!(report.snapshot_installed);
    assert_eq!(report.media, MediaOutcome::Spawned);
    assert!(engine.locks().is_running(REPO));

    let err = engine.update_repo(REPO).await.unwrap_err();
    assert_eq!(err.code(), "already_running");

    gate.add_permits(1);
    tokio::time::timeout(Duration::from_secs(10), async {
        while engine.locks().is_running(REPO) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("lease released once media are downloaded");

    assert_eq!(
        std::fs::metadata(medias.join("ENG - Song.mp4")).unwrap().len(),
        100
    );
    let downloads = origin
        .calls()
        .iter()
        .filter(|c| c.starts_with("download_media:"))
        .count();
    assert_eq!(downloads, 1);
    assert!(engine.update_repo(REPO).await.is_ok());
}

#[tokio::test]
async fn test_media_reconciliation_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = RepositoryConfig::new(REPO, dir.path());
    repo.auto_media_downloads = true;
    let medias = repo.medias_dir();
    std::fs::create_dir_all(&medias).unwrap();
    std::fs::write(medias.join("a.mp4"), vec![0u8; 100]).unwrap();
    std::fs::write(medias.join("b.mp4"), vec![0u8; 200]).unwrap();

    let origin = MemoryOrigin::default();
    origin.medias.lock().unwrap().extend([
        ("a.mp4".to_string(), 100),
        ("b.mp4".to_string(), 250),
        ("c.mp4".to_string(), 50),
    ]);

    let local = media::local_inventory(&medias).unwrap();
    let listing = vec![
        MediaFile::new("a.mp4", 100),
        MediaFile::new("b.mp4", 250),
        MediaFile::new("c.mp4", 50),
    ];
    let plan = media::classify(&local, &listing, false);
    assert_eq!(plan.added, vec![MediaFile::new("c.mp4", 50)]);
    assert_eq!(plan.updated, vec![MediaFile::new("b.mp4", 250)]);
    assert!(plan.removed.is_empty());

    assert!(media::sync_repository(&origin, &repo, 2, false).await.unwrap());
    assert_eq!(media::local_inventory(&medias).unwrap(), listing);
    assert!(!origin.calls().contains(&"download_media:a.mp4".to_string()));
}

#[tokio::test]
async fn test_installed_tree_enumerates_as_new() {
    let dir = tempfile::tempdir().unwrap();
    let origin = Arc::new(MemoryOrigin::at("r1"));
    *origin.archive.lock().unwrap() = Some(base_archive());
    let repo = RepositoryConfig::new(REPO, dir.path());
    let manifest = origin.manifest.lock().unwrap().clone().unwrap();

    karasync_core::snapshot::install_fresh(origin.clone(), &repo, &manifest, 1)
        .await
        .unwrap();
    let changes = karasync_core::snapshot::enumerate_changes(&repo).unwrap();
    assert_eq!(changes.len(), 6);
    assert!(changes.iter().all(|c| c.kind == ChangeKind::New));
}
