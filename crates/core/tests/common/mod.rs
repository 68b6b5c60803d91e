//! Shared helpers for the integration tests: metadata fixtures, an
//! in-process origin and a recording file transfer.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use karasync_core::config::{AppConfig, RepositoryConfig};
use karasync_core::db::Database;
use karasync_core::errors::{RemoteError, TransferError};
use karasync_core::lock::RepoLocks;
use karasync_core::models::MediaFile;
use karasync_core::remote::{FullFile, Manifest, RepositoryRemote};
use karasync_core::sync_engine::SyncEngine;
use karasync_core::transfer::FileTransfer;

pub fn kara_json(kid: &str, stem: &str, media_size: u64, tids: &[&str]) -> String {
    serde_json::json!({
        "header": { "version": 4 },
        "medias": [{
            "filename": format!("{stem}.mp4"),
            "filesize": media_size,
            "lyrics": [{ "filename": format!("{stem}.ass") }]
        }],
        "data": {
            "kid": kid,
            "parents": [],
            "tags": { "songtypes": tids },
            "titles": { "eng": stem }
        }
    })
    .to_string()
}

pub fn tag_json(tid: &str, name: &str) -> String {
    serde_json::json!({
        "header": { "version": 1 },
        "tag": { "tid": tid, "name": name, "types": [3] }
    })
    .to_string()
}

pub fn tar_gz(files: &[(&str, &str)]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, path, content.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn count(db: &Database, sql: &str) -> i64 {
    db.conn().query_row(sql, [], |row| row.get(0)).unwrap()
}

pub fn engine(config: AppConfig, remote: Arc<dyn RepositoryRemote>) -> SyncEngine {
    let db = Database::in_memory().unwrap();
    db.initialize().unwrap();
    SyncEngine::new(config, Arc::new(db), remote, RepoLocks::new())
}

pub fn single(repo: RepositoryConfig) -> AppConfig {
    AppConfig {
        repositories: vec![repo],
        ..Default::default()
    }
}

fn unavailable(what: &str) -> RemoteError {
    RemoteError::Status {
        url: format!("test://{what}"),
        status: 503,
        body: String::new(),
    }
}

/// Origin served from memory. A `None` endpoint answers 503.
#[derive(Default)]
pub struct MemoryOrigin {
    pub manifest: Mutex<Option<Manifest>>,
    pub diff: Mutex<Option<String>>,
    pub full_files: Mutex<Option<Vec<FullFile>>>,
    pub archive: Mutex<Option<Vec<u8>>>,
    pub medias: Mutex<BTreeMap<String, u64>>,
    /// When set, each media download waits for a permit.
    pub media_gate: Mutex<Option<Arc<tokio::sync::Semaphore>>>,
    pub calls: Mutex<Vec<String>>,
}

impl MemoryOrigin {
    pub fn at(revision: &str) -> Self {
        let origin = Self::default();
        origin.set_revision(revision);
        origin
    }

    pub fn set_revision(&self, revision: &str) {
        *self.manifest.lock().unwrap() = Some(Manifest {
            latest_revision: revision.to_string(),
            archive_url: "/downloads/base.tar.gz".to_string(),
            project_id: Some(1),
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RepositoryRemote for MemoryOrigin {
    async fn metadata(&self, _: &RepositoryConfig) -> Result<Manifest, RemoteError> {
        self.record("metadata".into());
        self.manifest
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| unavailable("metadata"))
    }

    async fn diff(&self, _: &RepositoryConfig, from: &str) -> Result<String, RemoteError> {
        self.record(format!("diff:{from}"));
        self.diff.lock().unwrap().clone().ok_or_else(|| unavailable("diff"))
    }

    async fn full_files(
        &self,
        _: &RepositoryConfig,
        from: &str,
    ) -> Result<Vec<FullFile>, RemoteError> {
        self.record(format!("full_files:{from}"));
        self.full_files
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| unavailable("full_files"))
    }

    async fn media_listing(&self, _: &RepositoryConfig) -> Result<Vec<MediaFile>, RemoteError> {
        self.record("media_listing".into());
        Ok(self
            .medias
            .lock()
            .unwrap()
            .iter()
            .map(|(name, size)| MediaFile::new(name.clone(), *size))
            .collect())
    }

    async fn download_archive(
        &self,
        _: &RepositoryConfig,
        _: &Manifest,
        dest: &Path,
    ) -> Result<(), RemoteError> {
        self.record("download_archive".into());
        let bytes = self
            .archive
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| unavailable("archive"))?;
        tokio::fs::write(dest, bytes).await?;
        Ok(())
    }

    async fn download_media(
        &self,
        _: &RepositoryConfig,
        basename: &str,
        dest: &Path,
    ) -> Result<(), RemoteError> {
        self.record(format!("download_media:{basename}"));
        let gate = self.media_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
        let size = self
            .medias
            .lock()
            .unwrap()
            .get(basename)
            .copied()
            .ok_or_else(|| unavailable(basename))?;
        tokio::fs::write(dest, vec![0u8; size as usize]).await?;
        Ok(())
    }
}

/// File transfer that records operations into a shared log.
#[derive(Clone, Default)]
pub struct SharedTransfer {
    pub ops: Arc<Mutex<Vec<String>>>,
}

impl SharedTransfer {
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }
}

impl FileTransfer for SharedTransfer {
    fn connect(&mut self) -> Result<(), TransferError> {
        self.ops.lock().unwrap().push("connect".into());
        Ok(())
    }
    fn upload(&mut self, local: &Path, remote_name: &str) -> Result<(), TransferError> {
        std::fs::metadata(local)?;
        self.ops.lock().unwrap().push(format!("upload:{remote_name}"));
        Ok(())
    }
    fn rename(&mut self, from: &str, to: &str) -> Result<(), TransferError> {
        self.ops.lock().unwrap().push(format!("rename:{from}->{to}"));
        Ok(())
    }
    fn delete(&mut self, remote_name: &str) -> Result<(), TransferError> {
        self.ops.lock().unwrap().push(format!("delete:{remote_name}"));
        Ok(())
    }
    fn disconnect(&mut self) -> Result<(), TransferError> {
        self.ops.lock().unwrap().push("disconnect".into());
        Ok(())
    }
}
