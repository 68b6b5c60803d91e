//! HTTP client for a repository's origin: manifest, diffs, full-file
//! payloads, archives and media files.
//!
//! The orchestrator talks to the origin through the [`RepositoryRemote`]
//! trait so tests can substitute an in-process fake.

use std::path::Path;

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

use crate::config::{HttpConfig, RepositoryConfig};
use crate::errors::RemoteError;
use crate::models::MediaFile;

/// Repository metadata returned by `GET /api/karas/repository`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "latestRevision")]
    pub latest_revision: String,
    #[serde(rename = "archiveURL")]
    pub archive_url: String,
    #[serde(rename = "projectID", default)]
    pub project_id: Option<u64>,
}

/// Change type of one entry of the full-file payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FullFileChange {
    #[serde(alias = "added", alias = "add")]
    New,
    #[serde(alias = "modify")]
    Modified,
    #[serde(alias = "deleted", alias = "delete")]
    Delete,
}

/// One entry of `GET /api/karas/repository/diff/full`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullFile {
    pub path: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(rename = "changeType")]
    pub change_type: FullFileChange,
}

#[derive(Debug, Deserialize)]
struct MediaListingEntry {
    mediafile: String,
    mediasize: u64,
}

/// Everything the engine needs from a repository origin.
#[async_trait]
pub trait RepositoryRemote: Send + Sync {
    async fn metadata(&self, repo: &RepositoryConfig) -> Result<Manifest, RemoteError>;

    /// Unified diff from `from_revision` to the origin's head.
    async fn diff(&self, repo: &RepositoryConfig, from_revision: &str)
        -> Result<String, RemoteError>;

    /// Same range as [`diff`](Self::diff), as complete file contents.
    async fn full_files(
        &self,
        repo: &RepositoryConfig,
        from_revision: &str,
    ) -> Result<Vec<FullFile>, RemoteError>;

    async fn media_listing(&self, repo: &RepositoryConfig) -> Result<Vec<MediaFile>, RemoteError>;

    /// Download the archive referenced by `manifest` into `dest`.
    async fn download_archive(
        &self,
        repo: &RepositoryConfig,
        manifest: &Manifest,
        dest: &Path,
    ) -> Result<(), RemoteError>;

    /// Download one media file into `dest`.
    async fn download_media(
        &self,
        repo: &RepositoryConfig,
        basename: &str,
        dest: &Path,
    ) -> Result<(), RemoteError>;
}

/// [`RepositoryRemote`] over HTTP(S), addressing `<scheme>://<repo name>/`.
#[derive(Clone)]
pub struct HttpRemote {
    http: reqwest::Client,
    config: HttpConfig,
}

impl HttpRemote {
    pub fn new(config: &HttpConfig) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;
        info!(scheme = %config.base_scheme, "created HttpRemote");
        Ok(Self {
            http,
            config: config.clone(),
        })
    }

    /// Root URL of `repo`'s origin.
    pub fn base_url(&self, repo: &RepositoryConfig) -> Result<Url, RemoteError> {
        base_url(&self.config.base_scheme, &repo.name)
    }

    async fn get(
        &self,
        url: Url,
        timeout: std::time::Duration,
    ) -> Result<reqwest::Response, RemoteError> {
        debug!(url = %url, "GET");
        let resp = self.http.get(url.clone()).timeout(timeout).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    async fn download_to(
        &self,
        url: Url,
        dest: &Path,
        timeout: std::time::Duration,
    ) -> Result<u64, RemoteError> {
        let mut resp = self.get(url, timeout).await?;
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

#[async_trait]
impl RepositoryRemote for HttpRemote {
    #[instrument(skip(self, repo), fields(repository = %repo.name))]
    async fn metadata(&self, repo: &RepositoryConfig) -> Result<Manifest, RemoteError> {
        let url = api_url(&self.base_url(repo)?, &["api", "karas", "repository"])?;
        let resp = self.get(url, self.config.timeout()).await?;
        let manifest: Manifest = resp
            .json()
            .await
            .map_err(|e| RemoteError::Parse(e.to_string()))?;
        debug!(revision = %manifest.latest_revision, "fetched manifest");
        Ok(manifest)
    }

    #[instrument(skip(self, repo), fields(repository = %repo.name))]
    async fn diff(
        &self,
        repo: &RepositoryConfig,
        from_revision: &str,
    ) -> Result<String, RemoteError> {
        let mut url = api_url(&self.base_url(repo)?, &["api", "karas", "repository", "diff"])?;
        url.query_pairs_mut().append_pair("commit", from_revision);
        let text = self.get(url, self.config.timeout()).await?.text().await?;
        debug!(bytes = text.len(), "fetched diff");
        Ok(text)
    }

    #[instrument(skip(self, repo), fields(repository = %repo.name))]
    async fn full_files(
        &self,
        repo: &RepositoryConfig,
        from_revision: &str,
    ) -> Result<Vec<FullFile>, RemoteError> {
        let mut url = api_url(
            &self.base_url(repo)?,
            &["api", "karas", "repository", "diff", "full"],
        )?;
        url.query_pairs_mut().append_pair("commit", from_revision);
        let files: Vec<FullFile> = self
            .get(url, self.config.timeout())
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Parse(e.to_string()))?;
        debug!(files = files.len(), "fetched full-file payload");
        Ok(files)
    }

    #[instrument(skip(self, repo), fields(repository = %repo.name))]
    async fn media_listing(&self, repo: &RepositoryConfig) -> Result<Vec<MediaFile>, RemoteError> {
        let url = api_url(&self.base_url(repo)?, &["api", "karas", "medias"])?;
        let entries: Vec<MediaListingEntry> = self
            .get(url, self.config.timeout())
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Parse(e.to_string()))?;
        Ok(entries
            .into_iter()
            .map(|e| MediaFile::new(e.mediafile, e.mediasize))
            .collect())
    }

    #[instrument(skip(self, repo, manifest, dest), fields(repository = %repo.name))]
    async fn download_archive(
        &self,
        repo: &RepositoryConfig,
        manifest: &Manifest,
        dest: &Path,
    ) -> Result<(), RemoteError> {
        let url = self
            .base_url(repo)?
            .join(&manifest.archive_url)
            .map_err(|e| RemoteError::InvalidUrl(format!("{}: {e}", manifest.archive_url)))?;
        let bytes = self
            .download_to(url, dest, self.config.media_timeout())
            .await?;
        info!(bytes, "archive downloaded");
        Ok(())
    }

    #[instrument(skip(self, repo, dest), fields(repository = %repo.name))]
    async fn download_media(
        &self,
        repo: &RepositoryConfig,
        basename: &str,
        dest: &Path,
    ) -> Result<(), RemoteError> {
        let url = api_url(&self.base_url(repo)?, &["downloads", "medias", basename])?;
        let bytes = self
            .download_to(url, dest, self.config.media_timeout())
            .await?;
        debug!(bytes, "media downloaded");
        Ok(())
    }
}

fn base_url(scheme: &str, name: &str) -> Result<Url, RemoteError> {
    let raw = format!("{scheme}://{name}/");
    Url::parse(&raw).map_err(|e| RemoteError::InvalidUrl(format!("{raw}: {e}")))
}

/// Append percent-escaped `segments` to `base`.
fn api_url(base: &Url, segments: &[&str]) -> Result<Url, RemoteError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| RemoteError::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
