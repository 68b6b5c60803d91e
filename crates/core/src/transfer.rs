//! Media upload side of a maintainer push.
//!
//! Media files are pushed to the repository's file server before any
//! metadata commit leaves the machine, so the origin never references a
//! media file it does not have.

use std::path::Path;

use suppaftp::types::FileType;
use suppaftp::FtpStream;
use tracing::{debug, info, instrument, warn};

use crate::config::FtpConfig;
use crate::errors::TransferError;
use crate::models::{MediaAction, ModifiedMedia};

/// Remote file operations used by [`push_medias`]. Blocking.
pub trait FileTransfer: Send {
    fn connect(&mut self) -> Result<(), TransferError>;
    fn upload(&mut self, local: &Path, remote_name: &str) -> Result<(), TransferError>;
    fn rename(&mut self, from: &str, to: &str) -> Result<(), TransferError>;
    fn delete(&mut self, remote_name: &str) -> Result<(), TransferError>;
    fn disconnect(&mut self) -> Result<(), TransferError>;
}

/// [`FileTransfer`] over FTP, in binary mode.
pub struct FtpTransfer {
    config: FtpConfig,
    stream: Option<FtpStream>,
}

impl FtpTransfer {
    pub fn new(config: &FtpConfig) -> Self {
        Self {
            config: config.clone(),
            stream: None,
        }
    }

    fn stream(&mut self) -> Result<&mut FtpStream, TransferError> {
        self.stream.as_mut().ok_or(TransferError::NotConnected)
    }
}

impl FileTransfer for FtpTransfer {
    #[instrument(skip(self), fields(host = %self.config.host, port = self.config.port))]
    fn connect(&mut self) -> Result<(), TransferError> {
        let password = self.config.password.clone().unwrap_or_default();
        let mut stream =
            FtpStream::connect(format!("{}:{}", self.config.host, self.config.port))?;
        stream.login(self.config.username.as_str(), password.as_str())?;
        if let Some(dir) = &self.config.base_dir {
            stream.cwd(dir.as_str())?;
        }
        stream.transfer_type(FileType::Binary)?;
        info!("FTP session opened");
        self.stream = Some(stream);
        Ok(())
    }

    fn upload(&mut self, local: &Path, remote_name: &str) -> Result<(), TransferError> {
        let mut file = std::fs::File::open(local)?;
        let bytes = self.stream()?.put_file(remote_name, &mut file)?;
        debug!(remote_name, bytes, "uploaded");
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), TransferError> {
        self.stream()?.rename(from, to)?;
        debug!(from, to, "renamed");
        Ok(())
    }

    fn delete(&mut self, remote_name: &str) -> Result<(), TransferError> {
        self.stream()?.rm(remote_name)?;
        debug!(remote_name, "deleted");
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransferError> {
        if let Some(mut stream) = self.stream.take() {
            stream.quit()?;
        }
        Ok(())
    }
}

/// What [`push_medias`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub uploaded: Vec<String>,
    pub renamed: Vec<(String, String)>,
    pub deleted: Vec<String>,
    /// Deletions that failed and were ignored.
    pub delete_failures: Vec<String>,
}

/// Apply every media change of a push through `transfer`.
///
/// Uploads happen before the matching deletion. A failed deletion is
/// logged and skipped; any other failure stops the push.
#[instrument(skip_all, fields(medias = medias.len()))]
pub fn push_medias(
    transfer: &mut dyn FileTransfer,
    medias_dir: &Path,
    medias: &[ModifiedMedia],
) -> Result<TransferReport, TransferError> {
    let mut report = TransferReport::default();
    if medias
        .iter()
        .all(|m| m.action() == MediaAction::Unchanged)
    {
        return Ok(report);
    }

    transfer.connect()?;
    let result = run(transfer, medias_dir, medias, &mut report);
    let closed = transfer.disconnect();
    result?;
    if let Err(e) = closed {
        warn!(error = %e, "could not close transfer session");
    }
    info!(
        uploaded = report.uploaded.len(),
        renamed = report.renamed.len(),
        deleted = report.deleted.len(),
        "media pushed"
    );
    Ok(report)
}

fn run(
    transfer: &mut dyn FileTransfer,
    medias_dir: &Path,
    medias: &[ModifiedMedia],
    report: &mut TransferReport,
) -> Result<(), TransferError> {
    for media in medias {
        let old = media.old.as_deref().unwrap_or_default();
        let new = media.new.as_deref().unwrap_or_default();
        match media.action() {
            MediaAction::Unchanged => {}
            MediaAction::Upload | MediaAction::Update => {
                transfer.upload(&medias_dir.join(new), new)?;
                report.uploaded.push(new.to_string());
            }
            MediaAction::Rename => {
                transfer.rename(old, new)?;
                report.renamed.push((old.to_string(), new.to_string()));
            }
            MediaAction::Reupload => {
                transfer.upload(&medias_dir.join(new), new)?;
                report.uploaded.push(new.to_string());
                delete_quietly(transfer, old, report);
            }
            MediaAction::Delete => delete_quietly(transfer, old, report),
        }
    }
    Ok(())
}

fn delete_quietly(transfer: &mut dyn FileTransfer, name: &str, report: &mut TransferReport) {
    match transfer.delete(name) {
        Ok(()) => report.deleted.push(name.to_string()),
        Err(e) => {
            warn!(media = name, error = %e, "remote media deletion failed, ignoring");
            report.delete_failures.push(name.to_string());
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fake::RecordingTransfer;
    use super::*;

    fn media(old: Option<&str>, new: Option<&str>, size_differs: bool) -> ModifiedMedia {
        ModifiedMedia {
            old: old.map(String::from),
            new: new.map(String::from),
            size_differs,
            commit: "c".into(),
        }
    }

    fn medias_dir(names: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            std::fs::write(dir.path().join(name), b"data").unwrap();
        }
        dir
    }

    #[test]
    fn test_each_action() {
        let dir = medias_dir(&["up.mp4", "same.mp4", "new.mp4"]);
        let mut transfer = RecordingTransfer::default();
        let report = push_medias(
            &mut transfer,
            dir.path(),
            &[
                media(None, Some("up.mp4"), true),
                media(Some("same.mp4"), Some("same.mp4"), true),
                media(Some("a.mp4"), Some("b.mp4"), false),
                media(Some("old.mp4"), Some("new.mp4"), true),
                media(Some("gone.mp4"), None, true),
            ],
        )
        .unwrap();
        assert_eq!(
            transfer.ops,
            vec![
                "connect",
                "upload:up.mp4",
                "upload:same.mp4",
                "rename:a.mp4->b.mp4",
                "upload:new.mp4",
                "delete:old.mp4",
                "delete:gone.mp4",
                "disconnect",
            ]
        );
        assert_eq!(report.uploaded.len(), 3);
        assert_eq!(report.deleted, vec!["old.mp4", "gone.mp4"]);
    }

    #[test]
    fn test_delete_failures_are_swallowed() {
        let dir = medias_dir(&[]);
        let mut transfer = RecordingTransfer {
            fail_deletes: true,
            ..Default::default()
        };
        let report =
            push_medias(&mut transfer, dir.path(), &[media(Some("gone.mp4"), None, true)]).unwrap();
        assert_eq!(report.delete_failures, vec!["gone.mp4"]);
        assert_eq!(transfer.ops.last().map(String::as_str), Some("disconnect"));
    }

    #[test]
    fn test_upload_failure_aborts_and_disconnects() {
        let dir = medias_dir(&["up.mp4"]);
        let mut transfer = RecordingTransfer {
            fail_uploads: true,
            ..Default::default()
        };
        let err = push_medias(
            &mut transfer,
            dir.path(),
            &[
                media(None, Some("up.mp4"), true),
                media(Some("gone.mp4"), None, true),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, TransferError::Ftp(_)));
        assert_eq!(transfer.ops, vec!["connect", "disconnect"]);
    }

    #[test]
    fn test_missing_local_file_is_an_error() {
        let dir = medias_dir(&[]);
        let mut transfer = RecordingTransfer::default();
        let err = push_medias(&mut transfer, dir.path(), &[media(None, Some("x.mp4"), true)])
            .unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
    }

    #[test]
    fn test_nothing_to_do_does_not_connect() {
        let dir = medias_dir(&[]);
        let mut transfer = RecordingTransfer::default();
        push_medias(&mut transfer, dir.path(), &[media(Some("a"), Some("a"), false)]).unwrap();
        assert!(transfer.ops.is_empty());
    }

    #[test]
    fn test_ftp_requires_connection() {
        let config = FtpConfig {
            host: "127.0.0.1".into(),
            port: 21,
            username: "u".into(),
            password_env: "P".into(),
            base_dir: None,
            password: None,
        };
        let mut ftp = FtpTransfer::new(&config);
        assert!(matches!(ftp.delete("x"), Err(TransferError::NotConnected)));
        assert!(ftp.disconnect().is_ok());
    }
}
