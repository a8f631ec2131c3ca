//! Streaming file transfer: chunked upload with optional safe archive
//! extraction, and chunked download.
//!
//! The upload sink enforces the 1 GiB cap against bytes actually received,
//! independent of the declared size. Any failure after the start frame
//! deletes the partial destination.

use std::path::{Component, Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::{AgentError, AgentResult};
use crate::security::PathValidator;
use wardend_protocol::{UploadResult, UploadStartRequest};

/// Hard cap on uploaded bytes, declared or received.
pub const MAX_UPLOAD_SIZE: u64 = 1024 * 1024 * 1024;

pub struct UploadSink {
    file: Option<tokio::fs::File>,
    path: PathBuf,
    bytes_written: u64,
    is_archive: bool,
    extract_to: Option<PathBuf>,
}

impl UploadSink {
    /// Validate the start frame and open the destination.
    pub async fn begin(validator: &PathValidator, req: &UploadStartRequest) -> AgentResult<Self> {
        if req.total_size > MAX_UPLOAD_SIZE {
            return Err(AgentError::InvalidArgument(format!(
                "declared size {} exceeds the 1 GiB upload limit",
                req.total_size
            )));
        }

        let path = validator.checked_write_path(&req.path)?;

        let extract_to = if req.is_archive {
            let target = req.extract_to.as_deref().ok_or_else(|| {
                AgentError::InvalidArgument("archive upload requires extract_to".into())
            })?;
            Some(validator.checked_write_path(target)?)
        } else {
            None
        };

        if req.create_dirs {
            if let Some(parent) = path.parent() {
                validator.validate_write(parent)?;
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| AgentError::from_io(e, "creating parent directories"))?;
            }
        }

        use std::os::unix::fs::OpenOptionsExt;
        let mode = if req.mode == 0 { 0o644 } else { req.mode };
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(mode)
            .open(&path)
            .await
            .map_err(|e| AgentError::from_io(e, &format!("creating {}", path.display())))?;

        info!(
            path = %path.display(),
            declared_size = req.total_size,
            is_archive = req.is_archive,
            "upload started"
        );

        Ok(Self {
            file: Some(file),
            path,
            bytes_written: 0,
            is_archive: req.is_archive,
            extract_to,
        })
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Append one chunk, enforcing the received-bytes cap.
    pub async fn write_chunk(&mut self, data: &[u8]) -> AgentResult<()> {
        if self.bytes_written + data.len() as u64 > MAX_UPLOAD_SIZE {
            self.cleanup().await;
            return Err(AgentError::ResourceExhausted(
                "upload exceeded the 1 GiB limit".into(),
            ));
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| AgentError::FailedPrecondition("upload already closed".into()))?;
        file.write_all(data)
            .await
            .map_err(|e| AgentError::from_io(e, "writing chunk"))?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Close the destination and, for archives, extract and discard the
    /// intermediate tarball.
    pub async fn finish(mut self) -> AgentResult<UploadResult> {
        let Some(mut file) = self.file.take() else {
            return Err(AgentError::FailedPrecondition("upload already closed".into()));
        };
        file.flush()
            .await
            .map_err(|e| AgentError::from_io(e, "flushing upload"))?;
        drop(file);

        if !self.is_archive {
            return Ok(UploadResult {
                success: true,
                message: "file uploaded".into(),
                bytes_written: self.bytes_written,
                path: self.path.to_string_lossy().to_string(),
            });
        }

        let extract_to = self.extract_to.clone().expect("archive uploads carry extract_to");
        let archive = self.path.clone();

        if let Err(e) = tokio::fs::create_dir_all(&extract_to).await {
            self.cleanup().await;
            return Err(AgentError::from_io(e, "creating extraction directory"));
        }

        let extract_result = {
            let archive = archive.clone();
            let extract_to = extract_to.clone();
            tokio::task::spawn_blocking(move || extract_tar_gz(&archive, &extract_to))
                .await
                .map_err(|e| AgentError::Internal(format!("extraction task failed: {}", e)))?
        };

        if let Err(e) = extract_result {
            // Remove the partially extracted tree and the tarball.
            let _ = tokio::fs::remove_dir_all(&extract_to).await;
            let _ = tokio::fs::remove_file(&archive).await;
            return Err(e);
        }

        let _ = tokio::fs::remove_file(&archive).await;
        let bytes = self.bytes_written;
        info!(extract_to = %extract_to.display(), bytes, "archive extracted");

        Ok(UploadResult {
            success: true,
            message: "archive uploaded and extracted".into(),
            bytes_written: bytes,
            path: extract_to.to_string_lossy().to_string(),
        })
    }

    /// Drop the partial destination after a mid-stream failure or cancel.
    pub async fn abort(mut self) {
        self.cleanup().await;
    }

    async fn cleanup(&mut self) {
        self.file.take();
        if tokio::fs::remove_file(&self.path).await.is_err() {
            // Already gone or never created; nothing to do.
        } else {
            warn!(path = %self.path.display(), "removed partial upload");
        }
    }
}

/// Extract a tar.gz refusing entries with absolute paths or `..`, then walk
/// the tree resolving symlinks and fail if any target escapes `dest`.
/// Shared with the plugin installer, which applies the same guard.
pub(crate) fn extract_tar_gz(archive: &Path, dest: &Path) -> AgentResult<()> {
    let file = std::fs::File::open(archive)
        .map_err(|e| AgentError::from_io(e, "opening archive"))?;
    let gz = flate2::read::GzDecoder::new(file);
    let mut tar = tar::Archive::new(gz);

    let entries = tar
        .entries()
        .map_err(|e| AgentError::InvalidArgument(format!("reading archive: {}", e)))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| AgentError::InvalidArgument(format!("reading archive entry: {}", e)))?;
        let entry_path = entry
            .path()
            .map_err(|e| AgentError::InvalidArgument(format!("archive entry path: {}", e)))?
            .into_owned();

        if entry_path.is_absolute() {
            return Err(AgentError::InvalidArgument(format!(
                "archive entry has absolute path: {}",
                entry_path.display()
            )));
        }
        if entry_path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(AgentError::InvalidArgument(format!(
                "archive entry escapes extraction root: {}",
                entry_path.display()
            )));
        }

        entry
            .unpack_in(dest)
            .map_err(|e| AgentError::InvalidArgument(format!("unpacking archive entry: {}", e)))?;
    }

    validate_extraction_tree(dest)
}

/// Post-extraction zip-slip guard: every resolved path must stay inside the
/// resolved extraction root.
fn validate_extraction_tree(dest: &Path) -> AgentResult<()> {
    let root = std::fs::canonicalize(dest)
        .map_err(|e| AgentError::from_io(e, "resolving extraction root"))?;
    let mut stack = vec![root.clone()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            // Dangling symlinks cannot be resolved; they also cannot leak
            // data, so they are left in place.
            if let Ok(real) = std::fs::canonicalize(&path) {
                if !real.starts_with(&root) {
                    return Err(AgentError::InvalidArgument(format!(
                        "extracted entry {} resolves outside the extraction root",
                        path.display()
                    )));
                }
            }
            // Recurse into real directories only; following symlinked
            // directories could loop forever.
            let Ok(file_type) = entry.file_type() else { continue };
            if file_type.is_dir() && !file_type.is_symlink() {
                stack.push(path);
            }
        }
    }
    Ok(())
}
