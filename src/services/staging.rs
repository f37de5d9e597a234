//! Local staging of uploaded files.
//!
//! Multipart file parts are written to a shared directory before being handed
//! to the media store. A [`StagedFile`] owns its file on disk and removes it
//! when dropped, so staged files never outlive the request (or the task)
//! holding them, whether it succeeded, failed or was cancelled.

use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use std::{
    io,
    path::{Path, PathBuf},
};
use tempfile::TempPath;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;

const MAX_STAGED_NAME_LEN: usize = 100;

/// Declared by browsers for audio formats they have no MIME mapping for.
const GENERIC_BINARY: &str = "application/octet-stream";

/// A file part written to the staging directory. Deleted on drop.
#[derive(Debug)]
pub struct StagedFile {
    path: TempPath,
    pub content_type: Option<String>,
    pub size_bytes: u64,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the file now. Errors are logged and swallowed.
    pub fn discard(self) {
        let path_display = self.path.display().to_string();
        match self.path.close() {
            Ok(()) => debug!("removed staged file {}", path_display),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => debug!("failed to remove staged file {}: {}", path_display, err),
        }
    }

    /// True when the declared content type starts with `prefix` (e.g. `audio/`)
    /// or is the generic binary type. Parts without a declared type are accepted.
    pub fn has_content_type(&self, prefix: &str) -> bool {
        match self.content_type.as_deref() {
            None => true,
            Some(ct) => {
                let ct = ct.trim().to_ascii_lowercase();
                ct.starts_with(prefix) || ct.starts_with(GENERIC_BINARY)
            }
        }
    }
}

/// The shared staging directory.
#[derive(Clone, Debug)]
pub struct Staging {
    dir: PathBuf,
}

impl Staging {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir).await
    }

    /// Stream a file part to disk.
    ///
    /// The file is named `{unix_millis}-{random}-{sanitized name}`. A failed
    /// write removes the partial file.
    pub async fn write_stream<S, E>(
        &self,
        original_name: &str,
        content_type: Option<String>,
        stream: S,
    ) -> io::Result<StagedFile>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let prefix = format!("{}-", Utc::now().timestamp_millis());
        let suffix = format!("-{}", sanitize_file_name(original_name));
        let (file, path) = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(&suffix)
            .tempfile_in(&self.dir)?
            .into_parts();
        let mut file = File::from_std(file);

        // `path` is dropped on every early return below, removing the file
        let mut size_bytes: u64 = 0;
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = chunk_res.map_err(io::Error::other)?;
            size_bytes += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        debug!(
            "staged `{}` ({} bytes) at {}",
            original_name,
            size_bytes,
            path.display()
        );
        Ok(StagedFile {
            path,
            content_type,
            size_bytes,
        })
    }
}

/// Reduce a client-supplied file name to a safe single path component.
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_STAGED_NAME_LEN)
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}
