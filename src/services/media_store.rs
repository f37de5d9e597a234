//! Hosted media storage for audio files and cover images.
//!
//! [`CloudinaryStore`] talks to a Cloudinary-compatible REST API using signed
//! requests. Uploads stream the staged file from disk instead of buffering it.

use crate::config::MediaConfig;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Url, multipart};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::{io, path::Path};
use thiserror::Error;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// What a blob is, which decides its folder and provider resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Image,
}

impl MediaKind {
    pub fn folder(self) -> &'static str {
        match self {
            MediaKind::Audio => "songs",
            MediaKind::Image => "covers",
        }
    }

    /// Provider resource type. Audio is stored under `video`.
    pub fn resource_type(self) -> &'static str {
        match self {
            MediaKind::Audio => "video",
            MediaKind::Image => "image",
        }
    }
}

/// A blob accepted by the media store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMedia {
    pub url: String,
    pub public_id: String,
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media store is not configured")]
    NotConfigured,
    #[error("media store returned {status}: {message}")]
    Provider { status: u16, message: String },
    #[error("media store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Upload a local file and return its public URL and identifier.
    async fn upload(&self, path: &Path, kind: MediaKind) -> Result<StoredMedia, MediaError>;

    /// Remove a blob. Removing a blob that no longer exists succeeds.
    async fn delete(&self, public_id: &str, kind: MediaKind) -> Result<(), MediaError>;
}

#[derive(Deserialize)]
struct UploadResponse {
    secure_url: String,
    public_id: String,
}

#[derive(Deserialize)]
struct DestroyResponse {
    result: String,
}

#[derive(Deserialize)]
struct ProviderErrorBody {
    error: ProviderErrorMessage,
}

#[derive(Deserialize)]
struct ProviderErrorMessage {
    message: String,
}

pub struct CloudinaryStore {
    client: Client,
    cfg: MediaConfig,
}

impl CloudinaryStore {
    /// Build a client whose requests are bounded by `cfg.timeout`.
    pub fn new(cfg: MediaConfig) -> Result<Self, MediaError> {
        let client = Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self { client, cfg })
    }

    fn ensure_configured(&self) -> Result<(), MediaError> {
        if self.cfg.cloud_name.is_empty()
            || self.cfg.api_key.is_empty()
            || self.cfg.api_secret.is_empty()
        {
            return Err(MediaError::NotConfigured);
        }
        Ok(())
    }

    fn endpoint(&self, kind: MediaKind, action: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.cfg.api_base.trim_end_matches('/'),
            self.cfg.cloud_name,
            kind.resource_type(),
            action
        )
    }

    /// Turn a non-2xx response into a `MediaError::Provider`.
    async fn provider_error(resp: reqwest::Response) -> MediaError {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ProviderErrorBody>(&text)
            .map(|body| body.error.message)
            .unwrap_or(text);
        MediaError::Provider { status, message }
    }
}

#[async_trait]
impl MediaStore for CloudinaryStore {
    async fn upload(&self, path: &Path, kind: MediaKind) -> Result<StoredMedia, MediaError> {
        self.ensure_configured()?;

        let timestamp = Utc::now().timestamp().to_string();
        let signature = sign_params(
            &[("folder", kind.folder()), ("timestamp", &timestamp)],
            self.cfg.api_secret.expose(),
        );

        let file = File::open(path).await?;
        let len = file.metadata().await?.len();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload")
            .to_string();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let part = multipart::Part::stream_with_length(body, len).file_name(file_name);

        let form = multipart::Form::new()
            .text("api_key", self.cfg.api_key.clone())
            .text("timestamp", timestamp)
            .text("folder", kind.folder())
            .text("signature", signature)
            .part("file", part);

        debug!("uploading {} ({} bytes) as {:?}", path.display(), len, kind);
        let resp = self
            .client
            .post(self.endpoint(kind, "upload"))
            .multipart(form)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::provider_error(resp).await);
        }

        let uploaded: UploadResponse = resp.json().await?;
        Ok(StoredMedia {
            url: uploaded.secure_url,
            public_id: uploaded.public_id,
        })
    }

    async fn delete(&self, public_id: &str, kind: MediaKind) -> Result<(), MediaError> {
        self.ensure_configured()?;

        let timestamp = Utc::now().timestamp().to_string();
        let signature = sign_params(
            &[("public_id", public_id), ("timestamp", &timestamp)],
            self.cfg.api_secret.expose(),
        );

        let resp = self
            .client
            .post(self.endpoint(kind, "destroy"))
            .form(&[
                ("public_id", public_id),
                ("api_key", self.cfg.api_key.as_str()),
                ("timestamp", timestamp.as_str()),
                ("signature", signature.as_str()),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::provider_error(resp).await);
        }

        let destroyed: DestroyResponse = resp.json().await?;
        match destroyed.result.as_str() {
            "ok" => Ok(()),
            "not found" => {
                warn!("media {} was already gone", public_id);
                Ok(())
            }
            other => Err(MediaError::Provider {
                status: 200,
                message: format!("unexpected destroy result `{}`", other),
            }),
        }
    }
}

/// Sign request parameters: sort by key, join as `k=v&k=v`, append the
/// secret, hex-encode the SHA-256 digest.
fn sign_params(params: &[(&str, &str)], secret: &str) -> String {
    let mut sorted = params.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let joined = sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Recover a media identifier from a public URL.
///
/// Takes the last two path segments and strips the extension, so
/// `.../upload/v17/songs/abc.mp3` becomes `songs/abc`. Only used for rows
/// that predate stored identifiers.
pub fn public_id_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segments: Vec<&str> = parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .collect();
    if segments.len() < 2 {
        return None;
    }

    let folder = segments[segments.len() - 2];
    let file = segments[segments.len() - 1];
    let stem = match file.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file,
    };
    Some(format!("{}/{}", folder, stem))
}
