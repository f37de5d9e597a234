//! src/services/song_service.rs
//!
//! SongService sequences the media store and the catalog for each catalog
//! operation.
//!
//! Failure policy, applied to every mutation:
//! - uploads are fail-closed: a song never points at a blob that was not stored;
//! - blobs uploaded earlier in a failed operation are deleted again;
//! - removing superseded or deleted blobs is fail-open: failures are logged
//!   and never block the catalog change.
//!
//! Mutations run on their own task. Once started they finish (including any
//! rollback) even if the caller stops waiting, e.g. on a request timeout or a
//! client disconnect. Staged local files passed in are owned by that task and
//! removed when it ends.

use crate::{
    models::{
        song::{NewSong, Song},
        user::Identity,
    },
    services::{
        catalog_store::{SongCatalog, UpdateOutcome},
        media_store::{MediaError, MediaKind, MediaStore, StoredMedia, public_id_from_url},
        staging::StagedFile,
    },
};
use std::{future::Future, io, sync::Arc};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Title and artist of the fixture song removed at startup.
pub const FIXTURE_TITLE: &str = "Test Song";
pub const FIXTURE_ARTIST: &str = "Test Artist";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{0}")]
    Unauthenticated(String),
    #[error("Access denied: admin only")]
    Forbidden,
    #[error("{0}")]
    InvalidInput(String),
    #[error("Song not found")]
    NotFound,
    #[error("Song was modified by another request; reload and retry")]
    Conflict,
    #[error("{0}")]
    Dependency(String),
}

impl From<sqlx::Error> for CatalogError {
    fn from(err: sqlx::Error) -> Self {
        CatalogError::Dependency(err.to_string())
    }
}

impl From<MediaError> for CatalogError {
    fn from(err: MediaError) -> Self {
        CatalogError::Dependency(err.to_string())
    }
}

impl From<io::Error> for CatalogError {
    fn from(err: io::Error) -> Self {
        CatalogError::Dependency(err.to_string())
    }
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Parts of a create request, after staging.
#[derive(Debug, Default)]
pub struct SongUpload {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub audio: Option<StagedFile>,
    pub cover: Option<StagedFile>,
}

/// Parts of an update request, after staging. Blank fields are ignored.
#[derive(Debug, Default)]
pub struct SongPatch {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub cover: Option<StagedFile>,
}

/// Blobs stored during the current operation, deleted again if it fails.
struct Compensation<'a> {
    media: &'a dyn MediaStore,
    uploaded: Vec<(StoredMedia, MediaKind)>,
}

impl<'a> Compensation<'a> {
    fn new(media: &'a dyn MediaStore) -> Self {
        Self {
            media,
            uploaded: Vec::new(),
        }
    }

    fn record(&mut self, media: &StoredMedia, kind: MediaKind) {
        self.uploaded.push((media.clone(), kind));
    }

    /// Delete recorded blobs, most recent first.
    async fn rollback(self) {
        for (stored, kind) in self.uploaded.into_iter().rev() {
            match self.media.delete(&stored.public_id, kind).await {
                Ok(()) => info!("rolled back upload {}", stored.public_id),
                Err(err) => warn!(
                    "could not roll back upload {}; blob is orphaned: {}",
                    stored.public_id, err
                ),
            }
        }
    }
}

#[derive(Clone)]
pub struct SongService {
    pub catalog: SongCatalog,
    pub media: Arc<dyn MediaStore>,
}

impl SongService {
    pub fn new(catalog: SongCatalog, media: Arc<dyn MediaStore>) -> Self {
        Self { catalog, media }
    }

    /// Every song, newest first. Any authenticated caller may list.
    pub async fn list_songs(&self, identity: &Identity) -> CatalogResult<Vec<Song>> {
        debug!("listing songs for {}", identity.email);
        Ok(self.catalog.list_newest_first().await?)
    }

    /// Upload both blobs, then insert the song.
    ///
    /// Validation happens before any remote call: capability, both files
    /// present with plausible content types, then title and artist.
    pub async fn create_song(&self, identity: &Identity, upload: SongUpload) -> CatalogResult<Song> {
        let this = self.clone();
        let identity = identity.clone();
        run_detached(async move { this.create_song_inner(&identity, upload).await }).await
    }

    async fn create_song_inner(&self, identity: &Identity, upload: SongUpload) -> CatalogResult<Song> {
        ensure_can_manage(identity)?;

        let (audio, cover) = match (&upload.audio, &upload.cover) {
            (Some(audio), Some(cover)) => (audio, cover),
            _ => {
                return Err(CatalogError::InvalidInput(
                    "Both song file and cover image are required".into(),
                ));
            }
        };
        if !audio.has_content_type("audio/") {
            return Err(CatalogError::InvalidInput(
                "songFile must be an audio file".into(),
            ));
        }
        if !cover.has_content_type("image/") {
            return Err(CatalogError::InvalidInput(
                "coverImage must be an image".into(),
            ));
        }

        let (title, artist) = match (non_blank(upload.title), non_blank(upload.artist)) {
            (Some(title), Some(artist)) => (title, artist),
            _ => {
                return Err(CatalogError::InvalidInput(
                    "Title and artist are required".into(),
                ));
            }
        };

        let mut undo = Compensation::new(self.media.as_ref());
        let result = async {
            let audio_media = self.media.upload(audio.path(), MediaKind::Audio).await?;
            undo.record(&audio_media, MediaKind::Audio);

            let cover_media = self.media.upload(cover.path(), MediaKind::Image).await?;
            undo.record(&cover_media, MediaKind::Image);

            let song = self
                .catalog
                .insert(NewSong {
                    title,
                    artist,
                    audio_url: audio_media.url,
                    audio_public_id: audio_media.public_id,
                    cover_url: cover_media.url,
                    cover_public_id: cover_media.public_id,
                })
                .await?;
            Ok::<Song, CatalogError>(song)
        }
        .await;

        match result {
            Ok(song) => {
                info!("created song {} ({} - {})", song.id, song.artist, song.title);
                Ok(song)
            }
            Err(err) => {
                error!("creating song failed: {}", err);
                undo.rollback().await;
                Err(err)
            }
        }
    }

    /// Apply title/artist overrides and optionally replace the cover.
    ///
    /// The new cover is uploaded before the record changes; the old cover is
    /// removed only after the change is stored.
    pub async fn update_song(
        &self,
        identity: &Identity,
        id: Uuid,
        patch: SongPatch,
    ) -> CatalogResult<Song> {
        let this = self.clone();
        let identity = identity.clone();
        run_detached(async move { this.update_song_inner(&identity, id, patch).await }).await
    }

    async fn update_song_inner(
        &self,
        identity: &Identity,
        id: Uuid,
        patch: SongPatch,
    ) -> CatalogResult<Song> {
        ensure_can_manage(identity)?;

        let mut song = self.catalog.find(id).await?.ok_or(CatalogError::NotFound)?;

        if let Some(title) = non_blank(patch.title) {
            song.title = title;
        }
        if let Some(artist) = non_blank(patch.artist) {
            song.artist = artist;
        }

        let mut undo = Compensation::new(self.media.as_ref());
        let mut superseded = None;
        if let Some(cover) = patch.cover.as_ref() {
            if !cover.has_content_type("image/") {
                return Err(CatalogError::InvalidInput(
                    "coverImage must be an image".into(),
                ));
            }
            let stored = self.media.upload(cover.path(), MediaKind::Image).await?;
            undo.record(&stored, MediaKind::Image);
            superseded = Some((song.cover_public_id.take(), song.cover_url.clone()));
            song.cover_url = stored.url;
            song.cover_public_id = Some(stored.public_id);
        }

        let outcome = match self.catalog.update_versioned(&song).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("updating song {} failed: {}", id, err);
                undo.rollback().await;
                return Err(err.into());
            }
        };
        let updated = match outcome {
            UpdateOutcome::Updated(updated) => updated,
            UpdateOutcome::Stale => {
                undo.rollback().await;
                return Err(CatalogError::Conflict);
            }
            UpdateOutcome::Missing => {
                undo.rollback().await;
                return Err(CatalogError::NotFound);
            }
        };

        if let Some((old_id, old_url)) = superseded {
            self.remove_media(old_id.as_deref(), &old_url, MediaKind::Image)
                .await;
        }

        info!("updated song {} to version {}", updated.id, updated.version);
        Ok(updated)
    }

    /// Remove both blobs concurrently, then the record.
    pub async fn delete_song(&self, identity: &Identity, id: Uuid) -> CatalogResult<()> {
        let this = self.clone();
        let identity = identity.clone();
        run_detached(async move { this.delete_song_inner(&identity, id).await }).await
    }

    async fn delete_song_inner(&self, identity: &Identity, id: Uuid) -> CatalogResult<()> {
        ensure_can_manage(identity)?;

        let song = self.catalog.find(id).await?.ok_or(CatalogError::NotFound)?;

        futures::join!(
            self.remove_media(
                song.audio_public_id.as_deref(),
                &song.audio_url,
                MediaKind::Audio
            ),
            self.remove_media(
                song.cover_public_id.as_deref(),
                &song.cover_url,
                MediaKind::Image
            ),
        );

        if !self.catalog.delete(id).await? {
            return Err(CatalogError::NotFound);
        }

        info!("deleted song {}", id);
        Ok(())
    }

    /// Delete leftover fixture songs and their blobs. Returns how many songs
    /// were removed.
    pub async fn purge_test_fixtures(&self) -> CatalogResult<usize> {
        let purged = self
            .catalog
            .purge_matching(FIXTURE_TITLE, FIXTURE_ARTIST)
            .await?;
        for song in &purged {
            self.remove_media(
                song.audio_public_id.as_deref(),
                &song.audio_url,
                MediaKind::Audio,
            )
            .await;
            self.remove_media(
                song.cover_public_id.as_deref(),
                &song.cover_url,
                MediaKind::Image,
            )
            .await;
        }
        Ok(purged.len())
    }

    /// Best-effort blob removal. Returns whether the blob is known to be gone.
    async fn remove_media(&self, stored_id: Option<&str>, url: &str, kind: MediaKind) -> bool {
        let public_id = match stored_id.filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => match public_id_from_url(url) {
                Some(id) => id,
                None => {
                    warn!("cannot determine media id for {}; leaving blob in place", url);
                    return false;
                }
            },
        };

        match self.media.delete(&public_id, kind).await {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to delete media {}: {}", public_id, err);
                false
            }
        }
    }
}

/// Run a mutation on its own task so dropping the caller's future cannot
/// interrupt it between a remote side effect and its compensation.
async fn run_detached<T, F>(operation: F) -> CatalogResult<T>
where
    F: Future<Output = CatalogResult<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(operation).await.map_err(|err| {
        error!("catalog task did not complete: {}", err);
        CatalogError::Dependency(format!("catalog task did not complete: {}", err))
    })?
}

fn ensure_can_manage(identity: &Identity) -> CatalogResult<()> {
    if identity.can_manage_catalog() {
        Ok(())
    } else {
        warn!("{} attempted a catalog change without admin role", identity.email);
        Err(CatalogError::Forbidden)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
