//! Represents a song entry in the catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A single catalog entry.
///
/// The audio and cover payloads live in the media store; the catalog keeps
/// only their public URLs and the media-store identifiers needed to remove them.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Song {
    /// Generated on insert, never changes.
    pub id: Uuid,

    pub title: String,

    pub artist: String,

    /// Public URL of the audio blob.
    pub audio_url: String,

    /// Media-store identifier of the audio blob. `None` on rows written
    /// before identifiers were stored.
    pub audio_public_id: Option<String>,

    /// Public URL of the cover image.
    pub cover_url: String,

    /// Media-store identifier of the cover image.
    pub cover_public_id: Option<String>,

    /// When this song was added. Set by the server.
    pub uploaded_at: DateTime<Utc>,

    /// Optimistic-lock counter, bumped on every update.
    pub version: i64,
}

/// Fields required to insert a new song.
#[derive(Debug, Clone)]
pub struct NewSong {
    pub title: String,
    pub artist: String,
    pub audio_url: String,
    pub audio_public_id: String,
    pub cover_url: String,
    pub cover_public_id: String,
}
