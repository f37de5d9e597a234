//! SQLite-backed persistence for song records.

use crate::models::song::{NewSong, Song};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

const SONG_COLUMNS: &str = "id, title, artist, audio_url, audio_public_id, cover_url, \
                            cover_public_id, uploaded_at, version";

/// Result of a version-checked update.
#[derive(Debug)]
pub enum UpdateOutcome {
    Updated(Song),
    /// The row exists but its version moved on.
    Stale,
    /// The row is gone.
    Missing,
}

#[derive(Clone)]
pub struct SongCatalog {
    pub db: Arc<SqlitePool>,
}

impl SongCatalog {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// All songs, newest first.
    pub async fn list_newest_first(&self) -> Result<Vec<Song>, sqlx::Error> {
        sqlx::query_as::<_, Song>(&format!(
            "SELECT {} FROM songs ORDER BY uploaded_at DESC, rowid DESC",
            SONG_COLUMNS
        ))
        .fetch_all(&*self.db)
        .await
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<Song>, sqlx::Error> {
        sqlx::query_as::<_, Song>(&format!("SELECT {} FROM songs WHERE id = ?", SONG_COLUMNS))
            .bind(id)
            .fetch_optional(&*self.db)
            .await
    }

    /// Insert a song with a fresh id and the current timestamp.
    pub async fn insert(&self, song: NewSong) -> Result<Song, sqlx::Error> {
        sqlx::query_as::<_, Song>(&format!(
            "INSERT INTO songs (
                id, title, artist, audio_url, audio_public_id,
                cover_url, cover_public_id, uploaded_at, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1)
            RETURNING {}",
            SONG_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&song.title)
        .bind(&song.artist)
        .bind(&song.audio_url)
        .bind(&song.audio_public_id)
        .bind(&song.cover_url)
        .bind(&song.cover_public_id)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await
    }

    /// Write the mutable fields of `song` if its stored version still equals
    /// `song.version`. The stored version is bumped on success.
    pub async fn update_versioned(&self, song: &Song) -> Result<UpdateOutcome, sqlx::Error> {
        let updated = sqlx::query_as::<_, Song>(&format!(
            "UPDATE songs
             SET title = ?, artist = ?, cover_url = ?, cover_public_id = ?,
                 version = version + 1
             WHERE id = ? AND version = ?
             RETURNING {}",
            SONG_COLUMNS
        ))
        .bind(&song.title)
        .bind(&song.artist)
        .bind(&song.cover_url)
        .bind(&song.cover_public_id)
        .bind(song.id)
        .bind(song.version)
        .fetch_optional(&*self.db)
        .await?;

        if let Some(song) = updated {
            return Ok(UpdateOutcome::Updated(song));
        }

        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM songs WHERE id = ?")
            .bind(song.id)
            .fetch_one(&*self.db)
            .await?;
        Ok(if exists > 0 {
            UpdateOutcome::Stale
        } else {
            UpdateOutcome::Missing
        })
    }

    /// Delete by id. Returns false when nothing was deleted.
    pub async fn delete(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM songs WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete every song with exactly this title and artist, returning the
    /// removed rows.
    pub async fn purge_matching(&self, title: &str, artist: &str) -> Result<Vec<Song>, sqlx::Error> {
        sqlx::query_as::<_, Song>(&format!(
            "DELETE FROM songs WHERE title = ? AND artist = ? RETURNING {}",
            SONG_COLUMNS
        ))
        .bind(title)
        .bind(artist)
        .fetch_all(&*self.db)
        .await
    }
}
