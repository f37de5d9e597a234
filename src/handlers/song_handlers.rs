//! HTTP handlers for the song catalog.
//! Multipart file parts are streamed to the staging directory; everything
//! else is delegated to `SongService`.

use crate::{
    auth::CurrentUser,
    errors::AppError,
    models::song::Song,
    services::{
        song_service::{CatalogError, SongPatch, SongUpload},
        staging::{StagedFile, Staging},
    },
    state::AppState,
};
use axum::{
    Json,
    extract::{Multipart, Path, State},
    response::IntoResponse,
};
use futures::StreamExt;
use serde_json::json;
use std::{collections::HashMap, io};
use tracing::warn;
use uuid::Uuid;

const SONG_FILE_FIELD: &str = "songFile";
const COVER_FILE_FIELD: &str = "coverImage";

/// `GET /api/songs`: every song, newest first.
pub async fn list_songs(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
) -> Result<Json<Vec<Song>>, AppError> {
    let songs = state.songs.list_songs(&identity).await?;
    Ok(Json(songs))
}

/// `POST /api/upload`: multipart `title`, `artist`, `songFile`, `coverImage`.
pub async fn upload_song(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    // refuse before anything touches the disk
    if !identity.can_manage_catalog() {
        return Err(CatalogError::Forbidden.into());
    }

    let mut form = read_form(&state.staging, multipart, &[SONG_FILE_FIELD, COVER_FILE_FIELD]).await?;
    let upload = SongUpload {
        title: form.fields.remove("title"),
        artist: form.fields.remove("artist"),
        audio: form.files.remove(SONG_FILE_FIELD),
        cover: form.files.remove(COVER_FILE_FIELD),
    };

    let song = state.songs.create_song(&identity, upload).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Song uploaded successfully",
        "song": song,
    })))
}

/// `PUT /api/songs/{id}`: multipart `title?`, `artist?`, `coverImage?`.
pub async fn update_song(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    Path(id): Path<String>,
    multipart: Multipart,
) -> Result<Json<Song>, AppError> {
    if !identity.can_manage_catalog() {
        return Err(CatalogError::Forbidden.into());
    }
    let id = parse_song_id(&id)?;

    let mut form = read_form(&state.staging, multipart, &[COVER_FILE_FIELD]).await?;
    let patch = SongPatch {
        title: form.fields.remove("title"),
        artist: form.fields.remove("artist"),
        cover: form.files.remove(COVER_FILE_FIELD),
    };

    let song = state.songs.update_song(&identity, id, patch).await?;
    Ok(Json(song))
}

/// `DELETE /api/songs/{id}`
pub async fn delete_song(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    if !identity.can_manage_catalog() {
        return Err(CatalogError::Forbidden.into());
    }
    let id = parse_song_id(&id)?;

    state.songs.delete_song(&identity, id).await?;
    Ok(Json(json!({ "message": "Song deleted successfully" })))
}

/// Ids that are not UUIDs cannot name a song.
fn parse_song_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::not_found("Song not found"))
}

/// Text fields and staged file parts of a multipart body.
#[derive(Default)]
struct StagedForm {
    fields: HashMap<String, String>,
    files: HashMap<String, StagedFile>,
}

/// Read a multipart body, staging the parts named in `file_fields`.
///
/// Empty file parts (a form submitted without choosing a file) count as
/// absent. Files staged so far are removed when the form is dropped, which
/// covers early returns and a cancelled request alike.
async fn read_form(
    staging: &Staging,
    mut multipart: Multipart,
    file_fields: &[&str],
) -> Result<StagedForm, AppError> {
    let mut form = StagedForm::default();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                return Err(AppError::new(
                    err.status(),
                    format!("Invalid multipart body: {}", err.body_text()),
                ));
            }
        };

        let name = field.name().unwrap_or_default().to_string();
        if file_fields.contains(&name.as_str()) {
            let file_name = field.file_name().unwrap_or_default().to_string();
            let content_type = field.content_type().map(str::to_string);
            let chunks =
                field.map(|chunk| chunk.map_err(|err| io::Error::other(err.body_text())));

            let staged = match staging.write_stream(&file_name, content_type, chunks).await {
                Ok(staged) => staged,
                Err(err) => {
                    warn!("staging `{}` failed: {}", name, err);
                    // body errors surface as `Other`; anything else is the staging disk
                    return Err(if err.kind() == io::ErrorKind::Other {
                        AppError::bad_request(format!("Could not read `{}`: {}", name, err))
                    } else {
                        AppError::internal(format!("Could not stage `{}`: {}", name, err))
                    });
                }
            };

            if staged.size_bytes == 0 && file_name.is_empty() {
                staged.discard();
                continue;
            }
            // a repeated part replaces the earlier one, which is dropped here
            form.files.insert(name, staged);
        } else {
            match field.text().await {
                Ok(text) => {
                    form.fields.insert(name, text);
                }
                Err(err) => {
                    return Err(AppError::new(
                        err.status(),
                        format!("Invalid multipart body: {}", err.body_text()),
                    ));
                }
            }
        }
    }

    Ok(form)
}
