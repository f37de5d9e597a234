//! Defines routes for the song catalog API.
//!
//! ## Structure
//! - **Public endpoints**
//!   - `GET    /api/test` — smoke test
//!   - `GET    /healthz`, `GET /readyz` — probes
//!
//! - **Protected endpoints** (behind the auth gate)
//!   - `GET    /api/songs` — list songs, newest first
//!   - `POST   /api/upload` — create a song (admin)
//!   - `PUT    /api/songs/{id}` — edit a song (admin)
//!   - `DELETE /api/songs/{id}` — remove a song (admin)

use crate::{
    auth::auth_gate,
    handlers::{
        health_handlers::{api_test, healthz, readyz},
        song_handlers::{delete_song, list_songs, update_song, upload_song},
    },
    state::AppState,
};
use axum::{
    Router, middleware,
    routing::{get, post, put},
};

/// Build the router for every catalog route.
///
/// The auth gate is attached with `route_layer`, so it only runs for
/// requests that matched a protected route.
pub fn routes(state: AppState) -> Router<AppState> {
    let protected = Router::new()
        .route("/api/songs", get(list_songs))
        .route("/api/songs/{id}", put(update_song).delete(delete_song))
        .route("/api/upload", post(upload_song))
        .route_layer(middleware::from_fn_with_state(state, auth_gate));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/test", get(api_test))
        .merge(protected)
}
