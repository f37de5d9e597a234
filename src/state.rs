//! Shared state handed to every handler.

use crate::services::{
    identity::IdentityVerifier, song_service::SongService, staging::Staging,
    user_service::UserDirectory,
};
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    /// Shared SQLite connection pool, also used by readiness checks.
    pub db: Arc<SqlitePool>,
    pub songs: SongService,
    pub users: UserDirectory,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub staging: Staging,
}
