//! Core data models for the song catalog.
//!
//! These entities map to SQLite tables via `sqlx::FromRow` and serialize
//! as camelCase JSON via `serde`.

pub mod song;
pub mod user;
