//! Collaborators and orchestration behind the HTTP handlers.

pub mod catalog_store;
pub mod identity;
pub mod media_store;
pub mod song_service;
pub mod staging;
pub mod user_service;
