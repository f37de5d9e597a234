pub mod health_handlers;
pub mod song_handlers;
