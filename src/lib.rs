//! Song catalog backend: authenticated song listing plus admin-only upload,
//! edit and removal of songs whose audio and cover art live in a hosted
//! media store.

pub mod auth;
pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method, header},
};
use crate::state::AppState;
use std::time::Duration;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

/// Transport-level settings applied around the router.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub cors_origins: Vec<String>,
    pub request_timeout: Duration,
    pub max_upload_bytes: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            cors_origins: vec!["*".into()],
            request_timeout: Duration::from_secs(120),
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}

impl From<&config::AppConfig> for HttpSettings {
    fn from(cfg: &config::AppConfig) -> Self {
        Self {
            cors_origins: cfg.cors_origins.clone(),
            request_timeout: cfg.request_timeout,
            max_upload_bytes: cfg.max_upload_bytes,
        }
    }
}

/// Assemble the full application: routes, shared state and middleware.
pub fn build_app(state: AppState, settings: &HttpSettings) -> Router {
    routes::routes::routes(state.clone())
        .layer(DefaultBodyLimit::max(settings.max_upload_bytes))
        .layer(cors_layer(&settings.cors_origins))
        .layer(TimeoutLayer::new(settings.request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("ignoring invalid CORS origin `{}`", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}
