use anyhow::Result;
use song_catalog::{
    HttpSettings, build_app, config, db,
    services::{
        catalog_store::SongCatalog, identity::JwtVerifier, media_store::CloudinaryStore,
        song_service::SongService, staging::Staging, user_service::UserDirectory,
    },
    state::AppState,
};
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting song-catalog with config: {:?}", cfg);

    // --- Ensure staging directory exists ---
    let staging = Staging::new(&cfg.staging_dir);
    staging.ensure_dir().await?;

    // --- Initialize SQLite connection ---
    let pool = Arc::new(db::connect(&cfg.database_url).await?);
    db::run_migrations(&pool).await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize services ---
    let users = UserDirectory::new(pool.clone());
    users.seed_admins(&cfg.admin_emails).await?;

    let media = Arc::new(CloudinaryStore::new(cfg.media.clone())?);
    let songs = SongService::new(SongCatalog::new(pool.clone()), media);

    if cfg.purge_test_fixtures {
        match songs.purge_test_fixtures().await {
            Ok(0) => tracing::debug!("no test fixture songs to purge"),
            Ok(n) => tracing::info!("purged {} test fixture song(s)", n),
            Err(err) => tracing::warn!("test fixture purge failed: {}", err),
        }
    }

    let state = AppState {
        db: pool,
        songs,
        users,
        verifier: Arc::new(JwtVerifier::new(&cfg.token)?),
        staging,
    };

    // --- Build router ---
    let app = build_app(state, &HttpSettings::from(&cfg));

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
