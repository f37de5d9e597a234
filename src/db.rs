//! SQLite pool setup and schema migrations.

use anyhow::Result;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{path::Path, str::FromStr, time::Duration};

const MIGRATIONS: &[(&str, &str)] = &[("0001_init", include_str!("../migrations/0001_init.sql"))];

/// Open the catalog database, creating the file and its parent directory
/// when they do not exist yet.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    tracing::debug!("Connecting using raw URL => {}", database_url);

    // Extract the local file path SQLx will use
    let db_path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    let db_path = db_path.split('?').next().unwrap_or(db_path);

    if !db_path.is_empty() && !db_path.starts_with(":memory:") {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// A migrated, single-connection in-memory database.
pub async fn connect_memory() -> Result<SqlitePool> {
    // one connection, otherwise every connection sees its own empty database
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Run the embedded SQL migrations statement by statement.
pub async fn run_migrations(db: &SqlitePool) -> Result<()> {
    for (name, sql) in MIGRATIONS {
        let statements = sql
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        tracing::info!(
            "Running migration {} ({} statements)...",
            name,
            statements.len()
        );

        for stmt in statements {
            tracing::debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(db).await?;
        }
    }

    Ok(())
}
