//! Health & readiness handlers.
//!
//! - GET /api/test -> unauthenticated smoke test for the frontend
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks DB connectivity and the staging directory

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use tokio::fs;
use uuid::Uuid;

/// `GET /api/test`
pub async fn api_test() -> impl IntoResponse {
    Json(TestResponse {
        message: "Backend is running".into(),
        timestamp: Utc::now().to_rfc3339(),
        status: "ok".into(),
    })
}

/// `GET /healthz`
///
/// Very small liveness probe, always 200 OK. Performs no I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Runs a lightweight query against SQLite (`SELECT 1`).
/// 2. Performs a best-effort write/read/delete in the staging directory.
///
/// HTTP 200 when all checks pass, HTTP 503 otherwise.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let sqlite_check = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*state.db)
        .await
    {
        Ok(1) => (true, None::<String>),
        Ok(v) => (false, Some(format!("unexpected result: {}", v))),
        Err(e) => (false, Some(format!("error: {}", e))),
    };

    let tmp_path = state
        .staging
        .dir()
        .join(format!(".readyz-{}", Uuid::new_v4()));
    let disk_check = match fs::write(&tmp_path, b"readyz").await {
        Ok(_) => match fs::read(&tmp_path).await {
            Ok(bytes) if bytes == b"readyz" => match fs::remove_file(&tmp_path).await {
                Ok(_) => (true, None::<String>),
                Err(e) => (true, Some(format!("could not remove tmp file: {}", e))),
            },
            Ok(_) => {
                let _ = fs::remove_file(&tmp_path).await;
                (false, Some("file content mismatch".to_string()))
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path).await;
                (false, Some(format!("could not read tmp file: {}", e)))
            }
        },
        Err(e) => (false, Some(format!("could not write tmp file: {}", e))),
    };

    let overall_ok = sqlite_check.0 && disk_check.0;

    let mut checks = HashMap::new();
    checks.insert(
        "sqlite",
        CheckStatus {
            ok: sqlite_check.0,
            error: sqlite_check.1,
        },
    );
    checks.insert(
        "staging",
        CheckStatus {
            ok: disk_check.0,
            error: disk_check.1,
        },
    );

    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct TestResponse {
    message: String,
    timestamp: String,
    status: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
