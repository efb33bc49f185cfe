//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness: DB connectivity, backend configuration and
//!   disk I/O in the receiving directory

use crate::services::StorageService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Always 200 with a small JSON body. Performs no I/O.
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
/// 200 when SQLite answers, every storage box can build its backend and a
/// scratch file can be written to the receiving directory; 503 otherwise.
pub async fn readyz(State(service): State<StorageService>) -> impl IntoResponse {
    let sqlite_check = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*service.db)
        .await
    {
        Ok(1) => CheckStatus::ok(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };

    let backends_check = match service.validate_backends().await {
        Ok(_) => CheckStatus::ok(),
        Err(e) => CheckStatus::failed(e.to_string()),
    };

    let dir = service.settings.receiving_dir.clone();
    let tmp_path = dir.join(format!(".readyz-{}", Uuid::new_v4()));
    let disk_check = match fs::create_dir_all(&dir).await {
        Err(e) => CheckStatus::failed(format!("could not create {}: {}", dir.display(), e)),
        Ok(()) => match fs::write(&tmp_path, b"readyz").await {
            Err(e) => CheckStatus::failed(format!("could not write tmp file: {}", e)),
            Ok(()) => {
                let read = fs::read(&tmp_path).await;
                let removed = fs::remove_file(&tmp_path).await;
                match (read, removed) {
                    (Ok(bytes), _) if bytes != b"readyz" => {
                        CheckStatus::failed("file content mismatch".into())
                    }
                    (Ok(_), Ok(())) => CheckStatus::ok(),
                    (Ok(_), Err(e)) => CheckStatus {
                        ok: true,
                        error: Some(format!("could not remove tmp file: {}", e)),
                    },
                    (Err(e), _) => CheckStatus::failed(format!("could not read tmp file: {}", e)),
                }
            }
        },
    };

    let mut checks = HashMap::new();
    checks.insert("sqlite", sqlite_check);
    checks.insert("backends", backends_check);
    checks.insert("disk", disk_check);
    let overall_ok = checks.values().all(|c| c.ok);

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

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
