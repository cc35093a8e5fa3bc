use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub dependencies: Dependencies,
}

#[derive(Serialize)]
pub struct Dependencies {
    pub database: &'static str,
    pub redis: &'static str,
    pub broker: &'static str,
    pub objectstore: &'static str,
}

/// GET /api/health — deep health check across every dependency.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let database = match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => "ok",
        Err(e) => {
            tracing::error!(error = %e, "Health check: database unreachable");
            "down"
        }
    };

    let redis = match state.idempotency.health_check().await {
        Ok(_) => "ok",
        Err(e) => {
            tracing::error!(error = %e, "Health check: redis unreachable");
            "down"
        }
    };

    let broker = match state.broker.health_check().await {
        Ok(_) => "ok",
        Err(e) => {
            tracing::error!(error = %e, "Health check: broker unreachable");
            "down"
        }
    };

    let objectstore = match state.storage.health_check().await {
        Ok(_) => "ok",
        Err(e) => {
            tracing::error!(error = %e, "Health check: object store unreachable");
            "down"
        }
    };

    let dependencies = Dependencies {
        database,
        redis,
        broker,
        objectstore,
    };
    let all_ok = [database, redis, broker, objectstore]
        .iter()
        .all(|s| *s == "ok");

    let (status_code, status) = if all_ok {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };

    (
        status_code,
        Json(HealthResponse {
            status: status.to_string(),
            dependencies,
        }),
    )
}
