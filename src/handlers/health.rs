use axum::{extract::State, response::Json};
use serde_json::json;

use crate::{db, ApiResponse, ApiResult, AppState};

/// Liveness plus a database round-trip.
pub async fn health_check(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    let db_ok = db::check_connection(&state.db).await.is_ok();
    Ok(Json(ApiResponse::success(json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "database": db_ok,
        "version": env!("CARGO_PKG_VERSION"),
    }))))
}
