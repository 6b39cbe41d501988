use axum::{extract::State, routing::get, Json, Router};
use serde_json::Value;

use super::AppState;
use crate::diagnostics;
use crate::error::AppResult;
use crate::sync;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/diagnostics/about", get(about))
}

async fn health(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let mut health = diagnostics::get_system_health(&state.db)?;
    health["sync"] = sync::sync_status(&state.db, &state.sync)?;
    health["version"] = Value::from(env!("CARGO_PKG_VERSION"));
    Ok(Json(health))
}

async fn about() -> Json<Value> {
    Json(diagnostics::get_about_info())
}
