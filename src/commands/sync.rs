use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use super::AppState;
use crate::error::AppResult;
use crate::{storage, sync};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/sync/status", get(status))
        .route("/api/sync/force", post(force))
        .route("/api/sync/retry-failed", post(retry_failed))
}

async fn status(State(state): State<AppState>) -> AppResult<Json<Value>> {
    Ok(Json(sync::sync_status(&state.db, &state.sync)?))
}

async fn force(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let client = storage::store_client().ok_or("Store is not configured")?;
    Ok(Json(sync::force_sync(&state.db, &state.sync, &client).await?))
}

/// Requeue failed rows with a fresh retry budget.
async fn retry_failed(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let requeued = {
        let conn = state.db.conn.lock().map_err(|e| e.to_string())?;
        sync::retry_failed(&conn)?
    };
    Ok(Json(json!({ "requeued": requeued })))
}
