use axum::{
    extract::State,
    routing::{get, post, put},
    Json, Router,
};
use serde_json::Value;

use super::AppState;
use crate::api::ConnectivityResult;
use crate::error::AppResult;
use crate::settings::{self, Settings};
use crate::storage;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/settings", get(get_settings).put(update_settings))
        .route(
            "/api/settings/credentials",
            put(update_credentials)
                .delete(clear_credentials)
                .get(credentials_overview),
        )
        .route("/api/settings/test-connection", post(test_connection))
}

async fn get_settings(State(state): State<AppState>) -> AppResult<Json<Settings>> {
    Ok(Json(settings::get_settings(&state.db)?))
}

/// Deep-merges the body into the stored settings.
async fn update_settings(
    State(state): State<AppState>,
    Json(patch): Json<Value>,
) -> AppResult<Json<Settings>> {
    Ok(Json(settings::update_settings(&state.db, &patch)?))
}

/// Secrets never leave the keyring; this only reports what is set.
async fn credentials_overview() -> Json<Value> {
    Json(storage::credentials_overview())
}

async fn update_credentials(Json(payload): Json<Value>) -> AppResult<Json<Value>> {
    Ok(Json(storage::update_credentials(&payload)?))
}

async fn clear_credentials() -> AppResult<Json<Value>> {
    Ok(Json(storage::clear_credentials()?))
}

async fn test_connection() -> AppResult<Json<ConnectivityResult>> {
    let client = storage::store_client().ok_or("Store is not configured")?;
    Ok(Json(client.test_connectivity().await))
}
