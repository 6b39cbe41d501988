use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use tracing::warn;

use super::AppState;
use crate::error::AppResult;
use crate::tabs::{self, TabView};
use crate::{catalog, settings, storage};

pub fn router() -> Router<AppState> {
    Router::new().route("/api/cashier/initial", get(initial))
}

/// Everything the till needs on first paint. An empty cache is filled from
/// the store first when credentials exist.
async fn initial(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let empty = {
        let conn = state.db.conn.lock().map_err(|e| e.to_string())?;
        crate::db::count_rows(&conn, "products") == 0
    };
    if empty {
        if let Some(client) = storage::store_client() {
            if let Err(e) = catalog::refresh_from_store(&state.db, &client).await {
                warn!(error = %e, "initial catalog load failed, serving empty cache");
            }
        }
    }

    let (products, categories) = {
        let conn = state.db.conn.lock().map_err(|e| e.to_string())?;
        (catalog::list_cached(&conn)?, catalog::list_categories(&conn)?)
    };
    let tabs: Vec<TabView> = tabs::list_tabs(&state.db)?.into_iter().map(TabView::from).collect();
    let settings = settings::get_settings(&state.db)?;

    Ok(Json(json!({
        "products": products,
        "categories": categories,
        "settings": settings,
        "tabs": tabs,
        "store_configured": storage::is_store_configured(),
    })))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{call, state};
    use crate::catalog;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_initial_payload() {
        let state = state();
        {
            let conn = state.db.conn.lock().unwrap();
            catalog::upsert_cached(&conn, &catalog::tests::simple(1, "قميص", 150.0, Some(3))).unwrap();
        }
        let (status, body) = call(&state, "GET", "/api/cashier/initial", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["products"].as_array().unwrap().len(), 1);
        assert!(body["categories"].is_array());
        assert!(body["settings"]["store"].is_object());
        // list_tabs opens the first tab when none exist
        assert!(!body["tabs"].as_array().unwrap().is_empty());
    }
}
