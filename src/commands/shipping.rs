use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use super::AppState;
use crate::bosta::{self, BostaClient, CachedList, City, District, PickupLocation, ShippingFeeQuote, Zone};
use crate::error::AppResult;
use crate::{settings, storage};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/shipping/cities", get(cities))
        .route("/api/shipping/cities/{city_id}/districts", get(districts))
        .route("/api/shipping/cities/{city_id}/zones", get(zones))
        .route("/api/shipping/pickup-locations", get(pickup_locations))
        .route("/api/shipping/fee", get(fee))
}

fn require_client() -> Result<BostaClient, String> {
    storage::bosta_client().ok_or_else(|| "Bosta API key is not configured".to_string())
}

/// Cached lists keep the address form usable offline.
async fn cities(State(state): State<AppState>) -> AppResult<Json<CachedList<City>>> {
    let client = storage::bosta_client();
    Ok(Json(bosta::cities_cached(&state.db, client.as_ref()).await?))
}

async fn districts(
    State(state): State<AppState>,
    Path(city_id): Path<String>,
) -> AppResult<Json<CachedList<District>>> {
    let client = storage::bosta_client();
    Ok(Json(bosta::districts_cached(&state.db, client.as_ref(), &city_id).await?))
}

async fn zones(Path(city_id): Path<String>) -> AppResult<Json<Vec<Zone>>> {
    let client = require_client()?;
    Ok(Json(client.zones(&city_id).await?))
}

async fn pickup_locations() -> AppResult<Json<Vec<PickupLocation>>> {
    let client = require_client()?;
    Ok(Json(client.pickup_locations().await?))
}

#[derive(Debug, Deserialize)]
struct FeeQuery {
    city_id: String,
    #[serde(default)]
    cod: f64,
    package_type: Option<String>,
}

async fn fee(
    State(state): State<AppState>,
    Query(query): Query<FeeQuery>,
) -> AppResult<Json<ShippingFeeQuote>> {
    let client = require_client()?;
    let package_type = match query.package_type {
        Some(p) if !p.trim().is_empty() => p,
        _ => settings::get_settings(&state.db)?.bosta.default_package_type,
    };
    Ok(Json(
        client
            .shipping_fee(&query.city_id, query.cod.max(0.0), &package_type)
            .await?,
    ))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{call, state};
    use crate::data_helpers::write_local_json;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_cities_served_from_cache() {
        let state = state();
        write_local_json(
            &state.db,
            "bosta_cities_cache_v1",
            &json!({
                "fetched_at": "2026-01-01T00:00:00Z",
                "items": [{ "id": "c1", "name": "Cairo", "name_ar": "القاهرة" }],
            }),
        )
        .unwrap();
        let (status, body) = call(&state, "GET", "/api/shipping/cities", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["from_cache"], json!(true));
        assert_eq!(body["items"][0]["id"], json!("c1"));
    }

    #[tokio::test]
    async fn test_fee_without_key_is_upstream_error() {
        let (status, body) = call(&state(), "GET", "/api/shipping/fee?city_id=c1&cod=100", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], json!("upstream_error"));
    }
}
