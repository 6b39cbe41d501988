use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;

use super::AppState;
use crate::customers::{self, Customer, ShippingQuote};
use crate::error::AppResult;
use crate::storage;

const DEFAULT_SEARCH_LIMIT: usize = 20;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/customers", get(list).post(create))
        .route("/api/customers/search", get(search))
        .route(
            "/api/customers/{id}",
            get(get_by_id).patch(update).delete(delete),
        )
        .route("/api/customers/{id}/shipping-cost", post(shipping_cost))
}

async fn list(State(state): State<AppState>) -> AppResult<Json<Vec<Customer>>> {
    Ok(Json(customers::list_customers(&state.db)?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchQuery {
    q: String,
    limit: Option<usize>,
}

/// Name fragment or phone digits.
async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> AppResult<Json<Vec<Customer>>> {
    let limit = query.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
    Ok(Json(customers::search_customers(&state.db, &query.q, limit)?))
}

/// Created on the store when reachable, else saved offline and queued.
async fn create(
    State(state): State<AppState>,
    Json(customer): Json<Customer>,
) -> AppResult<(StatusCode, Json<Customer>)> {
    let client = storage::store_client();
    let customer = customers::create_customer(&state.db, client.as_ref(), customer).await?;
    Ok((StatusCode::CREATED, Json(customer)))
}

async fn get_by_id(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Customer>> {
    Ok(Json(customers::get_customer(&state.db, &id)?))
}

async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<Value>,
) -> AppResult<Json<Customer>> {
    Ok(Json(customers::update_customer(&state.db, &id, &patch)?))
}

async fn delete(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<StatusCode> {
    customers::delete_customer(&state.db, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ShippingCostRequest {
    #[serde(alias = "codAmount")]
    cod_amount: f64,
}

async fn shipping_cost(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ShippingCostRequest>>,
) -> AppResult<Json<ShippingQuote>> {
    let cod_amount = body.map(|Json(b)| b.cod_amount).unwrap_or_default();
    let customer = customers::get_customer(&state.db, &id)?;
    let bosta = storage::bosta_client();
    Ok(Json(
        customers::resolve_shipping_cost(&state.db, bosta.as_ref(), &customer, cod_amount).await?,
    ))
}
