use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::AppState;
use crate::error::AppResult;
use crate::invoices::{self, CheckoutOptions};
use crate::pricing::{self, CartLine, CheckoutInput};
use crate::tabs::{self, PosTab, TabView};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/pos/verify-stock", post(verify_stock))
        .route("/api/pos/calculate", post(calculate))
        .route("/api/pos/tabs", get(list_tabs).post(open_tab))
        .route(
            "/api/pos/tabs/{id}",
            get(get_tab).patch(rename_tab).delete(close_tab),
        )
        .route("/api/pos/tabs/{id}/activate", post(activate_tab))
        .route("/api/pos/tabs/{id}/lines", post(add_line).delete(clear_cart))
        .route(
            "/api/pos/tabs/{id}/lines/{index}",
            put(set_quantity).delete(remove_line),
        )
        .route("/api/pos/tabs/{id}/options", put(set_options))
        .route("/api/pos/tabs/{id}/checkout", post(checkout))
}

#[derive(Debug, Deserialize)]
struct VerifyStockRequest {
    #[serde(alias = "items")]
    lines: Vec<CartLine>,
}

async fn verify_stock(
    State(state): State<AppState>,
    Json(body): Json<VerifyStockRequest>,
) -> AppResult<Json<Value>> {
    let shortages = invoices::verify_stock_db(&state.db, &body.lines)?;
    Ok(Json(json!({
        "ok": shortages.is_empty(),
        "shortages": shortages,
    })))
}

/// Totals for a cart that is not stored in a tab.
async fn calculate(Json(input): Json<CheckoutInput>) -> AppResult<Json<Value>> {
    let summary = pricing::calculate(&input)?;
    let breakdown: Vec<Value> = pricing::collection_breakdown(&input)?
        .into_iter()
        .map(|(status, amount)| json!({ "payment_status": status, "amount_to_collect": amount }))
        .collect();
    Ok(Json(json!({ "summary": summary, "breakdown": breakdown })))
}

fn view(tab: PosTab) -> Json<TabView> {
    Json(TabView::from(tab))
}

async fn list_tabs(State(state): State<AppState>) -> AppResult<Json<Vec<TabView>>> {
    let tabs = tabs::list_tabs(&state.db)?;
    Ok(Json(tabs.into_iter().map(TabView::from).collect()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TitleRequest {
    title: Option<String>,
}

async fn open_tab(
    State(state): State<AppState>,
    body: Option<Json<TitleRequest>>,
) -> AppResult<(StatusCode, Json<TabView>)> {
    let title = body.and_then(|Json(b)| b.title);
    let tab = tabs::open_tab(&state.db, title)?;
    Ok((StatusCode::CREATED, view(tab)))
}

async fn get_tab(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<TabView>> {
    Ok(view(tabs::get_tab(&state.db, &id)?))
}

async fn rename_tab(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TitleRequest>,
) -> AppResult<Json<TabView>> {
    let title = body.title.unwrap_or_default();
    Ok(view(tabs::rename_tab(&state.db, &id, &title)?))
}

/// Returns the remaining tabs; the neighbour becomes active.
async fn close_tab(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Vec<TabView>>> {
    let tabs = tabs::close_tab(&state.db, &id)?;
    Ok(Json(tabs.into_iter().map(TabView::from).collect()))
}

async fn activate_tab(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<TabView>> {
    Ok(view(tabs::activate_tab(&state.db, &id)?))
}

async fn add_line(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(line): Json<CartLine>,
) -> AppResult<Json<TabView>> {
    Ok(view(tabs::add_line(&state.db, &id, line)?))
}

async fn clear_cart(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<TabView>> {
    Ok(view(tabs::clear_cart(&state.db, &id)?))
}

#[derive(Debug, Deserialize)]
struct QuantityRequest {
    quantity: u32,
}

async fn set_quantity(
    State(state): State<AppState>,
    Path((id, index)): Path<(String, usize)>,
    Json(body): Json<QuantityRequest>,
) -> AppResult<Json<TabView>> {
    Ok(view(tabs::set_quantity(&state.db, &id, index, body.quantity)?))
}

async fn remove_line(
    State(state): State<AppState>,
    Path((id, index)): Path<(String, usize)>,
) -> AppResult<Json<TabView>> {
    Ok(view(tabs::remove_line(&state.db, &id, index)?))
}

async fn set_options(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(options): Json<Value>,
) -> AppResult<Json<TabView>> {
    Ok(view(tabs::set_checkout_options(&state.db, &id, &options)?))
}

/// Checkout of one tab. Stock shortages come back as 409 with the list so
/// the till can offer to oversell.
pub(crate) async fn checkout_response(
    state: &AppState,
    tab_id: &str,
    options: &CheckoutOptions,
) -> AppResult<Response> {
    if !options.allow_oversell {
        let tab = tabs::get_tab(&state.db, tab_id)?;
        let shortages = invoices::verify_stock_db(&state.db, &tab.cart.checkout.lines)?;
        if !shortages.is_empty() {
            let body = json!({
                "code": "stock_shortage",
                "message": "الكمية غير متوفرة في المخزون",
                "shortages": shortages,
            });
            return Ok((StatusCode::CONFLICT, Json(body)).into_response());
        }
    }
    let invoice = invoices::checkout_tab(&state.db, tab_id, options)?;
    Ok((StatusCode::CREATED, Json(invoice)).into_response())
}

async fn checkout(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<CheckoutOptions>>,
) -> AppResult<Response> {
    let options = body.map(|Json(o)| o).unwrap_or_default();
    checkout_response(&state, &id, &options).await
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{call, state};
    use crate::catalog::{self, tests::simple};
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_calculate_with_discount_and_delivery() {
        let state = state();
        let (status, body) = call(
            &state,
            "POST",
            "/api/pos/calculate",
            Some(json!({
                "lines": [{ "product_id": 1, "name": "قميص", "unit_price": 100.0, "quantity": 2 }],
                "discount": { "mode": "percentage", "value": 10.0 },
                "delivery_fee": 50.0,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["summary"]["subtotal"], json!(200.0));
        assert_eq!(body["summary"]["discount"], json!(20.0));
        assert_eq!(body["summary"]["total"], json!(230.0));
        assert_eq!(body["breakdown"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_tab_cart_flow_and_checkout() {
        let state = state();
        {
            let conn = state.db.conn.lock().unwrap();
            catalog::upsert_cached(&conn, &simple(1, "قميص", 100.0, Some(2))).unwrap();
        }
        let (status, tab) = call(&state, "POST", "/api/pos/tabs", Some(json!({}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = tab["id"].as_str().unwrap().to_string();

        let line = json!({ "product_id": 1, "name": "قميص", "unit_price": 100.0, "quantity": 1 });
        call(&state, "POST", &format!("/api/pos/tabs/{id}/lines"), Some(line.clone())).await;
        let (_, tab) = call(&state, "POST", &format!("/api/pos/tabs/{id}/lines"), Some(line)).await;
        assert_eq!(tab["cart"]["lines"][0]["quantity"], json!(2));
        assert_eq!(tab["summary"]["total"], json!(200.0));

        let (_, tab) = call(
            &state,
            "PUT",
            &format!("/api/pos/tabs/{id}/lines/0"),
            Some(json!({ "quantity": 3 })),
        )
        .await;
        assert_eq!(tab["cart"]["lines"][0]["quantity"], json!(3));

        let (status, body) = call(&state, "POST", &format!("/api/pos/tabs/{id}/checkout"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], json!("stock_shortage"));
        assert_eq!(body["shortages"][0]["available"], json!(2));

        let (status, invoice) = call(
            &state,
            "POST",
            &format!("/api/pos/tabs/{id}/checkout"),
            Some(json!({ "allow_oversell": true })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(invoice["total"], json!(300.0));

        let (_, tab) = call(&state, "GET", &format!("/api/pos/tabs/{id}"), None).await;
        assert!(tab["cart"]["lines"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_verify_stock_and_missing_tab() {
        let state = state();
        {
            let conn = state.db.conn.lock().unwrap();
            catalog::upsert_cached(&conn, &simple(1, "قميص", 100.0, Some(1))).unwrap();
        }
        let (_, body) = call(
            &state,
            "POST",
            "/api/pos/verify-stock",
            Some(json!({ "lines": [{ "product_id": 1, "name": "قميص", "unit_price": 100.0, "quantity": 1 }] })),
        )
        .await;
        assert_eq!(body["ok"], json!(true));

        let (status, _) = call(&state, "GET", "/api/pos/tabs/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
