use axum::{
    extract::{Path, Query, State},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use super::pos::checkout_response;
use super::AppState;
use crate::error::AppResult;
use crate::invoices::{self, CheckoutOptions, DeliveryStatus, Invoice, InvoiceFilter, PaymentResult};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/orders", get(list).post(checkout))
        .route("/api/orders/{id}", get(get_by_id))
        .route("/api/orders/{id}/payments", post(add_payment))
        .route("/api/orders/{id}/delivery-status", post(set_delivery_status))
        .route("/api/orders/{id}/cancel", post(cancel))
}

async fn list(
    State(state): State<AppState>,
    Query(filter): Query<InvoiceFilter>,
) -> AppResult<Json<Vec<Invoice>>> {
    Ok(Json(invoices::list_invoices(&state.db, &filter)?))
}

#[derive(Debug, Deserialize)]
struct CheckoutRequest {
    #[serde(alias = "tabId")]
    tab_id: String,
    #[serde(flatten)]
    options: CheckoutOptions,
}

async fn checkout(
    State(state): State<AppState>,
    Json(body): Json<CheckoutRequest>,
) -> AppResult<Response> {
    checkout_response(&state, &body.tab_id, &body.options).await
}

/// Accepts the invoice id or its number (`INV-000042`).
async fn get_by_id(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Invoice>> {
    Ok(Json(invoices::get_invoice(&state.db, &id)?))
}

#[derive(Debug, Deserialize)]
struct PaymentRequest {
    amount: f64,
    #[serde(default = "default_method")]
    method: String,
}

fn default_method() -> String {
    "cash".into()
}

async fn add_payment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PaymentRequest>,
) -> AppResult<Json<PaymentResult>> {
    Ok(Json(invoices::add_payment(&state.db, &id, body.amount, &body.method)?))
}

#[derive(Debug, Deserialize)]
struct DeliveryStatusRequest {
    status: DeliveryStatus,
}

async fn set_delivery_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<DeliveryStatusRequest>,
) -> AppResult<Json<Invoice>> {
    Ok(Json(invoices::set_delivery_status(&state.db, &id, body.status)?))
}

async fn cancel(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Invoice>> {
    Ok(Json(invoices::cancel_invoice(&state.db, &id)?))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{call, state};
    use crate::catalog::{self, tests::simple};
    use crate::tabs;
    use crate::pricing::CartLine;
    use axum::http::StatusCode;
    use serde_json::json;

    fn invoice_for(state: &super::AppState) -> String {
        {
            let conn = state.db.conn.lock().unwrap();
            catalog::upsert_cached(&conn, &simple(1, "قميص", 100.0, Some(5))).unwrap();
        }
        let tab = tabs::open_tab(&state.db, None).unwrap();
        tabs::add_line(
            &state.db,
            &tab.id,
            CartLine {
                product_id: Some(1),
                variation_id: None,
                name: "قميص".into(),
                unit_price: 100.0,
                quantity: 2,
                kind: Default::default(),
            },
        )
        .unwrap();
        tab.id
    }

    #[tokio::test]
    async fn test_checkout_payment_and_cancel() {
        let state = state();
        let tab_id = invoice_for(&state);
        let (status, invoice) = call(&state, "POST", "/api/orders", Some(json!({ "tab_id": tab_id }))).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = invoice["id"].as_str().unwrap().to_string();
        let number = invoice["number"].as_str().unwrap().to_string();
        assert!(number.starts_with("INV-"));

        let (status, result) = call(
            &state,
            "POST",
            &format!("/api/orders/{id}/payments"),
            Some(json!({ "amount": 200.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["invoice"]["payment_status"], json!("fully_paid"));

        let (status, listed) = call(&state, "GET", "/api/orders?payment_status=fully_paid", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (_, by_number) = call(&state, "GET", &format!("/api/orders/{number}"), None).await;
        assert_eq!(by_number["id"], json!(id));

        let (status, cancelled) = call(&state, "POST", &format!("/api/orders/{id}/cancel"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["delivery_status"], json!("cancelled"));
        let conn = state.db.conn.lock().unwrap();
        let product = catalog::get_cached(&conn, 1).unwrap().unwrap();
        assert_eq!(product.stock_quantity, Some(5));
    }

    #[tokio::test]
    async fn test_delivery_status_and_bad_payment() {
        let state = state();
        let tab_id = invoice_for(&state);
        let (_, invoice) = call(&state, "POST", "/api/orders", Some(json!({ "tab_id": tab_id }))).await;
        let id = invoice["id"].as_str().unwrap().to_string();

        let (status, shipped) = call(
            &state,
            "POST",
            &format!("/api/orders/{id}/delivery-status"),
            Some(json!({ "status": "shipped" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(shipped["delivery_status"], json!("shipped"));

        let (status, _) = call(
            &state,
            "POST",
            &format!("/api/orders/{id}/payments"),
            Some(json!({ "amount": -5.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&state, "GET", "/api/orders/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
