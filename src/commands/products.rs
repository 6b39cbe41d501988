use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::AppState;
use crate::catalog::{self, Product, ProductKind};
use crate::db::DbState;
use crate::error::{AppError, AppResult};
use crate::import::{self, ImportReport};
use crate::search::{self, ProductFilter};
use crate::storage;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/products", get(search_products).post(create))
        .route("/api/products/import", post(import_csv))
        .route("/api/products/import/preview", post(preview_csv))
        .route("/api/products/refresh", post(refresh))
        .route(
            "/api/products/{id}",
            get(get_by_id).patch(update).delete(delete),
        )
        .route(
            "/api/products/{id}/variations",
            get(list_variations).post(generate_variations),
        )
        .route("/api/products/{id}/stock", post(adjust_stock))
        .route("/api/categories", get(list_categories))
        .route("/api/warehouse/create-product", post(warehouse_create))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchQuery {
    q: Option<String>,
    category_id: Option<i64>,
    kind: Option<ProductKind>,
    in_stock_only: bool,
    min_price: Option<f64>,
    max_price: Option<f64>,
    limit: Option<usize>,
    /// Search-as-you-type: debounced, superseded requests come back stale.
    live: bool,
}

fn run_search(db: &DbState, query: &SearchQuery) -> Result<Value, String> {
    let products = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        catalog::list_cached(&conn)?
    };
    let filter = ProductFilter {
        category_id: query.category_id,
        kind: query.kind,
        in_stock_only: query.in_stock_only,
        min_price: query.min_price,
        max_price: query.max_price,
    };
    let text = query.q.as_deref().unwrap_or("");
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let hits = search::search_products(&products, text, &filter, limit);
    let variations = search::search_variations(&products, text, limit);
    Ok(json!({
        "stale": false,
        "total": hits.len(),
        "products": hits,
        "variations": variations,
    }))
}

async fn search_products(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> AppResult<Json<Value>> {
    let live = query.live;
    let db = state.db.clone();
    let work = move || async move { run_search(&db, &query) };
    let outcome = if live {
        state.search_debounce.run(work).await
    } else {
        Some(work().await)
    };
    match outcome {
        Some(result) => Ok(Json(result?)),
        None => Ok(Json(json!({
            "stale": true,
            "total": 0,
            "products": [],
            "variations": [],
        }))),
    }
}

/// New products arrive without an id; drafts get theirs from the cache.
fn draft_from_json(mut body: Value) -> Result<Product, String> {
    let obj = body.as_object_mut().ok_or("Product must be a JSON object")?;
    obj.insert("id".into(), json!(0));
    serde_json::from_value(body).map_err(|e| format!("Invalid product: {e}"))
}

async fn create(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> AppResult<(StatusCode, Json<Product>)> {
    let draft = draft_from_json(body)?;
    let product = catalog::create_product(&state.db, draft)?;
    Ok((StatusCode::CREATED, Json(product)))
}

/// Warehouse form: create on the store right away when reachable, else
/// fall back to a queued draft.
async fn warehouse_create(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let mut draft = draft_from_json(body)?;
    if draft.kind == ProductKind::Variable && draft.variations.is_empty() {
        draft.variations = catalog::generate_variations(&draft)?;
    }
    catalog::validate_product(&draft)?;

    let client = storage::store_client();
    let result = import::push_products(&state.db, client.as_ref(), vec![draft]).await?;
    if let Some(product) = result.created.first() {
        return Ok((StatusCode::CREATED, Json(json!({ "product": product, "queued": false }))));
    }
    if result.queued > 0 {
        return Ok((StatusCode::ACCEPTED, Json(json!({ "product": null, "queued": true }))));
    }
    Err(AppError::from(result.errors.join("; ")))
}

async fn import_csv(State(state): State<AppState>, body: String) -> AppResult<Json<Value>> {
    let ImportReport {
        mapping,
        rows,
        mut products,
        errors,
    } = import::parse_products_csv(&body)?;
    let unknown_categories = import::resolve_categories(&state.db, &mut products)?;
    if products.is_empty() {
        return Err(AppError::Validation("لا توجد منتجات صالحة في الملف".into()));
    }

    let client = storage::store_client();
    let pushed = import::push_products(&state.db, client.as_ref(), products).await?;
    Ok(Json(json!({
        "rows": rows,
        "mapping": mapping,
        "row_errors": errors,
        "unknown_categories": unknown_categories,
        "created": pushed.created.len(),
        "queued": pushed.queued,
        "push_errors": pushed.errors,
        "products": pushed.created,
    })))
}

async fn preview_csv(State(state): State<AppState>, body: String) -> AppResult<Json<Value>> {
    let mut report = import::parse_products_csv(&body)?;
    let unknown_categories = import::resolve_categories(&state.db, &mut report.products)?;
    let mut out = serde_json::to_value(&report).map_err(|e| e.to_string())?;
    out["unknown_categories"] = json!(unknown_categories);
    Ok(Json(out))
}

async fn refresh(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let client = storage::store_client().ok_or("Store is not configured")?;
    Ok(Json(catalog::refresh_from_store(&state.db, &client).await?))
}

fn load(db: &DbState, id: i64) -> Result<Product, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    catalog::get_cached(&conn, id)?.ok_or(format!("Product not found: {id}"))
}

async fn get_by_id(State(state): State<AppState>, Path(id): Path<i64>) -> AppResult<Json<Product>> {
    Ok(Json(load(&state.db, id)?))
}

async fn update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(patch): Json<Value>,
) -> AppResult<Json<Product>> {
    Ok(Json(catalog::update_product_optimistic(&state.db, id, &patch)?))
}

async fn delete(State(state): State<AppState>, Path(id): Path<i64>) -> AppResult<StatusCode> {
    catalog::delete_product(&state.db, id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_variations(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<Value>> {
    let product = load(&state.db, id)?;
    Ok(Json(json!(product.variations)))
}

/// Rebuild the variation grid from the product's attributes, keeping
/// matching variations as they are.
async fn generate_variations(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<Product>> {
    let product = load(&state.db, id)?;
    if product.kind != ProductKind::Variable {
        return Err(AppError::Validation("المنتج ليس متعدد الخيارات".into()));
    }
    let variations = catalog::generate_variations(&product)?;
    let patch = json!({ "variations": variations });
    Ok(Json(catalog::update_product_optimistic(&state.db, id, &patch)?))
}

#[derive(Debug, Deserialize)]
struct StockAdjustment {
    #[serde(default, alias = "variationId")]
    variation_id: Option<i64>,
    delta: i64,
}

async fn adjust_stock(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<StockAdjustment>,
) -> AppResult<Json<Product>> {
    Ok(Json(catalog::set_stock(&state.db, id, body.variation_id, body.delta)?))
}

async fn list_categories(State(state): State<AppState>) -> AppResult<Json<Vec<catalog::Category>>> {
    let conn = state.db.conn.lock().map_err(|e| e.to_string())?;
    Ok(Json(catalog::list_categories(&conn)?))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{call, send, state};
    use crate::catalog::{self, tests::simple};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;

    fn seed(state: &super::AppState) {
        let conn = state.db.conn.lock().unwrap();
        catalog::upsert_cached(&conn, &simple(1, "قميص أبيض", 150.0, Some(5))).unwrap();
        catalog::upsert_cached(&conn, &simple(2, "بنطلون جينز", 300.0, Some(0))).unwrap();
    }

    #[tokio::test]
    async fn test_search_normalizes_arabic() {
        let state = state();
        seed(&state);
        let (status, body) = call(&state, "GET", "/api/products?q=%D9%82%D9%85%D9%8A%D8%B5", None).await;
        assert_eq!(status, StatusCode::OK);
        let products = body["products"].as_array().unwrap();
        assert_eq!(products.len(), 1);
        assert_eq!(products[0]["id"], json!(1));

        let (_, body) = call(&state, "GET", "/api/products?in_stock_only=true", None).await;
        assert_eq!(body["total"], json!(1));
    }

    #[tokio::test]
    async fn test_live_search_returns_results() {
        let state = state();
        seed(&state);
        let (status, body) = call(&state, "GET", "/api/products?live=true", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stale"], json!(false));
        assert_eq!(body["total"], json!(2));
    }

    #[tokio::test]
    async fn test_create_patch_delete_draft() {
        let state = state();
        let (status, body) = call(
            &state,
            "POST",
            "/api/products",
            Some(json!({ "name": "كوب", "regular_price": 40.0, "manage_stock": true, "stock_quantity": 3 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["id"].as_i64().unwrap();
        assert!(id < 0);

        let (status, body) = call(
            &state,
            "PATCH",
            &format!("/api/products/{id}"),
            Some(json!({ "regular_price": 45.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["regular_price"], json!(45.0));

        let (status, _) = call(&state, "DELETE", &format!("/api/products/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = call(&state, "GET", &format!("/api/products/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], json!("not_found"));
    }

    #[tokio::test]
    async fn test_invalid_product_rejected() {
        let state = state();
        let (status, body) = call(
            &state,
            "POST",
            "/api/products",
            Some(json!({ "name": " ", "regular_price": 10.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("validation_error"));
    }

    #[tokio::test]
    async fn test_stock_adjustment_clamps_at_zero() {
        let state = state();
        seed(&state);
        let (status, body) = call(
            &state,
            "POST",
            "/api/products/1/stock",
            Some(json!({ "delta": -8 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stock_quantity"], json!(0));
    }

    #[tokio::test]
    async fn test_import_preview_and_offline_import() {
        let state = state();
        let csv = "الاسم,السعر,الكمية\nكوب,40,3\nطبق,55,2\n";
        let request = || {
            Request::builder()
                .method("POST")
                .header("content-type", "text/csv")
        };

        let (status, body) = send(
            &state,
            request()
                .uri("/api/products/import/preview")
                .body(Body::from(csv))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["products"].as_array().unwrap().len(), 2);

        let (status, body) = send(
            &state,
            request()
                .uri("/api/products/import")
                .body(Body::from(csv))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["queued"], json!(2));
        let conn = state.db.conn.lock().unwrap();
        assert_eq!(catalog::list_cached(&conn).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_without_credentials_is_upstream_error() {
        let (status, body) = call(&state(), "POST", "/api/products/refresh", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], json!("upstream_error"));
    }
}
