//! HTTP surface.
//!
//! Each submodule exposes `router()` with its handlers. Handlers call the
//! domain functions directly and convert their `Result<T, String>` into
//! [`AppError`](crate::error::AppError) with `?`.

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::db::DbState;
use crate::search::Debouncer;
use crate::sync::SyncState;

pub mod backup;
pub mod cashier;
pub mod customers;
pub mod employees;
pub mod orders;
pub mod pos;
pub mod products;
pub mod settings;
pub mod shipping;
pub mod sync;
pub mod system;

/// Shared handler state. The background loops own separate connections.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbState>,
    pub sync: Arc<SyncState>,
    pub config: Arc<AppConfig>,
    /// Live product search as the cashier types.
    pub search_debounce: Debouncer,
}

impl AppState {
    pub fn new(db: Arc<DbState>, sync: Arc<SyncState>, config: AppConfig) -> Self {
        Self {
            db,
            sync,
            config: Arc::new(config),
            search_debounce: Debouncer::default(),
        }
    }
}

/// Every route, without middleware.
pub fn build_router() -> Router<AppState> {
    Router::new()
        .merge(system::router())
        .merge(cashier::router())
        .merge(products::router())
        .merge(pos::router())
        .merge(orders::router())
        .merge(employees::router())
        .merge(customers::router())
        .merge(shipping::router())
        .merge(settings::router())
        .merge(backup::router())
        .merge(sync::router())
}

/// Routes plus CORS and request tracing, ready to serve.
pub fn build_app(state: AppState) -> Router {
    build_router()
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
