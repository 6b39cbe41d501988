//! Dukkan POS backend.
//!
//! Local point-of-sale and inventory service for a WooCommerce store: the
//! till talks to the axum routes in [`commands`], everything is cached in
//! SQLite, and store mutations go through the background sync queue.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod backup;
pub mod bosta;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod customers;
mod data_helpers;
pub mod db;
pub mod diagnostics;
pub mod employees;
pub mod error;
pub mod import;
pub mod invoices;
pub mod pricing;
pub mod search;
pub mod settings;
pub mod storage;
pub mod sync;
pub mod tabs;

pub use commands::AppState;
pub use config::AppConfig;

pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Numbers arrive as JSON numbers or, from the store API, as strings.
pub(crate) fn value_f64(v: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        match v.get(*key) {
            Some(serde_json::Value::Number(n)) => return n.as_f64(),
            Some(serde_json::Value::String(s)) => {
                if let Ok(n) = s.trim().parse::<f64>() {
                    return Some(n);
                }
            }
            _ => {}
        }
    }
    None
}

pub(crate) fn value_i64(v: &serde_json::Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        match v.get(*key) {
            Some(serde_json::Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    return Some(i);
                }
            }
            Some(serde_json::Value::String(s)) => {
                if let Ok(i) = s.trim().parse::<i64>() {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

pub(crate) fn value_bool(v: &serde_json::Value, keys: &[&str]) -> Option<bool> {
    for key in keys {
        if let Some(b) = v.get(*key).and_then(|x| x.as_bool()) {
            return Some(b);
        }
    }
    None
}

/// Console plus daily rolling file logs under `log_dir`. Keep the returned
/// guard alive for the life of the process; dropping it flushes the file.
pub fn init_tracing(log_dir: &Path) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dukkan_pos_lib=debug"));

    // Prune before the appender opens today's file
    let pruned = diagnostics::prune_old_logs(log_dir);
    std::fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if pruned > 0 {
        info!(pruned, "old log files removed");
    }
    guard
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// Open the database, start the background loops and serve HTTP until a
/// shutdown signal arrives.
pub async fn run(config: AppConfig) -> Result<(), String> {
    info!("Starting Dukkan POS v{}", env!("CARGO_PKG_VERSION"));

    // Main connection for the HTTP handlers
    let db_state = Arc::new(db::init(&config.data_dir)?);
    let sync_state = Arc::new(sync::SyncState::default());
    let cancel = CancellationToken::new();

    // Separate connections for the background loops
    let db_for_sync = Arc::new(db::init(&config.data_dir)?);
    let sync_task = sync::start_sync_loop(
        db_for_sync,
        sync_state.clone(),
        config.sync_interval,
        cancel.clone(),
    );
    let db_for_backup = Arc::new(db::init(&config.data_dir)?);
    let backup_task =
        backup::start_auto_backup_loop(db_for_backup, config.data_dir.clone(), cancel.clone());

    if !storage::is_store_configured() {
        warn!("Store credentials are not set; running offline until they are");
    }

    let addr = config.http_addr;
    let app = commands::build_app(AppState::new(db_state, sync_state, config));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("Failed to bind {addr}: {e}"))?;
    info!(%addr, "HTTP server listening");

    let signal_token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let server_token = cancel.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_token.cancelled().await })
        .await
        .map_err(|e| format!("HTTP server error: {e}"));

    cancel.cancel();
    let _ = tokio::join!(sync_task, backup_task);
    info!("Dukkan POS stopped");
    served
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_helpers_accept_strings_and_numbers() {
        let v = json!({ "price": "12.50", "qty": 3, "id": "42", "name": "  ", "on": true });
        assert_eq!(value_f64(&v, &["price"]), Some(12.5));
        assert_eq!(value_i64(&v, &["missing", "qty"]), Some(3));
        assert_eq!(value_i64(&v, &["id"]), Some(42));
        assert_eq!(value_str(&v, &["name"]), None);
        assert_eq!(value_bool(&v, &["on"]), Some(true));
    }
}
