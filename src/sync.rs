//! Background sync engine for Dukkan POS.
//!
//! Local mutations (product edits, checkouts, offline customers) are written
//! to SQLite first and recorded in `sync_queue`. A background loop pushes
//! the queue to the store in insertion order, retries failures with
//! exponential backoff, and writes the store's answer back into the cache.
//! A second pass polls stock of recently sold products for a short window so
//! the cache converges on server stock.

use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{self, StoreClient};
use crate::catalog::{self, Product, Variation};
use crate::db::DbState;
use crate::storage;

const DEFAULT_RETRY_DELAY_MS: i64 = 5_000;
const MAX_RETRY_DELAY_MS: i64 = 300_000;
const CYCLE_BATCH_SIZE: usize = 50;
/// How long after a sale the sold products are polled for store stock.
const RECONCILE_WINDOW_MINUTES: i64 = 2;
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(15);
/// Payload key carrying variations of a product that is not on the store yet.
pub const VARIATIONS_DRAFT_KEY: &str = "variations_draft";

/// Timestamp format used for every queue/reconcile column compared as text.
pub fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn ts_after(delay: ChronoDuration) -> String {
    (Utc::now() + delay).to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// End of the stock reconciliation window for a sale made now.
pub fn reconcile_deadline() -> String {
    ts_after(ChronoDuration::minutes(RECONCILE_WINDOW_MINUTES))
}

// ---------------------------------------------------------------------------
// Sync engine state
// ---------------------------------------------------------------------------

/// Shared state of the background sync engine.
pub struct SyncState {
    pub is_running: Arc<AtomicBool>,
    pub last_sync: Arc<Mutex<Option<String>>>,
    pub last_error: Arc<Mutex<Option<String>>>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            is_running: Arc::new(AtomicBool::new(false)),
            last_sync: Arc::new(Mutex::new(None)),
            last_error: Arc::new(Mutex::new(None)),
        }
    }
}

impl SyncState {
    fn record_cycle(&self, result: &Result<usize, String>) {
        match result {
            Ok(_) => {
                if let Ok(mut guard) = self.last_sync.lock() {
                    *guard = Some(now_ts());
                }
                if let Ok(mut guard) = self.last_error.lock() {
                    *guard = None;
                }
            }
            Err(e) => {
                if let Ok(mut guard) = self.last_error.lock() {
                    *guard = Some(e.clone());
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "create" => Operation::Create,
            "delete" => Operation::Delete,
            _ => Operation::Update,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncItem {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    pub method: String,
    pub path: String,
    pub payload: Value,
    pub retry_count: i64,
    pub max_retries: i64,
}

/// Record a store mutation to push later. Returns the queue row id.
pub fn enqueue(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
    operation: Operation,
    method: &str,
    path: &str,
    payload: &Value,
) -> Result<i64, String> {
    api::validate_store_path(path)?;
    let body = serde_json::to_string(payload).map_err(|e| format!("serialize payload: {e}"))?;
    let now = now_ts();
    conn.execute(
        "INSERT INTO sync_queue (entity_type, entity_id, operation, method, path, payload,
                                 idempotency_key, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?8)",
        params![
            entity_type,
            entity_id,
            operation.as_str(),
            method.to_uppercase(),
            path,
            body,
            Uuid::new_v4().to_string(),
            now,
        ],
    )
    .map_err(|e| format!("enqueue sync: {e}"))?;
    let id = conn.last_insert_rowid();
    debug!(id, entity_type, entity_id, method, path, "sync operation queued");
    Ok(id)
}

/// Rewrite the body of a still pending create (edits to local drafts).
pub fn replace_pending_payload(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
    payload: &Value,
) -> Result<usize, String> {
    let body = serde_json::to_string(payload).map_err(|e| format!("serialize payload: {e}"))?;
    conn.execute(
        "UPDATE sync_queue SET payload = ?1, updated_at = ?2
         WHERE entity_type = ?3 AND entity_id = ?4
           AND operation = 'create' AND status IN ('pending', 'failed')",
        params![body, now_ts(), entity_type, entity_id],
    )
    .map_err(|e| format!("replace pending payload: {e}"))
}

/// Drop queued work for an entity that was removed before it ever synced.
pub fn drop_pending(conn: &Connection, entity_type: &str, entity_id: &str) -> Result<usize, String> {
    conn.execute(
        "DELETE FROM sync_queue
         WHERE entity_type = ?1 AND entity_id = ?2 AND status IN ('pending', 'failed')",
        params![entity_type, entity_id],
    )
    .map_err(|e| format!("drop pending sync: {e}"))
}

/// Due pending rows, oldest first.
pub fn pending(conn: &Connection, limit: usize) -> Result<Vec<SyncItem>, String> {
    let mut stmt = conn
        .prepare(
            "SELECT id, entity_type, entity_id, operation, method, path, payload,
                    retry_count, max_retries
             FROM sync_queue
             WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= ?1)
             ORDER BY id ASC
             LIMIT ?2",
        )
        .map_err(|e| format!("prepare pending: {e}"))?;
    let rows = stmt
        .query_map(params![now_ts(), limit as i64], |row| {
            let payload: String = row.get(6)?;
            let operation: String = row.get(3)?;
            Ok(SyncItem {
                id: row.get(0)?,
                entity_type: row.get(1)?,
                entity_id: row.get(2)?,
                operation: Operation::parse(&operation),
                method: row.get(4)?,
                path: row.get(5)?,
                payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
                retry_count: row.get(7)?,
                max_retries: row.get(8)?,
            })
        })
        .map_err(|e| format!("query pending: {e}"))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn mark_synced(conn: &Connection, id: i64) -> Result<(), String> {
    let now = now_ts();
    conn.execute(
        "UPDATE sync_queue
         SET status = 'synced', synced_at = ?1, updated_at = ?1, last_error = NULL,
             next_retry_at = NULL
         WHERE id = ?2",
        params![now, id],
    )
    .map_err(|e| format!("mark synced: {e}"))?;
    Ok(())
}

/// `5s × 2^retry`, capped at five minutes.
pub fn backoff_delay_ms(retry_count: i64) -> i64 {
    let shift = retry_count.clamp(0, 16) as u32;
    DEFAULT_RETRY_DELAY_MS
        .saturating_mul(1_i64 << shift)
        .min(MAX_RETRY_DELAY_MS)
}

/// Record a failed push. Transient errors are rescheduled with backoff until
/// `max_retries`; permanent errors fail the row at once.
pub fn mark_failed(conn: &Connection, item: &SyncItem, error: &str, permanent: bool) -> Result<(), String> {
    let new_count = item.retry_count + 1;
    let exhausted = permanent || new_count >= item.max_retries;
    let (status, next_retry_at) = if exhausted {
        ("failed", None)
    } else {
        (
            "pending",
            Some(ts_after(ChronoDuration::milliseconds(backoff_delay_ms(
                item.retry_count,
            )))),
        )
    };
    conn.execute(
        "UPDATE sync_queue
         SET status = ?1, retry_count = ?2, next_retry_at = ?3, last_error = ?4, updated_at = ?5
         WHERE id = ?6",
        params![status, new_count, next_retry_at, error, now_ts(), item.id],
    )
    .map_err(|e| format!("mark failed: {e}"))?;
    if exhausted {
        warn!(id = item.id, entity_type = %item.entity_type, error, "sync operation failed permanently");
    }
    Ok(())
}

/// Put every failed row back in the queue with a fresh retry budget.
pub fn retry_failed(conn: &Connection) -> Result<usize, String> {
    let n = conn
        .execute(
            "UPDATE sync_queue
             SET status = 'pending', retry_count = 0, next_retry_at = NULL, updated_at = ?1
             WHERE status = 'failed'",
            params![now_ts()],
        )
        .map_err(|e| format!("retry failed: {e}"))?;
    if n > 0 {
        info!(count = n, "failed sync operations requeued");
    }
    Ok(n)
}

// ---------------------------------------------------------------------------
// Push cycle
// ---------------------------------------------------------------------------

fn is_gone(error: &str) -> bool {
    error.contains("(HTTP 404)") || error.contains("(HTTP 410)")
}

/// `DELETE` carries its payload as query parameters.
fn delete_query(payload: &Value) -> Vec<(&str, String)> {
    payload
        .as_object()
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.as_str(), value)
                })
                .collect()
        })
        .unwrap_or_default()
}

async fn push_item(client: &StoreClient, item: &SyncItem) -> Result<Value, String> {
    if item.method == "DELETE" {
        let query = delete_query(&item.payload);
        return client.request("DELETE", &item.path, &query, None).await;
    }
    let mut body = item.payload.clone();
    if let Some(obj) = body.as_object_mut() {
        obj.remove(VARIATIONS_DRAFT_KEY);
    }
    client.request(&item.method, &item.path, &[], Some(&body)).await
}

/// Write the store's answer for a pushed row back into the local stores.
fn apply_success(conn: &Connection, item: &SyncItem, response: &Value) -> Result<(), String> {
    match (item.entity_type.as_str(), item.operation) {
        ("product", Operation::Create) => {
            let draft_id: i64 = item.entity_id.parse().unwrap_or(0);
            let product = Product::from_store(response);
            if product.id <= 0 {
                return Err("store returned a product without id".into());
            }
            catalog::replace_draft(conn, draft_id, &product)?;
            let drafts = item
                .payload
                .get(VARIATIONS_DRAFT_KEY)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if !drafts.is_empty() {
                enqueue(
                    conn,
                    "variation_batch",
                    &product.id.to_string(),
                    Operation::Update,
                    "POST",
                    &format!("products/{}/variations/batch", product.id),
                    &json!({ "create": drafts }),
                )?;
            }
            info!(draft_id, product_id = product.id, "product draft synced");
        }
        ("product", Operation::Update) => {
            let mut server = Product::from_store(response);
            if server.id > 0 {
                if let Some(cached) = catalog::get_cached(conn, server.id)? {
                    server.variations = cached.variations;
                }
                catalog::upsert_cached(conn, &server)?;
            }
        }
        ("variation_batch", _) => {
            let product_id: i64 = item.entity_id.parse().unwrap_or(0);
            if let Some(mut cached) = catalog::get_cached(conn, product_id)? {
                merge_variation_batch(&mut cached, response);
                catalog::upsert_cached(conn, &cached)?;
            }
        }
        ("order", Operation::Create) => {
            let remote_id = response.get("id").and_then(Value::as_i64);
            // The store has the sale now; watch its stock from here
            conn.execute(
                "UPDATE invoices SET remote_order_id = ?1, sync_status = 'synced', updated_at = ?2,
                        reconcile_until = ?3
                 WHERE id = ?4",
                params![remote_id, now_ts(), reconcile_deadline(), item.entity_id],
            )
            .map_err(|e| format!("store remote order id: {e}"))?;
            info!(invoice_id = %item.entity_id, ?remote_id, "order synced");
        }
        ("order", _) => {
            conn.execute(
                "UPDATE invoices SET sync_status = 'synced', updated_at = ?1 WHERE id = ?2",
                params![now_ts(), item.entity_id],
            )
            .map_err(|e| format!("update invoice sync status: {e}"))?;
        }
        ("customer", Operation::Create) => {
            let remote_id = response.get("id").and_then(Value::as_i64);
            conn.execute(
                "UPDATE customers SET remote_id = ?1, offline = 0, updated_at = ?2 WHERE id = ?3",
                params![remote_id, now_ts(), item.entity_id],
            )
            .map_err(|e| format!("store customer remote id: {e}"))?;
            info!(customer_id = %item.entity_id, ?remote_id, "offline customer synced");
        }
        _ => {}
    }
    Ok(())
}

/// Fold a `variations/batch` response into the cached product: drafts are
/// replaced by the created records, deletions removed, updates overwritten.
fn merge_variation_batch(product: &mut Product, response: &Value) {
    let list = |key: &str| -> Vec<Variation> {
        response
            .get(key)
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter(|v| v.get("error").is_none())
                    .map(Variation::from_store)
                    .filter(|v| v.id > 0)
                    .collect()
            })
            .unwrap_or_default()
    };
    let created = list("create");
    let updated = list("update");
    let deleted: BTreeSet<i64> = list("delete").iter().map(|v| v.id).collect();

    product
        .variations
        .retain(|v| v.id > 0 && !deleted.contains(&v.id));
    for variation in updated {
        match product.variations.iter_mut().find(|v| v.id == variation.id) {
            Some(slot) => *slot = variation,
            None => product.variations.push(variation),
        }
    }
    product.variations.extend(created);
}

/// Push due queue rows in order. Returns how many were synced.
///
/// A transient failure (network, 5xx, 429) stops the cycle so later rows
/// are not sent ahead of the one that failed.
pub async fn run_sync_cycle(db: &DbState, client: &StoreClient) -> Result<usize, String> {
    let items = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        pending(&conn, CYCLE_BATCH_SIZE)?
    };
    if items.is_empty() {
        return Ok(0);
    }
    debug!(count = items.len(), "sync cycle starting");

    let mut synced = 0;
    for item in &items {
        let result = push_item(client, item).await;
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        match result {
            Ok(response) => {
                if let Err(e) = apply_success(&conn, item, &response) {
                    warn!(id = item.id, error = %e, "applying store response failed");
                }
                mark_synced(&conn, item.id)?;
                synced += 1;
            }
            Err(e) if item.operation == Operation::Delete && is_gone(&e) => {
                mark_synced(&conn, item.id)?;
                synced += 1;
            }
            Err(e) => {
                let transient = api::is_transient_error(&e);
                mark_failed(&conn, item, &e, !transient)?;
                if transient {
                    drop(conn);
                    return Err(e);
                }
            }
        }
    }
    Ok(synced)
}

// ---------------------------------------------------------------------------
// Stock reconciliation
// ---------------------------------------------------------------------------

fn stock_signature(product: &Product) -> (Option<i64>, Vec<(i64, Option<i64>)>) {
    (
        product.stock_quantity,
        product
            .variations
            .iter()
            .map(|v| (v.id, v.stock_quantity))
            .collect(),
    )
}

/// Fetch store stock for `product_ids` and overwrite cached products whose
/// stock differs. Returns the number of products updated.
pub async fn reconcile_stock(
    db: &DbState,
    client: &StoreClient,
    product_ids: &[i64],
) -> Result<usize, String> {
    let mut updated = 0;
    for &id in product_ids.iter().filter(|id| **id > 0) {
        let server = match catalog::fetch_product(client, id).await {
            Ok(p) => p,
            Err(e) if is_gone(&e) => {
                let conn = db.conn.lock().map_err(|e| e.to_string())?;
                catalog::remove_cached(&conn, id)?;
                continue;
            }
            Err(e) => return Err(e),
        };
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        let differs = match catalog::get_cached(&conn, id)? {
            Some(cached) => stock_signature(&cached) != stock_signature(&server),
            None => true,
        };
        if differs {
            catalog::upsert_cached(&conn, &server)?;
            updated += 1;
            debug!(product_id = id, "stock reconciled from store");
        }
    }
    Ok(updated)
}

/// Products sold by invoices still inside their reconciliation window.
/// Expired windows are cleared.
///
/// Products with a local change the store has not seen yet (an order create
/// or product row still `pending`/`failed`) are held back: the store's stock
/// would not include that change and would overwrite it.
pub fn reconcile_candidates(conn: &Connection) -> Result<Vec<i64>, String> {
    let now = now_ts();
    conn.execute(
        "UPDATE invoices SET reconcile_until = NULL
         WHERE reconcile_until IS NOT NULL AND reconcile_until <= ?1",
        params![now],
    )
    .map_err(|e| format!("expire reconcile windows: {e}"))?;

    let sold = product_ids_of_invoices(
        conn,
        "SELECT items FROM invoices WHERE reconcile_until > ?1",
        params![now],
    )?;
    let mut held = product_ids_of_invoices(
        conn,
        "SELECT i.items FROM invoices i
         JOIN sync_queue q ON q.entity_type = 'order' AND q.entity_id = i.id
         WHERE q.operation = 'create' AND q.status IN ('pending', 'failed')",
        params![],
    )?;
    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT entity_id FROM sync_queue
             WHERE entity_type = 'product' AND status IN ('pending', 'failed')",
        )
        .map_err(|e| format!("prepare unsynced products: {e}"))?;
    let unsynced = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| format!("query unsynced products: {e}"))?;
    held.extend(unsynced.filter_map(|r| r.ok()?.parse::<i64>().ok()));

    if !held.is_empty() {
        debug!(held = held.len(), "stock reconciliation waiting for unsynced changes");
    }
    Ok(sold.difference(&held).copied().collect())
}

fn product_ids_of_invoices<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<BTreeSet<i64>, String> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| format!("prepare reconcile candidates: {e}"))?;
    let rows = stmt
        .query_map(params, |row| row.get::<_, String>(0))
        .map_err(|e| format!("query reconcile candidates: {e}"))?;

    let mut ids = BTreeSet::new();
    for items in rows.filter_map(|r| r.ok()) {
        let parsed: Vec<Value> = serde_json::from_str(&items).unwrap_or_default();
        ids.extend(
            parsed
                .iter()
                .filter_map(|line| line.get("product_id").and_then(Value::as_i64))
                .filter(|id| *id > 0),
        );
    }
    Ok(ids)
}

// ---------------------------------------------------------------------------
// Background loop
// ---------------------------------------------------------------------------

async fn run_once(db: &DbState, client: &StoreClient) -> Result<usize, String> {
    let synced = run_sync_cycle(db, client).await?;
    if synced > 0 {
        info!("Sync cycle complete: {synced} items synced");
    }
    let candidates = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        reconcile_candidates(&conn)?
    };
    if !candidates.is_empty() {
        match reconcile_stock(db, client, &candidates).await {
            Ok(n) if n > 0 => info!(updated = n, "stock reconciliation applied"),
            Ok(_) => {}
            Err(e) => warn!("Stock reconciliation failed: {e}"),
        }
    }
    Ok(synced)
}

/// Start the background sync loop. Runs every `interval` until `cancel`
/// fires; skips cycles while the store credentials are missing.
pub fn start_sync_loop(
    db: Arc<DbState>,
    sync_state: Arc<SyncState>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    sync_state.is_running.store(true, Ordering::SeqCst);
    tokio::spawn(async move {
        info!("Sync loop started (interval: {}s)", interval.as_secs());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let Some(client) = storage::store_client() else {
                continue;
            };
            let result = run_once(&db, &client).await;
            if let Err(e) = &result {
                warn!("Sync cycle failed: {e}");
            }
            sync_state.record_cycle(&result);
        }
        sync_state.is_running.store(false, Ordering::SeqCst);
        info!("Sync loop stopped");
    })
}

/// Run one cycle now (the `/api/sync/force` route).
pub async fn force_sync(db: &DbState, sync_state: &SyncState, client: &StoreClient) -> Result<Value, String> {
    let result = run_once(db, client).await;
    sync_state.record_cycle(&result);
    let synced = result?;
    info!("Force sync complete: {synced} items synced");
    Ok(json!({ "success": true, "synced": synced }))
}

pub fn sync_status(db: &DbState, sync_state: &SyncState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let count = |status: &str| -> i64 {
        conn.query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE status = ?1",
            params![status],
            |row| row.get(0),
        )
        .unwrap_or(0)
    };
    let last_sync = sync_state.last_sync.lock().ok().and_then(|g| g.clone());
    let last_error = sync_state.last_error.lock().ok().and_then(|g| g.clone());
    let recent_failures: Vec<Value> = {
        let mut stmt = conn
            .prepare(
                "SELECT entity_type, entity_id, path, last_error FROM sync_queue
                 WHERE status = 'failed' ORDER BY updated_at DESC LIMIT 10",
            )
            .map_err(|e| format!("prepare failures: {e}"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(json!({
                    "entity_type": row.get::<_, String>(0)?,
                    "entity_id": row.get::<_, String>(1)?,
                    "path": row.get::<_, String>(2)?,
                    "last_error": row.get::<_, Option<String>>(3)?,
                }))
            })
            .map_err(|e| format!("query failures: {e}"))?;
        rows.filter_map(|r| r.ok()).collect()
    };
    Ok(json!({
        "pending": count("pending"),
        "failed": count("failed"),
        "synced": count("synced"),
        "last_sync": last_sync,
        "last_error": last_error,
        "is_running": sync_state.is_running.load(Ordering::SeqCst),
        "store_configured": storage::is_store_configured(),
        "recent_failures": recent_failures,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ProductKind, StockStatus};
    use crate::db;
    use axum::extract::Path;
    use axum::routing::{get, post, put};
    use axum::{Json, Router};

    fn product(id: i64, stock: i64) -> Product {
        Product {
            id,
            name: format!("P{id}"),
            sku: String::new(),
            barcode: None,
            kind: ProductKind::Simple,
            regular_price: 10.0,
            sale_price: None,
            stock_quantity: Some(stock),
            manage_stock: true,
            stock_status: StockStatus::Instock,
            categories: vec![],
            attributes: vec![],
            variations: vec![],
            images: vec![],
            description: String::new(),
            updated_at: None,
        }
    }

    async fn fake_store(app: Router) -> StoreClient {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        StoreClient::new(&format!("http://{addr}"), "ck".into(), "cs".into()).unwrap()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_delay_ms(0), 5_000);
        assert_eq!(backoff_delay_ms(1), 10_000);
        assert_eq!(backoff_delay_ms(3), 40_000);
        assert_eq!(backoff_delay_ms(6), 300_000);
        assert_eq!(backoff_delay_ms(60), 300_000);
    }

    #[test]
    fn test_enqueue_and_pending_order() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        let a = enqueue(&conn, "product", "1", Operation::Update, "patch", "products/1", &json!({})).unwrap();
        let b = enqueue(&conn, "product", "2", Operation::Delete, "DELETE", "products/2", &json!({})).unwrap();
        let items = pending(&conn, 10).unwrap();
        assert_eq!(items.iter().map(|i| i.id).collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(items[0].method, "PATCH");
        assert!(enqueue(&conn, "x", "1", Operation::Create, "POST", "../admin", &json!({})).is_err());
    }

    #[test]
    fn test_mark_failed_backoff_then_exhaust() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        enqueue(&conn, "order", "inv", Operation::Create, "POST", "orders", &json!({})).unwrap();
        let mut item = pending(&conn, 1).unwrap().remove(0);

        mark_failed(&conn, &item, "Store server error (HTTP 502)", false).unwrap();
        // Not due yet: backoff pushed next_retry_at into the future.
        assert!(pending(&conn, 10).unwrap().is_empty());

        item.retry_count = item.max_retries - 1;
        mark_failed(&conn, &item, "Store server error (HTTP 502)", false).unwrap();
        let status: String = conn
            .query_row("SELECT status FROM sync_queue WHERE id = ?1", [item.id], |r| r.get(0))
            .unwrap();
        assert_eq!(status, "failed");

        assert_eq!(retry_failed(&conn).unwrap(), 1);
        assert_eq!(pending(&conn, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_permanent_failure_fails_immediately() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        enqueue(&conn, "product", "5", Operation::Update, "PATCH", "products/5", &json!({})).unwrap();
        let item = pending(&conn, 1).unwrap().remove(0);
        mark_failed(&conn, &item, "Invalid ID. [woocommerce_rest_product_invalid_id] (HTTP 400)", true)
            .unwrap();
        assert_eq!(db::count_rows(&conn, "sync_queue"), 1);
        let failed: i64 = conn
            .query_row("SELECT COUNT(*) FROM sync_queue WHERE status = 'failed'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(failed, 1);
    }

    #[test]
    fn test_merge_variation_batch() {
        let mut p = product(1, 0);
        p.variations = vec![
            Variation {
                id: 0,
                sku: "draft".into(),
                regular_price: 1.0,
                sale_price: None,
                stock_quantity: None,
                manage_stock: false,
                attributes: vec![],
            },
            Variation {
                id: 7,
                sku: "old".into(),
                regular_price: 1.0,
                sale_price: None,
                stock_quantity: Some(1),
                manage_stock: true,
                attributes: vec![],
            },
            Variation {
                id: 8,
                sku: "gone".into(),
                regular_price: 1.0,
                sale_price: None,
                stock_quantity: None,
                manage_stock: false,
                attributes: vec![],
            },
        ];
        let response = json!({
            "create": [{ "id": 20, "sku": "new", "regular_price": "5" }],
            "update": [{ "id": 7, "sku": "renamed", "regular_price": "3" }],
            "delete": [{ "id": 8 }]
        });
        merge_variation_batch(&mut p, &response);
        let skus: Vec<&str> = p.variations.iter().map(|v| v.sku.as_str()).collect();
        assert_eq!(skus, vec!["renamed", "new"]);
    }

    #[tokio::test]
    async fn test_sync_cycle_replaces_draft_and_stores_remote_order() {
        async fn create_product(Json(body): Json<Value>) -> Json<Value> {
            assert!(body.get(VARIATIONS_DRAFT_KEY).is_none());
            Json(json!({ "id": 501, "name": body["name"], "type": "simple", "regular_price": "50.00" }))
        }
        async fn create_order() -> Json<Value> {
            Json(json!({ "id": 9001 }))
        }
        let client = fake_store(
            Router::new()
                .route("/wp-json/wc/v3/products", post(create_product))
                .route("/wp-json/wc/v3/orders", post(create_order)),
        )
        .await;

        let state = db::test_state();
        let draft = catalog::create_product(&state, product(0, 3)).unwrap();
        {
            let conn = state.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO invoices (id, number, seq, payment_status, created_at, updated_at)
                 VALUES ('inv-1', 'INV-000001', 1, 'cash_on_delivery', 'now', 'now')",
                [],
            )
            .unwrap();
            enqueue(&conn, "order", "inv-1", Operation::Create, "POST", "orders", &json!({})).unwrap();
        }

        let synced = run_sync_cycle(&state, &client).await.unwrap();
        assert_eq!(synced, 2);

        let conn = state.conn.lock().unwrap();
        assert!(catalog::get_cached(&conn, draft.id).unwrap().is_none());
        assert_eq!(catalog::get_cached(&conn, 501).unwrap().unwrap().regular_price, 50.0);
        let remote: Option<i64> = conn
            .query_row("SELECT remote_order_id FROM invoices WHERE id = 'inv-1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remote, Some(9001));
        assert!(pending(&conn, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_stops_cycle() {
        async fn broken() -> (axum::http::StatusCode, Json<Value>) {
            (
                axum::http::StatusCode::BAD_GATEWAY,
                Json(json!({ "message": "upstream down" })),
            )
        }
        let client = fake_store(Router::new().route("/wp-json/wc/v3/products/{id}", put(broken))).await;
        let state = db::test_state();
        {
            let conn = state.conn.lock().unwrap();
            enqueue(&conn, "product", "1", Operation::Update, "PUT", "products/1", &json!({})).unwrap();
            enqueue(&conn, "product", "2", Operation::Update, "PUT", "products/2", &json!({})).unwrap();
        }
        assert!(run_sync_cycle(&state, &client).await.is_err());
        let conn = state.conn.lock().unwrap();
        let retries: Vec<i64> = conn
            .prepare("SELECT retry_count FROM sync_queue ORDER BY id")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(retries, vec![1, 0]);
    }

    #[tokio::test]
    async fn test_reconcile_stock_overwrites_when_different() {
        async fn get_product(Path(id): Path<i64>) -> Json<Value> {
            Json(json!({ "id": id, "name": format!("P{id}"), "type": "simple",
                         "regular_price": "10", "manage_stock": true, "stock_quantity": 2 }))
        }
        let client = fake_store(Router::new().route("/wp-json/wc/v3/products/{id}", get(get_product))).await;
        let state = db::test_state();
        {
            let conn = state.conn.lock().unwrap();
            catalog::upsert_cached(&conn, &product(1, 5)).unwrap();
            catalog::upsert_cached(&conn, &product(2, 2)).unwrap();
        }
        let updated = reconcile_stock(&state, &client, &[1, 2]).await.unwrap();
        assert_eq!(updated, 1);
        let conn = state.conn.lock().unwrap();
        assert_eq!(catalog::get_cached(&conn, 1).unwrap().unwrap().stock_quantity, Some(2));
    }

    #[test]
    fn test_reconcile_candidates_window() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        let future = ts_after(ChronoDuration::minutes(1));
        let past = ts_after(ChronoDuration::minutes(-1));
        conn.execute(
            "INSERT INTO invoices (id, number, seq, items, payment_status, created_at, updated_at, reconcile_until)
             VALUES ('a', 'INV-000001', 1, '[{\"product_id\": 4}, {\"product_id\": 3}]', 'fully_paid', 'x', 'x', ?1),
                    ('b', 'INV-000002', 2, '[{\"product_id\": 9}]', 'fully_paid', 'x', 'x', ?2)",
            params![future, past],
        )
        .unwrap();
        assert_eq!(reconcile_candidates(&conn).unwrap(), vec![3, 4]);
        let cleared: Option<String> = conn
            .query_row("SELECT reconcile_until FROM invoices WHERE id = 'b'", [], |r| r.get(0))
            .unwrap();
        assert!(cleared.is_none());
    }

    #[test]
    fn test_reconcile_waits_for_unsynced_sale() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        let future = ts_after(ChronoDuration::minutes(5));
        conn.execute(
            "INSERT INTO invoices (id, number, seq, items, payment_status, created_at, updated_at, reconcile_until)
             VALUES ('a', 'INV-000001', 1, '[{\"product_id\": 7}]', 'fully_paid', 'x', 'x', ?1),
                    ('b', 'INV-000002', 2, '[{\"product_id\": 8}]', 'fully_paid', 'x', 'x', ?1)",
            params![future],
        )
        .unwrap();
        enqueue(&conn, "order", "a", Operation::Create, "POST", "orders", &json!({})).unwrap();
        enqueue(&conn, "product", "8", Operation::Update, "PUT", "products/8", &json!({})).unwrap();
        assert!(reconcile_candidates(&conn).unwrap().is_empty());

        // Backoff still counts as unsynced
        let items = pending(&conn, 10).unwrap();
        for item in &items {
            mark_failed(&conn, item, "store unreachable", false).unwrap();
        }
        assert!(reconcile_candidates(&conn).unwrap().is_empty());

        for item in &items {
            mark_synced(&conn, item.id).unwrap();
        }
        assert_eq!(reconcile_candidates(&conn).unwrap(), vec![7, 8]);
    }
}
