//! Diagnostics for Dukkan POS.
//!
//! - **About info**: version, build timestamp, git SHA, platform
//! - **System health**: schema version, sync backlog, cached row counts,
//!   credential presence
//! - **Log rotation**: keeps the newest daily log files

use crate::db::{self, DbState};
use crate::storage;
use rusqlite::{params, Connection};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::warn;

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Prefix of the daily rolling log files.
pub const LOG_FILE_PREFIX: &str = "dukkan";

const COUNTED_TABLES: &[&str] = &[
    "products",
    "categories",
    "customers",
    "employees",
    "invoices",
    "pos_tabs",
];

/// Returns version, build timestamp, git SHA, and platform info.
pub fn get_about_info() -> Value {
    json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

/// Snapshot for the `/api/health` route.
pub fn get_system_health(db: &DbState) -> Result<Value, String> {
    let (schema_version, sync_backlog, last_sync_times, recent_errors, counts) = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        let counts: Map<String, Value> = COUNTED_TABLES
            .iter()
            .map(|table| (table.to_string(), json!(db::count_rows(&conn, table))))
            .collect();
        (
            db::schema_version(&conn),
            get_sync_backlog(&conn),
            get_last_sync_times(&conn),
            get_recent_sync_errors(&conn, 20),
            counts,
        )
    };

    let db_size = fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0);

    Ok(json!({
        "status": "ok",
        "schemaVersion": schema_version,
        "syncBacklog": sync_backlog,
        "lastSyncTimes": last_sync_times,
        "recentSyncErrors": recent_errors,
        "counts": counts,
        "dbSizeBytes": db_size,
        "storeConfigured": storage::is_store_configured(),
        "bostaConfigured": storage::has_credential(storage::KEY_BOSTA_API_KEY),
    }))
}

/// Queue rows grouped as `{ entity_type: { status: count } }`.
fn get_sync_backlog(conn: &Connection) -> Value {
    let mut result = Map::new();
    if let Ok(mut stmt) = conn.prepare(
        "SELECT entity_type, status, COUNT(*) FROM sync_queue GROUP BY entity_type, status",
    ) {
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .ok();
        if let Some(rows) = rows {
            for (entity_type, status, count) in rows.flatten() {
                let entry = result.entry(entity_type).or_insert_with(|| json!({}));
                entry[&status] = json!(count);
            }
        }
    }
    Value::Object(result)
}

fn get_last_sync_times(conn: &Connection) -> Value {
    let mut result = json!({});
    if let Ok(mut stmt) = conn.prepare(
        "SELECT entity_type, MAX(synced_at) FROM sync_queue WHERE status = 'synced' GROUP BY entity_type",
    ) {
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })
            .ok();
        if let Some(rows) = rows {
            for (entity_type, ts) in rows.flatten() {
                result[entity_type] = json!(ts);
            }
        }
    }
    result
}

fn get_recent_sync_errors(conn: &Connection, limit: i64) -> Vec<Value> {
    let Ok(mut stmt) = conn.prepare(
        "SELECT id, entity_type, entity_id, method, path, last_error, retry_count, status, updated_at
         FROM sync_queue
         WHERE last_error IS NOT NULL
         ORDER BY updated_at DESC, id DESC
         LIMIT ?1",
    ) else {
        return Vec::new();
    };
    stmt.query_map(params![limit], |row| {
        Ok(json!({
            "id": row.get::<_, i64>(0)?,
            "entityType": row.get::<_, String>(1)?,
            "entityId": row.get::<_, String>(2)?,
            "method": row.get::<_, String>(3)?,
            "path": row.get::<_, String>(4)?,
            "error": row.get::<_, Option<String>>(5)?,
            "retryCount": row.get::<_, i64>(6)?,
            "status": row.get::<_, String>(7)?,
            "updatedAt": row.get::<_, Option<String>>(8)?,
        }))
    })
    .map(|rows| rows.flatten().collect())
    .unwrap_or_default()
}

/// Delete all but the newest [`MAX_LOG_FILES`] log files in `log_dir`.
/// Returns how many were removed; a missing directory removes nothing.
pub fn prune_old_logs(log_dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };
    let mut logs: Vec<(SystemTime, PathBuf)> = entries
        .flatten()
        .filter(|entry| {
            entry.file_name().to_string_lossy().starts_with(LOG_FILE_PREFIX)
                && entry.file_type().map(|t| t.is_file()).unwrap_or(false)
        })
        .map(|entry| {
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, entry.path())
        })
        .collect();

    // Newest first; the date suffix breaks ties on coarse mtimes
    logs.sort_unstable_by(|a, b| b.cmp(a));

    logs.iter()
        .skip(MAX_LOG_FILES)
        .filter(|(_, path)| match fs::remove_file(path) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not prune log file");
                false
            }
        })
        .count()
}
