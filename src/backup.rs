//! Data backup and restore.
//!
//! A backup is a zip with `manifest.json` plus one `{table}.json` per local
//! store. The manifest carries row counts and an md5 of every table file so a
//! damaged archive is refused before anything is replaced. With compression
//! enabled the zip is wrapped in zstd (`.zip.zst`).

use chrono::Utc;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read as _, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::db::{self, DbState};
use crate::{catalog, customers, invoices, settings};

pub const FORMAT_VERSION: u32 = 1;
const MANIFEST: &str = "manifest.json";
const FILE_PREFIX: &str = "dukkan-backup-";
const ZSTD_LEVEL: i32 = 3;
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
const AUTO_BACKUP_CHECK: Duration = Duration::from_secs(10 * 60);

/// Stores in insert order (parents before children).
const TABLES: &[&str] = &[
    "local_settings",
    "categories",
    "products",
    "customers",
    "employees",
    "attendance",
    "deductions",
    "pos_tabs",
    "invoices",
    "invoice_payments",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableEntry {
    pub rows: usize,
    pub md5: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub app_version: String,
    pub schema_version: i32,
    pub created_at: String,
    pub tables: BTreeMap<String, TableEntry>,
}

/// Store calls queued again after a restore, per entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Requeued {
    pub customers: usize,
    pub products: usize,
    pub orders: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    #[serde(flatten)]
    pub manifest: Manifest,
    pub requeued: Requeued,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub path: String,
    pub size_bytes: u64,
    pub compressed: bool,
    pub manifest: Manifest,
}

// ---------------------------------------------------------------------------
// Table dump / load
// ---------------------------------------------------------------------------

fn sql_to_json(value: ValueRef<'_>) -> Value {
    use base64::Engine as _;
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(base64::engine::general_purpose::STANDARD.encode(b)),
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn dump_table(conn: &Connection, table: &str) -> Result<Vec<Map<String, Value>>, String> {
    let mut stmt = conn
        .prepare(&format!("SELECT * FROM {table}"))
        .map_err(|e| format!("dump {table}: {e}"))?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt.query([]).map_err(|e| format!("dump {table}: {e}"))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(|e| format!("dump {table}: {e}"))? {
        let mut record = Map::new();
        for (i, column) in columns.iter().enumerate() {
            let value = row.get_ref(i).map_err(|e| format!("dump {table}: {e}"))?;
            record.insert(column.clone(), sql_to_json(value));
        }
        out.push(record);
    }
    Ok(out)
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, String> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(|e| format!("table info {table}: {e}"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| format!("table info {table}: {e}"))?;
    Ok(names.filter_map(|r| r.ok()).collect())
}

/// Insert dumped rows, keeping only columns the current schema knows.
fn load_table(conn: &Connection, table: &str, rows: &[Map<String, Value>]) -> Result<(), String> {
    let known = table_columns(conn, table)?;
    for row in rows {
        let columns: Vec<&String> = row.keys().filter(|k| known.contains(k)).collect();
        if columns.is_empty() {
            continue;
        }
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            columns.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(", "),
            placeholders.join(", ")
        );
        let values: Vec<SqlValue> = columns.iter().map(|c| json_to_sql(&row[c.as_str()])).collect();
        conn.execute(&sql, rusqlite::params_from_iter(values.iter()))
            .map_err(|e| format!("restore {table}: {e}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

fn build_archive(conn: &Connection) -> Result<(Vec<u8>, Manifest), String> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    let mut tables = BTreeMap::new();
    for table in TABLES {
        let rows = dump_table(conn, table)?;
        let body = serde_json::to_vec(&rows).map_err(|e| format!("serialize {table}: {e}"))?;
        tables.insert(
            table.to_string(),
            TableEntry {
                rows: rows.len(),
                md5: format!("{:x}", md5::compute(&body)),
            },
        );
        zip.start_file(format!("{table}.json"), options)
            .map_err(|e| e.to_string())?;
        zip.write_all(&body).map_err(|e| e.to_string())?;
    }

    let manifest = Manifest {
        format_version: FORMAT_VERSION,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        schema_version: db::schema_version(conn),
        created_at: Utc::now().to_rfc3339(),
        tables,
    };
    zip.start_file(MANIFEST, options).map_err(|e| e.to_string())?;
    let manifest_body = serde_json::to_vec_pretty(&manifest).map_err(|e| e.to_string())?;
    zip.write_all(&manifest_body).map_err(|e| e.to_string())?;

    let cursor = zip.finish().map_err(|e| e.to_string())?;
    Ok((cursor.into_inner(), manifest))
}

/// Write a backup of every store into `dir`.
pub fn export_backup(db: &DbState, dir: &Path, compress: bool) -> Result<BackupInfo, String> {
    fs::create_dir_all(dir).map_err(|e| format!("Failed to create backup dir: {e}"))?;
    let (archive, manifest) = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        build_archive(&conn)?
    };

    let stamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");
    let (name, bytes) = if compress {
        let packed = zstd::encode_all(archive.as_slice(), ZSTD_LEVEL)
            .map_err(|e| format!("compress backup: {e}"))?;
        (format!("{FILE_PREFIX}{stamp}.zip.zst"), packed)
    } else {
        (format!("{FILE_PREFIX}{stamp}.zip"), archive)
    };
    let path = dir.join(name);
    fs::write(&path, &bytes).map_err(|e| format!("Failed to write backup: {e}"))?;

    info!(path = %path.display(), bytes = bytes.len(), compress, "backup written");
    Ok(BackupInfo {
        path: path.to_string_lossy().to_string(),
        size_bytes: bytes.len() as u64,
        compressed: compress,
        manifest,
    })
}

// ---------------------------------------------------------------------------
// Restore
// ---------------------------------------------------------------------------

fn read_entry(archive: &mut zip::ZipArchive<Cursor<Vec<u8>>>, name: &str) -> Result<Vec<u8>, String> {
    let mut file = archive
        .by_name(name)
        .map_err(|_| format!("Backup is missing {name}"))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .map_err(|e| format!("read {name}: {e}"))?;
    Ok(buf)
}

/// Replace every store with the content of a backup. Both `.zip` and
/// `.zip.zst` are accepted; nothing changes unless the whole archive checks out.
///
/// The sync queue is not part of a backup. Restored drafts, offline
/// customers and unsynced invoices get their store calls queued again.
pub fn restore_backup(db: &DbState, path: &Path) -> Result<RestoreReport, String> {
    let raw = fs::read(path).map_err(|e| format!("Failed to read backup: {e}"))?;
    let bytes = if raw.starts_with(&ZSTD_MAGIC) {
        zstd::decode_all(raw.as_slice()).map_err(|e| format!("decompress backup: {e}"))?
    } else {
        raw
    };
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| format!("Not a backup archive: {e}"))?;

    let manifest: Manifest = serde_json::from_slice(&read_entry(&mut archive, MANIFEST)?)
        .map_err(|e| format!("Invalid backup manifest: {e}"))?;
    if manifest.format_version != FORMAT_VERSION {
        return Err(format!(
            "Unsupported backup format version {} (expected {FORMAT_VERSION})",
            manifest.format_version
        ));
    }

    let mut contents: Vec<(&str, Vec<Map<String, Value>>)> = Vec::new();
    for table in TABLES {
        let Some(entry) = manifest.tables.get(*table) else {
            warn!(table, "table missing from backup, leaving it empty");
            contents.push((*table, Vec::new()));
            continue;
        };
        let body = read_entry(&mut archive, &format!("{table}.json"))?;
        if format!("{:x}", md5::compute(&body)) != entry.md5 {
            return Err(format!("Backup checksum mismatch for {table}"));
        }
        let rows: Vec<Map<String, Value>> =
            serde_json::from_slice(&body).map_err(|e| format!("Invalid {table} data: {e}"))?;
        contents.push((*table, rows));
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;
    let result = (|| -> Result<Requeued, String> {
        for table in TABLES.iter().rev() {
            conn.execute(&format!("DELETE FROM {table}"), [])
                .map_err(|e| format!("clear {table}: {e}"))?;
        }
        // Queued store calls refer to the replaced data.
        conn.execute("DELETE FROM sync_queue", [])
            .map_err(|e| format!("clear sync queue: {e}"))?;
        for (table, rows) in &contents {
            load_table(&conn, table, rows)?;
        }
        Ok(Requeued {
            customers: customers::requeue_offline(&conn)?,
            products: catalog::requeue_drafts(&conn)?,
            orders: invoices::requeue_unsynced(&conn)?,
        })
    })();
    let requeued = match result {
        Ok(requeued) => {
            conn.execute_batch("COMMIT").map_err(|e| format!("commit: {e}"))?;
            requeued
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    };

    info!(
        path = %path.display(),
        created_at = %manifest.created_at,
        customers = requeued.customers,
        products = requeued.products,
        orders = requeued.orders,
        "backup restored"
    );
    Ok(RestoreReport { manifest, requeued })
}

// ---------------------------------------------------------------------------
// Housekeeping
// ---------------------------------------------------------------------------

fn backup_files(dir: &Path) -> Vec<(PathBuf, SystemTime)> {
    let mut files: Vec<(PathBuf, SystemTime)> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.path().is_file())
                .filter(|e| {
                    e.file_name()
                        .to_str()
                        .is_some_and(|n| n.starts_with(FILE_PREFIX))
                })
                .map(|e| {
                    let modified = e
                        .metadata()
                        .ok()
                        .and_then(|m| m.modified().ok())
                        .unwrap_or(std::time::UNIX_EPOCH);
                    (e.path(), modified)
                })
                .collect()
        })
        .unwrap_or_default();
    // Newest first; names carry the timestamp, so ties sort by name.
    files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    files
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupFile {
    pub name: String,
    pub size_bytes: u64,
    pub compressed: bool,
}

pub fn list_backups(dir: &Path) -> Vec<BackupFile> {
    backup_files(dir)
        .into_iter()
        .map(|(path, _)| BackupFile {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            size_bytes: fs::metadata(&path).map(|m| m.len()).unwrap_or(0),
            compressed: path.extension().is_some_and(|e| e == "zst"),
        })
        .collect()
}

/// Delete all but the newest `keep_last` backups. Returns how many went.
pub fn prune_backups(dir: &Path, keep_last: usize) -> usize {
    let mut removed = 0;
    for (path, _) in backup_files(dir).iter().skip(keep_last.max(1)) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove old backup"),
        }
    }
    removed
}

/// Backup directory from settings, `{data_dir}/backups` by default.
pub fn backup_dir(settings: &settings::BackupSettings, data_dir: &Path) -> PathBuf {
    settings
        .directory
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("backups"))
}

fn backup_due(dir: &Path, interval_hours: u32) -> bool {
    let interval = Duration::from_secs(u64::from(interval_hours) * 3600);
    match backup_files(dir).first() {
        None => true,
        Some((_, modified)) => modified.elapsed().map(|age| age >= interval).unwrap_or(true),
    }
}

/// Periodic backups while `backup.auto_backup` is on. Settings are re-read on
/// every check so changes apply without a restart.
pub fn start_auto_backup_loop(
    db: Arc<DbState>,
    data_dir: PathBuf,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("Auto-backup loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(AUTO_BACKUP_CHECK) => {}
            }
            let cfg = match settings::get_settings(&db) {
                Ok(s) => s.backup,
                Err(e) => {
                    warn!("Auto-backup could not read settings: {e}");
                    continue;
                }
            };
            let dir = backup_dir(&cfg, &data_dir);
            if !cfg.auto_backup || !backup_due(&dir, cfg.interval_hours) {
                continue;
            }
            let db = db.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                let info = export_backup(&db, &dir, cfg.compress)?;
                let pruned = prune_backups(&dir, cfg.keep_last);
                Ok::<_, String>((info, pruned))
            })
            .await;
            match outcome {
                Ok(Ok((info, pruned))) => info!(path = %info.path, pruned, "auto-backup complete"),
                Ok(Err(e)) => warn!("Auto-backup failed: {e}"),
                Err(e) => warn!("Auto-backup task panicked: {e}"),
            }
        }
        info!("Auto-backup loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::employees;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dukkan_{tag}_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn seed(state: &DbState) {
        let conn = state.conn.lock().unwrap();
        catalog::upsert_cached(&conn, &catalog::tests::simple(1, "كوب", 25.0, Some(4))).unwrap();
        db::set_setting(&conn, "app", "settings", r#"{"store":{"name":"محل"}}"#).unwrap();
        conn.execute(
            "INSERT INTO invoices (id, number, seq, payment_status, created_at, updated_at)
             VALUES ('inv-1', 'INV-000001', 1, 'fully_paid', 'now', 'now')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO invoice_payments (id, invoice_id, amount, method, created_at)
             VALUES ('pay-1', 'inv-1', 25.5, 'cash', 'now')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_export_then_restore_replaces_stores() {
        for compress in [false, true] {
            let dir = temp_dir("backup");
            let source = db::test_state();
            seed(&source);
            let info = export_backup(&source, &dir, compress).unwrap();
            assert_eq!(info.path.ends_with(".zst"), compress);
            assert_eq!(info.manifest.tables["products"].rows, 1);
            assert_eq!(info.manifest.tables["invoice_payments"].rows, 1);

            let target = db::test_state();
            {
                let conn = target.conn.lock().unwrap();
                catalog::upsert_cached(&conn, &catalog::tests::simple(9, "زائد", 1.0, None)).unwrap();
            }
            restore_backup(&target, Path::new(&info.path)).unwrap();

            let conn = target.conn.lock().unwrap();
            let ids: Vec<i64> = catalog::list_cached(&conn).unwrap().iter().map(|p| p.id).collect();
            assert_eq!(ids, vec![1]);
            let amount: f64 = conn
                .query_row("SELECT amount FROM invoice_payments WHERE id = 'pay-1'", [], |r| r.get(0))
                .unwrap();
            assert_eq!(amount, 25.5);
            assert_eq!(settings::load(&conn).store.name, "محل");
            let _ = fs::remove_dir_all(&dir);
        }
    }

    #[test]
    fn test_restore_queues_unsynced_work_again() {
        let dir = temp_dir("requeue");
        let source = db::test_state();
        let first = catalog::create_product(&source, catalog::tests::simple(0, "كوب", 25.0, Some(4))).unwrap();
        let second = catalog::create_product(&source, catalog::tests::simple(0, "طبق", 40.0, Some(2))).unwrap();
        let buyer = customers::save_new_customer(
            &source,
            customers::tests::customer("منى", "01012345678"),
            true,
        )
        .unwrap();
        {
            let conn = source.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO invoices (id, number, seq, customer_id, payment_status, sync_status,
                                       remote_order_id, created_at, updated_at)
                 VALUES ('inv-1', 'INV-000001', 1, ?1, 'cash_on_delivery', 'pending', NULL, 'now', 'now'),
                        ('inv-2', 'INV-000002', 2, NULL, 'fully_paid', 'synced', 900, 'now', 'now'),
                        ('inv-3', 'INV-000003', 3, NULL, 'fully_paid', 'pending', 901, 'now', 'now')",
                rusqlite::params![buyer.id],
            )
            .unwrap();
        }
        let info = export_backup(&source, &dir, false).unwrap();

        let target = db::test_state();
        let report = restore_backup(&target, Path::new(&info.path)).unwrap();
        assert_eq!(report.requeued, Requeued { customers: 1, products: 2, orders: 2 });

        let conn = target.conn.lock().unwrap();
        let queued: Vec<(String, String, String)> = crate::sync::pending(&conn, 10)
            .unwrap()
            .into_iter()
            .map(|item| (item.entity_id, item.method, item.path))
            .collect();
        let expected = vec![
            (buyer.id.clone(), "POST".to_string(), "customers".to_string()),
            (first.id.to_string(), "POST".to_string(), "products".to_string()),
            (second.id.to_string(), "POST".to_string(), "products".to_string()),
            ("inv-1".to_string(), "POST".to_string(), "orders".to_string()),
            ("inv-3".to_string(), "PUT".to_string(), "orders/901".to_string()),
        ];
        assert_eq!(queued, expected);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_restore_rejects_tampered_archive() {
        let dir = temp_dir("tamper");
        let source = db::test_state();
        seed(&source);
        let good = export_backup(&source, &dir, false).unwrap();

        // Rebuild the archive with a modified products file.
        let mut archive = zip::ZipArchive::new(fs::File::open(&good.path).unwrap()).unwrap();
        let bad_path = dir.join("dukkan-backup-bad.zip");
        let mut out = zip::ZipWriter::new(fs::File::create(&bad_path).unwrap());
        let options = zip::write::SimpleFileOptions::default();
        for i in 0..archive.len() {
            let mut file = archive.by_index(i).unwrap();
            let name = file.name().to_string();
            let mut body = Vec::new();
            file.read_to_end(&mut body).unwrap();
            if name == "products.json" {
                body = b"[]".to_vec();
            }
            out.start_file(name, options).unwrap();
            out.write_all(&body).unwrap();
        }
        out.finish().unwrap();

        let target = db::test_state();
        let employee = employees::create_employee(
            &target,
            serde_json::from_value(serde_json::json!({
                "name": "سارة", "phone": "01012345678", "national_id": "29901011234567"
            }))
            .unwrap(),
        )
        .unwrap();
        let err = restore_backup(&target, &bad_path).unwrap_err();
        assert!(err.contains("checksum"));
        // nothing replaced
        assert!(employees::get_employee(&target, &employee.id).is_ok());
        assert!(restore_backup(&target, &dir.join("missing.zip")).is_err());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = temp_dir("prune");
        let state = db::test_state();
        for _ in 0..4 {
            export_backup(&state, &dir, false).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        fs::write(dir.join("notes.txt"), "keep").unwrap();
        assert_eq!(prune_backups(&dir, 2), 2);
        assert_eq!(list_backups(&dir).len(), 2);
        assert!(dir.join("notes.txt").exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_backup_dir_and_due() {
        let data = PathBuf::from("/var/lib/dukkan");
        let mut cfg = settings::BackupSettings::default();
        assert_eq!(backup_dir(&cfg, &data), data.join("backups"));
        cfg.directory = Some("/mnt/usb".into());
        assert_eq!(backup_dir(&cfg, &data), PathBuf::from("/mnt/usb"));

        let dir = temp_dir("due");
        assert!(backup_due(&dir, 24));
        export_backup(&db::test_state(), &dir, true).unwrap();
        assert!(!backup_due(&dir, 24));
        let _ = fs::remove_dir_all(&dir);
    }
}
