//! Local SQLite database layer for Dukkan POS.
//!
//! Replaces the browser IndexedDB/localStorage caches of the web client with
//! one WAL-mode SQLite file. Provides schema migrations, settings helpers,
//! and the shared connection state used by the HTTP handlers and the
//! background loops.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Database connection shared by one consumer (HTTP state, sync loop, ...).
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Schema version after every migration below has run.
const CURRENT_SCHEMA_VERSION: i32 = 5;

/// One schema step. `prepare` runs first inside the same transaction, for
/// changes SQLite cannot express with `IF NOT EXISTS`.
struct Migration {
    version: i32,
    label: &'static str,
    prepare: Option<fn(&Connection) -> Result<(), String>>,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        label: "settings, sync queue, catalog cache",
        prepare: None,
        sql: "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- sync_queue (server mutations waiting to be pushed)
        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL CHECK (operation IN ('create', 'update', 'delete')),
            method TEXT NOT NULL,
            path TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT 'null',
            idempotency_key TEXT UNIQUE NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'synced', 'failed')),
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 5,
            next_retry_at TEXT,
            last_error TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            synced_at TEXT
        );

        -- products (cached store catalog, full JSON document in data)
        CREATE TABLE IF NOT EXISTS products (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            sku TEXT,
            barcode TEXT,
            kind TEXT NOT NULL DEFAULT 'simple' CHECK (kind IN ('simple', 'variable')),
            stock_quantity INTEGER,
            data TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- categories
        CREATE TABLE IF NOT EXISTS categories (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            parent INTEGER NOT NULL DEFAULT 0,
            count INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_entity ON sync_queue(entity_type, entity_id);
        CREATE INDEX IF NOT EXISTS idx_products_sku ON products(sku);
        CREATE INDEX IF NOT EXISTS idx_products_barcode ON products(barcode);
        CREATE INDEX IF NOT EXISTS idx_local_settings_cat_key ON local_settings(setting_category, setting_key);
        ",
    },
    Migration {
        version: 2,
        label: "tabs and invoices",
        prepare: None,
        sql: "
        CREATE TABLE IF NOT EXISTS pos_tabs (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            cart TEXT NOT NULL DEFAULT '{}',
            is_active INTEGER NOT NULL DEFAULT 0,
            position INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS invoices (
            id TEXT PRIMARY KEY,
            number TEXT NOT NULL UNIQUE,
            seq INTEGER NOT NULL UNIQUE,
            tab_id TEXT,
            customer_id TEXT,
            items TEXT NOT NULL DEFAULT '[]',
            summary TEXT NOT NULL DEFAULT '{}',
            total REAL NOT NULL DEFAULT 0,
            amount_paid REAL NOT NULL DEFAULT 0,
            payment_status TEXT NOT NULL CHECK (payment_status IN
                ('cash_on_delivery', 'half_paid', 'fully_paid', 'fully_paid_no_delivery_fee')),
            delivery_status TEXT NOT NULL DEFAULT 'pending' CHECK (delivery_status IN
                ('pending', 'shipped', 'delivered', 'returned', 'cancelled')),
            remote_order_id INTEGER,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            notes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS invoice_payments (
            id TEXT PRIMARY KEY,
            invoice_id TEXT NOT NULL,
            amount REAL NOT NULL CHECK (amount > 0),
            method TEXT NOT NULL DEFAULT 'cash',
            note TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(invoice_id) REFERENCES invoices(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_invoices_created_at ON invoices(created_at);
        CREATE INDEX IF NOT EXISTS idx_invoices_delivery_status ON invoices(delivery_status);
        CREATE INDEX IF NOT EXISTS idx_invoice_payments_invoice ON invoice_payments(invoice_id);
        ",
    },
    Migration {
        version: 3,
        label: "employees, attendance, deductions",
        prepare: None,
        sql: "
        CREATE TABLE IF NOT EXISTS employees (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            phone TEXT NOT NULL,
            national_id TEXT NOT NULL UNIQUE,
            monthly_salary REAL NOT NULL DEFAULT 0 CHECK (monthly_salary >= 0),
            work_start TEXT NOT NULL DEFAULT '09:00',
            work_end TEXT NOT NULL DEFAULT '17:00',
            work_days TEXT NOT NULL DEFAULT '[0,1,2,3,4,6]',
            grace_minutes INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS attendance (
            id TEXT PRIMARY KEY,
            employee_id TEXT NOT NULL,
            work_date TEXT NOT NULL,
            check_in TEXT NOT NULL,
            check_out TEXT,
            late_minutes INTEGER NOT NULL DEFAULT 0,
            overtime_minutes INTEGER NOT NULL DEFAULT 0,
            worked_minutes INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(employee_id, work_date),
            FOREIGN KEY(employee_id) REFERENCES employees(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS deductions (
            id TEXT PRIMARY KEY,
            employee_id TEXT NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('advance', 'penalty', 'other')),
            amount REAL NOT NULL CHECK (amount > 0),
            deduction_date TEXT NOT NULL,
            note TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(employee_id) REFERENCES employees(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_attendance_employee_date ON attendance(employee_id, work_date);
        CREATE INDEX IF NOT EXISTS idx_deductions_employee_date ON deductions(employee_id, deduction_date);
        ",
    },
    Migration {
        version: 4,
        label: "customers",
        prepare: None,
        sql: "
        CREATE TABLE IF NOT EXISTS customers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            phone TEXT NOT NULL,
            second_phone TEXT,
            address TEXT NOT NULL DEFAULT '{}',
            shipping_cost REAL NOT NULL DEFAULT 0 CHECK (shipping_cost >= 0),
            notes TEXT,
            offline INTEGER NOT NULL DEFAULT 0,
            remote_id INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_customers_phone ON customers(phone);
        ",
    },
    // Products sold through an invoice are polled against the store for a
    // short window after the sale.
    Migration {
        version: 5,
        label: "stock reconciliation window",
        prepare: Some(add_reconcile_until),
        sql: "CREATE INDEX IF NOT EXISTS idx_invoices_reconcile_until ON invoices(reconcile_until);",
    },
];

/// Initialize the database at `{data_dir}/pos.db`.
///
/// A file that cannot be opened (corrupt header, wrong format) is removed
/// together with its WAL files and opened once more from scratch. The store
/// remains the source of truth for the catalog; local-only rows are lost.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join("pos.db");
    info!(path = %db_path.display(), "opening database");

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(error = %first_err, "database unusable, recreating it");
            for suffix in ["db", "db-wal", "db-shm"] {
                let _ = fs::remove_file(db_path.with_extension(suffix));
            }
            open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;
    info!(schema = CURRENT_SCHEMA_VERSION, "database ready");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;
    // A damaged header fails here rather than in the first handler
    conn.query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0))
        .map_err(|e| format!("sqlite header: {e}"))?;
    Ok(conn)
}

/// Apply every migration newer than the recorded version, each in its own
/// transaction.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current = schema_version(conn);
    if current >= CURRENT_SCHEMA_VERSION {
        debug!(schema = current, "database schema up to date");
        return Ok(());
    }
    info!(from = current, to = CURRENT_SCHEMA_VERSION, "migrating database");

    for step in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| format!("begin transaction: {e}"))?;
        if let Err(e) = apply_migration(&tx, step) {
            error!(version = step.version, error = %e, "migration failed");
            return Err(e);
        }
        tx.commit().map_err(|e| format!("commit: {e}"))?;
        info!(version = step.version, label = step.label, "migration applied");
    }
    Ok(())
}

fn apply_migration(conn: &Connection, step: &Migration) -> Result<(), String> {
    if let Some(prepare) = step.prepare {
        prepare(conn)?;
    }
    conn.execute_batch(step.sql)
        .map_err(|e| format!("migration v{}: {e}", step.version))?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        params![step.version],
    )
    .map_err(|e| format!("record migration v{}: {e}", step.version))?;
    Ok(())
}

/// Highest applied migration, 0 for a fresh file.
pub fn schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

fn add_reconcile_until(conn: &Connection) -> Result<(), String> {
    if column_exists(conn, "invoices", "reconcile_until")? {
        return Ok(());
    }
    conn.execute_batch("ALTER TABLE invoices ADD COLUMN reconcile_until TEXT;")
        .map_err(|e| format!("add reconcile_until: {e}"))
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, String> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(|e| format!("table_info {table}: {e}"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| format!("table_info query: {e}"))?;
    for name in names {
        if name.map_err(|e| format!("table_info row: {e}"))? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| format!("set_setting: {e}"))?;
    Ok(())
}

/// Delete all settings in a category.
pub fn delete_all_settings(conn: &Connection, category: &str) -> Result<(), String> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1",
        params![category],
    )
    .map_err(|e| format!("delete_all_settings: {e}"))?;
    Ok(())
}

/// Row count of a table, 0 when the query fails.
pub fn count_rows(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })
    .unwrap_or(0)
}

/// Fresh in-memory database with every migration applied.
#[cfg(test)]
pub fn test_state() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.pragma_update(None, "foreign_keys", "ON")
        .expect("enable foreign keys");
    run_migrations(&conn).expect("migrate in-memory db");
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn memory_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        conn
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_v1_to_latest() {
        let conn = memory_conn();
        run_migrations(&conn).expect("run_migrations should succeed");

        let tables = table_names(&conn);
        for expected in [
            "local_settings",
            "sync_queue",
            "products",
            "categories",
            "pos_tabs",
            "invoices",
            "invoice_payments",
            "employees",
            "attendance",
            "deductions",
            "customers",
        ] {
            assert!(
                tables.contains(&expected.to_string()),
                "missing table {expected}"
            );
        }
        assert_eq!(schema_version(&conn), CURRENT_SCHEMA_VERSION);
        assert!(column_exists(&conn, "invoices", "reconcile_until").unwrap());
    }

    #[test]
    fn test_migration_table_is_ordered() {
        let versions: Vec<i32> = MIGRATIONS.iter().map(|m| m.version).collect();
        let expected: Vec<i32> = (1..=CURRENT_SCHEMA_VERSION).collect();
        assert_eq!(versions, expected);
    }

    #[test]
    fn test_partial_schema_is_upgraded() {
        let conn = memory_conn();
        conn.execute_batch(
            "CREATE TABLE schema_version (version INTEGER PRIMARY KEY, applied_at TEXT);",
        )
        .unwrap();
        apply_migration(&conn, &MIGRATIONS[0]).unwrap();
        apply_migration(&conn, &MIGRATIONS[1]).unwrap();
        assert_eq!(schema_version(&conn), 2);

        run_migrations(&conn).unwrap();
        assert_eq!(schema_version(&conn), CURRENT_SCHEMA_VERSION);
        assert!(column_exists(&conn, "customers", "remote_id").unwrap());
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = memory_conn();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run");
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, CURRENT_SCHEMA_VERSION as i64);
    }

    #[test]
    fn test_wal_mode_on_file_db() {
        let dir = std::env::temp_dir().join(format!("dukkan_db_{}", uuid::Uuid::new_v4()));
        let state = init(&dir).expect("init file db");
        {
            let conn = state.conn.lock().unwrap();
            let mode: String = conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .unwrap();
            assert_eq!(mode.to_lowercase(), "wal");
        }
        drop(state);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_deductions_cascade_with_employee() {
        let conn = memory_conn();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO employees (id, name, phone, national_id, created_at, updated_at)
             VALUES ('e1', 'Ali', '01012345678', '29001011234567', datetime('now'), datetime('now'))",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO deductions (id, employee_id, kind, amount, deduction_date, created_at)
             VALUES ('d1', 'e1', 'advance', 100, '2026-01-05', datetime('now'))",
            [],
        )
        .unwrap();
        conn.execute("DELETE FROM employees WHERE id = 'e1'", [])
            .unwrap();
        assert_eq!(count_rows(&conn, "deductions"), 0);
    }

    #[test]
    fn test_sync_queue_idempotency_key_unique() {
        let conn = memory_conn();
        run_migrations(&conn).unwrap();
        let insert = "INSERT INTO sync_queue (entity_type, entity_id, operation, method, path, idempotency_key)
                      VALUES ('product', '1', 'update', 'PATCH', 'products/1', 'k1')";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }

    #[test]
    fn test_settings_crud() {
        let conn = memory_conn();
        run_migrations(&conn).expect("migrations");

        set_setting(&conn, "app", "currency", "EGP").expect("set");
        assert_eq!(get_setting(&conn, "app", "currency"), Some("EGP".to_string()));

        set_setting(&conn, "app", "currency", "USD").expect("update");
        assert_eq!(get_setting(&conn, "app", "currency"), Some("USD".to_string()));

        delete_all_settings(&conn, "app").expect("delete");
        assert!(get_setting(&conn, "app", "currency").is_none());
    }
}
