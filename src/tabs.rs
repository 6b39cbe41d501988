//! Multi-tab carts at the cashier.
//!
//! Each tab is an independent cart with its own checkout options. Tabs live
//! in `pos_tabs` so an open sale survives a restart. At most
//! [`MAX_TABS`] tabs exist and exactly one is active at any time.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::DbState;
use crate::pricing::{self, CartLine, CheckoutInput, CheckoutSummary, LineKind};

pub const MAX_TABS: usize = 10;
const DEFAULT_TITLE_PREFIX: &str = "فاتورة";

/// Cart contents plus the till options of one tab.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TabCart {
    #[serde(flatten)]
    pub checkout: CheckoutInput,
    #[serde(default, alias = "customerId")]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosTab {
    pub id: String,
    pub title: String,
    pub cart: TabCart,
    pub is_active: bool,
    pub position: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl PosTab {
    pub fn summary(&self) -> Result<CheckoutSummary, String> {
        pricing::calculate(&self.cart.checkout)
    }

    pub fn is_empty(&self) -> bool {
        self.cart.checkout.lines.is_empty()
    }
}

/// Tab plus its live totals, as returned to the till.
#[derive(Debug, Clone, Serialize)]
pub struct TabView {
    #[serde(flatten)]
    pub tab: PosTab,
    pub summary: Option<CheckoutSummary>,
    pub summary_error: Option<String>,
}

impl From<PosTab> for TabView {
    fn from(tab: PosTab) -> Self {
        match tab.summary() {
            Ok(summary) => TabView {
                tab,
                summary: Some(summary),
                summary_error: None,
            },
            Err(e) => TabView {
                tab,
                summary: None,
                summary_error: Some(e),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

fn row_to_tab(row: &rusqlite::Row<'_>) -> rusqlite::Result<PosTab> {
    let cart: String = row.get(2)?;
    Ok(PosTab {
        id: row.get(0)?,
        title: row.get(1)?,
        cart: serde_json::from_str(&cart).unwrap_or_default(),
        is_active: row.get::<_, i64>(3)? != 0,
        position: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

const TAB_COLUMNS: &str = "id, title, cart, is_active, position, created_at, updated_at";

fn load_tabs(conn: &Connection) -> Result<Vec<PosTab>, String> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {TAB_COLUMNS} FROM pos_tabs ORDER BY position ASC, created_at ASC"
        ))
        .map_err(|e| format!("list tabs: {e}"))?;
    let rows = stmt
        .query_map([], row_to_tab)
        .map_err(|e| format!("list tabs: {e}"))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub(crate) fn load_tab(conn: &Connection, id: &str) -> Result<PosTab, String> {
    conn.query_row(
        &format!("SELECT {TAB_COLUMNS} FROM pos_tabs WHERE id = ?1"),
        params![id],
        row_to_tab,
    )
    .optional()
    .map_err(|e| format!("get tab: {e}"))?
    .ok_or(format!("Tab not found: {id}"))
}

fn save_cart(conn: &Connection, tab: &mut PosTab) -> Result<(), String> {
    tab.updated_at = Utc::now().to_rfc3339();
    let cart = serde_json::to_string(&tab.cart).map_err(|e| format!("serialize cart: {e}"))?;
    conn.execute(
        "UPDATE pos_tabs SET cart = ?1, updated_at = ?2 WHERE id = ?3",
        params![cart, tab.updated_at, tab.id],
    )
    .map_err(|e| format!("save cart: {e}"))?;
    Ok(())
}

/// Empty a tab's cart inside the caller's transaction (after checkout).
pub(crate) fn reset_cart(conn: &Connection, id: &str) -> Result<(), String> {
    let mut tab = load_tab(conn, id)?;
    tab.cart = TabCart::default();
    save_cart(conn, &mut tab)
}

fn set_active(conn: &Connection, id: &str) -> Result<(), String> {
    conn.execute("UPDATE pos_tabs SET is_active = (id = ?1)", params![id])
        .map_err(|e| format!("activate tab: {e}"))?;
    Ok(())
}

/// Lowest `N` not used by a default "فاتورة N" title.
fn next_default_title(tabs: &[PosTab]) -> String {
    let used: Vec<u32> = tabs
        .iter()
        .filter_map(|t| {
            t.title
                .strip_prefix(DEFAULT_TITLE_PREFIX)
                .and_then(|rest| rest.trim().parse::<u32>().ok())
        })
        .collect();
    let n = (1..).find(|n| !used.contains(n)).unwrap_or(1);
    format!("{DEFAULT_TITLE_PREFIX} {n}")
}

fn insert_tab(conn: &Connection, tabs: &[PosTab], title: Option<String>) -> Result<PosTab, String> {
    if tabs.len() >= MAX_TABS {
        return Err(format!("لا يمكن فتح أكثر من {MAX_TABS} فواتير في نفس الوقت"));
    }
    let title = title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| next_default_title(tabs));
    let now = Utc::now().to_rfc3339();
    let position = tabs.iter().map(|t| t.position).max().map_or(0, |p| p + 1);
    let tab = PosTab {
        id: Uuid::new_v4().to_string(),
        title,
        cart: TabCart::default(),
        is_active: true,
        position,
        created_at: now.clone(),
        updated_at: now,
    };
    conn.execute(
        "INSERT INTO pos_tabs (id, title, cart, is_active, position, created_at, updated_at)
         VALUES (?1, ?2, '{}', 0, ?3, ?4, ?5)",
        params![tab.id, tab.title, tab.position, tab.created_at, tab.updated_at],
    )
    .map_err(|e| format!("insert tab: {e}"))?;
    set_active(conn, &tab.id)?;
    Ok(tab)
}

// ---------------------------------------------------------------------------
// Tab operations
// ---------------------------------------------------------------------------

/// All tabs in display order. A first tab is opened when none exist.
pub fn list_tabs(db: &DbState) -> Result<Vec<PosTab>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let tabs = load_tabs(&conn)?;
    if tabs.is_empty() {
        insert_tab(&conn, &tabs, None)?;
        return load_tabs(&conn);
    }
    if !tabs.iter().any(|t| t.is_active) {
        set_active(&conn, &tabs[0].id)?;
        return load_tabs(&conn);
    }
    Ok(tabs)
}

pub fn get_tab(db: &DbState, id: &str) -> Result<PosTab, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    load_tab(&conn, id)
}

/// Open a new tab and make it active.
pub fn open_tab(db: &DbState, title: Option<String>) -> Result<PosTab, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let tabs = load_tabs(&conn)?;
    let tab = insert_tab(&conn, &tabs, title)?;
    info!(tab_id = %tab.id, title = %tab.title, "tab opened");
    Ok(tab)
}

pub fn rename_tab(db: &DbState, id: &str, title: &str) -> Result<PosTab, String> {
    let title = title.trim();
    if title.is_empty() {
        return Err("اسم الفاتورة مطلوب".into());
    }
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let n = conn
        .execute(
            "UPDATE pos_tabs SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, Utc::now().to_rfc3339(), id],
        )
        .map_err(|e| format!("rename tab: {e}"))?;
    if n == 0 {
        return Err(format!("Tab not found: {id}"));
    }
    load_tab(&conn, id)
}

pub fn activate_tab(db: &DbState, id: &str) -> Result<PosTab, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    load_tab(&conn, id)?;
    set_active(&conn, id)?;
    load_tab(&conn, id)
}

/// Close a tab. When the active tab closes its right neighbour (or the left
/// one, for the last tab) becomes active; closing the only tab leaves a
/// fresh empty one.
pub fn close_tab(db: &DbState, id: &str) -> Result<Vec<PosTab>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let tabs = load_tabs(&conn)?;
    let index = tabs
        .iter()
        .position(|t| t.id == id)
        .ok_or(format!("Tab not found: {id}"))?;
    let was_active = tabs[index].is_active;

    conn.execute("DELETE FROM pos_tabs WHERE id = ?1", params![id])
        .map_err(|e| format!("close tab: {e}"))?;

    let mut remaining = tabs;
    remaining.remove(index);
    if remaining.is_empty() {
        insert_tab(&conn, &remaining, None)?;
    } else if was_active {
        let neighbour = remaining.get(index).or_else(|| remaining.last());
        if let Some(next) = neighbour {
            set_active(&conn, &next.id)?;
        }
    }
    info!(tab_id = %id, "tab closed");
    load_tabs(&conn)
}

// ---------------------------------------------------------------------------
// Cart operations
// ---------------------------------------------------------------------------

fn with_tab<F>(db: &DbState, id: &str, edit: F) -> Result<PosTab, String>
where
    F: FnOnce(&mut TabCart) -> Result<(), String>,
{
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut tab = load_tab(&conn, id)?;
    edit(&mut tab.cart)?;
    // Only carts that still price are stored
    tab.summary()?;
    save_cart(&conn, &mut tab)?;
    Ok(tab)
}

fn validate_line(line: &CartLine) -> Result<(), String> {
    if line.name.trim().is_empty() {
        return Err("اسم الصنف مطلوب".into());
    }
    if !line.unit_price.is_finite() || line.unit_price < 0.0 {
        return Err("السعر لا يمكن أن يكون سالبًا".into());
    }
    if line.quantity == 0 {
        return Err("الكمية يجب أن تكون 1 على الأقل".into());
    }
    line.check_bounds()?;
    if line.kind == LineKind::Product && line.product_id.is_none() {
        return Err("Product lines need a product_id".into());
    }
    Ok(())
}

/// Add a line; an existing line for the same product/variation absorbs the
/// quantity instead.
pub fn add_line(db: &DbState, tab_id: &str, line: CartLine) -> Result<PosTab, String> {
    validate_line(&line)?;
    let tab = with_tab(db, tab_id, |cart| {
        match cart.checkout.lines.iter_mut().find(|l| l.same_item(&line)) {
            Some(existing) => {
                existing.quantity = existing.quantity.saturating_add(line.quantity);
                existing.unit_price = line.unit_price;
            }
            None => cart.checkout.lines.push(line),
        }
        Ok(())
    })?;
    debug!(tab_id, lines = tab.cart.checkout.lines.len(), "cart line added");
    Ok(tab)
}

/// Set the quantity of line `index`; zero removes the line.
pub fn set_quantity(db: &DbState, tab_id: &str, index: usize, quantity: u32) -> Result<PosTab, String> {
    with_tab(db, tab_id, |cart| {
        if index >= cart.checkout.lines.len() {
            return Err(format!("Cart line not found: {index}"));
        }
        if quantity == 0 {
            cart.checkout.lines.remove(index);
        } else {
            cart.checkout.lines[index].quantity = quantity;
        }
        Ok(())
    })
}

pub fn remove_line(db: &DbState, tab_id: &str, index: usize) -> Result<PosTab, String> {
    set_quantity(db, tab_id, index, 0)
}

/// Empty the cart and reset its checkout options.
pub fn clear_cart(db: &DbState, tab_id: &str) -> Result<PosTab, String> {
    with_tab(db, tab_id, |cart| {
        *cart = TabCart::default();
        Ok(())
    })
}

/// Keys of [`TabCart`] the till may set directly.
const OPTION_KEYS: &[&str] = &[
    "discount",
    "discount_scope",
    "extra_fee",
    "delivery_fee",
    "payment_status",
    "prepaid_amount",
    "customer_id",
    "notes",
];

fn canonical_key(key: &str) -> &str {
    match key {
        "discountScope" => "discount_scope",
        "extraFee" => "extra_fee",
        "deliveryFee" => "delivery_fee",
        "paymentStatus" => "payment_status",
        "prepaidAmount" => "prepaid_amount",
        "customerId" => "customer_id",
        other => other,
    }
}

/// Apply checkout options (discount, fees, payment status, customer).
/// Keys absent from `options` keep their value; `null` clears optional ones.
/// Rejected when the resulting cart would not price.
pub fn set_checkout_options(db: &DbState, tab_id: &str, options: &Value) -> Result<PosTab, String> {
    let obj = options.as_object().ok_or("Options must be a JSON object")?;
    with_tab(db, tab_id, |cart| {
        let mut merged = serde_json::to_value(&*cart).map_err(|e| e.to_string())?;
        for (key, value) in obj {
            let key = canonical_key(key);
            if OPTION_KEYS.contains(&key) {
                merged[key] = if key == "delivery_fee" && value.is_null() {
                    Value::from(0.0)
                } else {
                    value.clone()
                };
            }
        }
        let updated: TabCart =
            serde_json::from_value(merged).map_err(|e| format!("Invalid checkout options: {e}"))?;
        pricing::calculate(&updated.checkout)?;
        *cart = updated;
        Ok(())
    })
}
