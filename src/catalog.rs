//! Product catalog: simple and variable products, variations, categories.
//!
//! The store catalog is cached in SQLite (`products`, `categories`) so the
//! cashier can search and sell while offline. Mutations are optimistic: the
//! cache is updated at once and a `sync_queue` row carries the store call.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashSet};
use tracing::{info, warn};

use crate::api::StoreClient;
use crate::db::DbState;
use crate::pricing;
use crate::sync;
use crate::{value_bool, value_f64, value_i64, value_str};

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductKind {
    #[default]
    Simple,
    Variable,
}

impl ProductKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductKind::Simple => "simple",
            ProductKind::Variable => "variable",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StockStatus {
    #[default]
    Instock,
    Outofstock,
    Onbackorder,
}

impl StockStatus {
    fn parse(raw: &str) -> Self {
        match raw {
            "outofstock" => StockStatus::Outofstock,
            "onbackorder" => StockStatus::Onbackorder,
            _ => StockStatus::Instock,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            StockStatus::Instock => "instock",
            StockStatus::Outofstock => "outofstock",
            StockStatus::Onbackorder => "onbackorder",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRef {
    pub id: i64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductAttribute {
    pub name: String,
    #[serde(default)]
    pub options: Vec<String>,
    /// Used to build variations.
    #[serde(default)]
    pub variation: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariationAttribute {
    pub name: String,
    pub option: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variation {
    /// Store id, 0 until the variation exists on the store.
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub sku: String,
    #[serde(default)]
    pub regular_price: f64,
    #[serde(default)]
    pub sale_price: Option<f64>,
    #[serde(default)]
    pub stock_quantity: Option<i64>,
    #[serde(default)]
    pub manage_stock: bool,
    #[serde(default)]
    pub attributes: Vec<VariationAttribute>,
}

impl Variation {
    pub fn price(&self) -> f64 {
        effective_price(self.regular_price, self.sale_price)
    }

    /// Option values joined for labels ("أحمر / XL").
    pub fn label(&self) -> String {
        self.attributes
            .iter()
            .map(|a| a.option.as_str())
            .collect::<Vec<_>>()
            .join(" / ")
    }

    fn option_key(&self) -> BTreeSet<VariationAttribute> {
        self.attributes
            .iter()
            .map(|a| VariationAttribute {
                name: a.name.trim().to_lowercase(),
                option: a.option.trim().to_lowercase(),
            })
            .collect()
    }

    pub fn in_stock(&self) -> bool {
        !self.manage_stock || self.stock_quantity.unwrap_or(0) > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub sku: String,
    #[serde(default)]
    pub barcode: Option<String>,
    #[serde(default)]
    pub kind: ProductKind,
    #[serde(default)]
    pub regular_price: f64,
    #[serde(default)]
    pub sale_price: Option<f64>,
    #[serde(default)]
    pub stock_quantity: Option<i64>,
    #[serde(default)]
    pub manage_stock: bool,
    #[serde(default)]
    pub stock_status: StockStatus,
    #[serde(default)]
    pub categories: Vec<CategoryRef>,
    #[serde(default)]
    pub attributes: Vec<ProductAttribute>,
    #[serde(default)]
    pub variations: Vec<Variation>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl Product {
    pub fn price(&self) -> f64 {
        effective_price(self.regular_price, self.sale_price)
    }

    pub fn is_draft(&self) -> bool {
        self.id < 0
    }

    pub fn variation(&self, variation_id: i64) -> Option<&Variation> {
        self.variations.iter().find(|v| v.id == variation_id)
    }

    /// Total sellable units, `None` when stock is not tracked.
    pub fn available_stock(&self) -> Option<i64> {
        match self.kind {
            ProductKind::Simple => self.manage_stock.then(|| self.stock_quantity.unwrap_or(0)),
            ProductKind::Variable => {
                let tracked: Vec<i64> = self
                    .variations
                    .iter()
                    .filter(|v| v.manage_stock)
                    .map(|v| v.stock_quantity.unwrap_or(0).max(0))
                    .collect();
                if tracked.is_empty() {
                    None
                } else {
                    Some(tracked.iter().sum())
                }
            }
        }
    }

    pub fn in_stock(&self) -> bool {
        match self.kind {
            ProductKind::Simple => {
                if self.manage_stock {
                    self.stock_quantity.unwrap_or(0) > 0
                } else {
                    self.stock_status != StockStatus::Outofstock
                }
            }
            ProductKind::Variable => {
                if self.variations.is_empty() {
                    self.stock_status != StockStatus::Outofstock
                } else {
                    self.variations.iter().any(Variation::in_stock)
                }
            }
        }
    }

    pub(crate) fn refresh_stock_status(&mut self) {
        let in_stock = self.in_stock();
        if self.stock_status != StockStatus::Onbackorder || in_stock {
            self.stock_status = if in_stock {
                StockStatus::Instock
            } else {
                StockStatus::Outofstock
            };
        }
    }
}

/// Sale price when set, positive and below the regular price.
pub fn effective_price(regular: f64, sale: Option<f64>) -> f64 {
    match sale {
        Some(s) if s > 0.0 && s < regular => s,
        _ => regular,
    }
}

// ---------------------------------------------------------------------------
// Store (WooCommerce) mapping
// ---------------------------------------------------------------------------

/// Store prices arrive as strings ("120.00", "").
fn price_field(v: &Value, key: &str) -> Option<f64> {
    match v.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn barcode_from_store(v: &Value) -> Option<String> {
    value_str(v, &["global_unique_id", "barcode"]).or_else(|| {
        v.get("meta_data")
            .and_then(Value::as_array)
            .and_then(|meta| {
                meta.iter().find(|m| {
                    matches!(
                        m.get("key").and_then(Value::as_str),
                        Some("_barcode" | "barcode" | "_ean")
                    )
                })
            })
            .and_then(|m| m.get("value"))
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

impl Variation {
    pub fn from_store(v: &Value) -> Self {
        let attributes = v
            .get("attributes")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|a| {
                        Some(VariationAttribute {
                            name: value_str(a, &["name"])?,
                            option: value_str(a, &["option"])?,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Variation {
            id: value_i64(v, &["id"]).unwrap_or(0),
            sku: value_str(v, &["sku"]).unwrap_or_default(),
            regular_price: price_field(v, "regular_price")
                .or_else(|| price_field(v, "price"))
                .unwrap_or(0.0),
            sale_price: price_field(v, "sale_price"),
            stock_quantity: value_i64(v, &["stock_quantity"]),
            manage_stock: value_bool(v, &["manage_stock"]).unwrap_or(false),
            attributes,
        }
    }

    pub fn to_store_payload(&self) -> Value {
        json!({
            "sku": self.sku,
            "regular_price": format_price(self.regular_price),
            "sale_price": self.sale_price.map(format_price).unwrap_or_default(),
            "manage_stock": self.manage_stock,
            "stock_quantity": self.stock_quantity,
            "attributes": self.attributes.iter().map(|a| json!({
                "name": a.name,
                "option": a.option,
            })).collect::<Vec<_>>(),
        })
    }
}

impl Product {
    /// Map a store product. Variations arrive separately (the product body
    /// only lists their ids) and are attached by the caller.
    pub fn from_store(v: &Value) -> Self {
        let kind = match value_str(v, &["type"]).as_deref() {
            Some("variable") => ProductKind::Variable,
            _ => ProductKind::Simple,
        };
        let categories = v
            .get("categories")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|c| {
                        Some(CategoryRef {
                            id: value_i64(c, &["id"])?,
                            name: value_str(c, &["name"]).unwrap_or_default(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        let attributes = v
            .get("attributes")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|a| {
                        Some(ProductAttribute {
                            name: value_str(a, &["name"])?,
                            options: a
                                .get("options")
                                .and_then(Value::as_array)
                                .map(|o| {
                                    o.iter()
                                        .filter_map(Value::as_str)
                                        .map(str::to_string)
                                        .collect()
                                })
                                .unwrap_or_default(),
                            variation: value_bool(a, &["variation"]).unwrap_or(false),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        let images = v
            .get("images")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|i| value_str(i, &["src"]))
                    .collect()
            })
            .unwrap_or_default();

        Product {
            id: value_i64(v, &["id"]).unwrap_or(0),
            name: value_str(v, &["name"]).unwrap_or_default(),
            sku: value_str(v, &["sku"]).unwrap_or_default(),
            barcode: barcode_from_store(v),
            kind,
            regular_price: price_field(v, "regular_price")
                .or_else(|| price_field(v, "price"))
                .unwrap_or(0.0),
            sale_price: price_field(v, "sale_price"),
            stock_quantity: value_i64(v, &["stock_quantity"]),
            manage_stock: value_bool(v, &["manage_stock"]).unwrap_or(false),
            stock_status: StockStatus::parse(
                value_str(v, &["stock_status"]).as_deref().unwrap_or("instock"),
            ),
            categories,
            attributes,
            variations: Vec::new(),
            images,
            description: value_str(v, &["description", "short_description"]).unwrap_or_default(),
            updated_at: value_str(v, &["date_modified_gmt", "date_modified"]),
        }
    }

    /// Body for `POST products` / `PATCH products/{id}` (variations excluded).
    pub fn to_store_payload(&self) -> Value {
        let mut body = json!({
            "name": self.name,
            "type": self.kind.as_str(),
            "sku": self.sku,
            "description": self.description,
            "manage_stock": self.manage_stock,
            "stock_quantity": self.stock_quantity,
            "stock_status": self.stock_status.as_str(),
            "categories": self.categories.iter().map(|c| json!({ "id": c.id })).collect::<Vec<_>>(),
            "attributes": self.attributes.iter().map(|a| json!({
                "name": a.name,
                "options": a.options,
                "variation": a.variation,
                "visible": true,
            })).collect::<Vec<_>>(),
            "images": self.images.iter().map(|src| json!({ "src": src })).collect::<Vec<_>>(),
        });
        if self.kind == ProductKind::Simple {
            body["regular_price"] = json!(format_price(self.regular_price));
            body["sale_price"] = json!(self.sale_price.map(format_price).unwrap_or_default());
        }
        if let Some(code) = &self.barcode {
            body["global_unique_id"] = json!(code);
        }
        body
    }
}

fn format_price(value: f64) -> String {
    format!("{value:.2}")
}

// ---------------------------------------------------------------------------
// Validation and variation generation
// ---------------------------------------------------------------------------

fn validate_prices(label: &str, regular: f64, sale: Option<f64>) -> Result<(), String> {
    if !regular.is_finite() || regular < 0.0 {
        return Err(format!("{label}: price cannot be negative"));
    }
    if regular > pricing::MAX_AMOUNT || sale.is_some_and(|s| s > pricing::MAX_AMOUNT) {
        return Err(format!("{label}: price exceeds the supported amount"));
    }
    if let Some(sale) = sale {
        if !sale.is_finite() || sale < 0.0 {
            return Err(format!("{label}: sale price cannot be negative"));
        }
        if sale > regular {
            return Err(format!("{label}: sale price cannot exceed the regular price"));
        }
    }
    Ok(())
}

pub fn validate_product(product: &Product) -> Result<(), String> {
    if product.name.trim().is_empty() {
        return Err("Product name is required".into());
    }
    validate_prices(&product.name, product.regular_price, product.sale_price)?;
    if product.stock_quantity.is_some_and(|q| q < 0) {
        return Err(format!("{}: stock cannot be negative", product.name));
    }
    if product.kind == ProductKind::Variable {
        if !product.attributes.iter().any(|a| a.variation && !a.options.is_empty()) {
            return Err(format!(
                "{}: variable products need at least one variation attribute",
                product.name
            ));
        }
        if product.variations.len() > MAX_VARIATIONS {
            return Err(format!(
                "{}: more than {MAX_VARIATIONS} variations",
                product.name
            ));
        }
        for variation in &product.variations {
            let label = format!("{} ({})", product.name, variation.label());
            validate_prices(&label, variation.regular_price, variation.sale_price)?;
            if variation.stock_quantity.is_some_and(|q| q < 0) {
                return Err(format!("{label}: stock cannot be negative"));
            }
        }
    }
    Ok(())
}

/// Largest variation grid a product may carry.
pub const MAX_VARIATIONS: usize = 100;

/// Cartesian product of the variation attributes.
///
/// Existing variations whose option set matches a combination are kept as
/// they are (id, prices, stock); new combinations inherit the parent price.
/// Grids above [`MAX_VARIATIONS`] are rejected before anything is built.
pub fn generate_variations(product: &Product) -> Result<Vec<Variation>, String> {
    let axes: Vec<&ProductAttribute> = product
        .attributes
        .iter()
        .filter(|a| a.variation && !a.options.is_empty())
        .collect();
    if axes.is_empty() {
        return Ok(Vec::new());
    }
    let count = axes
        .iter()
        .try_fold(1_usize, |acc, axis| acc.checked_mul(axis.options.len()))
        .filter(|n| *n <= MAX_VARIATIONS);
    if count.is_none() {
        return Err(format!(
            "{}: the attributes produce more than {MAX_VARIATIONS} variations",
            product.name
        ));
    }

    let mut combos: Vec<Vec<VariationAttribute>> = vec![Vec::new()];
    for axis in axes {
        let mut next = Vec::with_capacity(combos.len() * axis.options.len());
        for combo in &combos {
            for option in &axis.options {
                let mut extended = combo.clone();
                extended.push(VariationAttribute {
                    name: axis.name.clone(),
                    option: option.clone(),
                });
                next.push(extended);
            }
        }
        combos = next;
    }

    let combos: Vec<Variation> = combos
        .into_iter()
        .map(|attributes| {
            let candidate = Variation {
                id: 0,
                sku: String::new(),
                regular_price: product.regular_price,
                sale_price: product.sale_price,
                stock_quantity: None,
                manage_stock: product.manage_stock,
                attributes,
            };
            let key = candidate.option_key();
            product
                .variations
                .iter()
                .find(|existing| existing.option_key() == key)
                .cloned()
                .unwrap_or(candidate)
        })
        .collect();
    Ok(combos)
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

fn row_to_product(data: String) -> Option<Product> {
    match serde_json::from_str::<Product>(&data) {
        Ok(p) => Some(p),
        Err(e) => {
            warn!(error = %e, "skipping unreadable cached product");
            None
        }
    }
}

pub fn list_cached(conn: &Connection) -> Result<Vec<Product>, String> {
    let mut stmt = conn
        .prepare("SELECT data FROM products ORDER BY name COLLATE NOCASE")
        .map_err(|e| format!("list products: {e}"))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| format!("list products: {e}"))?;
    Ok(rows.filter_map(|r| r.ok()).filter_map(row_to_product).collect())
}

pub fn get_cached(conn: &Connection, id: i64) -> Result<Option<Product>, String> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM products WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| format!("get product: {e}"))?;
    Ok(data.and_then(row_to_product))
}

pub fn upsert_cached(conn: &Connection, product: &Product) -> Result<(), String> {
    let data = serde_json::to_string(product).map_err(|e| format!("serialize product: {e}"))?;
    conn.execute(
        "INSERT INTO products (id, name, sku, barcode, kind, stock_quantity, data, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            sku = excluded.sku,
            barcode = excluded.barcode,
            kind = excluded.kind,
            stock_quantity = excluded.stock_quantity,
            data = excluded.data,
            updated_at = excluded.updated_at",
        params![
            product.id,
            product.name,
            product.sku,
            product.barcode,
            product.kind.as_str(),
            product.available_stock(),
            data,
        ],
    )
    .map_err(|e| format!("upsert product: {e}"))?;
    Ok(())
}

pub fn remove_cached(conn: &Connection, id: i64) -> Result<bool, String> {
    let n = conn
        .execute("DELETE FROM products WHERE id = ?1", params![id])
        .map_err(|e| format!("delete product: {e}"))?;
    Ok(n > 0)
}

/// Replace the whole cache with a fresh store snapshot. Local drafts that
/// have not been pushed yet are kept.
pub fn replace_cache(conn: &Connection, products: &[Product]) -> Result<usize, String> {
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;
    let result = (|| -> Result<usize, String> {
        conn.execute("DELETE FROM products WHERE id >= 0", [])
            .map_err(|e| format!("clear products: {e}"))?;
        for p in products {
            upsert_cached(conn, p)?;
        }
        Ok(products.len())
    })();
    match result {
        Ok(n) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
            Ok(n)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Swap a local draft for the record the store created.
pub fn replace_draft(conn: &Connection, draft_id: i64, product: &Product) -> Result<(), String> {
    remove_cached(conn, draft_id)?;
    upsert_cached(conn, product)
}

fn next_draft_id(conn: &Connection) -> i64 {
    conn.query_row("SELECT MIN(id) FROM products", [], |row| {
        row.get::<_, Option<i64>>(0)
    })
    .ok()
    .flatten()
    .map(|min| if min < 0 { min - 1 } else { -1 })
    .unwrap_or(-1)
}

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub parent: i64,
    #[serde(default)]
    pub count: i64,
}

impl Category {
    pub fn from_store(v: &Value) -> Option<Self> {
        Some(Category {
            id: value_i64(v, &["id"])?,
            name: value_str(v, &["name"])?,
            parent: value_i64(v, &["parent"]).unwrap_or(0),
            count: value_i64(v, &["count"]).unwrap_or(0),
        })
    }
}

pub fn list_categories(conn: &Connection) -> Result<Vec<Category>, String> {
    let mut stmt = conn
        .prepare("SELECT id, name, parent, count FROM categories ORDER BY name COLLATE NOCASE")
        .map_err(|e| format!("list categories: {e}"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(Category {
                id: row.get(0)?,
                name: row.get(1)?,
                parent: row.get(2)?,
                count: row.get(3)?,
            })
        })
        .map_err(|e| format!("list categories: {e}"))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn replace_categories(conn: &Connection, categories: &[Category]) -> Result<(), String> {
    conn.execute("DELETE FROM categories", [])
        .map_err(|e| format!("clear categories: {e}"))?;
    for c in categories {
        conn.execute(
            "INSERT INTO categories (id, name, parent, count, updated_at)
             VALUES (?1, ?2, ?3, ?4, datetime('now'))",
            params![c.id, c.name, c.parent, c.count],
        )
        .map_err(|e| format!("insert category: {e}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Optimistic mutations
// ---------------------------------------------------------------------------

/// Create a product locally (negative draft id) and queue the store POST.
pub fn create_product(db: &DbState, mut product: Product) -> Result<Product, String> {
    if product.kind == ProductKind::Variable && product.variations.is_empty() {
        product.variations = generate_variations(&product)?;
    }
    validate_product(&product)?;

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    product.id = next_draft_id(&conn);
    product.updated_at = Some(Utc::now().to_rfc3339());
    product.refresh_stock_status();

    let payload = create_payload(&product);

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;
    let result = (|| -> Result<(), String> {
        upsert_cached(&conn, &product)?;
        sync::enqueue(
            &conn,
            "product",
            &product.id.to_string(),
            sync::Operation::Create,
            "POST",
            "products",
            &payload,
        )?;
        Ok(())
    })();
    finish_tx(&conn, result)?;

    info!(draft_id = product.id, name = %product.name, "product draft created");
    Ok(product)
}

/// Queue the store create of every local draft, oldest first.
pub(crate) fn requeue_drafts(conn: &Connection) -> Result<usize, String> {
    let mut drafts: Vec<Product> = list_cached(conn)?.into_iter().filter(|p| p.id < 0).collect();
    drafts.sort_by_key(|p| std::cmp::Reverse(p.id));
    for product in &drafts {
        sync::enqueue(
            conn,
            "product",
            &product.id.to_string(),
            sync::Operation::Create,
            "POST",
            "products",
            &create_payload(product),
        )?;
    }
    Ok(drafts.len())
}

/// Store body for a new product. Variations of a variable product ride
/// along under `variations_draft` and are created once the parent has an id.
fn create_payload(product: &Product) -> Value {
    let mut payload = product.to_store_payload();
    if product.kind == ProductKind::Variable {
        payload[sync::VARIATIONS_DRAFT_KEY] = json!(product
            .variations
            .iter()
            .map(Variation::to_store_payload)
            .collect::<Vec<_>>());
    }
    payload
}

/// Fields the cashier/warehouse screens may patch.
const PATCHABLE_FIELDS: &[&str] = &[
    "name",
    "sku",
    "barcode",
    "kind",
    "regular_price",
    "sale_price",
    "stock_quantity",
    "manage_stock",
    "stock_status",
    "categories",
    "attributes",
    "variations",
    "images",
    "description",
];

/// Apply a partial update locally and queue the store update.
///
/// Returns the updated product immediately; the store call happens in the
/// background and its answer overwrites the cache if they disagree.
pub fn update_product_optimistic(db: &DbState, id: i64, patch: &Value) -> Result<Product, String> {
    let patch_obj = patch.as_object().ok_or("Patch must be a JSON object")?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let current = get_cached(&conn, id)?.ok_or(format!("Product not found: {id}"))?;

    let mut merged = serde_json::to_value(&current).map_err(|e| e.to_string())?;
    for (key, value) in patch_obj {
        if PATCHABLE_FIELDS.contains(&key.as_str()) {
            merged[key] = value.clone();
        }
    }
    let mut updated: Product =
        serde_json::from_value(merged).map_err(|e| format!("Invalid product patch: {e}"))?;
    updated.id = current.id;
    if updated.kind == ProductKind::Variable && patch_obj.contains_key("attributes") {
        updated.variations = generate_variations(&updated)?;
    }
    validate_product(&updated)?;
    updated.refresh_stock_status();
    updated.updated_at = Some(Utc::now().to_rfc3339());

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;
    let result = (|| -> Result<(), String> {
        upsert_cached(&conn, &updated)?;
        if updated.is_draft() {
            // Draft not on the store yet: rewrite the pending create instead.
            sync::replace_pending_payload(&conn, "product", &id.to_string(), &create_payload(&updated))?;
        } else {
            sync::enqueue(
                &conn,
                "product",
                &id.to_string(),
                sync::Operation::Update,
                "PATCH",
                &format!("products/{id}"),
                &updated.to_store_payload(),
            )?;
            if patch_obj.contains_key("variations") || patch_obj.contains_key("attributes") {
                enqueue_variation_batch(&conn, &current, &updated)?;
            }
        }
        Ok(())
    })();
    finish_tx(&conn, result)?;

    info!(product_id = id, "product updated locally");
    Ok(updated)
}

/// Queue create/update/delete of variations after an attribute or
/// variation edit.
fn enqueue_variation_batch(conn: &Connection, before: &Product, after: &Product) -> Result<(), String> {
    let kept: HashSet<i64> = after.variations.iter().map(|v| v.id).filter(|id| *id > 0).collect();
    let delete: Vec<i64> = before
        .variations
        .iter()
        .map(|v| v.id)
        .filter(|id| *id > 0 && !kept.contains(id))
        .collect();
    let create: Vec<Value> = after
        .variations
        .iter()
        .filter(|v| v.id <= 0)
        .map(Variation::to_store_payload)
        .collect();
    let update: Vec<Value> = after
        .variations
        .iter()
        .filter(|v| v.id > 0)
        .filter(|v| before.variation(v.id) != Some(*v))
        .map(|v| {
            let mut body = v.to_store_payload();
            body["id"] = json!(v.id);
            body
        })
        .collect();
    if create.is_empty() && update.is_empty() && delete.is_empty() {
        return Ok(());
    }
    sync::enqueue(
        conn,
        "variation_batch",
        &after.id.to_string(),
        sync::Operation::Update,
        "POST",
        &format!("products/{}/variations/batch", after.id),
        &json!({ "create": create, "update": update, "delete": delete }),
    )?;
    Ok(())
}

/// Remove a product locally and queue the store delete.
pub fn delete_product(db: &DbState, id: i64) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;
    let result = (|| -> Result<(), String> {
        if !remove_cached(&conn, id)? {
            return Err(format!("Product not found: {id}"));
        }
        if id < 0 {
            sync::drop_pending(&conn, "product", &id.to_string())?;
        } else {
            sync::enqueue(
                &conn,
                "product",
                &id.to_string(),
                sync::Operation::Delete,
                "DELETE",
                &format!("products/{id}"),
                &json!({ "force": true }),
            )?;
        }
        Ok(())
    })();
    finish_tx(&conn, result)?;
    info!(product_id = id, "product deleted locally");
    Ok(())
}

/// Change stock by `delta` on a product or one of its variations.
///
/// Managed stock never goes below zero. Untracked stock is left untouched.
/// Does not queue anything: callers decide whether the store needs an
/// explicit update (orders already move store stock).
pub fn adjust_stock(
    conn: &Connection,
    product_id: i64,
    variation_id: Option<i64>,
    delta: i64,
) -> Result<Product, String> {
    let mut product =
        get_cached(conn, product_id)?.ok_or(format!("Product not found: {product_id}"))?;
    match variation_id {
        Some(vid) => {
            let variation = product
                .variations
                .iter_mut()
                .find(|v| v.id == vid)
                .ok_or(format!("Variation not found: {vid}"))?;
            if variation.manage_stock {
                variation.stock_quantity =
                    Some((variation.stock_quantity.unwrap_or(0) + delta).max(0));
            }
        }
        None => {
            if product.manage_stock {
                product.stock_quantity = Some((product.stock_quantity.unwrap_or(0) + delta).max(0));
            }
        }
    }
    product.refresh_stock_status();
    upsert_cached(conn, &product)?;
    Ok(product)
}

/// Manual stock correction from the warehouse screen, pushed to the store.
pub fn set_stock(
    db: &DbState,
    product_id: i64,
    variation_id: Option<i64>,
    delta: i64,
) -> Result<Product, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;
    let result = (|| -> Result<Product, String> {
        let product = adjust_stock(&conn, product_id, variation_id, delta)?;
        if !product.is_draft() {
            let (path, quantity) = match variation_id {
                Some(vid) => (
                    format!("products/{product_id}/variations/{vid}"),
                    product.variation(vid).and_then(|v| v.stock_quantity),
                ),
                None => (format!("products/{product_id}"), product.stock_quantity),
            };
            sync::enqueue(
                &conn,
                "stock",
                &product_id.to_string(),
                sync::Operation::Update,
                "PUT",
                &path,
                &json!({ "manage_stock": true, "stock_quantity": quantity }),
            )?;
        }
        Ok(product)
    })();
    match result {
        Ok(p) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
            Ok(p)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

fn finish_tx(conn: &Connection, result: Result<(), String>) -> Result<(), String> {
    match result {
        Ok(()) => conn
            .execute_batch("COMMIT")
            .map_err(|e| format!("commit: {e}")),
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Store refresh
// ---------------------------------------------------------------------------

pub async fn fetch_variations(client: &StoreClient, product_id: i64) -> Result<Vec<Variation>, String> {
    let raw = client
        .get_all_pages(&format!("products/{product_id}/variations"), &[])
        .await?;
    Ok(raw.iter().map(Variation::from_store).collect())
}

/// Fetch one product (with variations) from the store.
pub async fn fetch_product(client: &StoreClient, product_id: i64) -> Result<Product, String> {
    let raw = client.get(&format!("products/{product_id}"), &[]).await?;
    let mut product = Product::from_store(&raw);
    if product.kind == ProductKind::Variable {
        product.variations = fetch_variations(client, product_id).await?;
    }
    Ok(product)
}

/// Pull the full catalog and categories from the store into the cache.
pub async fn refresh_from_store(db: &DbState, client: &StoreClient) -> Result<Value, String> {
    let raw_products = client
        .get_all_pages("products", &[("status", "publish".to_string())])
        .await?;
    let mut products: Vec<Product> = raw_products.iter().map(Product::from_store).collect();
    for product in products.iter_mut().filter(|p| p.kind == ProductKind::Variable) {
        match fetch_variations(client, product.id).await {
            Ok(variations) => product.variations = variations,
            Err(e) => warn!(product_id = product.id, error = %e, "variation fetch failed"),
        }
    }

    let raw_categories = client.get_all_pages("products/categories", &[]).await?;
    let categories: Vec<Category> = raw_categories
        .iter()
        .filter_map(Category::from_store)
        .collect();

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let count = replace_cache(&conn, &products)?;
    replace_categories(&conn, &categories)?;
    info!(products = count, categories = categories.len(), "catalog refreshed from store");

    Ok(json!({
        "success": true,
        "products": count,
        "categories": categories.len(),
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db;

    pub(crate) fn simple(id: i64, name: &str, price: f64, stock: Option<i64>) -> Product {
        Product {
            id,
            name: name.into(),
            sku: format!("SKU-{id}"),
            barcode: None,
            kind: ProductKind::Simple,
            regular_price: price,
            sale_price: None,
            stock_quantity: stock,
            manage_stock: stock.is_some(),
            stock_status: StockStatus::Instock,
            categories: vec![],
            attributes: vec![],
            variations: vec![],
            images: vec![],
            description: String::new(),
            updated_at: None,
        }
    }

    fn shirt() -> Product {
        let mut p = simple(10, "قميص", 200.0, None);
        p.kind = ProductKind::Variable;
        p.manage_stock = true;
        p.attributes = vec![
            ProductAttribute {
                name: "اللون".into(),
                options: vec!["أحمر".into(), "أزرق".into()],
                variation: true,
            },
            ProductAttribute {
                name: "المقاس".into(),
                options: vec!["M".into(), "L".into(), "XL".into()],
                variation: true,
            },
            ProductAttribute {
                name: "الخامة".into(),
                options: vec!["قطن".into()],
                variation: false,
            },
        ];
        p
    }

    #[test]
    fn test_effective_price() {
        assert_eq!(effective_price(100.0, Some(80.0)), 80.0);
        assert_eq!(effective_price(100.0, Some(0.0)), 100.0);
        assert_eq!(effective_price(100.0, Some(120.0)), 100.0);
        assert_eq!(effective_price(100.0, None), 100.0);
    }

    #[test]
    fn test_generate_variations_cartesian() {
        let variations = generate_variations(&shirt()).unwrap();
        assert_eq!(variations.len(), 6);
        assert!(variations.iter().all(|v| v.attributes.len() == 2));
        assert!(variations.iter().all(|v| v.regular_price == 200.0));
        assert_eq!(variations[0].label(), "أحمر / M");
    }

    #[test]
    fn test_variation_grid_is_capped() {
        let mut p = shirt();
        p.attributes = (0..8)
            .map(|i| ProductAttribute {
                name: format!("A{i}"),
                options: (0..10).map(|o| o.to_string()).collect(),
                variation: true,
            })
            .collect();
        let err = generate_variations(&p).unwrap_err();
        assert!(err.contains("variations"));

        let state = db::test_state();
        assert!(create_product(&state, p).is_err());
        assert_eq!(db::count_rows(&state.conn.lock().unwrap(), "sync_queue"), 0);

        let mut edge = shirt();
        edge.attributes[0].options = (0..10).map(|o| format!("c{o}")).collect();
        edge.attributes[1].options = (0..10).map(|o| format!("s{o}")).collect();
        assert_eq!(generate_variations(&edge).unwrap().len(), MAX_VARIATIONS);
        edge.attributes[1].options.push("s10".into());
        assert!(generate_variations(&edge).is_err());
    }

    #[test]
    fn test_price_above_supported_amount_rejected() {
        let p = simple(1, "ذهب", pricing::MAX_AMOUNT * 10.0, None);
        assert!(validate_product(&p).unwrap_err().contains("supported amount"));
        let mut sale = simple(1, "ذهب", 100.0, None);
        sale.sale_price = Some(f64::MAX);
        assert!(validate_product(&sale).is_err());
    }

    #[test]
    fn test_generate_variations_keeps_existing() {
        let mut p = shirt();
        p.variations = vec![Variation {
            id: 55,
            sku: "SH-R-L".into(),
            regular_price: 250.0,
            sale_price: None,
            stock_quantity: Some(4),
            manage_stock: true,
            attributes: vec![
                VariationAttribute {
                    name: "المقاس".into(),
                    option: "L".into(),
                },
                VariationAttribute {
                    name: "اللون".into(),
                    option: "أحمر".into(),
                },
            ],
        }];
        let variations = generate_variations(&p).unwrap();
        assert_eq!(variations.len(), 6);
        let kept = variations.iter().find(|v| v.id == 55).unwrap();
        assert_eq!(kept.regular_price, 250.0);
        assert_eq!(kept.stock_quantity, Some(4));
    }

    #[test]
    fn test_validate_product_rules() {
        let mut p = simple(1, "كوب", 50.0, Some(3));
        assert!(validate_product(&p).is_ok());
        p.sale_price = Some(60.0);
        assert!(validate_product(&p).is_err());
        p.sale_price = None;
        p.stock_quantity = Some(-1);
        assert!(validate_product(&p).is_err());
        p.stock_quantity = Some(1);
        p.name = "  ".into();
        assert!(validate_product(&p).is_err());

        let mut v = shirt();
        v.attributes.iter_mut().for_each(|a| a.variation = false);
        assert!(validate_product(&v).is_err());
    }

    #[test]
    fn test_from_store_maps_woocommerce_shapes() {
        let raw = json!({
            "id": 77,
            "name": "حذاء رياضي",
            "type": "variable",
            "sku": "SHOE",
            "regular_price": "",
            "sale_price": "",
            "price": "450",
            "manage_stock": false,
            "stock_quantity": null,
            "stock_status": "instock",
            "categories": [{ "id": 3, "name": "أحذية" }],
            "attributes": [{ "id": 0, "name": "المقاس", "options": ["42", "43"], "variation": true }],
            "images": [{ "src": "https://cdn.example/shoe.jpg" }],
            "meta_data": [{ "key": "_barcode", "value": "6221234567890" }],
            "variations": [101, 102]
        });
        let p = Product::from_store(&raw);
        assert_eq!(p.kind, ProductKind::Variable);
        assert_eq!(p.regular_price, 450.0);
        assert_eq!(p.sale_price, None);
        assert_eq!(p.barcode.as_deref(), Some("6221234567890"));
        assert_eq!(p.categories[0].name, "أحذية");
        assert_eq!(p.images, vec!["https://cdn.example/shoe.jpg".to_string()]);
        assert!(p.variations.is_empty());
    }

    #[test]
    fn test_cache_roundtrip_and_drafts() {
        let state = db::test_state();
        let created = create_product(&state, simple(0, "كوب", 50.0, Some(3))).unwrap();
        assert_eq!(created.id, -1);
        let second = create_product(&state, simple(0, "طبق", 80.0, Some(1))).unwrap();
        assert_eq!(second.id, -2);

        let conn = state.conn.lock().unwrap();
        assert_eq!(list_cached(&conn).unwrap().len(), 2);
        let queued = db::count_rows(&conn, "sync_queue");
        assert_eq!(queued, 2);

        replace_cache(&conn, &[simple(5, "ملعقة", 10.0, None)]).unwrap();
        let ids: Vec<i64> = list_cached(&conn).unwrap().iter().map(|p| p.id).collect();
        assert!(ids.contains(&5) && ids.contains(&-1) && ids.contains(&-2));
    }

    #[test]
    fn test_update_product_optimistic_queues_put() {
        let state = db::test_state();
        {
            let conn = state.conn.lock().unwrap();
            upsert_cached(&conn, &simple(9, "كوب", 50.0, Some(3))).unwrap();
        }
        let updated =
            update_product_optimistic(&state, 9, &json!({ "regular_price": 65.0, "id": 1234 }))
                .unwrap();
        assert_eq!(updated.id, 9);
        assert_eq!(updated.regular_price, 65.0);

        let conn = state.conn.lock().unwrap();
        let (method, path): (String, String) = conn
            .query_row(
                "SELECT method, path FROM sync_queue WHERE entity_type = 'product'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(method, "PATCH");
        assert_eq!(path, "products/9");
        assert_eq!(get_cached(&conn, 9).unwrap().unwrap().regular_price, 65.0);
    }

    #[test]
    fn test_update_rejects_invalid_patch() {
        let state = db::test_state();
        {
            let conn = state.conn.lock().unwrap();
            upsert_cached(&conn, &simple(9, "كوب", 50.0, Some(3))).unwrap();
        }
        assert!(update_product_optimistic(&state, 9, &json!({ "sale_price": 70.0 })).is_err());
        let conn = state.conn.lock().unwrap();
        assert_eq!(db::count_rows(&conn, "sync_queue"), 0);
        assert_eq!(get_cached(&conn, 9).unwrap().unwrap().sale_price, None);
    }

    #[test]
    fn test_adjust_stock_clamps_and_updates_status() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        upsert_cached(&conn, &simple(3, "كوب", 50.0, Some(2))).unwrap();
        let p = adjust_stock(&conn, 3, None, -5).unwrap();
        assert_eq!(p.stock_quantity, Some(0));
        assert_eq!(p.stock_status, StockStatus::Outofstock);
        let p = adjust_stock(&conn, 3, None, 4).unwrap();
        assert_eq!(p.stock_quantity, Some(4));
        assert_eq!(p.stock_status, StockStatus::Instock);
    }

    #[test]
    fn test_delete_draft_drops_pending_create() {
        let state = db::test_state();
        let draft = create_product(&state, simple(0, "كوب", 50.0, None)).unwrap();
        delete_product(&state, draft.id).unwrap();
        let conn = state.conn.lock().unwrap();
        assert_eq!(db::count_rows(&conn, "products"), 0);
        assert_eq!(db::count_rows(&conn, "sync_queue"), 0);
    }
}
