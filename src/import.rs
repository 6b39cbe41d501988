//! CSV product import.
//!
//! Header detection accepts English and Arabic column names. Rows that share
//! a product name and carry attribute values are folded into one variable
//! product with a variation per row.

use csv::{ReaderBuilder, StringRecord, Trim};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::api::{self, StoreClient};
use crate::catalog::{
    self, CategoryRef, Product, ProductAttribute, ProductKind, StockStatus, Variation,
    VariationAttribute,
};
use crate::db::DbState;
use crate::search::normalize_arabic;
use crate::sync;

/// Products per `POST products/batch` call; the store caps batches at 100.
pub const BATCH_SIZE: usize = 50;

const FIELD_SYNONYMS: &[(Field, &[&str])] = &[
    (Field::Name, &["name", "product name", "title", "product", "اسم", "الاسم", "اسم المنتج", "المنتج", "الصنف"]),
    (Field::Sku, &["sku", "code", "product code", "كود", "الكود", "كود المنتج", "رمز"]),
    (Field::Barcode, &["barcode", "ean", "upc", "gtin", "باركود", "الباركود"]),
    (Field::SalePrice, &["sale price", "discount price", "offer price", "سعر الخصم", "سعر العرض", "سعر التخفيض"]),
    (Field::RegularPrice, &["price", "regular price", "سعر", "السعر", "سعر البيع"]),
    (Field::Stock, &["stock", "quantity", "qty", "stock quantity", "الكمية", "كمية", "المخزون", "مخزون"]),
    (Field::Category, &["category", "categories", "قسم", "القسم", "الفئة", "فئة", "التصنيف"]),
    (Field::Description, &["description", "details", "الوصف", "وصف", "تفاصيل"]),
    (Field::Image, &["image", "images", "image url", "photo", "صورة", "الصورة", "صور"]),
];

const ATTRIBUTE_PREFIXES: &[&str] = &["attribute:", "attribute ", "خاصية:", "خاصية ", "خاصيه "];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Field {
    Name,
    Sku,
    Barcode,
    RegularPrice,
    SalePrice,
    Stock,
    Category,
    Description,
    Image,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeColumn {
    pub name: String,
    pub index: usize,
}

/// Column index per recognized field.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ColumnMapping {
    pub name: Option<usize>,
    pub sku: Option<usize>,
    pub barcode: Option<usize>,
    pub regular_price: Option<usize>,
    pub sale_price: Option<usize>,
    pub stock: Option<usize>,
    pub category: Option<usize>,
    pub description: Option<usize>,
    pub image: Option<usize>,
    pub attributes: Vec<AttributeColumn>,
    pub unmatched: Vec<String>,
}

impl ColumnMapping {
    fn slot(&mut self, field: Field) -> &mut Option<usize> {
        match field {
            Field::Name => &mut self.name,
            Field::Sku => &mut self.sku,
            Field::Barcode => &mut self.barcode,
            Field::RegularPrice => &mut self.regular_price,
            Field::SalePrice => &mut self.sale_price,
            Field::Stock => &mut self.stock,
            Field::Category => &mut self.category,
            Field::Description => &mut self.description,
            Field::Image => &mut self.image,
        }
    }
}

fn normalize_header(header: &str) -> String {
    let folded: String = normalize_arabic(header)
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn attribute_name(header: &str) -> Option<String> {
    let trimmed = header.trim();
    let lower = trimmed.to_lowercase();
    ATTRIBUTE_PREFIXES.iter().find_map(|prefix| {
        if !lower.starts_with(prefix) {
            return None;
        }
        trimmed
            .get(prefix.len()..)
            .map(|rest| rest.trim_start_matches(':').trim().to_string())
            .filter(|name| !name.is_empty())
    })
}

pub fn detect_columns(headers: &[String]) -> ColumnMapping {
    let mut mapping = ColumnMapping::default();
    for (index, header) in headers.iter().enumerate() {
        if let Some(name) = attribute_name(header) {
            mapping.attributes.push(AttributeColumn { name, index });
            continue;
        }
        let normalized = normalize_header(header);
        let field = FIELD_SYNONYMS.iter().find_map(|(field, synonyms)| {
            synonyms
                .iter()
                .any(|s| normalize_header(s) == normalized)
                .then_some(*field)
        });
        match field {
            Some(field) if mapping.slot(field).is_none() => *mapping.slot(field) = Some(index),
            _ => mapping.unmatched.push(header.clone()),
        }
    }
    mapping
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowError {
    /// 1-based line in the file, header included.
    pub row: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub mapping: ColumnMapping,
    pub rows: usize,
    pub products: Vec<Product>,
    pub errors: Vec<RowError>,
}

#[derive(Debug, Clone)]
struct ParsedRow {
    line: usize,
    name: String,
    sku: String,
    barcode: Option<String>,
    regular_price: f64,
    sale_price: Option<f64>,
    stock: Option<i64>,
    categories: Vec<String>,
    description: String,
    images: Vec<String>,
    attributes: Vec<VariationAttribute>,
}

fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = normalize_arabic(raw)
        .chars()
        .filter_map(|c| match c {
            '٫' => Some('.'),
            c if c.is_ascii_digit() || c == '.' || c == '-' => Some(c),
            _ => None,
        })
        .collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split([',', '|', '،'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn cell(record: &StringRecord, idx: Option<usize>) -> &str {
    idx.and_then(|i| record.get(i)).unwrap_or("").trim()
}

fn parse_row(mapping: &ColumnMapping, record: &StringRecord, line: usize) -> Result<ParsedRow, String> {
    let cell = |idx: Option<usize>| cell(record, idx);

    let name = cell(mapping.name);
    if name.is_empty() {
        return Err("اسم المنتج مطلوب".into());
    }
    let raw_price = cell(mapping.regular_price);
    let regular_price = parse_number(raw_price).ok_or(format!("Invalid price: \"{raw_price}\""))?;
    let raw_sale = cell(mapping.sale_price);
    let sale_price = match raw_sale {
        "" => None,
        raw => Some(parse_number(raw).ok_or(format!("Invalid sale price: \"{raw}\""))?),
    };
    let raw_stock = cell(mapping.stock);
    let stock = match raw_stock {
        "" => None,
        raw => {
            let qty = parse_number(raw).ok_or(format!("Invalid stock: \"{raw}\""))?;
            if qty.fract() != 0.0 {
                return Err(format!("Invalid stock: \"{raw}\""));
            }
            Some(qty as i64)
        }
    };
    let attributes = mapping
        .attributes
        .iter()
        .filter_map(|col| {
            let option = record.get(col.index).unwrap_or("").trim();
            (!option.is_empty()).then(|| VariationAttribute {
                name: col.name.clone(),
                option: option.to_string(),
            })
        })
        .collect();

    Ok(ParsedRow {
        line,
        name: name.to_string(),
        sku: cell(mapping.sku).to_string(),
        barcode: Some(cell(mapping.barcode).to_string()).filter(|b| !b.is_empty()),
        regular_price,
        sale_price,
        stock,
        categories: split_list(cell(mapping.category)),
        description: cell(mapping.description).to_string(),
        images: split_list(cell(mapping.image)),
        attributes,
    })
}

fn draft_from_rows(rows: &[ParsedRow]) -> Result<Product, String> {
    let first = &rows[0];
    let mut product = Product {
        id: 0,
        name: first.name.clone(),
        sku: first.sku.clone(),
        barcode: first.barcode.clone(),
        kind: ProductKind::Simple,
        regular_price: first.regular_price,
        sale_price: first.sale_price,
        stock_quantity: first.stock,
        manage_stock: first.stock.is_some(),
        stock_status: StockStatus::Instock,
        categories: first
            .categories
            .iter()
            .map(|name| CategoryRef {
                id: 0,
                name: name.clone(),
            })
            .collect(),
        attributes: Vec::new(),
        variations: Vec::new(),
        images: rows
            .iter()
            .find(|r| !r.images.is_empty())
            .map(|r| r.images.clone())
            .unwrap_or_default(),
        description: rows
            .iter()
            .map(|r| r.description.as_str())
            .find(|d| !d.is_empty())
            .unwrap_or_default()
            .to_string(),
        updated_at: None,
    };

    let is_variable = rows.iter().any(|r| !r.attributes.is_empty());
    if !is_variable {
        if rows.len() > 1 {
            return Err(format!("Duplicate product \"{}\" without attribute values", first.name));
        }
        product.refresh_stock_status();
        return Ok(product);
    }

    product.kind = ProductKind::Variable;
    product.sku = String::new();
    product.barcode = None;
    product.stock_quantity = None;
    product.manage_stock = false;
    for row in rows {
        if row.attributes.is_empty() {
            return Err(format!("Row {}: variation without attribute values", row.line));
        }
        for attr in &row.attributes {
            let pos = match product.attributes.iter().position(|a| a.name == attr.name) {
                Some(pos) => pos,
                None => {
                    product.attributes.push(ProductAttribute {
                        name: attr.name.clone(),
                        options: Vec::new(),
                        variation: true,
                    });
                    product.attributes.len() - 1
                }
            };
            let slot = &mut product.attributes[pos];
            if !slot.options.contains(&attr.option) {
                slot.options.push(attr.option.clone());
            }
        }
        let variation = Variation {
            id: 0,
            sku: row.sku.clone(),
            regular_price: row.regular_price,
            sale_price: row.sale_price,
            stock_quantity: row.stock,
            manage_stock: row.stock.is_some(),
            attributes: row.attributes.clone(),
        };
        if product
            .variations
            .iter()
            .any(|v| v.attributes == variation.attributes)
        {
            return Err(format!("Row {}: duplicate variation {}", row.line, variation.label()));
        }
        product.variations.push(variation);
    }
    product.refresh_stock_status();
    Ok(product)
}

/// Parse a product CSV into drafts. Row problems are collected, never fatal;
/// only an unreadable file or a missing name/price column fails the call.
pub fn parse_products_csv(text: &str) -> Result<ImportReport, String> {
    let text = text.trim_start_matches('\u{feff}');
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .trim(Trim::All)
        .from_reader(text.as_bytes());
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| format!("Invalid CSV header: {e}"))?
        .iter()
        .map(str::to_string)
        .collect();
    let mapping = detect_columns(&headers);
    if mapping.name.is_none() {
        return Err("لم يتم العثور على عمود اسم المنتج".into());
    }
    if mapping.regular_price.is_none() {
        return Err("لم يتم العثور على عمود السعر".into());
    }

    let mut report = ImportReport {
        mapping,
        ..Default::default()
    };
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<ParsedRow>> = HashMap::new();
    for (idx, record) in reader.records().enumerate() {
        let line = idx + 2;
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                report.errors.push(RowError { row: line, message: e.to_string() });
                continue;
            }
        };
        if record.iter().all(|c| c.trim().is_empty()) {
            continue;
        }
        report.rows += 1;
        match parse_row(&report.mapping, &record, line) {
            Ok(row) => {
                let key = normalize_arabic(&row.name);
                if !groups.contains_key(&key) {
                    order.push(key.clone());
                }
                groups.entry(key).or_default().push(row);
            }
            Err(message) => report.errors.push(RowError { row: line, message }),
        }
    }

    for key in order {
        let Some(rows) = groups.remove(&key) else { continue };
        let line = rows[0].line;
        match draft_from_rows(&rows).and_then(|p| catalog::validate_product(&p).map(|_| p)) {
            Ok(product) => report.products.push(product),
            Err(message) => report.errors.push(RowError { row: line, message }),
        }
    }
    report.errors.sort_by_key(|e| e.row);
    info!(
        rows = report.rows,
        products = report.products.len(),
        errors = report.errors.len(),
        "csv parsed"
    );
    Ok(report)
}

/// Fill category ids from the cached category list by normalized name.
/// Unknown names are dropped and returned.
pub fn resolve_categories(db: &DbState, products: &mut [Product]) -> Result<Vec<String>, String> {
    let known: HashMap<String, i64> = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        catalog::list_categories(&conn)?
            .into_iter()
            .map(|c| (normalize_arabic(&c.name), c.id))
            .collect()
    };
    let mut unknown = Vec::new();
    for product in products.iter_mut() {
        product.categories.retain_mut(|c| match known.get(&normalize_arabic(&c.name)) {
            Some(id) => {
                c.id = *id;
                true
            }
            None => {
                if !unknown.contains(&c.name) {
                    unknown.push(c.name.clone());
                }
                false
            }
        });
    }
    if !unknown.is_empty() {
        warn!(?unknown, "import references unknown categories");
    }
    Ok(unknown)
}

// ---------------------------------------------------------------------------
// Store push
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct PushResult {
    pub created: Vec<Product>,
    /// Drafts queued for the background sync.
    pub queued: usize,
    pub errors: Vec<String>,
}

fn queue_drafts(db: &DbState, drafts: &[Product], result: &mut PushResult) {
    for draft in drafts {
        match catalog::create_product(db, draft.clone()) {
            Ok(_) => result.queued += 1,
            Err(e) => result.errors.push(format!("{}: {e}", draft.name)),
        }
    }
}

fn batch_item_error(item: &Value) -> Option<String> {
    let err = item.get("error")?;
    Some(
        err.get("message")
            .and_then(Value::as_str)
            .unwrap_or("store rejected the product")
            .to_string(),
    )
}

/// Create the drafts on the store in batches and cache what comes back.
///
/// Without a client, or once the store becomes unreachable, the remaining
/// drafts are queued as local drafts instead. Variations of created variable
/// products go through the sync queue as a variation batch.
pub async fn push_products(db: &DbState, client: Option<&StoreClient>, drafts: Vec<Product>) -> Result<PushResult, String> {
    let mut result = PushResult::default();
    let Some(client) = client else {
        queue_drafts(db, &drafts, &mut result);
        return Ok(result);
    };

    let chunks: Vec<&[Product]> = drafts.chunks(BATCH_SIZE).collect();
    for (n, chunk) in chunks.iter().enumerate() {
        let body = json!({
            "create": chunk.iter().map(Product::to_store_payload).collect::<Vec<_>>(),
        });
        let response = match client.request("POST", "products/batch", &[], Some(&body)).await {
            Ok(r) => r,
            Err(e) if api::is_transient_error(&e) => {
                warn!(error = %e, "store unreachable during import, queueing the rest");
                for rest in &chunks[n..] {
                    queue_drafts(db, rest, &mut result);
                }
                break;
            }
            Err(e) => {
                result
                    .errors
                    .extend(chunk.iter().map(|p| format!("{}: {e}", p.name)));
                continue;
            }
        };

        let created = response
            .get("create")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        for (draft, item) in chunk.iter().zip(created.iter()) {
            if let Some(message) = batch_item_error(item) {
                result.errors.push(format!("{}: {message}", draft.name));
                continue;
            }
            let product = Product::from_store(item);
            if product.id <= 0 {
                result.errors.push(format!("{}: store returned no id", draft.name));
                continue;
            }
            catalog::upsert_cached(&conn, &product)?;
            if !draft.variations.is_empty() {
                sync::enqueue(
                    &conn,
                    "variation_batch",
                    &product.id.to_string(),
                    sync::Operation::Update,
                    "POST",
                    &format!("products/{}/variations/batch", product.id),
                    &json!({
                        "create": draft.variations.iter().map(Variation::to_store_payload).collect::<Vec<_>>(),
                    }),
                )?;
            }
            result.created.push(product);
        }
        if created.len() < chunk.len() {
            result.errors.extend(
                chunk[created.len()..]
                    .iter()
                    .map(|p| format!("{}: missing from store response", p.name)),
            );
        }
    }

    info!(
        created = result.created.len(),
        queued = result.queued,
        errors = result.errors.len(),
        "import pushed"
    );
    Ok(result)
}
