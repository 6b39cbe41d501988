//! Customers and their delivery addresses.
//!
//! Addresses follow Bosta's city/district model. Customers are created on
//! the store when it is reachable; otherwise they are kept locally with
//! `offline = true` and pushed by the sync loop.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::{self, StoreClient};
use crate::bosta::BostaClient;
use crate::data_helpers::{is_valid_phone, normalize_phone};
use crate::db::DbState;
use crate::search::normalize_arabic;
use crate::settings;
use crate::sync;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Address {
    pub city_id: Option<String>,
    pub city_name: Option<String>,
    pub district_id: Option<String>,
    pub district_name: Option<String>,
    pub zone: Option<String>,
    pub street: String,
    pub building: Option<String>,
    pub floor: Option<String>,
    pub apartment: Option<String>,
    pub landmark: Option<String>,
}

impl Address {
    /// Single line for labels and the store's `address_1`.
    pub fn one_line(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if !self.street.trim().is_empty() {
            parts.push(self.street.trim().to_string());
        }
        if let Some(b) = self.building.as_deref().filter(|s| !s.trim().is_empty()) {
            parts.push(format!("عمارة {b}"));
        }
        if let Some(f) = self.floor.as_deref().filter(|s| !s.trim().is_empty()) {
            parts.push(format!("دور {f}"));
        }
        if let Some(a) = self.apartment.as_deref().filter(|s| !s.trim().is_empty()) {
            parts.push(format!("شقة {a}"));
        }
        for extra in [&self.district_name, &self.zone, &self.landmark] {
            if let Some(v) = extra.as_deref().filter(|s| !s.trim().is_empty()) {
                parts.push(v.trim().to_string());
            }
        }
        parts.join("، ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub second_phone: Option<String>,
    #[serde(default)]
    pub address: Address,
    #[serde(default)]
    pub shipping_cost: f64,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub offline: bool,
    #[serde(default)]
    pub remote_id: Option<i64>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl Customer {
    /// Normalize phones and check required fields.
    pub fn validate(&mut self) -> Result<(), String> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return Err("اسم العميل مطلوب".into());
        }
        if !is_valid_phone(&self.phone) {
            return Err("رقم الهاتف غير صحيح".into());
        }
        self.phone = normalize_phone(&self.phone);
        self.second_phone = match self.second_phone.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(p) if is_valid_phone(p) => Some(normalize_phone(p)),
            Some(_) => return Err("رقم الهاتف الثاني غير صحيح".into()),
        };
        if !self.shipping_cost.is_finite() || self.shipping_cost < 0.0 {
            return Err("مصاريف الشحن لا يمكن أن تكون سالبة".into());
        }
        Ok(())
    }

    /// Name split for the store's first/last name fields.
    fn name_parts(&self) -> (String, String) {
        match self.name.split_once(' ') {
            Some((first, last)) => (first.to_string(), last.trim().to_string()),
            None => (self.name.clone(), String::new()),
        }
    }

    /// `billing`/`shipping` block of a store order or customer.
    pub fn store_address(&self) -> Value {
        let (first_name, last_name) = self.name_parts();
        json!({
            "first_name": first_name,
            "last_name": last_name,
            "phone": self.phone,
            "address_1": self.address.one_line(),
            "address_2": self.second_phone.clone().unwrap_or_default(),
            "city": self.address.city_name.clone().unwrap_or_default(),
            "state": self.address.district_name.clone().unwrap_or_default(),
            "country": "EG",
        })
    }

    /// Body for `POST customers`. The store requires an e-mail; walk-in
    /// customers get a placeholder derived from the phone.
    pub fn to_store_payload(&self) -> Value {
        let (first_name, last_name) = self.name_parts();
        json!({
            "email": format!("{}@customers.dukkan.local", self.phone),
            "first_name": first_name,
            "last_name": last_name,
            "username": self.phone,
            "billing": self.store_address(),
            "shipping": self.store_address(),
        })
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

const COLUMNS: &str = "id, name, phone, second_phone, address, shipping_cost, notes, offline, \
                       remote_id, created_at, updated_at";

fn row_to_customer(row: &rusqlite::Row<'_>) -> rusqlite::Result<Customer> {
    let address: String = row.get(4)?;
    Ok(Customer {
        id: row.get(0)?,
        name: row.get(1)?,
        phone: row.get(2)?,
        second_phone: row.get(3)?,
        address: serde_json::from_str(&address).unwrap_or_default(),
        shipping_cost: row.get(5)?,
        notes: row.get(6)?,
        offline: row.get::<_, i64>(7)? != 0,
        remote_id: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

pub fn load_customer(conn: &Connection, id: &str) -> Result<Option<Customer>, String> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM customers WHERE id = ?1"),
        params![id],
        row_to_customer,
    )
    .optional()
    .map_err(|e| format!("get customer: {e}"))
}

fn insert_customer(conn: &Connection, c: &Customer) -> Result<(), String> {
    let address = serde_json::to_string(&c.address).map_err(|e| e.to_string())?;
    conn.execute(
        &format!("INSERT INTO customers ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
        params![
            c.id,
            c.name,
            c.phone,
            c.second_phone,
            address,
            c.shipping_cost,
            c.notes,
            c.offline as i64,
            c.remote_id,
            c.created_at,
            c.updated_at,
        ],
    )
    .map_err(|e| format!("insert customer: {e}"))?;
    Ok(())
}

const DUPLICATE_PHONE: &str = "يوجد عميل مسجل بنفس رقم الهاتف";

fn phone_taken(conn: &Connection, phone: &str, except_id: &str) -> Result<bool, String> {
    conn.query_row(
        "SELECT COUNT(*) FROM customers WHERE phone = ?1 AND id != ?2",
        params![phone, except_id],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n > 0)
    .map_err(|e| format!("check phone: {e}"))
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

pub fn list_customers(db: &DbState) -> Result<Vec<Customer>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(&format!("SELECT {COLUMNS} FROM customers ORDER BY name COLLATE NOCASE"))
        .map_err(|e| format!("list customers: {e}"))?;
    let rows = stmt
        .query_map([], row_to_customer)
        .map_err(|e| format!("list customers: {e}"))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Queue the store create of every customer that only exists locally.
pub(crate) fn requeue_offline(conn: &Connection) -> Result<usize, String> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {COLUMNS} FROM customers WHERE offline = 1 AND remote_id IS NULL ORDER BY created_at"
        ))
        .map_err(|e| format!("list offline customers: {e}"))?;
    let offline: Vec<Customer> = stmt
        .query_map([], row_to_customer)
        .map_err(|e| format!("list offline customers: {e}"))?
        .filter_map(|r| r.ok())
        .collect();
    for customer in &offline {
        sync::enqueue(
            conn,
            "customer",
            &customer.id,
            sync::Operation::Create,
            "POST",
            "customers",
            &customer.to_store_payload(),
        )?;
    }
    Ok(offline.len())
}

pub fn get_customer(db: &DbState, id: &str) -> Result<Customer, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    load_customer(&conn, id)?.ok_or(format!("Customer not found: {id}"))
}

/// Match by normalized name or by phone digits.
pub fn search_customers(db: &DbState, query: &str, limit: usize) -> Result<Vec<Customer>, String> {
    let needle = normalize_arabic(query);
    let digits = normalize_phone(query);
    let all = list_customers(db)?;
    if needle.is_empty() {
        return Ok(all.into_iter().take(limit).collect());
    }
    Ok(all
        .into_iter()
        .filter(|c| {
            normalize_arabic(&c.name).contains(&needle)
                || (digits.len() >= 3
                    && (c.phone.contains(&digits)
                        || c.second_phone.as_deref().is_some_and(|p| p.contains(&digits))))
        })
        .take(limit)
        .collect())
}

/// Store a customer locally. `offline` customers get a queued store create.
pub fn save_new_customer(db: &DbState, mut customer: Customer, offline: bool) -> Result<Customer, String> {
    customer.validate()?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    if phone_taken(&conn, &customer.phone, "")? {
        return Err(DUPLICATE_PHONE.into());
    }
    let now = Utc::now().to_rfc3339();
    customer.id = Uuid::new_v4().to_string();
    customer.offline = offline;
    customer.created_at = now.clone();
    customer.updated_at = now;

    insert_customer(&conn, &customer)?;
    if offline {
        sync::enqueue(
            &conn,
            "customer",
            &customer.id,
            sync::Operation::Create,
            "POST",
            "customers",
            &customer.to_store_payload(),
        )?;
    }
    info!(customer_id = %customer.id, offline, "customer created");
    Ok(customer)
}

/// Create on the store first; fall back to an offline record when the store
/// cannot be reached or is not configured.
pub async fn create_customer(
    db: &DbState,
    client: Option<&StoreClient>,
    mut customer: Customer,
) -> Result<Customer, String> {
    customer.validate()?;
    let Some(client) = client else {
        return save_new_customer(db, customer, true);
    };
    // A duplicate must not leave a customer behind on the store
    {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        if phone_taken(&conn, &customer.phone, "")? {
            return Err(DUPLICATE_PHONE.into());
        }
    }
    match client
        .request("POST", "customers", &[], Some(&customer.to_store_payload()))
        .await
    {
        Ok(resp) => {
            customer.remote_id = resp.get("id").and_then(Value::as_i64);
            save_new_customer(db, customer, false)
        }
        Err(e) if api::is_transient_error(&e) => {
            warn!(error = %e, "store unreachable, saving customer offline");
            save_new_customer(db, customer, true)
        }
        Err(e) => Err(e),
    }
}

const PATCHABLE: &[&str] = &[
    "name",
    "phone",
    "second_phone",
    "address",
    "shipping_cost",
    "notes",
];

pub fn update_customer(db: &DbState, id: &str, patch: &Value) -> Result<Customer, String> {
    let obj = patch.as_object().ok_or("Patch must be a JSON object")?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let current = load_customer(&conn, id)?.ok_or(format!("Customer not found: {id}"))?;

    let mut merged = serde_json::to_value(&current).map_err(|e| e.to_string())?;
    for (k, v) in obj {
        if PATCHABLE.contains(&k.as_str()) {
            merged[k] = v.clone();
        }
    }
    let mut updated: Customer =
        serde_json::from_value(merged).map_err(|e| format!("Invalid customer patch: {e}"))?;
    updated.validate()?;
    if phone_taken(&conn, &updated.phone, id)? {
        return Err(DUPLICATE_PHONE.into());
    }
    updated.updated_at = Utc::now().to_rfc3339();

    let address = serde_json::to_string(&updated.address).map_err(|e| e.to_string())?;
    conn.execute(
        "UPDATE customers SET name = ?1, phone = ?2, second_phone = ?3, address = ?4,
                shipping_cost = ?5, notes = ?6, updated_at = ?7
         WHERE id = ?8",
        params![
            updated.name,
            updated.phone,
            updated.second_phone,
            address,
            updated.shipping_cost,
            updated.notes,
            updated.updated_at,
            id,
        ],
    )
    .map_err(|e| format!("update customer: {e}"))?;

    if let Some(remote_id) = updated.remote_id {
        sync::enqueue(
            &conn,
            "customer",
            id,
            sync::Operation::Update,
            "PUT",
            &format!("customers/{remote_id}"),
            &json!({
                "billing": updated.store_address(),
                "shipping": updated.store_address(),
            }),
        )?;
    } else if updated.offline {
        sync::replace_pending_payload(&conn, "customer", id, &updated.to_store_payload())?;
    }
    Ok(updated)
}

pub fn delete_customer(db: &DbState, id: &str) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let customer = load_customer(&conn, id)?.ok_or(format!("Customer not found: {id}"))?;
    conn.execute("DELETE FROM customers WHERE id = ?1", params![id])
        .map_err(|e| format!("delete customer: {e}"))?;
    match customer.remote_id {
        Some(remote_id) => {
            sync::enqueue(
                &conn,
                "customer",
                id,
                sync::Operation::Delete,
                "DELETE",
                &format!("customers/{remote_id}"),
                &json!({ "force": true }),
            )?;
        }
        None => {
            sync::drop_pending(&conn, "customer", id)?;
        }
    }
    info!(customer_id = %id, "customer deleted");
    Ok(())
}

// ---------------------------------------------------------------------------
// Shipping cost
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShippingSource {
    Bosta,
    CityRate,
    Customer,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShippingQuote {
    pub amount: f64,
    pub source: ShippingSource,
}

/// Delivery fee for `customer`: a live Bosta quote when Bosta is enabled
/// and the address has a city, else the configured city rate, else the
/// customer's own shipping cost, else the default delivery fee.
pub async fn resolve_shipping_cost(
    db: &DbState,
    bosta: Option<&BostaClient>,
    customer: &Customer,
    cod_amount: f64,
) -> Result<ShippingQuote, String> {
    let settings = settings::get_settings(db)?;
    let city_id = customer.address.city_id.as_deref().filter(|c| !c.is_empty());

    if let (true, Some(client), Some(city)) = (settings.bosta.enabled, bosta, city_id) {
        match client
            .shipping_fee(city, cod_amount.max(0.0), &settings.bosta.default_package_type)
            .await
        {
            Ok(quote) => {
                return Ok(ShippingQuote {
                    amount: quote.amount,
                    source: ShippingSource::Bosta,
                })
            }
            Err(e) => warn!(city, error = %e, "bosta fee lookup failed, falling back"),
        }
    }

    let rate = [city_id, customer.address.city_name.as_deref()]
        .into_iter()
        .flatten()
        .find_map(|key| settings.store.city_rates.get(key).copied());
    if let Some(amount) = rate {
        return Ok(ShippingQuote {
            amount,
            source: ShippingSource::CityRate,
        });
    }
    if customer.shipping_cost > 0.0 {
        return Ok(ShippingQuote {
            amount: customer.shipping_cost,
            source: ShippingSource::Customer,
        });
    }
    Ok(ShippingQuote {
        amount: settings.store.default_delivery_fee,
        source: ShippingSource::Default,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db;

    pub(crate) fn customer(name: &str, phone: &str) -> Customer {
        Customer {
            id: String::new(),
            name: name.into(),
            phone: phone.into(),
            second_phone: None,
            address: Address {
                city_id: Some("c1".into()),
                city_name: Some("Cairo".into()),
                street: "شارع التحرير".into(),
                building: Some("12".into()),
                ..Default::default()
            },
            shipping_cost: 0.0,
            notes: None,
            offline: false,
            remote_id: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_validate_normalizes_phones() {
        let mut c = customer(" أحمد علي ", "٠١٠١٢٣٤٥٦٧٨");
        c.second_phone = Some("+201112345678".into());
        c.validate().unwrap();
        assert_eq!(c.name, "أحمد علي");
        assert_eq!(c.phone, "01012345678");
        assert_eq!(c.second_phone.as_deref(), Some("01112345678"));

        let mut bad = customer("x", "0123");
        assert!(bad.validate().is_err());
        let mut neg = customer("x", "01012345678");
        neg.shipping_cost = -5.0;
        assert!(neg.validate().is_err());
    }

    #[test]
    fn test_offline_create_enqueues_sync() {
        let state = db::test_state();
        let c = save_new_customer(&state, customer("منى", "01012345678"), true).unwrap();
        assert!(c.offline);
        let conn = state.conn.lock().unwrap();
        let (path, entity): (String, String) = conn
            .query_row("SELECT path, entity_id FROM sync_queue", [], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();
        assert_eq!(path, "customers");
        assert_eq!(entity, c.id);
    }

    #[test]
    fn test_duplicate_phone_rejected() {
        let state = db::test_state();
        save_new_customer(&state, customer("أ", "01012345678"), false).unwrap();
        assert!(save_new_customer(&state, customer("ب", "010 1234 5678"), false).is_err());
    }

    #[tokio::test]
    async fn test_create_without_store_goes_offline() {
        let state = db::test_state();
        let c = create_customer(&state, None, customer("سارة", "01212345678"))
            .await
            .unwrap();
        assert!(c.offline);
        assert_eq!(get_customer(&state, &c.id).unwrap().name, "سارة");
    }

    #[tokio::test]
    async fn test_duplicate_phone_never_reaches_store() {
        use axum::{routing::post, Json, Router};
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/wp-json/wc/v3/customers",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Json(json!({ "id": 77 }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let client = StoreClient::new(&format!("http://{addr}"), "ck".into(), "cs".into()).unwrap();

        let state = db::test_state();
        save_new_customer(&state, customer("أ", "01012345678"), false).unwrap();
        let err = create_customer(&state, Some(&client), customer("ب", "010 1234 5678"))
            .await
            .unwrap_err();
        assert!(err.contains("بنفس"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let c = create_customer(&state, Some(&client), customer("ج", "01112345678"))
            .await
            .unwrap();
        assert_eq!(c.remote_id, Some(77));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_search_by_name_and_phone() {
        let state = db::test_state();
        save_new_customer(&state, customer("أحمد علي", "01012345678"), false).unwrap();
        save_new_customer(&state, customer("منى", "01598765432"), false).unwrap();
        assert_eq!(search_customers(&state, "احمد", 10).unwrap().len(), 1);
        assert_eq!(search_customers(&state, "٩٨٧٦", 10).unwrap()[0].name, "منى");
        assert_eq!(search_customers(&state, "", 10).unwrap().len(), 2);
    }

    #[test]
    fn test_update_and_delete() {
        let state = db::test_state();
        let c = save_new_customer(&state, customer("منى", "01012345678"), true).unwrap();
        let updated = update_customer(&state, &c.id, &serde_json::json!({ "shipping_cost": 40 })).unwrap();
        assert_eq!(updated.shipping_cost, 40.0);
        assert!(update_customer(&state, &c.id, &serde_json::json!({ "phone": "123" })).is_err());

        delete_customer(&state, &c.id).unwrap();
        let conn = state.conn.lock().unwrap();
        assert_eq!(db::count_rows(&conn, "customers"), 0);
        assert_eq!(db::count_rows(&conn, "sync_queue"), 0);
    }

    #[tokio::test]
    async fn test_shipping_cost_fallback_chain() {
        let state = db::test_state();
        settings::update_settings(
            &state,
            &serde_json::json!({ "store": { "default_delivery_fee": 50, "city_rates": { "Giza": 35 } } }),
        )
        .unwrap();

        let mut c = customer("منى", "01012345678");
        let q = resolve_shipping_cost(&state, None, &c, 100.0).await.unwrap();
        assert_eq!(q, ShippingQuote { amount: 50.0, source: ShippingSource::Default });

        c.shipping_cost = 25.0;
        let q = resolve_shipping_cost(&state, None, &c, 100.0).await.unwrap();
        assert_eq!(q.source, ShippingSource::Customer);

        c.address.city_id = None;
        c.address.city_name = Some("Giza".into());
        let q = resolve_shipping_cost(&state, None, &c, 100.0).await.unwrap();
        assert_eq!(q, ShippingQuote { amount: 35.0, source: ShippingSource::CityRate });
    }

    #[test]
    fn test_address_one_line() {
        let c = customer("x", "01012345678");
        assert_eq!(c.address.one_line(), "شارع التحرير، عمارة 12");
    }
}
