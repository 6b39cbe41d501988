//! Checkout and invoice lifecycle.
//!
//! `checkout_tab` turns the cart of a POS tab into a numbered invoice in a
//! single SQLite transaction: totals, stock check, stock decrement, queued
//! store order, cart reset. Later payments and delivery updates reconcile the
//! invoice and queue the matching store order update.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::{self, ProductKind};
use crate::customers::{self, Customer};
use crate::db::DbState;
use crate::pricing::{
    self, CartLine, CheckoutSummary, LineKind, PaymentReconciliation, PaymentState, PaymentStatus,
};
use crate::sync;
use crate::tabs;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Shipped,
    Delivered,
    Returned,
    Cancelled,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Shipped => "shipped",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Returned => "returned",
            DeliveryStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "pending" => Some(DeliveryStatus::Pending),
            "shipped" => Some(DeliveryStatus::Shipped),
            "delivered" => Some(DeliveryStatus::Delivered),
            "returned" => Some(DeliveryStatus::Returned),
            "cancelled" | "canceled" => Some(DeliveryStatus::Cancelled),
            _ => None,
        }
    }

    /// Goods are back on the shelf.
    fn restocks(&self) -> bool {
        matches!(self, DeliveryStatus::Returned | DeliveryStatus::Cancelled)
    }

    fn store_status(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending | DeliveryStatus::Shipped => "processing",
            DeliveryStatus::Delivered => "completed",
            DeliveryStatus::Returned => "refunded",
            DeliveryStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoicePayment {
    pub id: String,
    pub amount: f64,
    pub method: String,
    pub note: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub number: String,
    pub tab_id: Option<String>,
    pub customer_id: Option<String>,
    pub items: Vec<CartLine>,
    pub summary: CheckoutSummary,
    pub total: f64,
    pub amount_paid: f64,
    pub payment_status: PaymentStatus,
    pub delivery_status: DeliveryStatus,
    pub payments: Vec<InvoicePayment>,
    pub remote_order_id: Option<i64>,
    pub sync_status: String,
    pub notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Invoice {
    pub fn reconciliation(&self) -> PaymentReconciliation {
        let amounts: Vec<f64> = self.payments.iter().map(|p| p.amount).collect();
        pricing::reconcile_payments(self.total, &amounts)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockShortage {
    pub product_id: i64,
    pub variation_id: Option<i64>,
    pub name: String,
    pub requested: i64,
    pub available: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CheckoutOptions {
    #[serde(alias = "allowOversell")]
    pub allow_oversell: bool,
    pub notes: Option<String>,
}

// ---------------------------------------------------------------------------
// Stock verification
// ---------------------------------------------------------------------------

/// Product lines whose requested quantity exceeds cached managed stock.
/// Quantities of repeated lines for the same item are summed.
pub fn verify_stock(conn: &Connection, lines: &[CartLine]) -> Result<Vec<StockShortage>, String> {
    let mut requested: BTreeMap<(i64, Option<i64>), (String, i64)> = BTreeMap::new();
    for line in lines.iter().filter(|l| l.kind == LineKind::Product) {
        let Some(pid) = line.product_id else { continue };
        let entry = requested
            .entry((pid, line.variation_id))
            .or_insert_with(|| (line.name.clone(), 0));
        entry.1 += i64::from(line.quantity);
    }

    let mut shortages = Vec::new();
    for ((pid, vid), (name, qty)) in requested {
        let available = match catalog::get_cached(conn, pid)? {
            None => Some(0),
            Some(product) => match (product.kind, vid) {
                (ProductKind::Variable, Some(vid)) => match product.variation(vid) {
                    Some(v) if v.manage_stock => Some(v.stock_quantity.unwrap_or(0).max(0)),
                    Some(_) => None,
                    None => Some(0),
                },
                _ if product.manage_stock => Some(product.stock_quantity.unwrap_or(0).max(0)),
                _ => None,
            },
        };
        if let Some(available) = available {
            if qty > available {
                shortages.push(StockShortage {
                    product_id: pid,
                    variation_id: vid,
                    name,
                    requested: qty,
                    available,
                });
            }
        }
    }
    Ok(shortages)
}

pub fn verify_stock_db(db: &DbState, lines: &[CartLine]) -> Result<Vec<StockShortage>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    verify_stock(&conn, lines)
}

fn shortage_message(shortages: &[StockShortage]) -> String {
    let details: Vec<String> = shortages
        .iter()
        .map(|s| format!("{} (المطلوب {}، المتاح {})", s.name, s.requested, s.available))
        .collect();
    format!("الكمية غير متوفرة في المخزون: {}", details.join("، "))
}

// ---------------------------------------------------------------------------
// Store order payload
// ---------------------------------------------------------------------------

fn money(value: f64) -> String {
    format!("{value:.2}")
}

/// WooCommerce order body for an invoice.
///
/// Service lines, the extra fee and the delivery fee become fee lines; the
/// discount is a negative fee line since the till does not use coupons.
pub fn build_order_payload(invoice: &Invoice, customer: Option<&Customer>) -> Value {
    let line_items: Vec<Value> = invoice
        .items
        .iter()
        .filter(|l| l.kind == LineKind::Product && l.product_id.is_some_and(|id| id > 0))
        .map(|l| {
            let total = money(l.line_total());
            let mut item = json!({
                "product_id": l.product_id,
                "quantity": l.quantity,
                "subtotal": total,
                "total": total,
            });
            if let Some(vid) = l.variation_id {
                item["variation_id"] = json!(vid);
            }
            item
        })
        .collect();

    let mut fee_lines: Vec<Value> = invoice
        .items
        .iter()
        .filter(|l| {
            l.kind == LineKind::Service || l.product_id.is_some_and(|id| id <= 0)
        })
        .map(|l| json!({ "name": l.name, "total": money(l.line_total()) }))
        .collect();
    let s = &invoice.summary;
    if s.discount > 0.0 {
        fee_lines.push(json!({ "name": "خصم", "total": money(-s.discount) }));
    }
    if s.extra_fee > 0.0 {
        fee_lines.push(json!({ "name": "رسوم إضافية", "total": money(s.extra_fee) }));
    }
    if s.delivery_fee > 0.0 {
        fee_lines.push(json!({ "name": "مصاريف الشحن", "total": money(s.delivery_fee) }));
    }

    let set_paid = invoice.payment_status == PaymentStatus::FullyPaid;
    let mut body = json!({
        "status": invoice.delivery_status.store_status(),
        "set_paid": set_paid,
        "payment_method": if set_paid { "pos" } else { "cod" },
        "payment_method_title": if set_paid { "POS" } else { "Cash on delivery" },
        "line_items": line_items,
        "fee_lines": fee_lines,
        "customer_note": invoice.notes.clone().unwrap_or_default(),
        "meta_data": [
            { "key": "_pos_invoice_number", "value": invoice.number },
            { "key": "_pos_payment_status", "value": invoice.payment_status.as_str() },
            { "key": "_pos_delivery_status", "value": invoice.delivery_status.as_str() },
            { "key": "_pos_amount_paid", "value": money(invoice.amount_paid) },
            { "key": "_pos_amount_to_collect", "value": money(invoice.reconciliation().remaining) },
        ],
    });
    if let Some(c) = customer {
        body["billing"] = c.store_address();
        body["shipping"] = c.store_address();
        if let Some(remote) = c.remote_id {
            body["customer_id"] = json!(remote);
        }
    }
    body
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

const COLUMNS: &str = "id, number, tab_id, customer_id, items, summary, total, amount_paid, \
                       payment_status, delivery_status, remote_order_id, sync_status, notes, \
                       created_at, updated_at";

fn row_to_invoice(row: &rusqlite::Row<'_>) -> rusqlite::Result<Invoice> {
    let items: String = row.get(4)?;
    let summary: String = row.get(5)?;
    let payment_status: String = row.get(8)?;
    let delivery_status: String = row.get(9)?;
    Ok(Invoice {
        id: row.get(0)?,
        number: row.get(1)?,
        tab_id: row.get(2)?,
        customer_id: row.get(3)?,
        items: serde_json::from_str(&items).unwrap_or_default(),
        summary: serde_json::from_str(&summary).unwrap_or_default(),
        total: row.get(6)?,
        amount_paid: row.get(7)?,
        payment_status: PaymentStatus::parse(&payment_status).unwrap_or_default(),
        delivery_status: DeliveryStatus::parse(&delivery_status).unwrap_or_default(),
        payments: Vec::new(),
        remote_order_id: row.get(10)?,
        sync_status: row.get(11)?,
        notes: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn load_payments(conn: &Connection, invoice_id: &str) -> Result<Vec<InvoicePayment>, String> {
    let mut stmt = conn
        .prepare(
            "SELECT id, amount, method, note, created_at FROM invoice_payments
             WHERE invoice_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )
        .map_err(|e| format!("list payments: {e}"))?;
    let rows = stmt
        .query_map(params![invoice_id], |row| {
            Ok(InvoicePayment {
                id: row.get(0)?,
                amount: row.get(1)?,
                method: row.get(2)?,
                note: row.get(3)?,
                created_at: row.get(4)?,
            })
        })
        .map_err(|e| format!("list payments: {e}"))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub(crate) fn load_invoice(conn: &Connection, id: &str) -> Result<Invoice, String> {
    let mut invoice = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM invoices WHERE id = ?1 OR number = ?1"),
            params![id],
            row_to_invoice,
        )
        .optional()
        .map_err(|e| format!("get invoice: {e}"))?
        .ok_or(format!("Invoice not found: {id}"))?;
    invoice.payments = load_payments(conn, &invoice.id)?;
    Ok(invoice)
}

fn insert_payment(
    conn: &Connection,
    invoice_id: &str,
    amount: f64,
    method: &str,
    note: Option<&str>,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO invoice_payments (id, invoice_id, amount, method, note, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            Uuid::new_v4().to_string(),
            invoice_id,
            amount,
            method,
            note,
            Utc::now().to_rfc3339()
        ],
    )
    .map_err(|e| format!("insert payment: {e}"))?;
    Ok(())
}

fn next_seq(conn: &Connection) -> Result<i64, String> {
    conn.query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM invoices", [], |row| {
        row.get(0)
    })
    .map_err(|e| format!("next invoice number: {e}"))
}

fn in_transaction<T>(conn: &Connection, work: impl FnOnce() -> Result<T, String>) -> Result<T, String> {
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;
    match work() {
        Ok(v) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
            Ok(v)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Move cached stock for every product line by `sign × quantity`.
fn move_stock(conn: &Connection, items: &[CartLine], sign: i64) {
    for line in items.iter().filter(|l| l.kind == LineKind::Product) {
        let Some(pid) = line.product_id else { continue };
        if let Err(e) = catalog::adjust_stock(conn, pid, line.variation_id, sign * i64::from(line.quantity)) {
            warn!(product_id = pid, error = %e, "stock not adjusted");
        }
    }
}

/// Queue the store side of every invoice still marked `pending`: a create
/// for orders the store has never seen, an update for the rest.
pub(crate) fn requeue_unsynced(conn: &Connection) -> Result<usize, String> {
    let mut stmt = conn
        .prepare("SELECT id FROM invoices WHERE sync_status = 'pending' ORDER BY seq")
        .map_err(|e| format!("list unsynced invoices: {e}"))?;
    let ids: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .map_err(|e| format!("list unsynced invoices: {e}"))?
        .filter_map(|r| r.ok())
        .collect();
    for id in &ids {
        let invoice = load_invoice(conn, id)?;
        if invoice.remote_order_id.is_some() {
            queue_order_update(conn, &invoice)?;
            continue;
        }
        let customer = match &invoice.customer_id {
            Some(cid) => customers::load_customer(conn, cid)?,
            None => None,
        };
        sync::enqueue(
            conn,
            "order",
            &invoice.id,
            sync::Operation::Create,
            "POST",
            "orders",
            &build_order_payload(&invoice, customer.as_ref()),
        )?;
    }
    Ok(ids.len())
}

/// Queue a store update for an invoice, or refresh its pending create when
/// the order has not reached the store yet.
fn queue_order_update(conn: &Connection, invoice: &Invoice) -> Result<(), String> {
    let customer = match &invoice.customer_id {
        Some(cid) => customers::load_customer(conn, cid)?,
        None => None,
    };
    let payload = build_order_payload(invoice, customer.as_ref());
    match invoice.remote_order_id {
        Some(remote) => {
            let body = json!({
                "status": payload["status"],
                "set_paid": payload["set_paid"],
                "meta_data": payload["meta_data"],
            });
            sync::enqueue(
                conn,
                "order",
                &invoice.id,
                sync::Operation::Update,
                "PUT",
                &format!("orders/{remote}"),
                &body,
            )?;
        }
        None => {
            sync::replace_pending_payload(conn, "order", &invoice.id, &payload)?;
        }
    }
    conn.execute(
        "UPDATE invoices SET sync_status = 'pending' WHERE id = ?1",
        params![invoice.id],
    )
    .map_err(|e| format!("update invoice sync status: {e}"))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Turn the cart of `tab_id` into an invoice.
///
/// Rejected when the cart is empty, does not price, or (unless
/// `allow_oversell`) asks for more than the cached stock.
pub fn checkout_tab(db: &DbState, tab_id: &str, options: &CheckoutOptions) -> Result<Invoice, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let tab = tabs::load_tab(&conn, tab_id)?;
    if tab.is_empty() {
        return Err("السلة فارغة".into());
    }
    let summary = tab.summary()?;
    let shortages = verify_stock(&conn, &tab.cart.checkout.lines)?;
    if !shortages.is_empty() {
        if !options.allow_oversell {
            return Err(shortage_message(&shortages));
        }
        warn!(tab_id, count = shortages.len(), "checkout overselling stock");
    }
    if let Some(cid) = &tab.cart.customer_id {
        if customers::load_customer(&conn, cid)?.is_none() {
            return Err(format!("Customer not found: {cid}"));
        }
    }

    let invoice = in_transaction(&conn, || {
        let seq = next_seq(&conn)?;
        let now = Utc::now().to_rfc3339();
        let prepaid = summary.prepaid;
        let mut invoice = Invoice {
            id: Uuid::new_v4().to_string(),
            number: format!("INV-{seq:06}"),
            tab_id: Some(tab.id.clone()),
            customer_id: tab.cart.customer_id.clone(),
            items: tab.cart.checkout.lines.clone(),
            summary: summary.clone(),
            total: summary.total,
            amount_paid: prepaid,
            payment_status: summary.payment_status,
            delivery_status: DeliveryStatus::Pending,
            payments: Vec::new(),
            remote_order_id: None,
            sync_status: "pending".into(),
            notes: options.notes.clone().or_else(|| tab.cart.notes.clone()),
            created_at: now.clone(),
            updated_at: now.clone(),
        };

        conn.execute(
            "INSERT INTO invoices (id, number, seq, tab_id, customer_id, items, summary, total,
                                   amount_paid, payment_status, delivery_status, sync_status,
                                   notes, created_at, updated_at, reconcile_until)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'pending', ?12, ?13, ?13, ?14)",
            params![
                invoice.id,
                invoice.number,
                seq,
                invoice.tab_id,
                invoice.customer_id,
                serde_json::to_string(&invoice.items).map_err(|e| e.to_string())?,
                serde_json::to_string(&invoice.summary).map_err(|e| e.to_string())?,
                invoice.total,
                invoice.amount_paid,
                invoice.payment_status.as_str(),
                invoice.delivery_status.as_str(),
                invoice.notes,
                now,
                sync::reconcile_deadline(),
            ],
        )
        .map_err(|e| format!("insert invoice: {e}"))?;

        if prepaid > 0.0 {
            insert_payment(&conn, &invoice.id, prepaid, "prepaid", None)?;
        }
        move_stock(&conn, &invoice.items, -1);

        let customer = match &invoice.customer_id {
            Some(cid) => customers::load_customer(&conn, cid)?,
            None => None,
        };
        invoice.payments = load_payments(&conn, &invoice.id)?;
        sync::enqueue(
            &conn,
            "order",
            &invoice.id,
            sync::Operation::Create,
            "POST",
            "orders",
            &build_order_payload(&invoice, customer.as_ref()),
        )?;
        tabs::reset_cart(&conn, &tab.id)?;
        Ok(invoice)
    })?;

    info!(
        invoice = %invoice.number,
        total = invoice.total,
        payment_status = invoice.payment_status.as_str(),
        "checkout complete"
    );
    Ok(invoice)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InvoiceFilter {
    /// Inclusive `YYYY-MM-DD` bounds on `created_at`.
    pub from: Option<String>,
    pub to: Option<String>,
    pub payment_status: Option<PaymentStatus>,
    pub delivery_status: Option<DeliveryStatus>,
    pub customer_id: Option<String>,
    /// Invoice number fragment.
    pub q: Option<String>,
    pub limit: Option<usize>,
}

pub fn list_invoices(db: &DbState, filter: &InvoiceFilter) -> Result<Vec<Invoice>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut sql = format!("SELECT {COLUMNS} FROM invoices WHERE 1=1");
    let mut args: Vec<String> = Vec::new();
    if let Some(from) = &filter.from {
        args.push(from.clone());
        sql.push_str(&format!(" AND substr(created_at, 1, 10) >= ?{}", args.len()));
    }
    if let Some(to) = &filter.to {
        args.push(to.clone());
        sql.push_str(&format!(" AND substr(created_at, 1, 10) <= ?{}", args.len()));
    }
    if let Some(ps) = filter.payment_status {
        args.push(ps.as_str().to_string());
        sql.push_str(&format!(" AND payment_status = ?{}", args.len()));
    }
    if let Some(ds) = filter.delivery_status {
        args.push(ds.as_str().to_string());
        sql.push_str(&format!(" AND delivery_status = ?{}", args.len()));
    }
    if let Some(cid) = &filter.customer_id {
        args.push(cid.clone());
        sql.push_str(&format!(" AND customer_id = ?{}", args.len()));
    }
    if let Some(q) = filter.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        args.push(format!("%{q}%"));
        sql.push_str(&format!(" AND number LIKE ?{}", args.len()));
    }
    sql.push_str(&format!(
        " ORDER BY seq DESC LIMIT {}",
        filter.limit.unwrap_or(200).min(1000)
    ));

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| format!("list invoices: {e}"))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), row_to_invoice)
        .map_err(|e| format!("list invoices: {e}"))?;
    let mut invoices: Vec<Invoice> = rows.filter_map(|r| r.ok()).collect();
    for invoice in &mut invoices {
        invoice.payments = load_payments(&conn, &invoice.id)?;
    }
    Ok(invoices)
}

pub fn get_invoice(db: &DbState, id: &str) -> Result<Invoice, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    load_invoice(&conn, id)
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentResult {
    pub invoice: Invoice,
    pub reconciliation: PaymentReconciliation,
}

/// Record a (partial) payment against an invoice. Once nothing remains the
/// invoice becomes `fully_paid`; overpayment is reported as change.
pub fn add_payment(db: &DbState, id: &str, amount: f64, method: &str) -> Result<PaymentResult, String> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err("المبلغ يجب أن يكون أكبر من صفر".into());
    }
    pricing::check_amount(amount, "payment")?;
    let method = match method.trim() {
        "" => "cash",
        m => m,
    };
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let current = load_invoice(&conn, id)?;
    if current.delivery_status == DeliveryStatus::Cancelled {
        return Err("لا يمكن تسجيل دفعة على فاتورة ملغاة".into());
    }
    if current.reconciliation().state == PaymentState::Paid {
        return Err("الفاتورة مدفوعة بالكامل".into());
    }

    let invoice = in_transaction(&conn, || {
        insert_payment(&conn, &current.id, pricing::round_money(amount), method, None)?;
        let mut invoice = load_invoice(&conn, &current.id)?;
        let rec = invoice.reconciliation();
        invoice.amount_paid = rec.paid;
        if rec.state == PaymentState::Paid {
            invoice.payment_status = PaymentStatus::FullyPaid;
        }
        invoice.updated_at = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE invoices SET amount_paid = ?1, payment_status = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                invoice.amount_paid,
                invoice.payment_status.as_str(),
                invoice.updated_at,
                invoice.id
            ],
        )
        .map_err(|e| format!("update invoice payment: {e}"))?;
        queue_order_update(&conn, &invoice)?;
        Ok(invoice)
    })?;

    let reconciliation = invoice.reconciliation();
    info!(
        invoice = %invoice.number,
        amount,
        remaining = reconciliation.remaining,
        "payment recorded"
    );
    Ok(PaymentResult {
        invoice,
        reconciliation,
    })
}

/// Change the delivery status. Entering returned or cancelled puts the goods
/// back in stock; leaving returned takes them off again. Cancelled is final.
pub fn set_delivery_status(db: &DbState, id: &str, status: DeliveryStatus) -> Result<Invoice, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let current = load_invoice(&conn, id)?;
    if current.delivery_status == status {
        return Ok(current);
    }
    if current.delivery_status == DeliveryStatus::Cancelled {
        return Err("الفاتورة ملغاة بالفعل".into());
    }

    let invoice = in_transaction(&conn, || {
        let now = Utc::now().to_rfc3339();
        // +1 when goods come back, -1 when a returned order goes out again
        let stock_sign = match (current.delivery_status.restocks(), status.restocks()) {
            (false, true) => 1,
            (true, false) => -1,
            _ => 0,
        };
        conn.execute(
            "UPDATE invoices SET delivery_status = ?1, updated_at = ?2,
                    reconcile_until = CASE WHEN ?3 THEN ?4 ELSE reconcile_until END
             WHERE id = ?5",
            params![status.as_str(), now, stock_sign != 0, sync::reconcile_deadline(), current.id],
        )
        .map_err(|e| format!("update delivery status: {e}"))?;
        if stock_sign != 0 {
            move_stock(&conn, &current.items, stock_sign);
        }

        let invoice = load_invoice(&conn, &current.id)?;
        let unsynced_create = invoice.remote_order_id.is_none();
        if status == DeliveryStatus::Cancelled && unsynced_create {
            // Never reached the store: drop the create instead of cancelling.
            sync::drop_pending(&conn, "order", &invoice.id)?;
            conn.execute(
                "UPDATE invoices SET sync_status = 'local_only' WHERE id = ?1",
                params![invoice.id],
            )
            .map_err(|e| format!("update invoice sync status: {e}"))?;
        } else {
            queue_order_update(&conn, &invoice)?;
        }
        load_invoice(&conn, &current.id)
    })?;

    info!(invoice = %invoice.number, status = status.as_str(), "delivery status changed");
    Ok(invoice)
}

pub fn cancel_invoice(db: &DbState, id: &str) -> Result<Invoice, String> {
    set_delivery_status(db, id, DeliveryStatus::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Product, StockStatus, Variation, VariationAttribute};
    use crate::db;
    use crate::pricing::{Adjustment, AdjustmentMode};

    fn product(id: i64, stock: Option<i64>) -> Product {
        Product {
            id,
            name: format!("P{id}"),
            sku: String::new(),
            barcode: None,
            kind: ProductKind::Simple,
            regular_price: 100.0,
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

    fn line(pid: i64, qty: u32) -> CartLine {
        CartLine {
            product_id: Some(pid),
            variation_id: None,
            name: format!("P{pid}"),
            unit_price: 100.0,
            quantity: qty,
            kind: LineKind::Product,
        }
    }

    fn seed(state: &DbState) {
        let conn = state.conn.lock().unwrap();
        catalog::upsert_cached(&conn, &product(1, Some(5))).unwrap();
        catalog::upsert_cached(&conn, &product(2, None)).unwrap();
    }

    fn tab_with(state: &DbState, lines: &[CartLine], options: Value) -> String {
        let tab = tabs::open_tab(state, None).unwrap();
        for l in lines {
            tabs::add_line(state, &tab.id, l.clone()).unwrap();
        }
        tabs::set_checkout_options(state, &tab.id, &options).unwrap();
        tab.id
    }

    fn stock_of(state: &DbState, id: i64) -> Option<i64> {
        let conn = state.conn.lock().unwrap();
        catalog::get_cached(&conn, id).unwrap().unwrap().stock_quantity
    }

    #[test]
    fn test_verify_stock_sums_lines() {
        let state = db::test_state();
        seed(&state);
        let conn = state.conn.lock().unwrap();
        let shortages = verify_stock(&conn, &[line(1, 3), line(1, 3), line(2, 50)]).unwrap();
        assert_eq!(shortages.len(), 1);
        assert_eq!(shortages[0].requested, 6);
        assert_eq!(shortages[0].available, 5);
        assert!(verify_stock(&conn, &[line(99, 1)]).unwrap()[0].available == 0);
    }

    #[test]
    fn test_verify_stock_variations() {
        let state = db::test_state();
        let mut p = product(3, None);
        p.kind = ProductKind::Variable;
        p.variations = vec![Variation {
            id: 31,
            sku: String::new(),
            regular_price: 10.0,
            sale_price: None,
            stock_quantity: Some(1),
            manage_stock: true,
            attributes: vec![VariationAttribute {
                name: "size".into(),
                option: "L".into(),
            }],
        }];
        let conn = state.conn.lock().unwrap();
        catalog::upsert_cached(&conn, &p).unwrap();
        let mut l = line(3, 2);
        l.variation_id = Some(31);
        let shortages = verify_stock(&conn, &[l]).unwrap();
        assert_eq!(shortages[0].variation_id, Some(31));
    }

    #[test]
    fn test_checkout_creates_invoice_and_moves_stock() {
        let state = db::test_state();
        seed(&state);
        let tab = tab_with(
            &state,
            &[line(1, 2), line(2, 1)],
            json!({ "delivery_fee": 30, "payment_status": "half_paid" }),
        );

        let invoice = checkout_tab(&state, &tab, &CheckoutOptions::default()).unwrap();
        assert_eq!(invoice.number, "INV-000001");
        assert_eq!(invoice.total, 330.0);
        // half of the goods (300 / 2) prepaid
        assert_eq!(invoice.amount_paid, 150.0);
        assert_eq!(invoice.payments.len(), 1);
        assert_eq!(stock_of(&state, 1), Some(3));

        assert!(tabs::get_tab(&state, &tab).unwrap().is_empty());
        let conn = state.conn.lock().unwrap();
        let path: String = conn
            .query_row("SELECT path FROM sync_queue WHERE entity_type = 'order'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(path, "orders");
    }

    #[test]
    fn test_checkout_rejects_shortage_unless_oversell() {
        let state = db::test_state();
        seed(&state);
        let tab = tab_with(&state, &[line(1, 9)], json!({}));
        let err = checkout_tab(&state, &tab, &CheckoutOptions::default()).unwrap_err();
        assert!(err.contains("P1"));
        assert!(!tabs::get_tab(&state, &tab).unwrap().is_empty());

        let invoice = checkout_tab(
            &state,
            &tab,
            &CheckoutOptions {
                allow_oversell: true,
                notes: None,
            },
        )
        .unwrap();
        assert_eq!(invoice.number, "INV-000001");
        assert_eq!(stock_of(&state, 1), Some(0));
    }

    #[test]
    fn test_empty_cart_rejected() {
        let state = db::test_state();
        let tab = tabs::open_tab(&state, None).unwrap();
        assert!(checkout_tab(&state, &tab.id, &CheckoutOptions::default()).is_err());
    }

    #[test]
    fn test_numbers_increase() {
        let state = db::test_state();
        seed(&state);
        let a = tab_with(&state, &[line(2, 1)], json!({}));
        let first = checkout_tab(&state, &a, &CheckoutOptions::default()).unwrap();
        tabs::add_line(&state, &a, line(2, 1)).unwrap();
        let second = checkout_tab(&state, &a, &CheckoutOptions::default()).unwrap();
        assert_eq!(first.number, "INV-000001");
        assert_eq!(second.number, "INV-000002");
        assert_eq!(get_invoice(&state, "INV-000002").unwrap().id, second.id);
    }

    #[test]
    fn test_partial_payments_until_paid() {
        let state = db::test_state();
        seed(&state);
        let tab = tab_with(&state, &[line(2, 2)], json!({}));
        let invoice = checkout_tab(&state, &tab, &CheckoutOptions::default()).unwrap();
        assert_eq!(invoice.amount_paid, 0.0);

        let r = add_payment(&state, &invoice.id, 50.0, "cash").unwrap();
        assert_eq!(r.reconciliation.remaining, 150.0);
        assert_eq!(r.invoice.payment_status, PaymentStatus::CashOnDelivery);

        let r = add_payment(&state, &invoice.id, 170.0, "card").unwrap();
        assert_eq!(r.reconciliation.change, 20.0);
        assert_eq!(r.invoice.payment_status, PaymentStatus::FullyPaid);
        assert!(add_payment(&state, &invoice.id, 1.0, "cash").is_err());
        assert!(add_payment(&state, &invoice.id, -1.0, "cash").is_err());
    }

    #[test]
    fn test_cancel_restores_stock_once_and_drops_unsynced_order() {
        let state = db::test_state();
        seed(&state);
        let tab = tab_with(&state, &[line(1, 2)], json!({}));
        let invoice = checkout_tab(&state, &tab, &CheckoutOptions::default()).unwrap();
        assert_eq!(stock_of(&state, 1), Some(3));

        set_delivery_status(&state, &invoice.id, DeliveryStatus::Returned).unwrap();
        assert_eq!(stock_of(&state, 1), Some(5));
        let cancelled = cancel_invoice(&state, &invoice.id).unwrap();
        assert_eq!(cancelled.delivery_status, DeliveryStatus::Cancelled);
        assert_eq!(stock_of(&state, 1), Some(5));
        assert_eq!(cancelled.sync_status, "local_only");
        assert!(set_delivery_status(&state, &invoice.id, DeliveryStatus::Delivered).is_err());

        let conn = state.conn.lock().unwrap();
        let orders: i64 = conn
            .query_row("SELECT COUNT(*) FROM sync_queue WHERE entity_type = 'order'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(orders, 0);
    }

    #[test]
    fn test_return_then_redeliver_takes_stock_again() {
        let state = db::test_state();
        seed(&state);
        let tab = tab_with(&state, &[line(1, 2)], json!({}));
        let invoice = checkout_tab(&state, &tab, &CheckoutOptions::default()).unwrap();
        assert_eq!(stock_of(&state, 1), Some(3));

        set_delivery_status(&state, &invoice.id, DeliveryStatus::Returned).unwrap();
        assert_eq!(stock_of(&state, 1), Some(5));
        set_delivery_status(&state, &invoice.id, DeliveryStatus::Delivered).unwrap();
        assert_eq!(stock_of(&state, 1), Some(3));
        set_delivery_status(&state, &invoice.id, DeliveryStatus::Shipped).unwrap();
        assert_eq!(stock_of(&state, 1), Some(3));

        set_delivery_status(&state, &invoice.id, DeliveryStatus::Returned).unwrap();
        cancel_invoice(&state, &invoice.id).unwrap();
        assert_eq!(stock_of(&state, 1), Some(5));
    }

    #[test]
    fn test_payment_above_supported_amount_rejected() {
        let state = db::test_state();
        seed(&state);
        let tab = tab_with(&state, &[line(2, 1)], json!({}));
        let invoice = checkout_tab(&state, &tab, &CheckoutOptions::default()).unwrap();
        let err = add_payment(&state, &invoice.id, 1e30, "cash").unwrap_err();
        assert!(err.contains("supported amount"));
        assert!(get_invoice(&state, &invoice.id).unwrap().payments.is_empty());
    }

    #[test]
    fn test_order_payload_fee_lines() {
        let mut service = line(0, 1);
        service.product_id = None;
        service.kind = LineKind::Service;
        service.name = "تغليف".into();
        service.unit_price = 20.0;
        let input = pricing::CheckoutInput {
            lines: vec![line(1, 2), service.clone()],
            discount: Some(Adjustment {
                mode: AdjustmentMode::Fixed,
                value: 10.0,
            }),
            delivery_fee: 30.0,
            payment_status: PaymentStatus::FullyPaid,
            ..Default::default()
        };
        let summary = pricing::calculate(&input).unwrap();
        let invoice = Invoice {
            id: "i".into(),
            number: "INV-000009".into(),
            tab_id: None,
            customer_id: None,
            items: input.lines.clone(),
            total: summary.total,
            amount_paid: summary.total,
            payment_status: PaymentStatus::FullyPaid,
            summary,
            delivery_status: DeliveryStatus::Pending,
            payments: vec![],
            remote_order_id: None,
            sync_status: "pending".into(),
            notes: None,
            created_at: String::new(),
            updated_at: String::new(),
        };
        let body = build_order_payload(&invoice, None);
        assert_eq!(body["line_items"].as_array().unwrap().len(), 1);
        assert_eq!(body["line_items"][0]["total"], "200.00");
        let fees: Vec<(String, String)> = body["fee_lines"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| (f["name"].as_str().unwrap().to_string(), f["total"].as_str().unwrap().to_string()))
            .collect();
        assert_eq!(
            fees,
            vec![
                ("تغليف".to_string(), "20.00".to_string()),
                ("خصم".to_string(), "-10.00".to_string()),
                ("مصاريف الشحن".to_string(), "30.00".to_string()),
            ]
        );
        assert_eq!(body["set_paid"], true);
    }
}
