//! Checkout total calculator.
//!
//! Sums product lines and service lines, applies a discount (percentage or
//! fixed, scoped to products, services or both), adds an extra fee and the
//! delivery fee, and works out how much the courier has to collect for each
//! delivery-payment status. Also reconciles partial payments against an
//! invoice total.
//!
//! Arithmetic runs on `rust_decimal`; results are rounded to 2 decimal
//! places (half away from zero) and exposed as `f64` for JSON.

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};

const DECIMAL_PLACES: u32 = 2;

/// Largest money amount accepted anywhere (prices, fees, payments, salaries).
pub const MAX_AMOUNT: f64 = 1_000_000_000.0;

/// Largest quantity accepted on one cart line.
pub const MAX_QUANTITY: u32 = 100_000;

/// Accept a money amount in `0..=MAX_AMOUNT`.
pub(crate) fn check_amount(value: f64, what: &str) -> Result<(), String> {
    if !value.is_finite() || value < 0.0 {
        return Err(format!("The {what} cannot be negative"));
    }
    if value > MAX_AMOUNT {
        return Err(format!("The {what} exceeds the supported amount ({MAX_AMOUNT})"));
    }
    Ok(())
}

/// Inputs are bounded by [`check_amount`] before they get here; anything
/// outside the decimal range would read as zero.
#[inline]
pub(crate) fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or_default()
}

#[inline]
pub(crate) fn round(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(DECIMAL_PLACES, RoundingStrategy::MidpointAwayFromZero)
}

#[inline]
pub(crate) fn to_f64(value: Decimal) -> f64 {
    round(value).to_f64().unwrap_or_default()
}

/// Round an amount to piasters, half away from zero.
pub fn round_money(value: f64) -> f64 {
    to_f64(to_decimal(value))
}

// ---------------------------------------------------------------------------
// Input types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    #[default]
    Product,
    Service,
}

/// One cart line as the cashier sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartLine {
    #[serde(default, alias = "productId")]
    pub product_id: Option<i64>,
    #[serde(default, alias = "variationId")]
    pub variation_id: Option<i64>,
    pub name: String,
    #[serde(alias = "unitPrice", alias = "price")]
    pub unit_price: f64,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub kind: LineKind,
}

fn default_quantity() -> u32 {
    1
}

impl CartLine {
    /// Same product/variation (service lines match by name).
    pub fn same_item(&self, other: &CartLine) -> bool {
        match (self.kind, other.kind) {
            (LineKind::Product, LineKind::Product) => {
                self.product_id.is_some()
                    && self.product_id == other.product_id
                    && self.variation_id == other.variation_id
            }
            (LineKind::Service, LineKind::Service) => self.name == other.name,
            _ => false,
        }
    }

    pub fn line_total(&self) -> f64 {
        to_f64(to_decimal(self.unit_price).saturating_mul(Decimal::from(self.quantity)))
    }

    /// Price and quantity inside the supported range.
    pub fn check_bounds(&self) -> Result<(), String> {
        check_amount(self.unit_price, &format!("price of \"{}\"", self.name))?;
        if self.quantity > MAX_QUANTITY {
            return Err(format!(
                "The quantity of \"{}\" exceeds the maximum of {MAX_QUANTITY}",
                self.name
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentMode {
    Percentage,
    Fixed,
}

/// A discount or extra fee entered at the till.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub mode: AdjustmentMode,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountScope {
    Products,
    Services,
    #[default]
    Both,
}

/// Who has paid what before the parcel leaves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    CashOnDelivery,
    HalfPaid,
    FullyPaid,
    FullyPaidNoDeliveryFee,
}

impl PaymentStatus {
    pub const ALL: [PaymentStatus; 4] = [
        PaymentStatus::CashOnDelivery,
        PaymentStatus::HalfPaid,
        PaymentStatus::FullyPaid,
        PaymentStatus::FullyPaidNoDeliveryFee,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::CashOnDelivery => "cash_on_delivery",
            PaymentStatus::HalfPaid => "half_paid",
            PaymentStatus::FullyPaid => "fully_paid",
            PaymentStatus::FullyPaidNoDeliveryFee => "fully_paid_no_delivery_fee",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().replace('-', "_").as_str() {
            "cash_on_delivery" | "cod" => Some(PaymentStatus::CashOnDelivery),
            "half_paid" => Some(PaymentStatus::HalfPaid),
            "fully_paid" | "paid" => Some(PaymentStatus::FullyPaid),
            "fully_paid_no_delivery_fee" => Some(PaymentStatus::FullyPaidNoDeliveryFee),
            _ => None,
        }
    }
}

/// Everything the calculator needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckoutInput {
    #[serde(default)]
    pub lines: Vec<CartLine>,
    #[serde(default)]
    pub discount: Option<Adjustment>,
    #[serde(default, alias = "discountScope")]
    pub discount_scope: DiscountScope,
    #[serde(default, alias = "extraFee")]
    pub extra_fee: Option<Adjustment>,
    #[serde(default, alias = "deliveryFee")]
    pub delivery_fee: f64,
    #[serde(default, alias = "paymentStatus")]
    pub payment_status: PaymentStatus,
    /// Amount prepaid for `half_paid`; defaults to half of the goods total.
    #[serde(default, alias = "prepaidAmount")]
    pub prepaid_amount: Option<f64>,
}

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSummary {
    pub item_count: u32,
    pub products_subtotal: f64,
    pub services_subtotal: f64,
    pub subtotal: f64,
    pub discount_base: f64,
    pub discount: f64,
    pub after_discount: f64,
    pub extra_fee: f64,
    pub delivery_fee: f64,
    pub total: f64,
    pub payment_status: PaymentStatus,
    pub prepaid: f64,
    pub amount_to_collect: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Unpaid,
    Partial,
    Paid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentReconciliation {
    pub total: f64,
    pub paid: f64,
    pub remaining: f64,
    pub change: f64,
    pub state: PaymentState,
}

// ---------------------------------------------------------------------------
// Calculation
// ---------------------------------------------------------------------------

fn validate(input: &CheckoutInput) -> Result<(), String> {
    for line in &input.lines {
        line.check_bounds()?;
    }
    for (label, adj) in [("discount", input.discount), ("extra fee", input.extra_fee)] {
        if let Some(adj) = adj {
            check_amount(adj.value, label)?;
            if adj.mode == AdjustmentMode::Percentage && adj.value > 100.0 {
                return Err(format!("The {label} percentage cannot exceed 100%"));
            }
        }
    }
    check_amount(input.delivery_fee, "delivery fee")?;
    if let Some(prepaid) = input.prepaid_amount {
        check_amount(prepaid, "prepaid amount")?;
    }
    Ok(())
}

fn apply_adjustment(adj: Option<Adjustment>, base: Decimal) -> Decimal {
    match adj {
        None => Decimal::ZERO,
        Some(Adjustment {
            mode: AdjustmentMode::Percentage,
            value,
        }) => round(base.saturating_mul(to_decimal(value)) / Decimal::ONE_HUNDRED),
        Some(Adjustment {
            mode: AdjustmentMode::Fixed,
            value,
        }) => round(to_decimal(value)),
    }
}

/// What the courier collects for `status`, given the rounded totals.
fn collect_for(
    status: PaymentStatus,
    total: Decimal,
    delivery_fee: Decimal,
    prepaid_amount: Option<f64>,
) -> (Decimal, Decimal) {
    match status {
        PaymentStatus::CashOnDelivery => (Decimal::ZERO, total),
        PaymentStatus::HalfPaid => {
            let goods = (total - delivery_fee).max(Decimal::ZERO);
            let prepaid = prepaid_amount
                .map(to_decimal)
                .unwrap_or_else(|| round(goods / Decimal::from(2)))
                .clamp(Decimal::ZERO, total);
            (prepaid, total - prepaid)
        }
        PaymentStatus::FullyPaid => (total, Decimal::ZERO),
        PaymentStatus::FullyPaidNoDeliveryFee => {
            let fee = delivery_fee.min(total);
            (total - fee, fee)
        }
    }
}

/// Compute the checkout summary for a cart.
pub fn calculate(input: &CheckoutInput) -> Result<CheckoutSummary, String> {
    validate(input)?;

    let too_large = || "The cart total exceeds the supported amount".to_string();

    let mut products = Decimal::ZERO;
    let mut services = Decimal::ZERO;
    let mut item_count: u32 = 0;
    for line in &input.lines {
        let line_total = to_decimal(line.unit_price)
            .checked_mul(Decimal::from(line.quantity))
            .ok_or_else(too_large)?;
        let bucket = match line.kind {
            LineKind::Product => &mut products,
            LineKind::Service => &mut services,
        };
        *bucket = bucket.checked_add(line_total).ok_or_else(too_large)?;
        item_count = item_count.saturating_add(line.quantity);
    }
    let products = round(products);
    let services = round(services);
    let subtotal = products.checked_add(services).ok_or_else(too_large)?;

    let discount_base = match input.discount_scope {
        DiscountScope::Products => products,
        DiscountScope::Services => services,
        DiscountScope::Both => subtotal,
    };
    let discount = apply_adjustment(input.discount, discount_base).clamp(Decimal::ZERO, discount_base);
    let after_discount = (subtotal - discount).max(Decimal::ZERO);

    let extra_fee = apply_adjustment(input.extra_fee, after_discount).max(Decimal::ZERO);
    let delivery_fee = round(to_decimal(input.delivery_fee));
    let total = after_discount
        .checked_add(extra_fee)
        .and_then(|t| t.checked_add(delivery_fee))
        .ok_or_else(too_large)?;

    let (prepaid, amount_to_collect) =
        collect_for(input.payment_status, total, delivery_fee, input.prepaid_amount);

    Ok(CheckoutSummary {
        item_count,
        products_subtotal: to_f64(products),
        services_subtotal: to_f64(services),
        subtotal: to_f64(subtotal),
        discount_base: to_f64(discount_base),
        discount: to_f64(discount),
        after_discount: to_f64(after_discount),
        extra_fee: to_f64(extra_fee),
        delivery_fee: to_f64(delivery_fee),
        total: to_f64(total),
        payment_status: input.payment_status,
        prepaid: to_f64(prepaid),
        amount_to_collect: to_f64(amount_to_collect),
    })
}

/// Amount to collect for every payment status, for the status picker.
pub fn collection_breakdown(input: &CheckoutInput) -> Result<Vec<(PaymentStatus, f64)>, String> {
    let summary = calculate(input)?;
    let total = to_decimal(summary.total);
    let delivery_fee = to_decimal(summary.delivery_fee);
    Ok(PaymentStatus::ALL
        .iter()
        .map(|status| {
            let (_, collect) = collect_for(*status, total, delivery_fee, input.prepaid_amount);
            (*status, to_f64(collect))
        })
        .collect())
}

/// Reconcile payments received so far against an invoice total.
pub fn reconcile_payments(total: f64, payments: &[f64]) -> PaymentReconciliation {
    let total_d = round(to_decimal(total).max(Decimal::ZERO));
    let paid = round(
        payments
            .iter()
            .map(|p| to_decimal(*p).max(Decimal::ZERO))
            .fold(Decimal::ZERO, Decimal::saturating_add),
    );
    let remaining = (total_d - paid).max(Decimal::ZERO);
    let change = (paid - total_d).max(Decimal::ZERO);
    let state = if paid.is_zero() && !total_d.is_zero() {
        PaymentState::Unpaid
    } else if remaining.is_zero() {
        PaymentState::Paid
    } else {
        PaymentState::Partial
    };
    PaymentReconciliation {
        total: to_f64(total_d),
        paid: to_f64(paid),
        remaining: to_f64(remaining),
        change: to_f64(change),
        state,
    }
}
