//! Product search for the cashier and warehouse screens.
//!
//! Queries and product fields are folded with [`normalize_arabic`] so that
//! "احمد", "أحمد" and "أَحْمَد" match each other, then every product is scored
//! by where each query token matched.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::{Product, ProductKind};

// Per-token field weights; the best matching field wins.
const W_BARCODE_EXACT: u32 = 100;
const W_SKU_EXACT: u32 = 80;
const W_NAME_EXACT: u32 = 60;
const W_SKU_PREFIX: u32 = 40;
const W_NAME_WORD_PREFIX: u32 = 30;
const W_NAME_CONTAINS: u32 = 15;
const W_ATTRIBUTE: u32 = 12;
const W_CATEGORY: u32 = 6;
const W_DESCRIPTION: u32 = 2;
/// Added once when the whole query equals the product name.
const W_FULL_NAME_BONUS: u32 = 50;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Fold Arabic spelling variants, digits and case so text compares loosely.
pub fn normalize_arabic(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        let mapped = match ch {
            // tashkeel, superscript alef, tatweel
            '\u{064B}'..='\u{065F}' | '\u{0670}' | '\u{0640}' => continue,
            'أ' | 'إ' | 'آ' | 'ٱ' => 'ا',
            'ى' | 'ئ' => 'ي',
            'ة' => 'ه',
            'ؤ' => 'و',
            '\u{0660}'..='\u{0669}' => digit(ch as u32 - 0x0660),
            '\u{06F0}'..='\u{06F9}' => digit(ch as u32 - 0x06F0),
            c => c,
        };
        out.extend(mapped.to_lowercase());
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn digit(offset: u32) -> char {
    char::from_digit(offset, 10).unwrap_or('0')
}

pub fn tokenize(query: &str) -> Vec<String> {
    normalize_arabic(query)
        .split(' ')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Pre-normalized searchable fields of one candidate.
struct SearchDoc {
    name: String,
    name_words: Vec<String>,
    sku: String,
    barcode: String,
    options: Vec<String>,
    categories: Vec<String>,
    description: String,
}

impl SearchDoc {
    fn new(name: &str, sku: &str, barcode: Option<&str>) -> Self {
        let name = normalize_arabic(name);
        let name_words = name.split(' ').map(str::to_string).collect();
        SearchDoc {
            name,
            name_words,
            sku: normalize_arabic(sku),
            barcode: barcode.map(normalize_arabic).unwrap_or_default(),
            options: Vec::new(),
            categories: Vec::new(),
            description: String::new(),
        }
    }

    fn for_product(product: &Product) -> Self {
        let mut doc = SearchDoc::new(&product.name, &product.sku, product.barcode.as_deref());
        doc.options = product
            .attributes
            .iter()
            .flat_map(|a| a.options.iter())
            .chain(
                product
                    .variations
                    .iter()
                    .flat_map(|v| v.attributes.iter().map(|a| &a.option)),
            )
            .map(|o| normalize_arabic(o))
            .collect();
        doc.categories = product
            .categories
            .iter()
            .map(|c| normalize_arabic(&c.name))
            .collect();
        doc.description = normalize_arabic(&product.description);
        doc
    }

    fn token_score(&self, token: &str) -> u32 {
        let mut best = 0;
        let mut take = |hit: bool, weight: u32| {
            if hit && weight > best {
                best = weight;
            }
        };
        take(!self.barcode.is_empty() && self.barcode == token, W_BARCODE_EXACT);
        take(!self.sku.is_empty() && self.sku == token, W_SKU_EXACT);
        take(self.name == token, W_NAME_EXACT);
        take(self.sku.starts_with(token), W_SKU_PREFIX);
        take(
            self.name_words.iter().any(|w| w.starts_with(token)),
            W_NAME_WORD_PREFIX,
        );
        take(self.name.contains(token), W_NAME_CONTAINS);
        take(self.options.iter().any(|o| o.contains(token)), W_ATTRIBUTE);
        take(self.categories.iter().any(|c| c.contains(token)), W_CATEGORY);
        take(self.description.contains(token), W_DESCRIPTION);
        best
    }

    fn score(&self, tokens: &[String]) -> u32 {
        if tokens.is_empty() {
            return 0;
        }
        let mut total = 0;
        for token in tokens {
            let s = self.token_score(token);
            if s == 0 {
                return 0;
            }
            total += s;
        }
        if self.name == tokens.join(" ") {
            total += W_FULL_NAME_BONUS;
        }
        total
    }
}

/// Relevance of `product` for already tokenized query terms.
pub fn score_product(product: &Product, tokens: &[String]) -> u32 {
    SearchDoc::for_product(product).score(tokens)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductFilter {
    pub category_id: Option<i64>,
    pub kind: Option<ProductKind>,
    pub in_stock_only: bool,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
}

impl ProductFilter {
    pub fn matches(&self, product: &Product) -> bool {
        if let Some(cat) = self.category_id {
            if !product.categories.iter().any(|c| c.id == cat) {
                return false;
            }
        }
        if self.kind.is_some_and(|k| k != product.kind) {
            return false;
        }
        if self.in_stock_only && !product.in_stock() {
            return false;
        }
        let price = display_price(product);
        if self.min_price.is_some_and(|min| price < min) {
            return false;
        }
        if self.max_price.is_some_and(|max| price > max) {
            return false;
        }
        true
    }
}

/// Shelf price: cheapest variation for variable products.
pub fn display_price(product: &Product) -> f64 {
    match product.kind {
        ProductKind::Variable if !product.variations.is_empty() => product
            .variations
            .iter()
            .map(|v| v.price())
            .fold(f64::INFINITY, f64::min),
        _ => product.price(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit<'a> {
    pub score: u32,
    #[serde(flatten)]
    pub product: &'a Product,
}

/// Filter, score and rank products. An empty query lists every filtered
/// product by name.
pub fn search_products<'a>(
    products: &'a [Product],
    query: &str,
    filter: &ProductFilter,
    limit: usize,
) -> Vec<SearchHit<'a>> {
    let tokens = tokenize(query);
    let mut hits: Vec<SearchHit<'a>> = products
        .iter()
        .filter(|p| filter.matches(p))
        .filter_map(|product| {
            if tokens.is_empty() {
                return Some(SearchHit { score: 0, product });
            }
            let score = score_product(product, &tokens);
            (score > 0).then_some(SearchHit { score, product })
        })
        .collect();
    hits.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.product.name.to_lowercase().cmp(&b.product.name.to_lowercase()))
    });
    hits.truncate(limit);
    hits
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariationHit {
    pub product_id: i64,
    pub variation_id: i64,
    pub label: String,
    pub sku: String,
    pub price: f64,
    pub stock_quantity: Option<i64>,
    pub score: u32,
}

/// Search sellable variations of variable products, labelled
/// "{product} - {options}".
pub fn search_variations(products: &[Product], query: &str, limit: usize) -> Vec<VariationHit> {
    let tokens = tokenize(query);
    if tokens.is_empty() {
        return Vec::new();
    }
    let mut hits: Vec<VariationHit> = products
        .iter()
        .filter(|p| p.kind == ProductKind::Variable)
        .flat_map(|product| {
            product.variations.iter().filter_map(|variation| {
                let label = format!("{} - {}", product.name, variation.label());
                let mut doc = SearchDoc::new(&label, &variation.sku, None);
                doc.options = variation
                    .attributes
                    .iter()
                    .map(|a| normalize_arabic(&a.option))
                    .collect();
                doc.categories = product
                    .categories
                    .iter()
                    .map(|c| normalize_arabic(&c.name))
                    .collect();
                let score = doc.score(&tokens);
                (score > 0).then(|| VariationHit {
                    product_id: product.id,
                    variation_id: variation.id,
                    label,
                    sku: variation.sku.clone(),
                    price: variation.price(),
                    stock_quantity: variation.stock_quantity,
                    score,
                })
            })
        })
        .collect();
    hits.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.label.cmp(&b.label)));
    hits.truncate(limit);
    hits
}

/// Latest-value-wins delay for search-as-you-type.
///
/// Each call to [`Debouncer::run`] takes a generation number; after the delay
/// only the newest generation runs its work, older callers get `None`.
#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    generation: Arc<AtomicU64>,
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn run<F, Fut, T>(&self, work: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let mine = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        if self.generation.load(Ordering::SeqCst) != mine {
            return None;
        }
        Some(work().await)
    }
}
