//! Bosta shipping carrier client.
//!
//! Used by the customer address form (cities, districts, zones), the
//! shipping settings screen (pickup locations) and delivery fee quotes.
//! City and district lists are cached in `local_settings` so address
//! entry keeps working offline.

use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::data_helpers::{read_local_json, write_local_json};
use crate::db::DbState;
use crate::value_str;

pub const BOSTA_BASE_URL: &str = "https://app.bosta.co/api/v2";
const TIMEOUT: Duration = Duration::from_secs(20);
const CITIES_CACHE_KEY: &str = "bosta_cities_cache_v1";
const DISTRICTS_CACHE_KEY: &str = "bosta_districts_cache_v1";
/// Bosta country id for Egypt.
const EGYPT_COUNTRY_ID: &str = "60e4482c7cb7d4bc4849c4d5";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct City {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub name_ar: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub name_ar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct District {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub name_ar: Option<String>,
    #[serde(default)]
    pub zone_id: Option<String>,
    #[serde(default)]
    pub zone_name: Option<String>,
    #[serde(default = "default_true")]
    pub drop_off_available: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PickupLocation {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShippingFeeQuote {
    pub amount: f64,
    pub city_id: String,
    pub cod: f64,
    pub package_type: String,
}

/// Lists arrive either as `data: [...]` or `data: { list: [...] }`.
fn data_list(body: &Value) -> Vec<Value> {
    let data = body.get("data").unwrap_or(body);
    data.as_array()
        .or_else(|| data.get("list").and_then(Value::as_array))
        .cloned()
        .unwrap_or_default()
}

fn id_of(v: &Value) -> Option<String> {
    value_str(v, &["_id", "id", "districtId", "zoneId"])
}

fn city_from(v: &Value) -> Option<City> {
    Some(City {
        id: id_of(v)?,
        name: value_str(v, &["name"])?,
        name_ar: value_str(v, &["nameAr", "otherName"]),
        code: value_str(v, &["code"]),
    })
}

fn zone_from(v: &Value) -> Option<Zone> {
    Some(Zone {
        id: id_of(v)?,
        name: value_str(v, &["name", "zoneName"])?,
        name_ar: value_str(v, &["nameAr", "zoneOtherName"]),
    })
}

/// District lists are grouped by zone; flatten them carrying the zone.
fn districts_from(body: &Value) -> Vec<District> {
    let mut out = Vec::new();
    for zone in data_list(body) {
        let zone_id = value_str(&zone, &["zoneId", "_id"]);
        let zone_name = value_str(&zone, &["zoneName", "name"]);
        let nested = zone.get("districts").and_then(Value::as_array);
        let items: Vec<&Value> = match nested {
            Some(list) => list.iter().collect(),
            None => vec![&zone],
        };
        for d in items {
            let Some(id) = value_str(d, &["districtId", "_id", "id"]) else {
                continue;
            };
            let Some(name) = value_str(d, &["districtName", "name"]) else {
                continue;
            };
            out.push(District {
                id,
                name,
                name_ar: value_str(d, &["districtOtherName", "nameAr"]),
                zone_id: zone_id.clone(),
                zone_name: zone_name.clone(),
                drop_off_available: d
                    .get("dropOffAvailability")
                    .and_then(Value::as_bool)
                    .unwrap_or(true),
            });
        }
    }
    out
}

fn pickup_from(v: &Value) -> Option<PickupLocation> {
    Some(PickupLocation {
        id: id_of(v)?,
        name: value_str(v, &["locationName", "name"])?,
        city: v
            .get("address")
            .and_then(|a| a.get("city"))
            .and_then(|c| value_str(c, &["name"]).or_else(|| c.as_str().map(str::to_string))),
        is_default: v.get("isDefault").and_then(Value::as_bool).unwrap_or(false),
    })
}

fn fee_from(body: &Value) -> Option<f64> {
    let data = body.get("data").unwrap_or(body);
    ["priceAfterVat", "shippingFee", "price", "total"]
        .iter()
        .find_map(|k| data.get(*k).and_then(Value::as_f64))
}

fn bosta_error(status: StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| value_str(&v, &["message", "error"]));
    match (status.as_u16(), detail) {
        (401 | 403, _) => "Bosta API key is invalid or lacks permission".into(),
        (_, Some(msg)) => format!("Bosta: {msg} (HTTP {})", status.as_u16()),
        (s, None) if s >= 500 => format!("Bosta server error (HTTP {s})"),
        (s, None) => format!("Unexpected response from Bosta (HTTP {s})"),
    }
}

/// Authenticated client for the Bosta API.
#[derive(Clone)]
pub struct BostaClient {
    base_url: String,
    api_key: String,
    http: Client,
}

impl std::fmt::Debug for BostaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BostaClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl Drop for BostaClient {
    fn drop(&mut self) {
        self.api_key.zeroize();
    }
}

impl BostaClient {
    pub fn new(api_key: String) -> Result<Self, String> {
        Self::with_base_url(BOSTA_BASE_URL, api_key)
    }

    pub fn with_base_url(base_url: &str, api_key: String) -> Result<Self, String> {
        if api_key.trim().is_empty() {
            return Err("Bosta API key is empty".into());
        }
        let http = Client::builder()
            .timeout(TIMEOUT)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            http,
        })
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, String> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        debug!(%path, "bosta request");
        let resp = self
            .http
            .get(&url)
            .header("Authorization", &self.api_key)
            .query(query)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    "Connection to Bosta timed out".to_string()
                } else {
                    format!("Cannot reach Bosta: {e}")
                }
            })?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(bosta_error(status, &text));
        }
        serde_json::from_str(&text).map_err(|e| format!("Invalid JSON from Bosta: {e}"))
    }

    pub async fn cities(&self) -> Result<Vec<City>, String> {
        let body = self
            .get("cities", &[("countryId", EGYPT_COUNTRY_ID.to_string())])
            .await?;
        Ok(data_list(&body).iter().filter_map(city_from).collect())
    }

    pub async fn districts(&self, city_id: &str) -> Result<Vec<District>, String> {
        let body = self.get(&format!("cities/{city_id}/districts"), &[]).await?;
        Ok(districts_from(&body))
    }

    pub async fn zones(&self, city_id: &str) -> Result<Vec<Zone>, String> {
        let body = self.get(&format!("cities/{city_id}/zones"), &[]).await?;
        Ok(data_list(&body).iter().filter_map(zone_from).collect())
    }

    pub async fn pickup_locations(&self) -> Result<Vec<PickupLocation>, String> {
        let body = self.get("pickup-locations", &[]).await?;
        Ok(data_list(&body).iter().filter_map(pickup_from).collect())
    }

    /// Delivery fee quote for a parcel to `city_id` collecting `cod`.
    pub async fn shipping_fee(
        &self,
        city_id: &str,
        cod: f64,
        package_type: &str,
    ) -> Result<ShippingFeeQuote, String> {
        let body = self
            .get(
                "pricing/shipment/calculator",
                &[
                    ("dropOffCity", city_id.to_string()),
                    ("cod", format!("{cod:.2}")),
                    ("type", "SEND".to_string()),
                    ("size", package_type.to_string()),
                ],
            )
            .await?;
        let amount = fee_from(&body).ok_or("Bosta returned no shipping fee")?;
        Ok(ShippingFeeQuote {
            amount,
            city_id: city_id.to_string(),
            cod,
            package_type: package_type.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Offline caches
// ---------------------------------------------------------------------------

/// A list plus where it came from.
#[derive(Debug, Clone, Serialize)]
pub struct CachedList<T> {
    pub items: Vec<T>,
    pub from_cache: bool,
    pub fetched_at: Option<String>,
}

/// Cities from Bosta when reachable (refreshing the cache), otherwise the
/// cached copy.
pub async fn cities_cached(db: &DbState, client: Option<&BostaClient>) -> Result<CachedList<City>, String> {
    let mut live_error = None;
    if let Some(client) = client {
        match client.cities().await {
            Ok(items) => {
                let fetched_at = Utc::now().to_rfc3339();
                write_local_json(
                    db,
                    CITIES_CACHE_KEY,
                    &json!({ "fetched_at": fetched_at, "items": items }),
                )?;
                info!(count = items.len(), "bosta cities cached");
                return Ok(CachedList {
                    items,
                    from_cache: false,
                    fetched_at: Some(fetched_at),
                });
            }
            Err(e) => {
                warn!(error = %e, "bosta cities fetch failed, using cache");
                live_error = Some(e);
            }
        }
    }
    let cached = read_local_json(db, CITIES_CACHE_KEY)?;
    let items: Vec<City> = cached
        .get("items")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    if items.is_empty() {
        return Err(live_error.unwrap_or_else(|| "Bosta is not configured and no cities are cached".into()));
    }
    Ok(CachedList {
        items,
        from_cache: true,
        fetched_at: value_str(&cached, &["fetched_at"]),
    })
}

/// Districts of one city, live when possible; the cache holds every city
/// fetched so far keyed by city id.
pub async fn districts_cached(
    db: &DbState,
    client: Option<&BostaClient>,
    city_id: &str,
) -> Result<CachedList<District>, String> {
    let mut cache = read_local_json(db, DISTRICTS_CACHE_KEY)?;
    if !cache.is_object() {
        cache = json!({});
    }
    let mut live_error = None;
    if let Some(client) = client {
        match client.districts(city_id).await {
            Ok(items) => {
                let fetched_at = Utc::now().to_rfc3339();
                cache[city_id] = json!({ "fetched_at": fetched_at, "items": items });
                write_local_json(db, DISTRICTS_CACHE_KEY, &cache)?;
                return Ok(CachedList {
                    items,
                    from_cache: false,
                    fetched_at: Some(fetched_at),
                });
            }
            Err(e) => {
                warn!(city_id, error = %e, "bosta districts fetch failed, using cache");
                live_error = Some(e);
            }
        }
    }
    let entry = cache.get(city_id).cloned().unwrap_or(Value::Null);
    let items: Vec<District> = entry
        .get("items")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    if items.is_empty() {
        return Err(live_error.unwrap_or_else(|| format!("No cached districts for city {city_id}")));
    }
    Ok(CachedList {
        items,
        from_cache: true,
        fetched_at: value_str(&entry, &["fetched_at"]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use axum::extract::Path;
    use axum::http::HeaderMap;
    use axum::routing::get;
    use axum::{Json, Router};

    async fn fake_bosta() -> String {
        async fn cities(headers: HeaderMap) -> Json<Value> {
            assert_eq!(headers.get("authorization").unwrap(), "secret-key");
            Json(json!({ "success": true, "data": { "list": [
                { "_id": "c1", "name": "Cairo", "nameAr": "القاهرة", "code": "EG-01" },
                { "_id": "c2", "name": "Giza", "nameAr": "الجيزة" }
            ]}}))
        }
        async fn districts(Path(city): Path<String>) -> Json<Value> {
            assert_eq!(city, "c1");
            Json(json!({ "success": true, "data": [
                { "zoneId": "z1", "zoneName": "Nasr City", "districts": [
                    { "districtId": "d1", "districtName": "7th District", "districtOtherName": "الحي السابع",
                      "dropOffAvailability": true },
                    { "districtId": "d2", "districtName": "8th District", "dropOffAvailability": false }
                ]}
            ]}))
        }
        async fn fee() -> Json<Value> {
            Json(json!({ "success": true, "data": { "priceAfterVat": 68.4 } }))
        }
        let app = Router::new()
            .route("/cities", get(cities))
            .route("/cities/{id}/districts", get(districts))
            .route("/pricing/shipment/calculator", get(fee));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(BostaClient::new("  ".into()).is_err());
    }

    #[test]
    fn test_error_messages() {
        assert!(bosta_error(StatusCode::UNAUTHORIZED, "").contains("invalid"));
        assert_eq!(
            bosta_error(StatusCode::BAD_REQUEST, r#"{"message":"City not found"}"#),
            "Bosta: City not found (HTTP 400)"
        );
    }

    #[tokio::test]
    async fn test_client_parses_lists_and_fee() {
        let base = fake_bosta().await;
        let client = BostaClient::with_base_url(&base, "secret-key".into()).unwrap();
        let cities = client.cities().await.unwrap();
        assert_eq!(cities.len(), 2);
        assert_eq!(cities[0].name_ar.as_deref(), Some("القاهرة"));

        let districts = client.districts("c1").await.unwrap();
        assert_eq!(districts.len(), 2);
        assert_eq!(districts[0].zone_name.as_deref(), Some("Nasr City"));
        assert!(!districts[1].drop_off_available);

        let quote = client.shipping_fee("c1", 250.0, "Parcel").await.unwrap();
        assert_eq!(quote.amount, 68.4);
    }

    #[tokio::test]
    async fn test_cache_used_when_offline() {
        let base = fake_bosta().await;
        let state = db::test_state();
        let client = BostaClient::with_base_url(&base, "secret-key".into()).unwrap();

        let live = cities_cached(&state, Some(&client)).await.unwrap();
        assert!(!live.from_cache);
        districts_cached(&state, Some(&client), "c1").await.unwrap();

        let offline = cities_cached(&state, None).await.unwrap();
        assert!(offline.from_cache);
        assert_eq!(offline.items, live.items);

        let districts = districts_cached(&state, None, "c1").await.unwrap();
        assert_eq!(districts.items.len(), 2);
        assert!(districts_cached(&state, None, "c9").await.is_err());
    }
}
