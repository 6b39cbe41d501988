//! Store and carrier credentials kept in the OS credential store.
//!
//! Backed by the `keyring` crate: Keychain, Windows Credential Manager or
//! Secret Service depending on the platform. Business settings live in
//! SQLite; only secrets are kept here.

use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};
use zeroize::Zeroize;

const SERVICE_NAME: &str = "dukkan-pos";

// Credential keys
pub const KEY_STORE_URL: &str = "store_url";
pub const KEY_CONSUMER_KEY: &str = "consumer_key";
pub const KEY_CONSUMER_SECRET: &str = "consumer_secret";
pub const KEY_BOSTA_API_KEY: &str = "bosta_api_key";

const ALL_KEYS: [&str; 4] = [
    KEY_STORE_URL,
    KEY_CONSUMER_KEY,
    KEY_CONSUMER_SECRET,
    KEY_BOSTA_API_KEY,
];

fn entry(key: &str) -> Result<Entry, String> {
    Entry::new(SERVICE_NAME, key).map_err(|e| format!("keyring entry {key}: {e}"))
}

/// Read one credential. Missing entries and keyring failures both yield
/// `None`; failures are logged.
pub fn get_credential(key: &str) -> Option<String> {
    let read = entry(key).and_then(|e| match e.get_password() {
        Ok(secret) => Ok(Some(secret)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(format!("keyring read {key}: {err}")),
    });
    read.unwrap_or_else(|e| {
        warn!(key, error = %e, "credential unavailable");
        None
    })
}

pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    entry(key)?
        .set_password(value)
        .map_err(|e| format!("keyring write {key}: {e}"))
}

/// Removing an absent entry is not an error.
pub fn delete_credential(key: &str) -> Result<(), String> {
    match entry(key)?.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(format!("keyring delete {key}: {e}")),
    }
}

pub fn has_credential(key: &str) -> bool {
    get_credential(key).is_some()
}

/// The store API is usable when URL, consumer key and consumer secret exist.
pub fn is_store_configured() -> bool {
    has_credential(KEY_STORE_URL)
        && has_credential(KEY_CONSUMER_KEY)
        && has_credential(KEY_CONSUMER_SECRET)
}

/// Build a store client from the keyring, `None` when not configured.
pub fn store_client() -> Option<crate::api::StoreClient> {
    let url = get_credential(KEY_STORE_URL)?;
    let key = get_credential(KEY_CONSUMER_KEY)?;
    let secret = get_credential(KEY_CONSUMER_SECRET)?;
    crate::api::StoreClient::new(&url, key, secret).ok()
}

/// Build a Bosta client from the keyring, `None` when no API key is stored.
pub fn bosta_client() -> Option<crate::bosta::BostaClient> {
    let key = get_credential(KEY_BOSTA_API_KEY)?;
    crate::bosta::BostaClient::new(key).ok()
}

/// Non-secret view of the stored credentials for the settings screen.
pub fn credentials_overview() -> Value {
    serde_json::json!({
        "store_url": get_credential(KEY_STORE_URL),
        "store_configured": is_store_configured(),
        "bosta_configured": has_credential(KEY_BOSTA_API_KEY),
    })
}

/// Store credentials entered on the settings screen.
///
/// Accepts either explicit fields or a pasted connection string (base64 JSON
/// `{"url", "ck", "cs"}`) in `connectionString`:
/// ```json
/// {
///   "storeUrl": "https://shop.example",
///   "consumerKey": "ck_...",
///   "consumerSecret": "cs_...",
///   "bostaApiKey": "..."          // optional
/// }
/// ```
pub fn update_credentials(payload: &Value) -> Result<Value, String> {
    let mut store_url = crate::value_str(payload, &["storeUrl", "store_url", "url"]);
    let mut consumer_key = crate::value_str(payload, &["consumerKey", "consumer_key"]);
    let mut consumer_secret = crate::value_str(payload, &["consumerSecret", "consumer_secret"]);

    if let Some(raw) = crate::value_str(payload, &["connectionString", "connection_string"]) {
        let decoded = crate::api::decode_connection_string(&raw)
            .ok_or("Connection string could not be decoded")?;
        store_url = crate::value_str(&decoded, &["url"]).or(store_url);
        consumer_key = crate::value_str(&decoded, &["ck", "consumer_key"]).or(consumer_key);
        consumer_secret =
            crate::value_str(&decoded, &["cs", "consumer_secret"]).or(consumer_secret);
    }

    let any_store_field =
        store_url.is_some() || consumer_key.is_some() || consumer_secret.is_some();
    if any_store_field {
        let url = store_url.ok_or("Missing required field: storeUrl")?;
        let key = consumer_key.ok_or("Missing required field: consumerKey")?;
        let mut secret = consumer_secret.ok_or("Missing required field: consumerSecret")?;

        let normalized = crate::api::normalize_store_url(&url);
        set_credential(KEY_STORE_URL, &normalized)?;
        set_credential(KEY_CONSUMER_KEY, &key)?;
        let stored = set_credential(KEY_CONSUMER_SECRET, &secret);
        secret.zeroize();
        stored?;
        info!(store_url = %normalized, "store credentials updated");
    }

    if let Some(mut bosta_key) = crate::value_str(payload, &["bostaApiKey", "bosta_api_key"]) {
        let stored = set_credential(KEY_BOSTA_API_KEY, &bosta_key);
        bosta_key.zeroize();
        stored?;
        info!("bosta api key updated");
    }

    Ok(credentials_overview())
}

/// Delete every stored credential.
pub fn clear_credentials() -> Result<Value, String> {
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    info!("stored credentials cleared");
    Ok(credentials_overview())
}
