//! Business settings stored as one JSON document in `local_settings`
//! (category `app`, key `settings`). Secrets never land here; see
//! [`crate::storage`].

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::info;

use crate::db::{self, DbState};

const CATEGORY: &str = "app";
const KEY: &str = "settings";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub name: String,
    pub currency: String,
    pub default_delivery_fee: f64,
    /// Flat delivery rates keyed by Bosta city id or city name.
    pub city_rates: BTreeMap<String, f64>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            name: "Dukkan".into(),
            currency: "EGP".into(),
            default_delivery_fee: 0.0,
            city_rates: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BostaSettings {
    pub enabled: bool,
    pub pickup_location_id: Option<String>,
    pub default_package_type: String,
    pub allow_to_open_package: bool,
}

impl Default for BostaSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            pickup_location_id: None,
            default_package_type: "Parcel".into(),
            allow_to_open_package: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    pub auto_backup: bool,
    pub interval_hours: u32,
    pub keep_last: usize,
    pub compress: bool,
    /// Defaults to `{data_dir}/backups`.
    pub directory: Option<String>,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            auto_backup: false,
            interval_hours: 24,
            keep_last: 7,
            compress: true,
            directory: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayrollSettings {
    pub overtime_multiplier: f64,
    pub month_days: u32,
}

impl Default for PayrollSettings {
    fn default() -> Self {
        Self {
            overtime_multiplier: 1.5,
            month_days: 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub store: StoreSettings,
    pub bosta: BostaSettings,
    pub backup: BackupSettings,
    pub payroll: PayrollSettings,
}

impl Settings {
    pub fn validate(&self) -> Result<(), String> {
        if self.store.currency.trim().is_empty() {
            return Err("Currency is required".into());
        }
        if !self.store.default_delivery_fee.is_finite() || self.store.default_delivery_fee < 0.0 {
            return Err("مصاريف الشحن لا يمكن أن تكون سالبة".into());
        }
        crate::pricing::check_amount(self.store.default_delivery_fee, "default delivery fee")?;
        for (city, rate) in &self.store.city_rates {
            crate::pricing::check_amount(*rate, &format!("delivery rate for {city}"))?;
        }
        if self.backup.interval_hours == 0 {
            return Err("Backup interval must be at least one hour".into());
        }
        if self.backup.keep_last == 0 {
            return Err("At least one backup must be kept".into());
        }
        if !(1.0..=5.0).contains(&self.payroll.overtime_multiplier) {
            return Err("Overtime multiplier must be between 1 and 5".into());
        }
        if !(1..=31).contains(&self.payroll.month_days) {
            return Err("Month days must be between 1 and 31".into());
        }
        Ok(())
    }
}

/// Stored settings, defaults for anything missing or unreadable.
pub fn load(conn: &Connection) -> Settings {
    db::get_setting(conn, CATEGORY, KEY)
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

pub fn save(conn: &Connection, settings: &Settings) -> Result<(), String> {
    settings.validate()?;
    let raw = serde_json::to_string(settings).map_err(|e| format!("serialize settings: {e}"))?;
    db::set_setting(conn, CATEGORY, KEY, &raw)
}

pub fn get_settings(db: &DbState) -> Result<Settings, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    Ok(load(&conn))
}

fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(t), Value::Object(p)) => {
            for (k, v) in p {
                match t.get_mut(k) {
                    Some(slot) if slot.is_object() && v.is_object() => merge(slot, v),
                    _ => {
                        t.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (t, p) => *t = p.clone(),
    }
}

/// Deep-merge `patch` into the stored settings, validate, save.
pub fn update_settings(db: &DbState, patch: &Value) -> Result<Settings, String> {
    if !patch.is_object() {
        return Err("Settings patch must be a JSON object".into());
    }
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut current = serde_json::to_value(load(&conn)).map_err(|e| e.to_string())?;
    merge(&mut current, patch);
    let updated: Settings =
        serde_json::from_value(current).map_err(|e| format!("Invalid settings: {e}"))?;
    save(&conn, &updated)?;
    info!("settings updated");
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_when_absent() {
        let state = db::test_state();
        let s = get_settings(&state).unwrap();
        assert_eq!(s, Settings::default());
        assert_eq!(s.payroll.month_days, 30);
        assert_eq!(s.payroll.overtime_multiplier, 1.5);
    }

    #[test]
    fn test_update_merges_nested() {
        let state = db::test_state();
        update_settings(&state, &json!({ "store": { "default_delivery_fee": 45 } })).unwrap();
        let s = update_settings(&state, &json!({ "bosta": { "enabled": true } })).unwrap();
        assert_eq!(s.store.default_delivery_fee, 45.0);
        assert_eq!(s.store.currency, "EGP");
        assert!(s.bosta.enabled);
        assert_eq!(get_settings(&state).unwrap(), s);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let state = db::test_state();
        assert!(update_settings(&state, &json!({ "store": { "default_delivery_fee": -1 } })).is_err());
        assert!(update_settings(&state, &json!({ "payroll": { "month_days": 0 } })).is_err());
        assert!(update_settings(&state, &json!({ "backup": { "keep_last": 0 } })).is_err());
        assert_eq!(get_settings(&state).unwrap(), Settings::default());
    }

    #[test]
    fn test_unreadable_document_falls_back() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        db::set_setting(&conn, CATEGORY, KEY, "{not json").unwrap();
        assert_eq!(load(&conn), Settings::default());
    }
}
