use regex::Regex;
use std::sync::LazyLock;

use crate::db;

/// Category of `local_settings` holding cached JSON documents.
const LOCAL_CATEGORY: &str = "local";

static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^01[0125][0-9]{8}$").expect("valid phone regex"));

pub(crate) fn read_local_json(db: &db::DbState, key: &str) -> Result<serde_json::Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let raw = db::get_setting(&conn, LOCAL_CATEGORY, key);
    if let Some(raw) = raw {
        if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&raw) {
            return Ok(parsed);
        }
    }
    Ok(serde_json::Value::Null)
}

pub(crate) fn write_local_json(
    db: &db::DbState,
    key: &str,
    value: &serde_json::Value,
) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    db::set_setting(&conn, LOCAL_CATEGORY, key, &value.to_string())
}

/// Digits only, Arabic-Indic digits folded to ASCII, Egyptian country code
/// (`+20` / `0020`) turned back into the leading `0`.
pub(crate) fn normalize_phone(value: &str) -> String {
    let digits: String = crate::search::normalize_arabic(value)
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    if let Some(rest) = digits.strip_prefix("0020") {
        return format!("0{rest}");
    }
    if digits.len() == 12 {
        if let Some(rest) = digits.strip_prefix("20") {
            return format!("0{rest}");
        }
    }
    digits
}

/// Egyptian mobile number after [`normalize_phone`].
pub(crate) fn is_valid_phone(value: &str) -> bool {
    PHONE_RE.is_match(&normalize_phone(value))
}
