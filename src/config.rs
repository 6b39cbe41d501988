//! Process configuration from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::sync::DEFAULT_SYNC_INTERVAL;

pub const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:4600";
const APP_DIR: &str = "com.dukkan.pos";

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite database, logs and default backup directory.
    pub data_dir: PathBuf,
    pub http_addr: SocketAddr,
    pub sync_interval: Duration,
}

fn default_data_dir() -> PathBuf {
    let base = std::env::var("XDG_DATA_HOME")
        .or_else(|_| std::env::var("LOCALAPPDATA"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                .join(".local")
                .join("share")
        });
    base.join(APP_DIR)
}

impl AppConfig {
    /// Load configuration from environment variables. Unset values fall
    /// back to defaults; set but unparsable values are errors.
    pub fn from_env() -> Result<Self, String> {
        let data_dir = std::env::var("DUKKAN_DATA_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let http_addr = match std::env::var("DUKKAN_HTTP_ADDR") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse()
                .map_err(|e| format!("DUKKAN_HTTP_ADDR must be host:port ({raw}): {e}"))?,
            _ => DEFAULT_HTTP_ADDR
                .parse()
                .map_err(|e| format!("default address: {e}"))?,
        };

        let sync_interval = match std::env::var("DUKKAN_SYNC_INTERVAL_SECS") {
            Ok(raw) if !raw.trim().is_empty() => {
                let secs: u64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| format!("DUKKAN_SYNC_INTERVAL_SECS must be a number ({raw})"))?;
                if secs == 0 {
                    return Err("DUKKAN_SYNC_INTERVAL_SECS must be at least 1".into());
                }
                Duration::from_secs(secs)
            }
            _ => DEFAULT_SYNC_INTERVAL,
        };

        Ok(Self {
            data_dir,
            http_addr,
            sync_interval,
        })
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}
