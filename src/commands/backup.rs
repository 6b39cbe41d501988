use std::path::PathBuf;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::AppState;
use crate::backup::{self, BackupFile, BackupInfo, RestoreReport};
use crate::error::{AppError, AppResult};
use crate::settings;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/backup", get(list))
        .route("/api/backup/export", post(export))
        .route("/api/backup/restore", post(restore))
}

fn configured_dir(state: &AppState) -> Result<(PathBuf, settings::BackupSettings), String> {
    let cfg = settings::get_settings(&state.db)?.backup;
    Ok((backup::backup_dir(&cfg, &state.config.data_dir), cfg))
}

async fn list(State(state): State<AppState>) -> AppResult<Json<Vec<BackupFile>>> {
    let (dir, _) = configured_dir(&state)?;
    Ok(Json(backup::list_backups(&dir)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExportRequest {
    /// Overrides the `backup.compress` setting.
    compress: Option<bool>,
}

async fn export(
    State(state): State<AppState>,
    body: Option<Json<ExportRequest>>,
) -> AppResult<Json<Value>> {
    let (dir, cfg) = configured_dir(&state)?;
    let compress = body.and_then(|Json(b)| b.compress).unwrap_or(cfg.compress);
    let db = state.db.clone();
    let (info, pruned) = tokio::task::spawn_blocking(move || {
        let info = backup::export_backup(&db, &dir, compress)?;
        let pruned = backup::prune_backups(&dir, cfg.keep_last);
        Ok::<(BackupInfo, usize), String>((info, pruned))
    })
    .await
    .map_err(|e| AppError::Internal(format!("backup task panicked: {e}")))??;
    Ok(Json(json!({ "backup": info, "pruned": pruned })))
}

#[derive(Debug, Deserialize)]
struct RestoreRequest {
    /// File name inside the backup directory.
    name: String,
}

async fn restore(
    State(state): State<AppState>,
    Json(body): Json<RestoreRequest>,
) -> AppResult<Json<RestoreReport>> {
    let name = body.name.trim().to_string();
    if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
        return Err(AppError::Validation(format!("Invalid backup name: {name}")));
    }
    let (dir, _) = configured_dir(&state)?;
    let path = dir.join(&name);
    if !path.is_file() {
        return Err(AppError::NotFound(format!("Backup not found: {name}")));
    }
    let db = state.db.clone();
    let report = tokio::task::spawn_blocking(move || backup::restore_backup(&db, &path))
        .await
        .map_err(|e| AppError::Internal(format!("restore task panicked: {e}")))??;
    info!(backup = %name, "backup restored");
    Ok(Json(report))
}
