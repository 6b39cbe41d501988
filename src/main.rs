use dukkan_pos_lib::{init_tracing, run, AppConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().map_err(anyhow::Error::msg)?;
    let _log_guard = init_tracing(&config.log_dir());
    tracing::info!(data_dir = %config.data_dir.display(), "configuration loaded");
    run(config).await.map_err(anyhow::Error::msg)
}
