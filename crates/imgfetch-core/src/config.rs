//! Configuration file handling
//!
//! The downloader configuration is stored as pretty-printed JSON. A missing
//! file is not an error: defaults are used until something is saved.

use crate::error::DownloadError;
use imgfetch_types::DownloaderConfig;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// `<config dir>/imgfetch/config.json`, if the platform has a config dir
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("imgfetch").join("config.json"))
}

/// Load a configuration file, falling back to defaults when it is absent
pub async fn load_config(path: &Path) -> Result<DownloaderConfig, DownloadError> {
    if !fs::try_exists(path).await? {
        debug!("No config at {}, using defaults", path.display());
        return Ok(DownloaderConfig::default());
    }

    let content = fs::read_to_string(path).await?;
    let mut config: DownloaderConfig = serde_json::from_str(&content)?;
    if config.max_concurrent_downloads == 0 {
        return Err(DownloadError::Config(
            "max_concurrent_downloads must be at least 1".to_string(),
        ));
    }
    config.event_capacity = config.event_capacity.max(1);

    info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Write a configuration file, creating parent directories as needed
pub async fn save_config(path: &Path, config: &DownloaderConfig) -> Result<(), DownloadError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content).await?;
    Ok(())
}
