//! Default locations for the config file and checkout scratch space.

use std::path::PathBuf;

pub fn default_config_path() -> anyhow::Result<PathBuf> {
    let dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
    Ok(dir.join("preview").join("preview.toml"))
}

/// Falls back to the system temp dir when no cache dir is known.
pub fn default_work_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("preview")
}
