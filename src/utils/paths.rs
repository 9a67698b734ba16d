use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Ensure the data directory exists and return it.
pub fn ensure_data_dir(data_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(data_dir).context("Failed to create data directory")?;
    Ok(data_dir.to_path_buf())
}

/// Path of the single engine database inside the data directory.
pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("ei.db")
}

/// Path of the persona registry document.
pub fn registry_path(data_dir: &Path) -> PathBuf {
    data_dir.join("personas.json")
}

/// Directory holding named snapshot saves.
pub fn snapshots_dir(data_dir: &Path) -> Result<PathBuf> {
    let path = data_dir.join("snapshots");
    std::fs::create_dir_all(&path).context("Failed to create snapshots directory")?;
    Ok(path)
}
