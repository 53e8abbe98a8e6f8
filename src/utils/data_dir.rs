//! Global data directory.
//!
//! Defaults to `~/.scenecast/` but can be overridden via `--conf`.
//! Initialized once at startup via `init()`; later reads that happen
//! before `init()` (tests) fall back to the default location.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{anyhow, Result};

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

fn default_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".scenecast")
}

/// Initialize the global data directory. `None` selects `~/.scenecast/`.
pub fn init(custom: Option<&Path>) -> Result<()> {
    let dir = custom.map(Path::to_path_buf).unwrap_or_else(default_dir);
    DATA_DIR
        .set(dir)
        .map_err(|_| anyhow!("data_dir::init() called more than once"))
}

pub fn get() -> &'static Path {
    DATA_DIR.get_or_init(default_dir)
}

/// Receiver cache root. Incoming uploads land in `<cache>/Uploads/<sender>/`.
pub fn cache_dir() -> PathBuf {
    get().join("cache")
}

pub fn logs_dir() -> PathBuf {
    get().join("logs")
}
