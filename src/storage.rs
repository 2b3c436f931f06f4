use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;

/// Filesystem layout under the data directory.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub data_dir: PathBuf,
    /// Main price store (procedures, price records, ingest log).
    pub store_path: PathBuf,
    /// Durable key/value cache (schema mappings, code match results).
    pub cache_path: PathBuf,
    /// Working area for archive extraction.
    pub scratch_dir: PathBuf,
}

impl StoragePaths {
    pub fn new(data_dir: &str) -> Self {
        let data_dir = PathBuf::from(data_dir);
        let store_path = data_dir.join("prices.sqlite");
        let cache_path = data_dir.join("cache.sqlite");
        let scratch_dir = data_dir.join("scratch");
        Self {
            data_dir,
            store_path,
            cache_path,
            scratch_dir,
        }
    }

    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("create {}", self.data_dir.display()))?;
        fs::create_dir_all(&self.scratch_dir)
            .with_context(|| format!("create {}", self.scratch_dir.display()))?;
        Ok(())
    }
}

pub fn file_present_nonempty(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}
