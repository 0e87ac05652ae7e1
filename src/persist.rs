use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::grid::{GridBook, GridLevel};

/// On-disk layout of the state file.
#[derive(Debug, Serialize, Deserialize)]
pub struct GridPersistItem {
    pub time: DateTime<Utc>,
    pub spot_name: String,
    pub future_name: String,
    pub grids: Vec<GridLevel>,
}

#[derive(Debug, Clone)]
pub struct GridStore {
    path: PathBuf,
}

impl GridStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Writes the whole book to a temp file and renames it into place.
    pub fn save(&self, book: &GridBook) -> anyhow::Result<()> {
        let item = GridPersistItem {
            time: Utc::now(),
            spot_name: book.spot_market.clone(),
            future_name: book.future_market.clone(),
            grids: book.levels.clone(),
        };
        let payload = serde_yaml::to_string(&item).context("serialize grid state")?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
        }
        let tmp_path = self.path.with_extension("yaml.tmp");
        fs::write(&tmp_path, payload)
            .with_context(|| format!("write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("rename into {}", self.path.display()))?;
        Ok(())
    }

    pub fn load(&self) -> anyhow::Result<GridBook> {
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("read state file {}", self.path.display()))?;
        let item: GridPersistItem = serde_yaml::from_str(&text)
            .with_context(|| format!("parse state file {}", self.path.display()))?;
        log::info!(
            "[PERSIST] restored {} levels saved at {}",
            item.grids.len(),
            item.time
        );
        Ok(GridBook::new(&item.spot_name, &item.future_name, item.grids))
    }
}
