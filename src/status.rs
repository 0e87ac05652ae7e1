use chrono::Utc;
use serde::Serialize;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::grid::{GridBook, PairStatus};
use crate::stats::RunStatsSnapshot;

const SNAPSHOT_EVERY: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct StatusReporter {
    path: PathBuf,
    agent: Option<String>,
    venue: String,
    observe_only: bool,
    snapshot_every: Duration,
    last_snapshot: Option<Instant>,
}

#[derive(Debug, Serialize)]
struct StatusLevel {
    open_at: String,
    close_at: String,
    open_chance: u32,
    close_chance: u32,
    open_pairs: usize,
    close_pairs: usize,
}

#[derive(Debug, Default, Serialize)]
struct PairCounts {
    pending: usize,
    awaiting_repair: usize,
    reconciled: usize,
}

#[derive(Debug, Serialize)]
struct StatusSnapshot {
    ts: i64,
    updated_at: String,
    agent: Option<String>,
    venue: String,
    observe_only: bool,
    spot_market: String,
    future_market: String,
    levels: Vec<StatusLevel>,
    pair_count: usize,
    pairs: PairCounts,
    indexed_orders: usize,
    stats: RunStatsSnapshot,
}

impl StatusReporter {
    /// Enabled by `GRIDHEDGE_STATUS_PATH`, or `GRIDHEDGE_STATUS_DIR`
    /// (written as `status.json` inside it).
    pub fn from_env(agent: Option<String>, venue: &str, observe_only: bool) -> Option<Self> {
        let path = env::var("GRIDHEDGE_STATUS_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                env::var("GRIDHEDGE_STATUS_DIR")
                    .ok()
                    .filter(|v| !v.trim().is_empty())
                    .map(|dir| PathBuf::from(dir).join("status.json"))
            })?;
        log::info!("[STATUS] writing status to {}", path.display());
        Some(Self::new(path, agent, venue, observe_only))
    }

    pub fn new(path: PathBuf, agent: Option<String>, venue: &str, observe_only: bool) -> Self {
        Self {
            path,
            agent,
            venue: venue.to_string(),
            observe_only,
            snapshot_every: SNAPSHOT_EVERY,
            last_snapshot: None,
        }
    }

    fn write_snapshot(
        &self,
        book: &GridBook,
        indexed_orders: usize,
        stats: RunStatsSnapshot,
    ) -> std::io::Result<()> {
        let levels = book
            .levels
            .iter()
            .map(|level| StatusLevel {
                open_at: level.open_at.to_string(),
                close_at: level.close_at.to_string(),
                open_chance: level.open_chance,
                close_chance: level.close_chance,
                open_pairs: level.open_pairs.len(),
                close_pairs: level.close_pairs.len(),
            })
            .collect();
        let snapshot = StatusSnapshot {
            ts: Utc::now().timestamp(),
            updated_at: Utc::now().to_rfc3339(),
            agent: self.agent.clone(),
            venue: self.venue.clone(),
            observe_only: self.observe_only,
            spot_market: book.spot_market.clone(),
            future_market: book.future_market.clone(),
            levels,
            pair_count: book.pair_count(),
            pairs: PairCounts {
                pending: book.count_by_status(PairStatus::Pending),
                awaiting_repair: book.count_by_status(PairStatus::AwaitingRepair),
                reconciled: book.count_by_status(PairStatus::Reconciled),
            },
            indexed_orders,
            stats,
        };
        let payload = serde_json::to_string(&snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, payload)?;
        fs::rename(tmp_path, &self.path)?;
        Ok(())
    }

    pub fn write_snapshot_if_due(
        &mut self,
        book: &GridBook,
        indexed_orders: usize,
        stats: RunStatsSnapshot,
    ) -> std::io::Result<bool> {
        let due = self
            .last_snapshot
            .map(|t| t.elapsed() >= self.snapshot_every)
            .unwrap_or(true);
        if !due {
            return Ok(false);
        }
        self.write_snapshot(book, indexed_orders, stats)?;
        self.last_snapshot = Some(Instant::now());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{GridLevel, HedgePair, PairDirection};
    use rust_decimal::Decimal;
    use tempfile::tempdir;

    #[test]
    fn snapshot_is_written_once_per_interval() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status").join("status.json");
        let mut reporter = StatusReporter::new(path.clone(), Some("grid-01".into()), "paper", false);

        let mut level = GridLevel::new(Decimal::ONE, Decimal::ZERO, 0, 1, Decimal::ONE);
        let pair = HedgePair::new(&level.id, PairDirection::Open, Decimal::ONE, Utc::now());
        level.open_pairs.insert(pair.id.clone(), pair);
        let book = GridBook::new("S", "F", vec![level]);
        let stats = RunStatsSnapshot {
            triggers: 1,
            ..Default::default()
        };

        assert!(reporter.write_snapshot_if_due(&book, 2, stats).unwrap());
        assert!(!reporter.write_snapshot_if_due(&book, 2, stats).unwrap());

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["agent"], "grid-01");
        assert_eq!(value["pair_count"], 1);
        assert_eq!(value["pairs"]["pending"], 1);
        assert_eq!(value["indexed_orders"], 2);
        assert_eq!(value["stats"]["triggers"], 1);
        assert_eq!(value["levels"][0]["close_chance"], 1);
        assert!(!path.with_extension("json.tmp").exists());
    }
}
