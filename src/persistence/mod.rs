//! Durable storage for grid layout and cached fund balances: atomic
//! file writes keyed by bot identity, tolerant of a missing file on
//! first run.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::core::types::{FundLedger, Order};
use crate::errors::Error;

/// Everything about the grid layout that must survive a restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridSnapshot {
    pub orders: Vec<Order>,
    pub version: u64,
}

/// Storage contract the bot depends on for crash recovery. Implementations
/// live outside the core so the core stays free of I/O.
#[async_trait::async_trait]
pub trait GridPersistence: Send + Sync {
    async fn read_grid(&self, bot_id: &str) -> Result<Option<GridSnapshot>, Error>;
    async fn write_grid(&self, bot_id: &str, snapshot: &GridSnapshot) -> Result<(), Error>;
    async fn read_cache_funds(&self, bot_id: &str) -> Result<Option<FundLedger>, Error>;
    async fn write_cache_funds(&self, bot_id: &str, ledger: &FundLedger) -> Result<(), Error>;
}

/// JSON-on-disk implementation. Each bot identity gets its own pair of
/// files under `base_dir`; writes go to a `.tmp` sibling and are renamed
/// into place so a crash mid-write never leaves a half-written file
/// behind for the next load to trip over.
pub struct FilePersistence {
    base_dir: PathBuf,
}

impl FilePersistence {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    fn grid_path(&self, bot_id: &str) -> PathBuf {
        self.base_dir.join(format!("{bot_id}.grid.json"))
    }

    fn funds_path(&self, bot_id: &str) -> PathBuf {
        self.base_dir.join(format!("{bot_id}.funds.json"))
    }

    fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("tmp");
        let content = serde_json::to_string_pretty(value)?;
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    fn read_if_exists<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, Error> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

#[async_trait::async_trait]
impl GridPersistence for FilePersistence {
    async fn read_grid(&self, bot_id: &str) -> Result<Option<GridSnapshot>, Error> {
        let path = self.grid_path(bot_id);
        match Self::read_if_exists(&path) {
            Ok(snapshot) => {
                if snapshot.is_some() {
                    info!("loaded grid snapshot for {bot_id} from {path:?}");
                }
                Ok(snapshot)
            }
            Err(e) => {
                warn!("failed to load grid snapshot for {bot_id}: {e}, starting fresh");
                Ok(None)
            }
        }
    }

    async fn write_grid(&self, bot_id: &str, snapshot: &GridSnapshot) -> Result<(), Error> {
        let path = self.grid_path(bot_id);
        Self::write_atomic(&path, snapshot)?;
        debug!("grid snapshot for {bot_id} saved to {path:?}");
        Ok(())
    }

    async fn read_cache_funds(&self, bot_id: &str) -> Result<Option<FundLedger>, Error> {
        let path = self.funds_path(bot_id);
        match Self::read_if_exists(&path) {
            Ok(ledger) => Ok(ledger),
            Err(e) => {
                warn!("failed to load cache funds for {bot_id}: {e}, starting fresh");
                Ok(None)
            }
        }
    }

    async fn write_cache_funds(&self, bot_id: &str, ledger: &FundLedger) -> Result<(), Error> {
        let path = self.funds_path(bot_id);
        Self::write_atomic(&path, ledger)?;
        debug!("cache funds for {bot_id} saved to {path:?}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Order, OrderKind};

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("grid-market-maker-test-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[tokio::test]
    async fn missing_file_reads_as_none() {
        let store = FilePersistence::new(temp_dir("missing"));
        assert!(store.read_grid("acct-1").await.unwrap().is_none());
        assert!(store.read_cache_funds("acct-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let store = FilePersistence::new(temp_dir("roundtrip"));
        let snapshot = GridSnapshot {
            orders: vec![Order::virtual_order("slot-0".into(), 10.0, OrderKind::Buy, 2.0)],
            version: 7,
        };

        store.write_grid("acct-1", &snapshot).await.unwrap();
        let loaded = store.read_grid("acct-1").await.unwrap().unwrap();
        assert_eq!(loaded.version, 7);
        assert_eq!(loaded.orders.len(), 1);
    }

    #[tokio::test]
    async fn write_is_atomic_no_tmp_file_left_behind() {
        let store = FilePersistence::new(temp_dir("atomic"));
        let ledger = FundLedger::default();
        store.write_cache_funds("acct-1", &ledger).await.unwrap();

        let tmp_path = store.funds_path("acct-1").with_extension("tmp");
        assert!(!tmp_path.exists());
        assert!(store.funds_path("acct-1").exists());
    }
}
