//! Engine configuration.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::wal::WalConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Adaptive hash index settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AhiConfig {
    /// Whether the index starts enabled.
    pub enabled: bool,
    /// Number of partitions; an index maps to `index_id % partitions`.
    pub partitions: usize,
    /// Target chain count per partition, rounded up to a prime.
    pub cells_per_partition: usize,
    /// Searches with the same recommendation before a hash build is considered.
    pub hash_analysis_limit: u32,
    /// Searches that must profit on one page before it is hashed.
    pub page_build_limit: u32,
    /// Potential successful guesses needed before pages are hashed at all.
    pub build_limit: u32,
}

impl Default for AhiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            partitions: 8,
            cells_per_partition: 4096,
            hash_analysis_limit: 17,
            page_build_limit: 16,
            build_limit: 100,
        }
    }
}

/// Configuration of one engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Buffer pool size in frames (16 KB each).
    pub buffer_pool_frames: usize,
    /// Tablespace size limit in pages; `None` is unbounded.
    pub tablespace_max_pages: Option<u32>,
    /// Fill percentage below which a page is considered for merging.
    pub merge_threshold_pct: usize,
    /// Padding kept free when merging into compressed pages.
    pub zip_pad_pct: usize,
    /// Target fill of pages packed by defragmentation.
    pub defrag_fill_pct: usize,
    /// Records' worth of space defragmentation leaves free, if that is less
    /// than what `defrag_fill_pct` leaves.
    pub defrag_fill_n_recs: usize,
    pub ahi: AhiConfig,
    pub wal: WalConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_pool_frames: 1024,
            tablespace_max_pages: None,
            merge_threshold_pct: 50,
            zip_pad_pct: 15,
            defrag_fill_pct: 90,
            defrag_fill_n_recs: 20,
            ahi: AhiConfig::default(),
            wal: WalConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Reads a JSON configuration file. Missing fields take their defaults.
    pub fn load(path: &Path) -> StorageResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&text)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.buffer_pool_frames < 8 {
            return Err(StorageError::InvalidIndex(format!(
                "buffer_pool_frames must be at least 8, got {}",
                self.buffer_pool_frames
            )));
        }
        if self.merge_threshold_pct == 0 || self.merge_threshold_pct > 50 {
            return Err(StorageError::InvalidIndex(format!(
                "merge_threshold_pct must be in 1..=50, got {}",
                self.merge_threshold_pct
            )));
        }
        if !(50..=100).contains(&self.defrag_fill_pct) {
            return Err(StorageError::InvalidIndex(format!(
                "defrag_fill_pct must be in 50..=100, got {}",
                self.defrag_fill_pct
            )));
        }
        if self.ahi.partitions == 0 {
            return Err(StorageError::InvalidIndex(
                "ahi.partitions must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.buffer_pool_frames, 1024);
        assert_eq!(config.merge_threshold_pct, 50);
        assert!(config.ahi.enabled);
        assert_eq!(config.ahi.page_build_limit, 16);
        assert!(config.wal.wal_dir.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_load_partial_json() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("engine.json");
        std::fs::write(
            &path,
            r#"{ "buffer_pool_frames": 64, "ahi": { "enabled": false } }"#,
        )?;
        let config = EngineConfig::load(&path)?;
        assert_eq!(config.buffer_pool_frames, 64);
        assert!(!config.ahi.enabled);
        assert_eq!(config.ahi.partitions, 8);
        assert_eq!(config.zip_pad_pct, 15);
        assert_eq!(config.defrag_fill_pct, 90);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_values() {
        let config = EngineConfig {
            merge_threshold_pct: 80,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = EngineConfig {
            defrag_fill_pct: 30,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
