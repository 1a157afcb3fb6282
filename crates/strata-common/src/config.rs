//! Configuration structures for Strata.

use crate::error::{Result, StrataError};
use crate::page::PAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Storage configuration for component files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for component files and the manifest.
    pub data_dir: PathBuf,
    /// Page size in bytes.
    pub page_size: usize,
    /// Buffer pool size in number of pages.
    pub buffer_pool_pages: usize,
    /// Enable fsync for durability.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            page_size: PAGE_SIZE,
            buffer_pool_pages: 8192, // 128 MB with 16 KB pages
            fsync_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Returns the total buffer pool size in bytes.
    pub fn buffer_pool_size_bytes(&self) -> usize {
        self.buffer_pool_pages * self.page_size
    }

    /// Checks that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.page_size != PAGE_SIZE {
            return Err(StrataError::InvalidParameter {
                name: "page_size".to_string(),
                value: self.page_size.to_string(),
            });
        }
        if self.buffer_pool_pages == 0 {
            return Err(StrataError::InvalidParameter {
                name: "buffer_pool_pages".to_string(),
                value: "0".to_string(),
            });
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(StrataError::ConfigError("data_dir is empty".to_string()));
        }
        Ok(())
    }

    /// Derives the buffer cache configuration for this storage configuration.
    pub fn buffer_cache(&self) -> BufferCacheConfig {
        BufferCacheConfig {
            num_frames: self.buffer_pool_pages,
            ..Default::default()
        }
    }
}

/// Buffer cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferCacheConfig {
    /// Number of page frames.
    pub num_frames: usize,
    /// How long `pin` waits for a frame before failing with `BufferPoolFull`.
    pub pin_timeout_ms: u64,
    /// Interval of the background dirty page cleaner (0 = no cleaner).
    pub cleaner_interval_ms: u64,
}

impl Default for BufferCacheConfig {
    fn default() -> Self {
        Self {
            num_frames: 1024,
            pin_timeout_ms: 5_000,
            cleaner_interval_ms: 0,
        }
    }
}

impl BufferCacheConfig {
    /// Returns the pin timeout as a Duration.
    pub fn pin_timeout(&self) -> Duration {
        Duration::from_millis(self.pin_timeout_ms)
    }

    /// Returns the cleaner interval, if the cleaner is enabled.
    pub fn cleaner_interval(&self) -> Option<Duration> {
        (self.cleaner_interval_ms > 0).then(|| Duration::from_millis(self.cleaner_interval_ms))
    }

    /// Checks that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.num_frames == 0 {
            return Err(StrataError::InvalidParameter {
                name: "num_frames".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

/// Merge policy selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MergePolicyKind {
    /// Never merge.
    NoMerge,
    /// Merge every Disk component once there are more than `max_components`.
    Constant { max_components: usize },
    /// Merge runs of similarly sized Disk components.
    SizeTiered {
        min_merge_width: usize,
        max_merge_width: usize,
        size_ratio: f64,
    },
}

impl Default for MergePolicyKind {
    fn default() -> Self {
        MergePolicyKind::Constant { max_components: 5 }
    }
}

impl MergePolicyKind {
    /// Checks the policy parameters.
    pub fn validate(&self) -> Result<()> {
        match self {
            MergePolicyKind::NoMerge => Ok(()),
            MergePolicyKind::Constant { max_components } => {
                if *max_components == 0 {
                    return Err(StrataError::InvalidParameter {
                        name: "max_components".to_string(),
                        value: "0".to_string(),
                    });
                }
                Ok(())
            }
            MergePolicyKind::SizeTiered {
                min_merge_width,
                max_merge_width,
                size_ratio,
            } => {
                if *min_merge_width < 2 || max_merge_width < min_merge_width {
                    return Err(StrataError::ConfigError(format!(
                        "merge width range {}..={} is invalid",
                        min_merge_width, max_merge_width
                    )));
                }
                if !(*size_ratio >= 1.0) {
                    return Err(StrataError::InvalidParameter {
                        name: "size_ratio".to_string(),
                        value: size_ratio.to_string(),
                    });
                }
                Ok(())
            }
        }
    }
}

/// Configuration of one LSM index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LsmConfig {
    /// Number of fields in every stored tuple.
    pub field_count: usize,
    /// Number of leading fields forming the key.
    pub key_field_count: usize,
    /// Approximate Memory component size that triggers a flush, in bytes.
    pub memory_component_budget: usize,
    /// Target false positive rate of buddy bloom filters.
    pub bloom_false_positive_rate: f64,
    /// Merge policy.
    pub merge_policy: MergePolicyKind,
    /// Worker threads of the IO scheduler.
    pub io_threads: usize,
    /// Ask the merge policy for candidates after every flush.
    pub auto_merge: bool,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            field_count: 2,
            key_field_count: 1,
            memory_component_budget: 4 * 1024 * 1024, // 4 MB
            bloom_false_positive_rate: 0.01,
            merge_policy: MergePolicyKind::default(),
            io_threads: 2,
            auto_merge: true,
        }
    }
}

impl LsmConfig {
    /// Checks that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.key_field_count == 0 {
            return Err(StrataError::InvalidParameter {
                name: "key_field_count".to_string(),
                value: "0".to_string(),
            });
        }
        if self.field_count < self.key_field_count {
            return Err(StrataError::ConfigError(format!(
                "field_count {} is smaller than key_field_count {}",
                self.field_count, self.key_field_count
            )));
        }
        if !(self.bloom_false_positive_rate > 0.0 && self.bloom_false_positive_rate < 1.0) {
            return Err(StrataError::InvalidParameter {
                name: "bloom_false_positive_rate".to_string(),
                value: self.bloom_false_positive_rate.to_string(),
            });
        }
        if self.memory_component_budget == 0 {
            return Err(StrataError::InvalidParameter {
                name: "memory_component_budget".to_string(),
                value: "0".to_string(),
            });
        }
        if self.io_threads == 0 {
            return Err(StrataError::InvalidParameter {
                name: "io_threads".to_string(),
                value: "0".to_string(),
            });
        }
        self.merge_policy.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.page_size, 16384);
        assert_eq!(config.buffer_pool_pages, 8192);
        assert!(config.fsync_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_buffer_pool_size_bytes() {
        let config = StorageConfig::default();
        // 8192 pages * 16384 bytes = 128 MB
        assert_eq!(config.buffer_pool_size_bytes(), 134_217_728);
        assert_eq!(config.buffer_cache().num_frames, 8192);
    }

    #[test]
    fn test_storage_config_rejects_other_page_size() {
        let config = StorageConfig {
            page_size: 8192,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StrataError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_storage_config_serde_roundtrip() {
        let original = StorageConfig {
            data_dir: PathBuf::from("/var/lib/strata"),
            ..Default::default()
        };
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: StorageConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original.data_dir, deserialized.data_dir);
        assert_eq!(original.buffer_pool_pages, deserialized.buffer_pool_pages);
    }

    #[test]
    fn test_buffer_cache_config() {
        let config = BufferCacheConfig::default();
        assert_eq!(config.pin_timeout(), Duration::from_secs(5));
        assert!(config.cleaner_interval().is_none());

        let config = BufferCacheConfig {
            cleaner_interval_ms: 50,
            ..Default::default()
        };
        assert_eq!(config.cleaner_interval(), Some(Duration::from_millis(50)));

        let config = BufferCacheConfig {
            num_frames: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lsm_config_defaults_are_valid() {
        let config = LsmConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.merge_policy,
            MergePolicyKind::Constant { max_components: 5 }
        );
    }

    #[test]
    fn test_lsm_config_rejects_bad_values() {
        let config = LsmConfig {
            key_field_count: 3,
            field_count: 2,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(StrataError::ConfigError(_))));

        let config = LsmConfig {
            bloom_false_positive_rate: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = LsmConfig {
            io_threads: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_merge_policy_kind_validation() {
        assert!(MergePolicyKind::NoMerge.validate().is_ok());
        assert!(MergePolicyKind::Constant { max_components: 0 }
            .validate()
            .is_err());
        assert!(MergePolicyKind::SizeTiered {
            min_merge_width: 2,
            max_merge_width: 4,
            size_ratio: 1.2,
        }
        .validate()
        .is_ok());
        assert!(MergePolicyKind::SizeTiered {
            min_merge_width: 1,
            max_merge_width: 4,
            size_ratio: 1.2,
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_lsm_config_serde_roundtrip() {
        let original = LsmConfig {
            merge_policy: MergePolicyKind::SizeTiered {
                min_merge_width: 2,
                max_merge_width: 6,
                size_ratio: 1.5,
            },
            ..Default::default()
        };
        let serialized = serde_json::to_string(&original).unwrap();
        assert!(serialized.contains("\"type\":\"size_tiered\""));
        let deserialized: LsmConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized.merge_policy, original.merge_policy);
        assert_eq!(deserialized.key_field_count, original.key_field_count);
    }
}
