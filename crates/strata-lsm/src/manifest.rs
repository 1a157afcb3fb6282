//! Component manifest.
//!
//! `manifest.json` in the data directory lists the operational Disk
//! components, newest first. It is rewritten through a temporary file and a
//! rename after every flush and merge, so a crash leaves either the old or
//! the new list.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use strata_common::{Result, StrataError};

pub const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_TMP_FILE: &str = "manifest.json.tmp";
pub const MANIFEST_VERSION: u32 = 1;

/// One Disk component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: u64,
    pub primary_file: u32,
    pub buddy_file: u32,
    pub tuple_count: u64,
    pub tombstone_count: u64,
    pub created_at: u64,
}

/// Persistent description of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub key_field_count: usize,
    pub next_component_id: u64,
    pub components: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(key_field_count: usize) -> Self {
        Self {
            version: MANIFEST_VERSION,
            key_field_count,
            next_component_id: 1,
            components: Vec::new(),
        }
    }

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    pub fn exists(dir: &Path) -> bool {
        Self::path(dir).exists()
    }

    /// Reads the manifest of `dir`, or None if there is none.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(dir);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let manifest: Manifest = serde_json::from_slice(&bytes).map_err(|e| {
            StrataError::ConfigError(format!("unreadable manifest {}: {}", path.display(), e))
        })?;
        if manifest.version != MANIFEST_VERSION {
            return Err(StrataError::ConfigError(format!(
                "manifest version {} is not supported",
                manifest.version
            )));
        }
        Ok(Some(manifest))
    }

    /// Atomically replaces the manifest of `dir`.
    pub fn store(&self, dir: &Path, fsync: bool) -> Result<()> {
        let tmp = dir.join(MANIFEST_TMP_FILE);
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| StrataError::Internal(format!("manifest encoding failed: {}", e)))?;
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&json)?;
            if fsync {
                file.sync_all()?;
            }
        }
        fs::rename(&tmp, Self::path(dir))?;
        if fsync {
            // Persist the rename itself
            File::open(dir)?.sync_all()?;
        }
        Ok(())
    }

    /// Files referenced by the listed components.
    pub fn file_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.components
            .iter()
            .flat_map(|c| [c.primary_file, c.buddy_file])
    }
}
