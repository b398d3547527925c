use std::collections::BTreeMap;

use deltabak_fs::path;
use serde::Deserialize;

use crate::{ChainError, Result};

/// Backup metadata sidecar (`<vm_dir>/<timestamp>.json`).
///
/// Only the fields needed to cross-reference artifacts are decoded; anything else in the
/// file is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum BackupMetadata {
    Full {
        xva: String,
    },
    Delta {
        /// Disk id to VHD path.
        vhds: BTreeMap<String, String>,
    },
}

impl BackupMetadata {
    pub fn parse(metadata_path: &str, raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|source| ChainError::InvalidMetadata {
            path: metadata_path.to_string(),
            source,
        })
    }

    /// Artifacts referenced by this backup, resolved against `vm_dir`.
    pub fn linked_files(&self, vm_dir: &str) -> Vec<String> {
        match self {
            BackupMetadata::Full { xva } => vec![path::resolve(vm_dir, xva)],
            BackupMetadata::Delta { vhds } => vhds
                .values()
                .map(|vhd| path::resolve(vm_dir, vhd))
                .collect(),
        }
    }
}
