//! Snapshot file for the in-memory engine
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────┬──────────┐
//! │ bincode(Snapshot)               │ CRC (4)  │
//! └─────────────────────────────────┴──────────┘
//! ```
//! The CRC32 (big-endian) covers the payload. Files are written to a
//! temporary sibling and renamed into place.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// File name used inside an environment directory
pub const SNAPSHOT_FILENAME: &str = "data.mdb";

const CRC_SIZE: usize = 4;

/// Persistent image of an environment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Map size recorded by the last writer
    pub map_size: u64,

    /// All entries in key order
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Snapshot {
    /// Encode to the on-disk layout
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes =
            bincode::serialize(self).map_err(|e| SyncError::Serialization(e.to_string()))?;
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_be_bytes());
        Ok(bytes)
    }

    /// Decode from the on-disk layout, verifying the checksum
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CRC_SIZE {
            return Err(SyncError::Corrupted(format!(
                "snapshot too short: {} bytes",
                bytes.len()
            )));
        }

        let (payload, trailer) = bytes.split_at(bytes.len() - CRC_SIZE);
        let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let actual = crc32fast::hash(payload);
        if expected != actual {
            return Err(SyncError::Corrupted(format!(
                "CRC mismatch: stored {:#010x}, computed {:#010x}",
                expected, actual
            )));
        }

        bincode::deserialize(payload).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Load a snapshot; `Ok(None)` if the file does not exist
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        Self::decode(&bytes).map(Some)
    }

    /// Write the snapshot, replacing any previous file
    pub fn store(&self, path: &Path, mode: u32) -> Result<()> {
        let bytes = self.encode()?;
        let tmp = temp_path(path);

        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        set_mode(&tmp, mode)?;
        fs::rename(&tmp, path)?;

        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
