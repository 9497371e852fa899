//! Serialized form of a disconnected state and atomic snapshot files.

use crate::core::{DbError, Result};
use crate::operations::OperationLog;
use crate::state::EntityRecord;
use crate::version::VersionSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{Level, event};

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

// ============================================================================
// Disconnected Snapshot
// ============================================================================

/// Flat, acyclic image of a disconnected state: both registry layers as
/// ordered record lists, the captured operations and the known versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisconnectedSnapshot {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub original: Vec<EntityRecord>,
    pub local: Vec<EntityRecord>,
    pub operations: OperationLog,
    #[serde(default)]
    pub versions: VersionSet,
}

impl DisconnectedSnapshot {
    pub fn new(
        mut original: Vec<EntityRecord>,
        mut local: Vec<EntityRecord>,
        operations: OperationLog,
        versions: VersionSet,
    ) -> Self {
        original.sort_by_cached_key(|record| record.key().to_string());
        local.sort_by_cached_key(|record| record.key().to_string());
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            created_at: Utc::now(),
            original,
            local,
            operations,
            versions,
        }
    }

    fn check_version(self) -> Result<Self> {
        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(DbError::Serialization(format!(
                "Unsupported snapshot format version {} (expected {})",
                self.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        Ok(self)
    }
}

// ============================================================================
// Encoding
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotFormat {
    #[default]
    MessagePack,
    Json,
}

impl SnapshotFormat {
    /// JSON snapshots are objects; anything else is taken as MessagePack.
    pub fn detect(bytes: &[u8]) -> Self {
        match bytes.iter().find(|byte| !byte.is_ascii_whitespace()) {
            Some(b'{') => SnapshotFormat::Json,
            _ => SnapshotFormat::MessagePack,
        }
    }

    pub fn encode(self, snapshot: &DisconnectedSnapshot) -> Result<Vec<u8>> {
        match self {
            SnapshotFormat::MessagePack => Ok(rmp_serde::to_vec_named(snapshot)?),
            SnapshotFormat::Json => Ok(serde_json::to_vec_pretty(snapshot)?),
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Result<DisconnectedSnapshot> {
        let snapshot: DisconnectedSnapshot = match self {
            SnapshotFormat::MessagePack => rmp_serde::from_slice(bytes)?,
            SnapshotFormat::Json => serde_json::from_slice(bytes)?,
        };
        snapshot.check_version()
    }
}

// ============================================================================
// Snapshot Manager
// ============================================================================

pub struct SnapshotManager {
    snapshot_path: PathBuf,
    format: SnapshotFormat,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(snapshot_path: P, format: SnapshotFormat) -> Self {
        Self {
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
            format,
        }
    }

    pub fn path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Writes to a temporary file next to the target and renames it into
    /// place, so readers never see a partial snapshot.
    pub fn save(&self, snapshot: &DisconnectedSnapshot) -> Result<()> {
        let dir = self
            .snapshot_path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let bytes = self.format.encode(snapshot)?;
        let mut temp = NamedTempFile::new_in(dir)?;
        temp.write_all(&bytes)?;
        temp.flush()?;
        temp.as_file().sync_all()?;
        temp.persist(&self.snapshot_path)
            .map_err(|err| DbError::IoError(format!("Failed to persist snapshot: {}", err.error)))?;

        event!(
            Level::DEBUG,
            path = %self.snapshot_path.display(),
            bytes = bytes.len(),
            "disconnected snapshot saved"
        );
        Ok(())
    }

    /// `None` when no snapshot file exists yet.
    pub fn load(&self) -> Result<Option<DisconnectedSnapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.snapshot_path)?;
        SnapshotFormat::detect(&bytes).decode(&bytes).map(Some)
    }

    pub fn exists(&self) -> bool {
        self.snapshot_path.exists()
    }

    pub fn delete(&self) -> Result<()> {
        if self.snapshot_path.exists() {
            fs::remove_file(&self.snapshot_path)?;
        }
        Ok(())
    }
}
