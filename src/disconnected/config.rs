use crate::core::{DbError, Result};
use crate::storage::SnapshotFormat;
use crate::version::MergeMode;

/// Disconnected state configuration
#[derive(Debug, Clone)]
pub struct OfflineConfig {
    /// Merge mode applied to data read from the live source while connected
    pub merge_mode: MergeMode,

    /// Check live versions of touched entities while applying changes
    pub validate_versions: bool,

    /// Buffer size of the lifecycle event channel
    pub event_capacity: usize,

    /// Encoding used by `save`
    pub snapshot_format: SnapshotFormat,

    /// Open a local transaction on connect, committed on disconnect
    pub chain_connected_transactions: bool,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            merge_mode: MergeMode::PreferNew,
            validate_versions: false,
            event_capacity: 256,
            snapshot_format: SnapshotFormat::MessagePack,
            chain_connected_transactions: true,
        }
    }
}

impl OfflineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the merge mode for connected reads
    pub fn merge_mode(mut self, mode: MergeMode) -> Self {
        self.merge_mode = mode;
        self
    }

    /// Enable or disable version validation during apply
    pub fn validate_versions(mut self, enabled: bool) -> Self {
        self.validate_versions = enabled;
        self
    }

    /// Set the lifecycle event buffer size
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set the snapshot encoding
    pub fn snapshot_format(mut self, format: SnapshotFormat) -> Self {
        self.snapshot_format = format;
        self
    }

    /// Enable or disable the chained transaction of connected scopes
    pub fn chain_connected_transactions(mut self, enabled: bool) -> Self {
        self.chain_connected_transactions = enabled;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.event_capacity == 0 {
            return Err(DbError::Validation("event_capacity must be > 0".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides_defaults() {
        let config = OfflineConfig::new()
            .merge_mode(MergeMode::Strict)
            .validate_versions(true)
            .snapshot_format(SnapshotFormat::Json);

        assert_eq!(config.merge_mode, MergeMode::Strict);
        assert!(config.validate_versions);
        assert_eq!(config.snapshot_format, SnapshotFormat::Json);
        assert_eq!(config.event_capacity, 256);
        assert!(config.chain_connected_transactions);
    }

    #[test]
    fn test_zero_capacity_is_invalid() {
        assert!(OfflineConfig::new().event_capacity(0).validate().is_err());
    }
}
