use crate::core::{Key, VersionInfo};
use crate::operations::KeyMapping;

/// Published by a disconnected state on its broadcast channel.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// Live data for `key` was ingested into the original layer.
    Materialized { key: Key, version: VersionInfo },
    Created { key: Key },
    Changed { key: Key, offset: usize },
    Removed { key: Key },
    /// Live data for `key` is gone from the source.
    Vanished { key: Key },
    TransactionOpened,
    TransactionCommitted { operations: usize },
    TransactionRolledBack,
    ChangesApplied { mapping: KeyMapping },
    ChangesCancelled,
}
