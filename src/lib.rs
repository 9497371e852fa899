// ============================================================================
// RustMemDB Offline
// ============================================================================
//
// Disconnected entity-state cache: read entities from a live source, edit
// them offline, capture every edit as a replayable operation and apply the
// whole change set later in one transaction, with optional optimistic
// version checks.
//
// ============================================================================

pub mod core;
pub mod disconnected;
pub mod operations;
pub mod state;
pub mod storage;
pub mod transaction;
pub mod version;

pub use core::{
    DataType, DbError, EntityModel, EntityValidator, FieldInfo, Key, Result, SchemaValidator,
    Tuple, TypeInfo, Value, VersionInfo,
};
pub use disconnected::{
    AttachScope, ConnectScope, DisconnectedState, LifecycleEvent, OfflineConfig,
};
pub use operations::{
    KeyMapping, Operation, OperationContext, OperationKind, OperationLog, OperationType,
    ReplayObserver, UniqueMark,
};
pub use state::{DifferentialSnapshot, EntityRecord, MergeBehavior, PersistenceState, StateRegistry};
pub use storage::{
    DisconnectedSnapshot, LiveSession, MemorySession, MemorySource, SessionVersionProvider,
    SnapshotFormat, SnapshotManager, VersionProvider,
};
pub use version::{MergeMode, VersionSet, VersionValidator};
