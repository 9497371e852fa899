// ============================================================================
// Operation Capture & Replay
// ============================================================================
//
// Local edits are recorded as operations; `OperationLog::replay` re-executes
// them against a live session and yields the key mapping for entities that
// were created offline under temporary keys.
//
// ============================================================================

pub mod context;
pub mod key_mapping;
pub mod log;
pub mod operation;

pub use context::{OperationContext, ReplayObserver};
pub use key_mapping::KeyMapping;
pub use log::OperationLog;
pub use operation::{Operation, OperationKind, OperationType, UniqueMark};
