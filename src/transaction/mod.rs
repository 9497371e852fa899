// ============================================================================
// Live Transaction Support
// ============================================================================
//
// Transaction lifecycle and the reversible change log used by in-memory live
// sessions. Writes go straight to the source; rollback replays the log
// backwards.
//
// ============================================================================

pub mod change;
pub mod state;

pub use change::Change;
pub use state::{Transaction, TransactionId, TransactionState};
