pub mod memory;
pub mod persistence;
pub mod session;

pub use memory::{MemorySession, MemorySource};
pub use persistence::{DisconnectedSnapshot, SNAPSHOT_FORMAT_VERSION, SnapshotFormat, SnapshotManager};
pub use session::{LiveSession, SessionVersionProvider, VersionProvider};
