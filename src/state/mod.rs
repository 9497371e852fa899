//! Layered, copy-on-write entity state.
//!
//! A [`StateRegistry`] holds [`EntityRecord`]s for one layer and falls back
//! to its origin layer for everything else. Each record keeps its values as a
//! [`DifferentialSnapshot`]: the origin tuple plus the locally written fields.

pub mod record;
pub mod registry;
pub mod snapshot;

pub use record::{EntityRecord, PersistenceState};
pub use registry::StateRegistry;
pub use snapshot::{DifferentialSnapshot, MergeBehavior};
