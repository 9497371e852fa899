//! Version tracking for optimistic replay.
//!
//! A [`VersionSet`] remembers the fingerprint each known entity had when it
//! was last read from the live source. [`MergeMode`] decides what happens when
//! fresher data arrives with a different fingerprint, and [`VersionValidator`]
//! checks the live versions during replay.

pub mod merge;
pub mod validator;
pub mod version_set;

pub use merge::MergeMode;
pub use validator::VersionValidator;
pub use version_set::VersionSet;
