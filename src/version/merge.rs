use crate::state::MergeBehavior;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Policy for ingesting entity data whose version differs from the one
/// already known.
///
/// | mode           | origin data        | stored version               |
/// |----------------|--------------------|------------------------------|
/// | `Strict`       | conflict is an error; otherwise fresh data wins | added when absent |
/// | `PreferSource` | fresh data wins    | replaced                     |
/// | `PreferTarget` | existing data wins | kept, added when absent      |
/// | `PreferNew`    | fresh data wins    | always the incoming version  |
///
/// Local overlays survive in every mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MergeMode {
    Strict,
    PreferSource,
    PreferTarget,
    #[default]
    PreferNew,
}

impl MergeMode {
    pub fn merge_behavior(self) -> MergeBehavior {
        match self {
            MergeMode::PreferTarget => MergeBehavior::PreferOrigin,
            MergeMode::Strict | MergeMode::PreferSource | MergeMode::PreferNew => {
                MergeBehavior::PreferDifference
            }
        }
    }

    /// Whether an incoming version replaces a stored one.
    pub fn overwrites_version(self) -> bool {
        matches!(self, MergeMode::PreferSource | MergeMode::PreferNew)
    }

    /// Whether a void incoming version clears the stored one.
    pub fn clears_on_void(self) -> bool {
        matches!(self, MergeMode::PreferNew)
    }

    pub fn rejects_conflicts(self) -> bool {
        matches!(self, MergeMode::Strict)
    }
}

impl fmt::Display for MergeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeMode::Strict => write!(f, "strict"),
            MergeMode::PreferSource => write!(f, "prefer-source"),
            MergeMode::PreferTarget => write!(f, "prefer-target"),
            MergeMode::PreferNew => write!(f, "prefer-new"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_prefer_target_keeps_origin() {
        assert_eq!(MergeMode::PreferTarget.merge_behavior(), MergeBehavior::PreferOrigin);
        for mode in [MergeMode::Strict, MergeMode::PreferSource, MergeMode::PreferNew] {
            assert_eq!(mode.merge_behavior(), MergeBehavior::PreferDifference);
        }
    }

    #[test]
    fn test_version_policy() {
        assert!(!MergeMode::Strict.overwrites_version());
        assert!(!MergeMode::PreferTarget.overwrites_version());
        assert!(MergeMode::PreferSource.overwrites_version());
        assert!(MergeMode::PreferNew.clears_on_void());
        assert!(!MergeMode::PreferSource.clears_on_void());
    }
}
