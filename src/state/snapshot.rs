// ============================================================================
// Differential Snapshot
// ============================================================================
//
// Copy-on-write entity tuple: a shared origin plus an optional overlay of
// locally written fields. Reads consult the overlay first; writes never touch
// the origin.
//
// ============================================================================

use crate::core::{Key, Tuple, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// How a fresher origin is folded into an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeBehavior {
    /// Existing origin values win; the fresh tuple only fills fields the
    /// origin does not have.
    PreferOrigin,
    /// Fresh values overwrite the origin wherever they are available.
    PreferDifference,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifferentialSnapshot {
    origin: Arc<Tuple>,
    overlay: Option<BTreeMap<usize, Value>>,
}

impl DifferentialSnapshot {
    pub fn new(origin: Tuple) -> Self {
        Self {
            origin: Arc::new(origin),
            overlay: None,
        }
    }

    /// A snapshot whose every field is local: empty origin, full overlay.
    pub fn detached(values: Tuple) -> Self {
        let mut snapshot = Self::new(Vec::new());
        for (offset, value) in values.into_iter().enumerate() {
            snapshot.write(offset, value);
        }
        snapshot
    }

    pub fn origin(&self) -> &Tuple {
        &self.origin
    }

    /// Field value, or `None` when the field is unavailable.
    pub fn read(&self, offset: usize) -> Option<&Value> {
        self.overlay
            .as_ref()
            .and_then(|overlay| overlay.get(&offset))
            .or_else(|| self.origin.get(offset))
    }

    /// Writes into the overlay. Writing back the origin value drops the
    /// overlay entry, so an entity edited back to its origin is clean again.
    pub fn write(&mut self, offset: usize, value: Value) {
        if self.origin.get(offset) == Some(&value) {
            if let Some(overlay) = self.overlay.as_mut() {
                overlay.remove(&offset);
                if overlay.is_empty() {
                    self.overlay = None;
                }
            }
            return;
        }
        self.overlay
            .get_or_insert_with(BTreeMap::new)
            .insert(offset, value);
    }

    pub fn is_modified(&self) -> bool {
        self.overlay.as_ref().is_some_and(|overlay| !overlay.is_empty())
    }

    pub fn overlay(&self) -> impl Iterator<Item = (usize, &Value)> {
        self.overlay
            .iter()
            .flat_map(|overlay| overlay.iter().map(|(offset, value)| (*offset, value)))
    }

    pub fn len(&self) -> usize {
        let overlay_len = self
            .overlay
            .as_ref()
            .and_then(|overlay| overlay.keys().next_back())
            .map(|last| last + 1)
            .unwrap_or(0);
        self.origin.len().max(overlay_len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current field values, overlay applied. Gaps read as NULL.
    pub fn merged(&self) -> Tuple {
        (0..self.len())
            .map(|offset| self.read(offset).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Rebases the origin onto `fresh` field-by-field. The overlay is kept.
    pub fn merge_with(&mut self, fresh: &Tuple, behavior: MergeBehavior) {
        let len = self.origin.len().max(fresh.len());
        let origin = (0..len)
            .map(|offset| {
                let (first, second) = match behavior {
                    MergeBehavior::PreferDifference => (fresh.get(offset), self.origin.get(offset)),
                    MergeBehavior::PreferOrigin => (self.origin.get(offset), fresh.get(offset)),
                };
                first.or(second).cloned().unwrap_or(Value::Null)
            })
            .collect();
        self.replace_origin(origin);
    }

    /// Replaces the origin wholesale, keeping overlay entries that still differ.
    pub fn replace_origin(&mut self, origin: Tuple) {
        self.origin = Arc::new(origin);
        if let Some(overlay) = self.overlay.as_mut() {
            let origin = &self.origin;
            overlay.retain(|offset, value| origin.get(*offset) != Some(value));
            if overlay.is_empty() {
                self.overlay = None;
            }
        }
    }

    /// Folds the overlay into the origin.
    pub fn flatten(&self) -> Self {
        if !self.is_modified() {
            return self.clone();
        }
        Self::new(self.merged())
    }

    pub(crate) fn remap_refs(&self, remap: &impl Fn(&Key) -> Key) -> Self {
        Self {
            origin: Arc::new(self.origin.iter().map(|v| v.remap_refs(remap)).collect()),
            overlay: self.overlay.as_ref().map(|overlay| {
                overlay
                    .iter()
                    .map(|(offset, value)| (*offset, value.remap_refs(remap)))
                    .collect()
            }),
        }
    }
}
