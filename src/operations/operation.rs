// ============================================================================
// Recorded Operations
// ============================================================================
//
// An operation is a replayable intent captured while editing offline.
// Execution order within one operation tree is fixed: preconditions, the
// operation itself, then nested operations, depth-first and left-to-right.
//
// ============================================================================

use super::OperationContext;
use crate::core::{DbError, Key, Result, Tuple, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    Insert,
    Update,
    Remove,
    Group,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Insert => write!(f, "INSERT"),
            OperationType::Update => write!(f, "UPDATE"),
            OperationType::Remove => write!(f, "REMOVE"),
            OperationType::Group => write!(f, "GROUP"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// `key` may be temporary; a persistent key is allocated at prepare time.
    Insert { key: Key, values: Tuple },
    Update { key: Key, changes: Vec<(usize, Value)> },
    Remove { key: Key },
    /// Does nothing itself; carries preconditions and nested operations.
    Group,
}

/// Declares an operation that must appear at most once in a log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueMark {
    pub id: String,
    /// A repeated idempotent operation is dropped instead of rejected.
    pub idempotent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    title: String,
    kind: OperationKind,
    #[serde(default)]
    preconditions: Vec<Operation>,
    #[serde(default)]
    nested: Vec<Operation>,
    #[serde(default)]
    undo: Vec<Operation>,
    #[serde(default)]
    identified_entities: BTreeMap<String, Key>,
    #[serde(default)]
    unique: Option<UniqueMark>,
}

impl Operation {
    fn with_kind(title: String, kind: OperationKind) -> Self {
        Self {
            title,
            kind,
            preconditions: Vec::new(),
            nested: Vec::new(),
            undo: Vec::new(),
            identified_entities: BTreeMap::new(),
            unique: None,
        }
    }

    pub fn insert(key: Key, values: Tuple) -> Self {
        let mut op = Self::with_kind(
            format!("Insert {}", key),
            OperationKind::Insert {
                key: key.clone(),
                values: values.clone(),
            },
        );
        op.identify_refs(&values);
        op.undo.push(Self::with_kind(
            format!("Undo insert {}", key),
            OperationKind::Remove { key: key.clone() },
        ));
        op.identified_entities.insert("entity".to_string(), key);
        op
    }

    /// `previous` holds the field values the changes overwrite; it becomes
    /// the undo operation.
    pub fn update(key: Key, changes: Vec<(usize, Value)>, previous: Vec<(usize, Value)>) -> Self {
        let values: Tuple = changes.iter().map(|(_, value)| value.clone()).collect();
        let mut op = Self::with_kind(
            format!("Update {}", key),
            OperationKind::Update {
                key: key.clone(),
                changes,
            },
        );
        op.identify_refs(&values);
        if !previous.is_empty() {
            op.undo.push(Self::with_kind(
                format!("Undo update {}", key),
                OperationKind::Update {
                    key: key.clone(),
                    changes: previous,
                },
            ));
        }
        op.identified_entities.insert("entity".to_string(), key);
        op
    }

    /// Removing an entity twice is a logic error, so removes are unique per key.
    pub fn remove(key: Key, previous: Option<Tuple>) -> Self {
        let mut op = Self::with_kind(
            format!("Remove {}", key),
            OperationKind::Remove { key: key.clone() },
        );
        if let Some(values) = previous {
            op.undo.push(Self::with_kind(
                format!("Undo remove {}", key),
                OperationKind::Insert {
                    key: key.clone(),
                    values,
                },
            ));
        }
        op.unique = Some(UniqueMark {
            id: format!("remove:{}", key),
            idempotent: false,
        });
        op.identified_entities.insert("entity".to_string(), key);
        op
    }

    pub fn group(title: impl Into<String>) -> Self {
        Self::with_kind(title.into(), OperationKind::Group)
    }

    pub fn with_precondition(mut self, operation: Operation) -> Self {
        self.preconditions.push(operation);
        self
    }

    pub fn with_nested(mut self, operation: Operation) -> Self {
        self.nested.push(operation);
        self
    }

    pub fn with_undo(mut self, operation: Operation) -> Self {
        self.undo.push(operation);
        self
    }

    pub fn unique(mut self, id: impl Into<String>, idempotent: bool) -> Self {
        self.unique = Some(UniqueMark {
            id: id.into(),
            idempotent,
        });
        self
    }

    pub fn identify(mut self, name: impl Into<String>, key: Key) -> Self {
        self.identified_entities.insert(name.into(), key);
        self
    }

    fn identify_refs(&mut self, values: &[Value]) {
        for (index, value) in values.iter().enumerate() {
            if let Value::Ref(key) = value {
                self.identified_entities
                    .insert(format!("ref:{}", index), key.clone());
            }
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn operation_type(&self) -> OperationType {
        match self.kind {
            OperationKind::Insert { .. } => OperationType::Insert,
            OperationKind::Update { .. } => OperationType::Update,
            OperationKind::Remove { .. } => OperationType::Remove,
            OperationKind::Group => OperationType::Group,
        }
    }

    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    pub fn target_key(&self) -> Option<&Key> {
        match &self.kind {
            OperationKind::Insert { key, .. }
            | OperationKind::Update { key, .. }
            | OperationKind::Remove { key } => Some(key),
            OperationKind::Group => None,
        }
    }

    pub fn preconditions(&self) -> &[Operation] {
        &self.preconditions
    }

    pub fn nested_operations(&self) -> &[Operation] {
        &self.nested
    }

    pub fn undo_operations(&self) -> &[Operation] {
        &self.undo
    }

    pub fn identified_entities(&self) -> &BTreeMap<String, Key> {
        &self.identified_entities
    }

    pub fn unique_mark(&self) -> Option<&UniqueMark> {
        self.unique.as_ref()
    }

    /// The operation tree in execution order.
    pub fn flatten(&self) -> Vec<&Operation> {
        let mut ordered = Vec::new();
        self.flatten_into(&mut ordered);
        ordered
    }

    fn flatten_into<'a>(&'a self, ordered: &mut Vec<&'a Operation>) {
        for precondition in &self.preconditions {
            precondition.flatten_into(ordered);
        }
        ordered.push(self);
        for nested in &self.nested {
            nested.flatten_into(ordered);
        }
    }

    /// Allocates persistent keys for temporary inserts and registers keys
    /// worth prefetching. Applies to this node only, not its children.
    pub async fn prepare(&self, ctx: &mut OperationContext<'_>) -> Result<()> {
        match &self.kind {
            OperationKind::Insert { key, .. } => {
                if key.is_temporary() {
                    ctx.allocate_key(key).await?;
                }
            }
            OperationKind::Update { key, .. } | OperationKind::Remove { key } => {
                ctx.register_prefetch(key);
            }
            OperationKind::Group => {}
        }
        Ok(())
    }

    /// Performs the mutation against the live session. Applies to this node
    /// only, not its children.
    pub async fn execute(&self, ctx: &mut OperationContext<'_>) -> Result<()> {
        match &self.kind {
            OperationKind::Insert { key, values } => {
                let key = ctx.resolve_key(key);
                let values = ctx.key_mapping().remap_tuple(values);
                ctx.insert(&key, values).await
            }
            OperationKind::Update { key, changes } => {
                let key = ctx.resolve_key(key);
                let mut current = ctx
                    .fetch(&key)
                    .await?
                    .ok_or_else(|| DbError::EntityNotFound(key.to_string()))?;
                for (offset, value) in changes {
                    let value = ctx.key_mapping().remap_value(value);
                    if *offset >= current.len() {
                        current.resize(offset + 1, Value::Null);
                    }
                    current[*offset] = value;
                }
                ctx.update(&key, current).await
            }
            OperationKind::Remove { key } => {
                let key = ctx.resolve_key(key);
                ctx.fetch(&key)
                    .await?
                    .ok_or_else(|| DbError::EntityNotFound(key.to_string()))?;
                ctx.remove(&key).await
            }
            OperationKind::Group => Ok(()),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.title, self.operation_type())?;
        if !self.nested.is_empty() || !self.preconditions.is_empty() {
            write!(
                f,
                " (+{} preconditions, +{} nested)",
                self.preconditions.len(),
                self.nested.len()
            )?;
        }
        Ok(())
    }
}
