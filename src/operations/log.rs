// ============================================================================
// Operation Log
// ============================================================================
//
// Ordered, serializable sequence of captured operations, replayed against a
// live session inside a single transaction. Replay is all-or-nothing: any
// failure while preparing or executing rolls the live transaction back.
//
// Backed by persistent collections so registry layers can be cloned cheaply.
//
// ============================================================================

use super::{KeyMapping, Operation, OperationContext, ReplayObserver};
use crate::core::{DbError, Result};
use crate::storage::LiveSession;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, Level, event, info_span};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Operation>", into = "Vec<Operation>")]
pub struct OperationLog {
    operations: im::Vector<Operation>,
    unique_ids: im::HashSet<String>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.operations.iter()
    }

    pub fn clear(&mut self) {
        self.operations.clear();
        self.unique_ids.clear();
    }

    /// Appends `operation`. A non-idempotent duplicate of a unique operation
    /// is rejected here, at capture time. Returns `false` when an idempotent
    /// duplicate was dropped.
    pub fn log(&mut self, operation: Operation) -> Result<bool> {
        let mut ids = self.unique_ids.clone();
        if !Self::claim_unique_ids(&mut ids, &operation)? {
            event!(
                Level::DEBUG,
                operation = %operation.title(),
                "idempotent duplicate dropped"
            );
            return Ok(false);
        }
        self.unique_ids = ids;
        event!(Level::DEBUG, operation = %operation.title(), "operation captured");
        self.operations.push_back(operation);
        Ok(true)
    }

    /// Whether `operation` may follow this log: `Ok(false)` for an
    /// idempotent duplicate, an error for a rejected one.
    pub fn admits(&self, operation: &Operation) -> Result<bool> {
        let mut ids = self.unique_ids.clone();
        Self::claim_unique_ids(&mut ids, operation)
    }

    /// Appends every operation of `other`, or none of them.
    pub fn append(&mut self, other: &OperationLog) -> Result<()> {
        let mut merged = self.clone();
        for operation in other.iter() {
            merged.log(operation.clone())?;
        }
        *self = merged;
        Ok(())
    }

    /// Records the unique ids of the operation tree into `ids`.
    /// `Ok(false)` means the root is an idempotent duplicate.
    fn claim_unique_ids(ids: &mut im::HashSet<String>, operation: &Operation) -> Result<bool> {
        for node in operation.flatten() {
            let Some(mark) = node.unique_mark() else {
                continue;
            };
            if ids.insert(mark.id.clone()).is_some() {
                if mark.idempotent && std::ptr::eq(node, operation) {
                    return Ok(false);
                }
                if mark.idempotent {
                    continue;
                }
                return Err(DbError::DuplicateOperation(format!(
                    "'{}' ({})",
                    mark.id,
                    node.title()
                )));
            }
        }
        Ok(true)
    }

    /// Undo operations of the whole log, in the order they should run.
    pub fn undo_operations(&self) -> Vec<Operation> {
        let mut undo = Vec::new();
        for operation in self.operations.iter().rev() {
            for node in operation.flatten().into_iter().rev() {
                undo.extend(node.undo_operations().iter().rev().cloned());
            }
        }
        undo
    }

    /// Replays the log against `session` inside one live transaction.
    pub async fn replay(
        &self,
        session: &mut dyn LiveSession,
        observer: Option<&mut dyn ReplayObserver>,
    ) -> Result<KeyMapping> {
        let span = info_span!(
            "offline.replay",
            operations = self.operations.len(),
            session = %session.name()
        );
        self.replay_in_transaction(session, observer)
            .instrument(span)
            .await
    }

    async fn replay_in_transaction(
        &self,
        session: &mut dyn LiveSession,
        observer: Option<&mut dyn ReplayObserver>,
    ) -> Result<KeyMapping> {
        session.begin_transaction().await?;

        let outcome = {
            let observer = observer.map(|o| o as &mut dyn ReplayObserver);
            let mut ctx = OperationContext::new(&mut *session, observer);
            match self.run(&mut ctx).await {
                Ok(()) => Ok(ctx.into_key_mapping()),
                Err(err) => Err(err),
            }
        };

        match outcome {
            Ok(mapping) => {
                if let Err(err) = session.commit().await {
                    event!(Level::ERROR, error = %err, "replay commit failed");
                    if let Err(rollback_err) = session.rollback().await {
                        event!(Level::ERROR, error = %rollback_err, "rollback after failed commit failed");
                    }
                    return Err(err);
                }
                event!(Level::DEBUG, remapped = mapping.len(), "replay committed");
                Ok(mapping)
            }
            Err(err) => {
                event!(Level::ERROR, error = %err, "replay failed, rolling back");
                if let Err(rollback_err) = session.rollback().await {
                    event!(Level::ERROR, error = %rollback_err, "replay rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn run(&self, ctx: &mut OperationContext<'_>) -> Result<()> {
        let ordered: Vec<&Operation> = self
            .operations
            .iter()
            .flat_map(|operation| operation.flatten())
            .collect();

        // A log restored from elsewhere may still carry duplicates.
        let mut seen = std::collections::HashSet::new();
        let mut skip = vec![false; ordered.len()];
        for (index, operation) in ordered.iter().enumerate() {
            if let Some(mark) = operation.unique_mark() {
                if !seen.insert(mark.id.as_str()) {
                    if !mark.idempotent {
                        return Err(DbError::replay(
                            index,
                            operation.title(),
                            DbError::DuplicateOperation(mark.id.clone()),
                        ));
                    }
                    skip[index] = true;
                }
            }
        }

        for (index, operation) in ordered.iter().enumerate() {
            if skip[index] {
                continue;
            }
            operation
                .prepare(ctx)
                .await
                .map_err(|err| DbError::replay(index, operation.title(), err))?;
        }

        ctx.prefetch().await?;

        for (index, operation) in ordered.iter().enumerate() {
            if skip[index] {
                continue;
            }
            operation
                .execute(ctx)
                .await
                .map_err(|err| DbError::replay(index, operation.title(), err))?;
        }

        Ok(())
    }
}

impl TryFrom<Vec<Operation>> for OperationLog {
    type Error = DbError;

    fn try_from(operations: Vec<Operation>) -> Result<Self> {
        let mut log = OperationLog::new();
        for operation in operations {
            log.log(operation)?;
        }
        Ok(log)
    }
}

impl From<OperationLog> for Vec<Operation> {
    fn from(log: OperationLog) -> Self {
        log.operations.into_iter().collect()
    }
}
