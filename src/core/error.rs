use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Disconnected state is already attached to a session")]
    AlreadyAttached,

    #[error("Disconnected state is not attached to a session")]
    NotAttached,

    #[error("Operation is not allowed while a local transaction is open")]
    TransactionOpen,

    #[error("No local transaction is open")]
    NoTransaction,

    #[error("Inconsistent state: {0}")]
    InconsistentState(String),

    #[error("Entity '{0}' not found")]
    EntityNotFound(String),

    #[error("Entity type '{0}' is not registered in the model")]
    UnknownEntityType(String),

    #[error("Version conflict for '{key}': expected {expected}, actual {actual}")]
    VersionConflict {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Replay failed at operation #{index} ({operation}): {source}")]
    Replay {
        index: usize,
        operation: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("Duplicate unique operation: {0}")]
    DuplicateOperation(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/0 error: {0}")]
    IoError(String),
}

impl DbError {
    /// Innermost error, looking through replay wrappers.
    pub fn root_cause(&self) -> &DbError {
        match self {
            DbError::Replay { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self.root_cause(), DbError::VersionConflict { .. })
    }

    pub(crate) fn replay(index: usize, operation: impl Into<String>, source: DbError) -> Self {
        DbError::Replay {
            index,
            operation: operation.into(),
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for DbError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for DbError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
