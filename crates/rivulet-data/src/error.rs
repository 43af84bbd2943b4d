//! Error types for the data access layer.

/// Result alias for data layer operations.
pub type Result<T> = std::result::Result<T, DataError>;

/// Errors raised by the data access layer.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    /// Migration execution failed.
    #[error("migration failed")]
    MigrationFailed {
        #[source]
        source: sqlx::migrate::MigrateError,
    },
    /// A database operation failed.
    #[error("database operation failed: {operation}")]
    QueryFailed {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
    /// A stored column could not be decoded into its domain type.
    #[error("stored value for {column} is corrupt")]
    Corrupt { column: &'static str },
    /// The referenced task does not exist.
    #[error("task {task_id} not found")]
    TaskNotFound { task_id: String },
}

impl DataError {
    pub(crate) fn query(operation: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::QueryFailed { operation, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn display_and_source() {
        let query = DataError::QueryFailed {
            operation: "tasks.get",
            source: sqlx::Error::RowNotFound,
        };
        assert_eq!(query.to_string(), "database operation failed: tasks.get");
        assert!(query.source().is_some());

        let missing = DataError::TaskNotFound {
            task_id: "task_1".into(),
        };
        assert_eq!(missing.to_string(), "task task_1 not found");
        assert!(missing.source().is_none());
    }
}
