use uuid::Uuid;

/// Errors raised by the persistence context, its executors and scopes.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// A physical connection could not be obtained (exhausted pool, network failure).
    #[error("failed to acquire a database connection: {0}")]
    PoolAcquisition(#[source] sqlx::Error),

    /// Resolution was attempted outside any connection or transaction scope.
    #[error("no executor is bound to this unit of work; run inside with_connection or with_transaction")]
    ExecutorNotBound,

    /// The executor outlived the scope that owned it.
    #[error("executor {0} is no longer usable: its scope has ended")]
    ExecutorReleased(Uuid),

    #[error("unit of work is already bound to executor {bound}")]
    AlreadyBound { bound: Uuid },

    /// A nested scope asked for something the enclosing scope cannot provide.
    #[error("nested scope conflicts with the enclosing scope: {0}")]
    ScopeConflict(String),

    #[error("operation requires a transaction scope but the unit of work is bound to a plain connection")]
    NotInTransaction,

    #[error("failed to begin transaction: {0}")]
    BeginFailed(#[source] sqlx::Error),

    /// The database rejected a statement. The driver error is kept intact.
    #[error("statement failed: {0}")]
    Statement(#[source] sqlx::Error),

    #[error("failed to decode row: {0}")]
    Decode(#[source] sqlx::Error),

    /// `fn` succeeded but the database failed to durably apply it.
    #[error("transaction commit failed: {0}")]
    CommitFailed(#[source] sqlx::Error),

    /// Only ever logged; never returned in place of the primary failure.
    #[error("transaction rollback failed: {0}")]
    RollbackFailed(#[source] sqlx::Error),

    #[error("unit of work was cancelled")]
    Cancelled,

    #[error("unit of work deadline elapsed")]
    TimedOut,

    #[error("{backend} does not support the transaction option `{option}`")]
    UnsupportedOption {
        backend: &'static str,
        option: &'static str,
    },

    #[error("invalid database configuration: {0}")]
    InvalidConfig(String),

    #[error("database is closed")]
    Closed,
}

impl PersistenceError {
    /// The underlying driver error, when there is one.
    pub fn sqlx_error(&self) -> Option<&sqlx::Error> {
        match self {
            Self::PoolAcquisition(err)
            | Self::BeginFailed(err)
            | Self::Statement(err)
            | Self::Decode(err)
            | Self::CommitFailed(err)
            | Self::RollbackFailed(err) => Some(err),
            _ => None,
        }
    }

    /// True when the database rejected a statement because of a unique constraint.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Statement(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
            _ => false,
        }
    }

    /// Programming errors that retrying can never fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ExecutorNotBound
                | Self::ExecutorReleased(_)
                | Self::AlreadyBound { .. }
                | Self::ScopeConflict(_)
                | Self::NotInTransaction
                | Self::UnsupportedOption { .. }
                | Self::InvalidConfig(_)
        )
    }
}

/// Result type for persistence operations
pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statement_error_exposes_driver_error() {
        let err = PersistenceError::Statement(sqlx::Error::RowNotFound);
        assert!(matches!(err.sqlx_error(), Some(sqlx::Error::RowNotFound)));
        assert!(!err.is_unique_violation());
        assert!(!err.is_fatal());
    }

    #[test]
    fn binding_errors_are_fatal() {
        assert!(PersistenceError::ExecutorNotBound.is_fatal());
        assert!(PersistenceError::ExecutorReleased(Uuid::new_v4()).is_fatal());
        assert!(!PersistenceError::Cancelled.is_fatal());
        assert!(PersistenceError::ExecutorNotBound.sqlx_error().is_none());
    }
}
