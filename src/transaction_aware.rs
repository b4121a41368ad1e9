use async_trait::async_trait;

use crate::PersistenceResult;

/// Completion callback for a transaction scope.
///
/// Register an implementation with
/// [`UnitOfWork::register_transaction_aware`](crate::UnitOfWork::register_transaction_aware)
/// from inside [`Database::with_transaction`](crate::Database::with_transaction). Exactly one
/// of the two methods runs, after the outcome is final on the server; a commit the
/// server refused counts as a rollback. Returned errors and panics are logged and
/// leave the scope's result untouched.
#[async_trait]
pub trait TransactionAware: Send + Sync {
    /// The transaction committed. Publish cached state here.
    async fn on_commit(&self) -> PersistenceResult<()>;

    /// The transaction rolled back, for any reason including a failed commit, a
    /// panic or cancellation.
    async fn on_rollback(&self) -> PersistenceResult<()>;
}
