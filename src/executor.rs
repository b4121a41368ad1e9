use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex as SyncMutex, RwLock};
use sqlx::any::AnyRow;
use sqlx::pool::PoolConnection;
use sqlx::{Any, Transaction};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::observer::{notify_all, StatementEvent, StatementObserver};
use crate::value::bind_all;
use crate::{PersistenceError, PersistenceResult, SqlValue, TransactionAware, TxOptions};

/// Statement execution capability.
///
/// Deliberately has no commit or rollback: transaction boundaries belong to
/// [`Database`](crate::Database).
#[async_trait]
pub trait Execute: Send + Sync {
    /// Runs a mutating statement and returns the number of affected rows.
    async fn exec(&self, statement: &str, args: &[SqlValue]) -> PersistenceResult<u64>;

    /// Runs a query and returns every row it produced.
    async fn query(&self, statement: &str, args: &[SqlValue]) -> PersistenceResult<Vec<AnyRow>>;

    async fn query_optional(
        &self,
        statement: &str,
        args: &[SqlValue],
    ) -> PersistenceResult<Option<AnyRow>> {
        Ok(self.query(statement, args).await?.into_iter().next())
    }
}

/// What an executor is backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    Connection,
    Transaction(TxOptions),
}

/// Lifecycle of an executor's underlying resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Active,
    /// Connection returned to the pool.
    Released,
    Committed,
    RolledBack,
    /// Commit was attempted and failed; the server discarded the transaction.
    CommitFailed,
}

impl ExecutorState {
    /// True once the underlying resource is gone.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

#[derive(Debug, Clone, Copy)]
enum Completion {
    Committed,
    RolledBack,
}

enum Resource {
    Connection(PoolConnection<Any>),
    Transaction(Transaction<'static, Any>),
}

struct Inner {
    id: Uuid,
    kind: ExecutorKind,
    resource: Mutex<Option<Resource>>,
    state: SyncMutex<ExecutorState>,
    statement_observers: Arc<Vec<Arc<dyn StatementObserver>>>,
    completion_observers: RwLock<Vec<Arc<dyn TransactionAware>>>,
}

/// Executor wraps a pooled connection or a transaction for use by repositories.
///
/// Clones share the same resource and identity. The resource belongs to the scope
/// that created the executor; once that scope ends every clone fails with
/// [`PersistenceError::ExecutorReleased`].
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl Executor {
    pub(crate) fn connection(
        conn: PoolConnection<Any>,
        statement_observers: Arc<Vec<Arc<dyn StatementObserver>>>,
    ) -> Self {
        Self::new(
            ExecutorKind::Connection,
            Resource::Connection(conn),
            statement_observers,
        )
    }

    pub(crate) fn transaction(
        tx: Transaction<'static, Any>,
        options: TxOptions,
        statement_observers: Arc<Vec<Arc<dyn StatementObserver>>>,
    ) -> Self {
        Self::new(
            ExecutorKind::Transaction(options),
            Resource::Transaction(tx),
            statement_observers,
        )
    }

    fn new(
        kind: ExecutorKind,
        resource: Resource,
        statement_observers: Arc<Vec<Arc<dyn StatementObserver>>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                kind,
                resource: Mutex::new(Some(resource)),
                state: SyncMutex::new(ExecutorState::Active),
                statement_observers,
                completion_observers: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Identity shared by every clone of this executor.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Whether this is a plain connection or a transaction, and its options.
    pub fn kind(&self) -> ExecutorKind {
        self.inner.kind
    }

    /// True for executors created by a transaction scope.
    pub fn is_transaction(&self) -> bool {
        matches!(self.inner.kind, ExecutorKind::Transaction(_))
    }

    /// Current lifecycle state; anything but `Active` means the scope has ended.
    pub fn state(&self) -> ExecutorState {
        *self.inner.state.lock()
    }

    /// True when both handles refer to the same underlying resource.
    pub fn same_as(&self, other: &Executor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn register_transaction_aware(&self, observer: Arc<dyn TransactionAware>) {
        self.inner.completion_observers.write().push(observer);
    }

    /// Takes ownership of the resource, leaving `None` in its place.
    async fn take_resource(&self) -> Option<Resource> {
        self.inner.resource.lock().await.take()
    }

    fn set_state(&self, state: ExecutorState) {
        *self.inner.state.lock() = state;
    }

    /// Returns a connection to the pool. Idempotent.
    pub(crate) async fn release(&self) {
        if let Some(resource) = self.take_resource().await {
            drop(resource);
            self.set_state(ExecutorState::Released);
            tracing::trace!(executor = %self.id(), "connection released");
        }
    }

    /// Commits the transaction. A failed commit leaves nothing applied, so the
    /// rollback callbacks run for it.
    pub(crate) async fn commit(&self) -> PersistenceResult<()> {
        match self.take_resource().await {
            Some(Resource::Transaction(tx)) => {
                if let Err(err) = tx.commit().await {
                    self.set_state(ExecutorState::CommitFailed);
                    tracing::warn!(executor = %self.id(), error = %err, "transaction commit failed");
                    self.notify_completion(Completion::RolledBack).await;
                    return Err(PersistenceError::CommitFailed(err));
                }
            }
            Some(Resource::Connection(conn)) => {
                drop(conn);
                self.set_state(ExecutorState::Released);
                return Err(PersistenceError::NotInTransaction);
            }
            None => return Err(PersistenceError::ExecutorReleased(self.id())),
        }
        self.set_state(ExecutorState::Committed);
        tracing::debug!(executor = %self.id(), "transaction committed");
        self.notify_completion(Completion::Committed).await;
        Ok(())
    }

    /// Rolls the transaction back. Failures are logged, never returned: the
    /// caller is already propagating the error that caused the rollback.
    pub(crate) async fn rollback(&self) {
        match self.take_resource().await {
            Some(Resource::Transaction(tx)) => match tx.rollback().await {
                Ok(()) => tracing::debug!(executor = %self.id(), "transaction rolled back"),
                Err(err) => {
                    let err = PersistenceError::RollbackFailed(err);
                    tracing::error!(
                        executor = %self.id(),
                        error = %err,
                        "rollback failed; the connection is discarded"
                    );
                }
            },
            Some(Resource::Connection(conn)) => drop(conn),
            None => return,
        }
        self.set_state(ExecutorState::RolledBack);
        self.notify_completion(Completion::RolledBack).await;
    }

    /// Runs every registered completion callback. A callback that fails or
    /// panics is logged and the rest still run.
    async fn notify_completion(&self, completion: Completion) {
        let observers = self.inner.completion_observers.read().clone();
        for observer in observers.iter() {
            let callback = match completion {
                Completion::Committed => observer.on_commit(),
                Completion::RolledBack => observer.on_rollback(),
            };
            match AssertUnwindSafe(callback).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(
                        executor = %self.id(),
                        ?completion,
                        error = %err,
                        "transaction callback failed"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        executor = %self.id(),
                        ?completion,
                        "transaction callback panicked"
                    );
                }
            }
        }
    }

    /// Best-effort synchronous release for scopes dropped mid-flight. Dropping
    /// a transaction makes the driver roll it back.
    pub(crate) fn abandon(&self) {
        let Ok(mut slot) = self.inner.resource.try_lock() else {
            // Someone still holds the lock; the resource goes when the last clone drops.
            return;
        };
        if let Some(resource) = slot.take() {
            let state = match resource {
                Resource::Connection(_) => ExecutorState::Released,
                Resource::Transaction(_) => ExecutorState::RolledBack,
            };
            drop(resource);
            self.set_state(state);
            tracing::warn!(executor = %self.id(), "scope dropped before completion; resource reclaimed");
        }
    }

    fn observe(
        &self,
        statement: &str,
        args: &[SqlValue],
        started: Instant,
        error: Option<&sqlx::Error>,
    ) {
        if self.inner.statement_observers.is_empty() {
            return;
        }
        let event = StatementEvent {
            executor: self.id(),
            statement,
            arguments: args,
            duration: started.elapsed(),
            error,
        };
        notify_all(&self.inner.statement_observers, &event);
    }
}

#[async_trait]
impl Execute for Executor {
    async fn exec(&self, statement: &str, args: &[SqlValue]) -> PersistenceResult<u64> {
        let started = Instant::now();
        let result = {
            let mut slot = self.inner.resource.lock().await;
            let resource = slot
                .as_mut()
                .ok_or(PersistenceError::ExecutorReleased(self.id()))?;
            let query = bind_all(sqlx::query(statement), args);
            match resource {
                Resource::Connection(conn) => query.execute(&mut **conn).await,
                Resource::Transaction(tx) => query.execute(&mut **tx).await,
            }
        };
        self.observe(statement, args, started, result.as_ref().err());
        result
            .map(|done| done.rows_affected())
            .map_err(PersistenceError::Statement)
    }

    async fn query(&self, statement: &str, args: &[SqlValue]) -> PersistenceResult<Vec<AnyRow>> {
        let started = Instant::now();
        let result = {
            let mut slot = self.inner.resource.lock().await;
            let resource = slot
                .as_mut()
                .ok_or(PersistenceError::ExecutorReleased(self.id()))?;
            let query = bind_all(sqlx::query(statement), args);
            match resource {
                Resource::Connection(conn) => query.fetch_all(&mut **conn).await,
                Resource::Transaction(tx) => query.fetch_all(&mut **tx).await,
            }
        };
        self.observe(statement, args, started, result.as_ref().err());
        result.map_err(PersistenceError::Statement)
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}

/// Reclaims the executor's resource if the owning scope future is dropped
/// before it could release it.
pub(crate) struct ReleaseGuard {
    executor: Executor,
}

impl ReleaseGuard {
    pub(crate) fn new(executor: Executor) -> Self {
        Self { executor }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.executor.abandon();
    }
}
