use std::fmt;
use std::future::Future;
use std::panic::{resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use sqlx::any::AnyPoolOptions;
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyPool, Transaction};
use tracing::Instrument;

use crate::config::redact;
use crate::executor::{ExecutorKind, ReleaseGuard};
use crate::observer::{StatementObserver, TracingObserver};
use crate::unit_of_work::Interrupt;
use crate::{
    Backend, DatabaseConfig, Execute, Executor, PersistenceError, PersistenceResult, TxOptions,
    UnitOfWork,
};

/// Connection counters, for health checks and leak detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Open connections, idle or in use.
    pub size: u32,
    /// Open connections sitting in the pool, ready to be acquired.
    pub idle: usize,
}

impl PoolStatus {
    /// Connections currently checked out by a scope.
    pub fn in_use(&self) -> usize {
        (self.size as usize).saturating_sub(self.idle)
    }
}

/// Persistence context: owns the connection pool and hands out scoped executors.
///
/// Construct one per process and pass it (or clones of it) to whatever needs
/// database access. Clones share the same pool.
#[derive(Clone)]
pub struct Database {
    pool: AnyPool,
    backend: Backend,
    statement_observers: Arc<Vec<Arc<dyn StatementObserver>>>,
}

impl Database {
    /// Creates the pool described by `config` and verifies it can connect.
    pub async fn connect(config: &DatabaseConfig) -> PersistenceResult<Self> {
        config.validate()?;
        let backend = config.backend()?;
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .max_lifetime(config.max_lifetime())
            .idle_timeout(config.idle_timeout())
            .connect(&config.url)
            .await
            .map_err(PersistenceError::PoolAcquisition)?;

        tracing::info!(
            backend = %backend,
            url = %redact(&config.url),
            max_connections = config.max_connections,
            "database pool ready"
        );

        let database = Self::from_pool(pool, backend);
        Ok(if config.log_statements {
            database.with_observer(Arc::new(TracingObserver))
        } else {
            database
        })
    }

    /// Wraps an existing pool. `backend` must match the pool's driver.
    pub fn from_pool(pool: AnyPool, backend: Backend) -> Self {
        Self {
            pool,
            backend,
            statement_observers: Arc::new(Vec::new()),
        }
    }

    /// Adds an observer notified after every statement run through this database.
    pub fn with_observer(mut self, observer: Arc<dyn StatementObserver>) -> Self {
        Arc::make_mut(&mut self.statement_observers).push(observer);
        self
    }

    /// Database flavour the pool talks to.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Snapshot of the pool's connection counters.
    pub fn pool_status(&self) -> PoolStatus {
        PoolStatus {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
        }
    }

    /// True once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Closes every connection and waits for checked-out ones to come back.
    /// Safe to call more than once.
    ///
    /// Call it outside any scope: a scope still holding a connection keeps
    /// this future pending until the scope ends, so awaiting it from inside
    /// `with_connection` or `with_transaction` never completes.
    pub async fn close(&self) -> PersistenceResult<()> {
        if !self.pool.is_closed() {
            tracing::info!(backend = %self.backend, "closing database pool");
        }
        self.pool.close().await;
        Ok(())
    }

    /// Runs `f` with a single pooled connection bound to the unit of work.
    ///
    /// There is no atomicity across the statements `f` issues: when `f` fails
    /// half-way, whatever already ran stays applied. Use
    /// [`with_transaction`](Self::with_transaction) when that matters.
    ///
    /// When `uow` is already bound (a nested call), `f` runs on the existing
    /// binding. The connection is returned to the pool on every exit path and a
    /// panic inside `f` is resumed once it has been.
    pub async fn with_connection<F, Fut, T, E>(&self, uow: &UnitOfWork, f: F) -> Result<T, E>
    where
        F: FnOnce(UnitOfWork) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<PersistenceError>,
    {
        if let Ok(bound) = uow.resolve() {
            ensure_active(bound)?;
            tracing::trace!(executor = %bound.id(), "reusing bound executor for connection scope");
            return f(uow.clone()).await;
        }

        let conn = self.acquire(uow).await?;
        let executor = Executor::connection(conn, self.statement_observers.clone());
        let scoped = uow.bind(executor.clone())?;
        let span = tracing::debug_span!("persistence.connection", executor = %executor.id());

        async move {
            let guard = ReleaseGuard::new(executor.clone());

            let work = async move { f(scoped).await };
            let outcome = AssertUnwindSafe(uow.race(work)).catch_unwind().await;
            executor.release().await;
            drop(guard);

            match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(interrupt)) => {
                    tracing::debug!(?interrupt, "connection scope interrupted");
                    Err(E::from(PersistenceError::from(interrupt)))
                }
                Err(panic) => {
                    tracing::warn!("panic inside connection scope; connection released");
                    resume_unwind(panic)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Runs `f` inside a transaction bound to the unit of work.
    ///
    /// Exactly one terminal action happens: commit when `f` returns `Ok`
    /// (a failed commit is [`PersistenceError::CommitFailed`]), rollback when `f`
    /// returns `Err`, panics, or the chain is cancelled or times out. The error
    /// returned by `f` is passed through as is, and a panic is resumed with its
    /// original payload after the rollback.
    ///
    /// Nested calls join the enclosing transaction when `options` are the
    /// defaults or identical to the outer ones; anything else is a
    /// [`PersistenceError::ScopeConflict`].
    pub async fn with_transaction<F, Fut, T, E>(
        &self,
        uow: &UnitOfWork,
        options: TxOptions,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce(UnitOfWork) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<PersistenceError>,
    {
        if let Ok(bound) = uow.resolve() {
            ensure_active(bound)?;
            return match bound.kind() {
                ExecutorKind::Transaction(outer) if options.can_join(&outer) => {
                    tracing::trace!(executor = %bound.id(), "joining enclosing transaction");
                    f(uow.clone()).await
                }
                ExecutorKind::Transaction(outer) => {
                    Err(E::from(PersistenceError::ScopeConflict(format!(
                        "requested {options:?} inside a transaction opened with {outer:?}"
                    ))))
                }
                ExecutorKind::Connection => Err(E::from(PersistenceError::ScopeConflict(
                    "cannot open a transaction on a unit of work bound to a plain connection"
                        .into(),
                ))),
            };
        }

        self.check_options(&options)?;
        let tx = self.begin(uow).await?;
        let executor = Executor::transaction(tx, options, self.statement_observers.clone());
        let scoped = uow.bind(executor.clone())?;
        let span = tracing::debug_span!("persistence.transaction", executor = %executor.id());

        async move {
            let guard = ReleaseGuard::new(executor.clone());

            if let Err(err) = self.apply_options(&executor, &options).await {
                executor.rollback().await;
                return Err(E::from(err));
            }
            tracing::debug!(?options, "transaction started");

            let work = async move { f(scoped).await };
            let outcome = AssertUnwindSafe(uow.race(work)).catch_unwind().await;
            let result = match outcome {
                Ok(Ok(Ok(value))) => executor.commit().await.map(|_| value).map_err(E::from),
                Ok(Ok(Err(err))) => {
                    executor.rollback().await;
                    Err(err)
                }
                Ok(Err(interrupt)) => {
                    tracing::debug!(?interrupt, "transaction interrupted");
                    executor.rollback().await;
                    Err(E::from(PersistenceError::from(interrupt)))
                }
                Err(panic) => {
                    tracing::warn!("panic inside transaction scope; rolling back");
                    executor.rollback().await;
                    drop(guard);
                    resume_unwind(panic)
                }
            };
            drop(guard);
            result
        }
        .instrument(span)
        .await
    }

    async fn acquire(&self, uow: &UnitOfWork) -> PersistenceResult<PoolConnection<Any>> {
        self.ensure_open()?;
        uow.check_interrupted().map_err(acquisition_interrupted)?;
        match uow.race(self.pool.acquire()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(sqlx::Error::PoolClosed)) => Err(PersistenceError::Closed),
            Ok(Err(err)) => Err(PersistenceError::PoolAcquisition(err)),
            Err(interrupt) => Err(acquisition_interrupted(interrupt)),
        }
    }

    async fn begin(&self, uow: &UnitOfWork) -> PersistenceResult<Transaction<'static, Any>> {
        self.ensure_open()?;
        uow.check_interrupted().map_err(acquisition_interrupted)?;
        match uow.race(self.pool.begin()).await {
            Ok(Ok(tx)) => Ok(tx),
            Ok(Err(sqlx::Error::PoolClosed)) => Err(PersistenceError::Closed),
            // The connection was obtained but the server refused BEGIN.
            Ok(Err(err @ sqlx::Error::Database(_))) => Err(PersistenceError::BeginFailed(err)),
            Ok(Err(err)) => Err(PersistenceError::PoolAcquisition(err)),
            Err(interrupt) => Err(acquisition_interrupted(interrupt)),
        }
    }

    fn ensure_open(&self) -> PersistenceResult<()> {
        if self.pool.is_closed() {
            return Err(PersistenceError::Closed);
        }
        Ok(())
    }

    fn check_options(&self, options: &TxOptions) -> PersistenceResult<()> {
        match self.backend {
            Backend::Postgres => Ok(()),
            // SQLite transactions are always serializable, which satisfies every
            // isolation level. Read-only has no per-transaction switch.
            Backend::Sqlite if options.read_only => Err(PersistenceError::UnsupportedOption {
                backend: self.backend.name(),
                option: "read_only",
            }),
            Backend::Sqlite => Ok(()),
        }
    }

    async fn apply_options(&self, executor: &Executor, options: &TxOptions) -> PersistenceResult<()> {
        if self.backend != Backend::Postgres {
            return Ok(());
        }
        if let Some(sql) = options.set_transaction_sql() {
            executor
                .exec(&sql, &[])
                .await
                .map_err(|err| match err {
                    PersistenceError::Statement(inner) => PersistenceError::BeginFailed(inner),
                    other => other,
                })?;
        }
        Ok(())
    }
}

/// A handle kept from a finished scope must not be reused as an enclosing scope.
fn ensure_active(bound: &Executor) -> PersistenceResult<()> {
    if bound.state().is_terminal() {
        return Err(PersistenceError::ExecutorReleased(bound.id()));
    }
    Ok(())
}

/// Deadline or cancellation hit before a connection was obtained.
fn acquisition_interrupted(interrupt: Interrupt) -> PersistenceError {
    match interrupt {
        Interrupt::Cancelled => PersistenceError::Cancelled,
        Interrupt::DeadlineElapsed => PersistenceError::PoolAcquisition(sqlx::Error::PoolTimedOut),
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("backend", &self.backend)
            .field("pool", &self.pool_status())
            .field("statement_observers", &self.statement_observers.len())
            .finish()
    }
}
