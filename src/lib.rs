//! Persistence Context
//!
//! Transaction-scoped database access. A [`Database`] owns the connection pool
//! and runs caller-supplied work inside a connection scope or a transaction
//! scope, binding the scope's [`Executor`] to a [`UnitOfWork`] handle that the
//! work threads down to repositories. Commit and rollback are decided by the
//! scope from the outcome of the work: repositories only ever resolve the bound
//! executor and issue statements.
//!
//! ```ignore
//! let db = Database::connect(&DatabaseConfig::from_env()?).await?;
//! let users = UserRepository::new();
//!
//! db.with_transaction(&UnitOfWork::new(), TxOptions::default(), |uow| async move {
//!     let mut user = User::new("alice", "secret", "alice@example.com", "13800138000");
//!     users.create(&uow, &mut user).await?;
//!     Ok::<_, UserError>(user)
//! })
//! .await?;
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod executor;
pub mod observer;
pub mod options;
pub mod repository;
pub mod transaction_aware;
pub mod unit_of_work;
pub mod value;

pub use config::{Backend, DatabaseConfig};
pub use database::{Database, PoolStatus};
pub use error::{PersistenceError, PersistenceResult};
pub use executor::{Execute, Executor, ExecutorKind, ExecutorState};
pub use observer::{StatementEvent, StatementObserver, TracingObserver};
pub use options::{IsolationLevel, TxOptions};
pub use repository::{User, UserError, UserRepository};
pub use transaction_aware::TransactionAware;
pub use unit_of_work::UnitOfWork;
pub use value::SqlValue;

pub use sqlx::any::AnyRow;
pub use sqlx::Row;
pub use tokio_util::sync::CancellationToken;
