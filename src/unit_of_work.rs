use std::future::{pending, Future};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::{CancellationToken, Executor, PersistenceError, PersistenceResult, TransactionAware};

/// Unit of Work handle threaded through a call chain.
///
/// A `UnitOfWork` carries at most one bound [`Executor`] plus the caller's
/// cancellation token and deadline. Scopes opened by [`Database`](crate::Database)
/// hand their callback a derived handle with the executor bound; repositories
/// [`resolve`](Self::resolve) it before issuing SQL. Nothing is stored globally:
/// once the callback returns, the derived handle (and with it the binding) goes
/// out of use.
#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    executor: Option<Executor>,
    cancellation: Option<CancellationToken>,
    deadline: Option<Instant>,
}

/// Why a scope stopped waiting on its callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
    Cancelled,
    DeadlineElapsed,
}

impl From<Interrupt> for PersistenceError {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Cancelled => PersistenceError::Cancelled,
            Interrupt::DeadlineElapsed => PersistenceError::TimedOut,
        }
    }
}

impl UnitOfWork {
    /// A fresh, unbound handle with no cancellation or deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a token that aborts the chain when cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Bounds the whole chain, including connection acquisition, by `timeout`
    /// from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Sets the deadline, keeping an earlier one if already present.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    /// The chain's cancellation token, if any.
    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    /// The chain's deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True inside a scope.
    pub fn is_bound(&self) -> bool {
        self.executor.is_some()
    }

    /// Returns the executor bound to this chain.
    ///
    /// Fails with [`PersistenceError::ExecutorNotBound`] outside any scope; there
    /// is no fallback connection.
    pub fn resolve(&self) -> PersistenceResult<&Executor> {
        self.executor.as_ref().ok_or(PersistenceError::ExecutorNotBound)
    }

    /// Returns a new handle with `executor` attached. Binding the executor the
    /// handle already carries is a no-op; binding a different one is rejected.
    pub(crate) fn bind(&self, executor: Executor) -> PersistenceResult<UnitOfWork> {
        if let Some(bound) = &self.executor {
            if !bound.same_as(&executor) {
                return Err(PersistenceError::AlreadyBound { bound: bound.id() });
            }
        }
        Ok(UnitOfWork {
            executor: Some(executor),
            cancellation: self.cancellation.clone(),
            deadline: self.deadline,
        })
    }

    /// Registers a callback for the outcome of the bound transaction.
    pub fn register_transaction_aware(
        &self,
        observer: Arc<dyn TransactionAware>,
    ) -> PersistenceResult<()> {
        let executor = self.resolve()?;
        if !executor.is_transaction() {
            return Err(PersistenceError::NotInTransaction);
        }
        executor.register_transaction_aware(observer);
        Ok(())
    }

    /// Fails immediately when the chain is already cancelled or past its deadline.
    pub(crate) fn check_interrupted(&self) -> Result<(), Interrupt> {
        if self.cancellation.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Err(Interrupt::Cancelled);
        }
        if self.deadline.is_some_and(|d| d <= Instant::now()) {
            return Err(Interrupt::DeadlineElapsed);
        }
        Ok(())
    }

    /// Resolves when the chain is cancelled or its deadline passes; never
    /// resolves for a chain with neither.
    pub(crate) async fn interrupted(&self) -> Interrupt {
        let cancelled = async {
            match &self.cancellation {
                Some(token) => token.cancelled().await,
                None => pending::<()>().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => pending::<()>().await,
            }
        };
        tokio::select! {
            _ = cancelled => Interrupt::Cancelled,
            _ = expired => Interrupt::DeadlineElapsed,
        }
    }

    /// Drives `work` to completion unless the chain is interrupted first.
    pub(crate) async fn race<F: Future>(&self, work: F) -> Result<F::Output, Interrupt> {
        tokio::select! {
            biased;
            output = work => Ok(output),
            interrupt = self.interrupted() => Err(interrupt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_outside_scope_is_an_error() {
        let uow = UnitOfWork::new();
        assert!(!uow.is_bound());
        assert!(matches!(
            uow.resolve(),
            Err(PersistenceError::ExecutorNotBound)
        ));
    }

    #[test]
    fn register_requires_a_bound_transaction() {
        struct Noop;

        #[async_trait::async_trait]
        impl TransactionAware for Noop {
            async fn on_commit(&self) -> PersistenceResult<()> {
                Ok(())
            }
            async fn on_rollback(&self) -> PersistenceResult<()> {
                Ok(())
            }
        }

        let err = UnitOfWork::new()
            .register_transaction_aware(Arc::new(Noop))
            .unwrap_err();
        assert!(matches!(err, PersistenceError::ExecutorNotBound));
    }

    #[tokio::test]
    async fn earliest_deadline_wins() {
        let soon = Instant::now() + Duration::from_millis(10);
        let uow = UnitOfWork::new()
            .with_deadline(soon)
            .with_timeout(Duration::from_secs(60));
        assert_eq!(uow.deadline(), Some(soon));
    }

    #[tokio::test]
    async fn race_reports_cancellation() {
        let token = CancellationToken::new();
        let uow = UnitOfWork::new().with_cancellation(token.clone());
        assert_eq!(uow.check_interrupted(), Ok(()));

        token.cancel();
        assert_eq!(uow.check_interrupted(), Err(Interrupt::Cancelled));
        let outcome = uow.race(pending::<()>()).await;
        assert_eq!(outcome, Err(Interrupt::Cancelled));
    }

    #[tokio::test]
    async fn race_reports_deadline() {
        let uow = UnitOfWork::new().with_timeout(Duration::from_millis(20));
        let outcome = uow.race(pending::<()>()).await;
        assert_eq!(outcome, Err(Interrupt::DeadlineElapsed));
    }

    #[tokio::test]
    async fn race_returns_finished_work() {
        let uow = UnitOfWork::new();
        assert_eq!(uow.race(async { 7 }).await, Ok(7));
    }
}
