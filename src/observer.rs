use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::SqlValue;

/// One executed statement, as seen by a [`StatementObserver`].
#[derive(Debug)]
pub struct StatementEvent<'a> {
    pub executor: Uuid,
    pub statement: &'a str,
    pub arguments: &'a [SqlValue],
    pub duration: Duration,
    pub error: Option<&'a sqlx::Error>,
}

impl StatementEvent<'_> {
    /// True when the statement did not fail.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Audit/tracing hook invoked after every statement an executor runs.
///
/// Observers only see the outcome; they cannot change it. A panicking
/// observer is contained and logged.
pub trait StatementObserver: Send + Sync {
    fn on_statement(&self, event: &StatementEvent<'_>);
}

impl<F> StatementObserver for F
where
    F: Fn(&StatementEvent<'_>) + Send + Sync,
{
    fn on_statement(&self, event: &StatementEvent<'_>) {
        self(event)
    }
}

pub(crate) fn notify_all(observers: &[Arc<dyn StatementObserver>], event: &StatementEvent<'_>) {
    for observer in observers {
        if catch_unwind(AssertUnwindSafe(|| observer.on_statement(event))).is_err() {
            tracing::warn!(executor = %event.executor, "statement observer panicked");
        }
    }
}

/// Logs every statement through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl StatementObserver for TracingObserver {
    fn on_statement(&self, event: &StatementEvent<'_>) {
        let sql = compact_sql(event.statement);
        let elapsed_ms = event.duration.as_secs_f64() * 1000.0;
        match event.error {
            None => tracing::debug!(
                executor = %event.executor,
                sql = %sql,
                args = ?event.arguments,
                elapsed_ms,
                "SQL executed"
            ),
            Some(err) => tracing::warn!(
                executor = %event.executor,
                sql = %sql,
                args = ?event.arguments,
                elapsed_ms,
                error = %err,
                "SQL error"
            ),
        }
    }
}

/// Collapses newlines and indentation so statements log on one line.
pub(crate) fn compact_sql(statement: &str) -> String {
    statement.split_whitespace().collect::<Vec<_>>().join(" ")
}
