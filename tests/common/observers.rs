use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use persistence_context::{PersistenceResult, StatementEvent, StatementObserver, TransactionAware};
use uuid::Uuid;

/// Records which transaction callbacks fired.
pub struct CompletionTracker {
    committed: Arc<RwLock<bool>>,
    rolled_back: Arc<RwLock<bool>>,
}

impl CompletionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            committed: Arc::new(RwLock::new(false)),
            rolled_back: Arc::new(RwLock::new(false)),
        })
    }

    pub fn is_committed(&self) -> bool {
        *self.committed.read()
    }

    pub fn is_rolled_back(&self) -> bool {
        *self.rolled_back.read()
    }
}

#[async_trait]
impl TransactionAware for CompletionTracker {
    async fn on_commit(&self) -> PersistenceResult<()> {
        *self.committed.write() = true;
        Ok(())
    }

    async fn on_rollback(&self) -> PersistenceResult<()> {
        *self.rolled_back.write() = true;
        Ok(())
    }
}

/// A completion callback with a bug: both methods panic.
pub struct PanickingCallback;

#[async_trait]
impl TransactionAware for PanickingCallback {
    async fn on_commit(&self) -> PersistenceResult<()> {
        panic!("commit callback bug");
    }

    async fn on_rollback(&self) -> PersistenceResult<()> {
        panic!("rollback callback bug");
    }
}

#[derive(Debug, Clone)]
pub struct RecordedStatement {
    pub executor: Uuid,
    pub statement: String,
    pub argument_count: usize,
    pub failed: bool,
}

/// Keeps every statement event it is shown.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<RecordedStatement>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<RecordedStatement> {
        self.events.lock().clone()
    }
}

impl StatementObserver for RecordingObserver {
    fn on_statement(&self, event: &StatementEvent<'_>) {
        self.events.lock().push(RecordedStatement {
            executor: event.executor,
            statement: event.statement.trim().to_owned(),
            argument_count: event.arguments.len(),
            failed: !event.succeeded(),
        });
    }
}
