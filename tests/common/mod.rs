#![allow(dead_code)]

pub mod entities;
pub mod observers;

use std::sync::Arc;
use std::time::Duration;

use persistence_context::{
    params, Backend, Database, DatabaseConfig, Execute, PersistenceError, PoolStatus,
    StatementObserver, UnitOfWork, UserRepository,
};
use tempfile::TempDir;

pub use entities::sample_user;
pub use observers::{CompletionTracker, PanickingCallback, RecordingObserver};

/// Routes `tracing` output through the test harness; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A file-backed SQLite database living in its own temporary directory.
pub struct TestDb {
    pub db: Database,
    _dir: TempDir,
}

impl std::ops::Deref for TestDb {
    type Target = Database;

    fn deref(&self) -> &Database {
        &self.db
    }
}

pub fn sqlite_config(dir: &TempDir, max_connections: u32) -> DatabaseConfig {
    let path = dir.path().join("test.db");
    DatabaseConfig {
        url: format!("sqlite://{}?mode=rwc", path.display()),
        max_connections,
        min_connections: 0,
        acquire_timeout_secs: 1,
        ..DatabaseConfig::default()
    }
}

/// Connects to a fresh SQLite database with the users table created.
pub async fn setup_sqlite(max_connections: u32) -> TestDb {
    setup_sqlite_with(max_connections, None).await
}

pub async fn setup_sqlite_with(
    max_connections: u32,
    observer: Option<Arc<dyn StatementObserver>>,
) -> TestDb {
    init_tracing();
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut db = Database::connect(&sqlite_config(&dir, max_connections))
        .await
        .expect("Failed to connect to database");
    if let Some(observer) = observer {
        db = db.with_observer(observer);
    }

    create_schema(&db).await;
    TestDb { db, _dir: dir }
}

pub async fn create_schema(db: &Database) {
    let backend = db.backend();
    db.with_connection(&UnitOfWork::new(), |uow| async move {
        uow.resolve()?
            .exec(UserRepository::schema(backend), params![])
            .await?;
        Ok::<_, PersistenceError>(())
    })
    .await
    .expect("Failed to create users table");
}

/// Live users, counted in a scope of its own.
pub async fn count_users(db: &Database) -> i64 {
    db.with_connection(&UnitOfWork::new(), |uow| async move {
        UserRepository::new().count(&uow).await
    })
    .await
    .expect("Failed to count users")
}

/// Connections are handed back to the pool asynchronously; wait for it.
pub async fn wait_until_idle(db: &Database) -> PoolStatus {
    for _ in 0..100 {
        let status = db.pool_status();
        if status.in_use() == 0 {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    db.pool_status()
}

/// Postgres url for the tests that need a real server, if one is configured.
pub fn postgres_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .ok()
        .filter(|url| matches!(Backend::from_url(url), Ok(Backend::Postgres)))
}
