use serde::{Deserialize, Serialize};

/// Isolation level requested for a transaction scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Whatever the server is configured with.
    #[default]
    Default,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling of the level, `None` for the server default.
    pub fn as_sql(&self) -> Option<&'static str> {
        match self {
            Self::Default => None,
            Self::ReadCommitted => Some("READ COMMITTED"),
            Self::RepeatableRead => Some("REPEATABLE READ"),
            Self::Serializable => Some("SERIALIZABLE"),
        }
    }
}

/// Options for [`Database::with_transaction`](crate::Database::with_transaction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    pub read_only: bool,
}

impl TxOptions {
    /// Default isolation, read-write.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests an isolation level.
    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    /// Requests a read-only transaction. PostgreSQL only.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// True when nothing beyond a plain `BEGIN` is needed.
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// Whether a nested scope asking for `self` may join a transaction opened with `outer`.
    pub fn can_join(&self, outer: &TxOptions) -> bool {
        self.is_default() || self == outer
    }

    /// PostgreSQL `SET TRANSACTION` statement, or `None` when nothing needs to change.
    pub(crate) fn set_transaction_sql(&self) -> Option<String> {
        let mut modes = Vec::with_capacity(2);
        if let Some(level) = self.isolation.as_sql() {
            modes.push(format!("ISOLATION LEVEL {level}"));
        }
        if self.read_only {
            modes.push("READ ONLY".to_owned());
        }
        if modes.is_empty() {
            return None;
        }
        Some(format!("SET TRANSACTION {}", modes.join(", ")))
    }
}
