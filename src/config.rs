use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::{PersistenceError, PersistenceResult};

/// Database flavour behind the `Any` driver, detected from the DSN scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Sqlite,
}

impl Backend {
    /// Detects the backend from the url scheme.
    pub fn from_url(url: &str) -> PersistenceResult<Self> {
        let url = url.trim();
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Self::Postgres)
        } else if url.starts_with("sqlite:") {
            Ok(Self::Sqlite)
        } else {
            Err(PersistenceError::InvalidConfig(format!(
                "unsupported database url scheme in `{}`",
                redact(url)
            )))
        }
    }

    /// Human-readable backend name, used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Postgres => "PostgreSQL",
            Self::Sqlite => "SQLite",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Connection pool settings, passed once to [`Database::connect`](crate::Database::connect).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// Connections kept open while idle.
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub max_lifetime_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub log_statements: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 0,
            acquire_timeout_secs: 30,
            max_lifetime_secs: Some(30 * 60),
            idle_timeout_secs: Some(10 * 60),
            log_statements: true,
        }
    }
}

impl DatabaseConfig {
    /// Default pool settings for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Reads the configuration from `DATABASE_URL` and the `DB_*` variables.
    pub fn from_env() -> PersistenceResult<Self> {
        let defaults = Self::default();
        let url = env::var("DATABASE_URL")
            .map_err(|_| PersistenceError::InvalidConfig("DATABASE_URL must be set".into()))?;

        let config = Self {
            url,
            max_connections: env_parse("DB_MAX_CONNECTIONS")?.unwrap_or(defaults.max_connections),
            min_connections: env_parse("DB_MIN_CONNECTIONS")?.unwrap_or(defaults.min_connections),
            acquire_timeout_secs: env_parse("DB_ACQUIRE_TIMEOUT_SECS")?
                .unwrap_or(defaults.acquire_timeout_secs),
            max_lifetime_secs: env_parse("DB_MAX_LIFETIME_SECS")?.or(defaults.max_lifetime_secs),
            idle_timeout_secs: env_parse("DB_IDLE_TIMEOUT_SECS")?.or(defaults.idle_timeout_secs),
            log_statements: env_parse("DB_LOG_STATEMENTS")?.unwrap_or(defaults.log_statements),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects an empty or unsupported url and inconsistent pool sizes.
    pub fn validate(&self) -> PersistenceResult<()> {
        if self.url.trim().is_empty() {
            return Err(PersistenceError::InvalidConfig(
                "database url must not be empty".into(),
            ));
        }
        Backend::from_url(&self.url)?;
        if self.max_connections == 0 {
            return Err(PersistenceError::InvalidConfig(
                "max_connections must be greater than zero".into(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PersistenceError::InvalidConfig(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }

    /// Backend named by the configured url.
    pub fn backend(&self) -> PersistenceResult<Backend> {
        Backend::from_url(&self.url)
    }

    /// How long a scope waits for a free connection.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    /// Age after which a connection is closed instead of reused.
    pub fn max_lifetime(&self) -> Option<Duration> {
        self.max_lifetime_secs.map(Duration::from_secs)
    }

    /// Idle time after which a connection above the minimum is closed.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

fn env_parse<T>(key: &str) -> PersistenceResult<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|err| PersistenceError::InvalidConfig(format!("{key}: {err}"))),
        Err(_) => Ok(None),
    }
}

/// Strips credentials so the url can be logged.
pub(crate) fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_owned(),
    }
}
