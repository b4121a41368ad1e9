use sqlx::any::AnyRow;
use sqlx::Row;

use crate::{params, Backend, Execute, PersistenceError, UnitOfWork};

const USER_COLUMNS: &str =
    "id, created_at, updated_at, username, pwd_secret, email, phone, deleted_at";

/// User account. `deleted_at == 0` marks a live row; timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub username: String,
    pub pwd_secret: String,
    pub email: String,
    pub phone: String,
    pub deleted_at: i64,
}

impl User {
    /// A user that has not been persisted yet (`id == 0`).
    pub fn new(
        username: impl Into<String>,
        pwd_secret: impl Into<String>,
        email: impl Into<String>,
        phone: impl Into<String>,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: 0,
            created_at: now,
            updated_at: now,
            username: username.into(),
            pwd_secret: pwd_secret.into(),
            email: email.into(),
            phone: phone.into(),
            deleted_at: 0,
        }
    }

    /// True for soft-deleted users.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at != 0
    }

    fn from_row(row: &AnyRow) -> Result<Self, PersistenceError> {
        let decode = PersistenceError::Decode;
        Ok(Self {
            id: row.try_get("id").map_err(decode)?,
            created_at: row.try_get("created_at").map_err(decode)?,
            updated_at: row.try_get("updated_at").map_err(decode)?,
            username: row.try_get("username").map_err(decode)?,
            pwd_secret: row.try_get("pwd_secret").map_err(decode)?,
            email: row.try_get("email").map_err(decode)?,
            phone: row.try_get("phone").map_err(decode)?,
            deleted_at: row.try_get("deleted_at").map_err(decode)?,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UserError {
    #[error("user not found")]
    NotFound,

    #[error("username already taken")]
    UsernameTaken,

    #[error("email already taken")]
    EmailTaken,

    #[error("phone number already taken")]
    PhoneTaken,

    #[error("invalid user input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Users table access. Stateless: every call runs on the executor bound to the
/// `UnitOfWork` it is given.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserRepository;

impl UserRepository {
    /// The repository holds no state; one instance can serve every chain.
    pub fn new() -> Self {
        Self
    }

    /// DDL for the users table.
    pub fn schema(backend: Backend) -> &'static str {
        match backend {
            Backend::Postgres => {
                r#"
                CREATE TABLE IF NOT EXISTS users (
                    id BIGSERIAL PRIMARY KEY,
                    created_at BIGINT NOT NULL,
                    updated_at BIGINT NOT NULL,
                    username VARCHAR(50) NOT NULL UNIQUE,
                    pwd_secret VARCHAR(255) NOT NULL,
                    email VARCHAR(255) NOT NULL UNIQUE,
                    phone VARCHAR(32) NOT NULL UNIQUE,
                    deleted_at BIGINT NOT NULL DEFAULT 0
                )
                "#
            }
            Backend::Sqlite => {
                r#"
                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    created_at BIGINT NOT NULL,
                    updated_at BIGINT NOT NULL,
                    username TEXT NOT NULL UNIQUE,
                    pwd_secret TEXT NOT NULL,
                    email TEXT NOT NULL UNIQUE,
                    phone TEXT NOT NULL UNIQUE,
                    deleted_at BIGINT NOT NULL DEFAULT 0
                )
                "#
            }
        }
    }

    /// Inserts `user` and fills in its id and timestamps.
    pub async fn create(&self, uow: &UnitOfWork, user: &mut User) -> Result<(), UserError> {
        let executor = uow.resolve()?;
        validate(user)?;
        tracing::debug!(username = %user.username, email = %user.email, "creating user");

        if let Some(conflict) = self.find_conflict(uow, user).await? {
            tracing::warn!(username = %user.username, error = %conflict, "user already exists");
            return Err(conflict);
        }

        let now = chrono::Utc::now().timestamp();
        let rows = executor
            .query(
                r#"
                INSERT INTO users (created_at, updated_at, username, pwd_secret, email, phone, deleted_at)
                VALUES ($1, $2, $3, $4, $5, $6, 0)
                RETURNING id
                "#,
                params![now, now, &user.username, &user.pwd_secret, &user.email, &user.phone],
            )
            .await
            .map_err(map_unique_violation)?;

        let row = rows
            .first()
            .ok_or(PersistenceError::Statement(sqlx::Error::RowNotFound))?;
        user.id = row.try_get("id").map_err(PersistenceError::Decode)?;
        user.created_at = now;
        user.updated_at = now;
        user.deleted_at = 0;

        tracing::info!(user_id = user.id, username = %user.username, "user created");
        Ok(())
    }

    pub async fn find_by_id(&self, uow: &UnitOfWork, id: i64) -> Result<User, UserError> {
        self.find_one("id", params![id], uow).await
    }

    pub async fn find_by_username(&self, uow: &UnitOfWork, username: &str) -> Result<User, UserError> {
        self.find_one("username", params![username], uow).await
    }

    pub async fn find_by_email(&self, uow: &UnitOfWork, email: &str) -> Result<User, UserError> {
        self.find_one("email", params![email], uow).await
    }

    pub async fn find_by_phone(&self, uow: &UnitOfWork, phone: &str) -> Result<User, UserError> {
        self.find_one("phone", params![phone], uow).await
    }

    /// Overwrites every mutable field of a live user.
    pub async fn update(&self, uow: &UnitOfWork, user: &mut User) -> Result<(), UserError> {
        let executor = uow.resolve()?;
        if user.id == 0 {
            return Err(UserError::InvalidInput("user has not been persisted".into()));
        }
        validate(user)?;

        let now = chrono::Utc::now().timestamp();
        let affected = executor
            .exec(
                r#"
                UPDATE users
                SET updated_at = $1, username = $2, pwd_secret = $3, email = $4, phone = $5
                WHERE id = $6 AND deleted_at = 0
                "#,
                params![now, &user.username, &user.pwd_secret, &user.email, &user.phone, user.id],
            )
            .await
            .map_err(map_unique_violation)?;

        if affected == 0 {
            return Err(UserError::NotFound);
        }
        user.updated_at = now;
        Ok(())
    }

    /// Renames a user, refusing a name held by someone else.
    pub async fn update_username(&self, uow: &UnitOfWork, user: &mut User) -> Result<(), UserError> {
        let executor = uow.resolve()?;
        if user.id == 0 || user.username.trim().is_empty() {
            tracing::warn!(user_id = user.id, "invalid input for username update");
            return Err(UserError::InvalidInput(
                "username update needs a persisted user and a non-empty name".into(),
            ));
        }

        match self.find_by_username(uow, &user.username).await {
            Ok(existing) if existing.id != user.id => {
                tracing::warn!(
                    username = %user.username,
                    existing_user_id = existing.id,
                    "username already taken"
                );
                return Err(UserError::UsernameTaken);
            }
            Ok(_) | Err(UserError::NotFound) => {}
            Err(err) => return Err(err),
        }

        let now = chrono::Utc::now().timestamp();
        let affected = executor
            .exec(
                "UPDATE users SET updated_at = $1, username = $2 WHERE id = $3 AND deleted_at = 0",
                params![now, &user.username, user.id],
            )
            .await
            .map_err(map_unique_violation)?;

        if affected == 0 {
            tracing::warn!(user_id = user.id, "no rows affected during username update");
            return Err(UserError::NotFound);
        }
        user.updated_at = now;
        tracing::info!(user_id = user.id, username = %user.username, "username updated");
        Ok(())
    }

    /// Soft delete.
    pub async fn delete(&self, uow: &UnitOfWork, id: i64) -> Result<(), UserError> {
        let executor = uow.resolve()?;
        let now = chrono::Utc::now().timestamp();
        let affected = executor
            .exec(
                "UPDATE users SET deleted_at = $1, updated_at = $1 WHERE id = $2 AND deleted_at = 0",
                params![now, id],
            )
            .await?;
        if affected == 0 {
            return Err(UserError::NotFound);
        }
        Ok(())
    }

    /// Number of live users.
    pub async fn count(&self, uow: &UnitOfWork) -> Result<i64, UserError> {
        let executor = uow.resolve()?;
        let row = executor
            .query_optional("SELECT COUNT(*) AS count FROM users WHERE deleted_at = 0", params![])
            .await?
            .ok_or(PersistenceError::Statement(sqlx::Error::RowNotFound))?;
        let count: i64 = row.try_get("count").map_err(PersistenceError::Decode)?;
        Ok(count)
    }

    async fn find_one(
        &self,
        column: &'static str,
        args: &[crate::SqlValue],
        uow: &UnitOfWork,
    ) -> Result<User, UserError> {
        let executor = uow.resolve()?;
        let statement =
            format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = $1 AND deleted_at = 0");
        match executor.query_optional(&statement, args).await? {
            Some(row) => Ok(User::from_row(&row)?),
            None => {
                tracing::debug!(column, "user not found");
                Err(UserError::NotFound)
            }
        }
    }

    async fn find_conflict(&self, uow: &UnitOfWork, user: &User) -> Result<Option<UserError>, UserError> {
        let executor = uow.resolve()?;
        let rows = executor
            .query(
                r#"
                SELECT username, email, phone FROM users
                WHERE (username = $1 OR email = $2 OR phone = $3) AND deleted_at = 0
                "#,
                params![&user.username, &user.email, &user.phone],
            )
            .await?;

        for row in &rows {
            let username: String = row.try_get("username").map_err(PersistenceError::Decode)?;
            let email: String = row.try_get("email").map_err(PersistenceError::Decode)?;
            if username == user.username {
                return Ok(Some(UserError::UsernameTaken));
            }
            if email == user.email {
                return Ok(Some(UserError::EmailTaken));
            }
        }
        Ok((!rows.is_empty()).then_some(UserError::PhoneTaken))
    }
}

fn validate(user: &User) -> Result<(), UserError> {
    for (field, value) in [
        ("username", &user.username),
        ("email", &user.email),
        ("phone", &user.phone),
        ("pwd_secret", &user.pwd_secret),
    ] {
        if value.trim().is_empty() {
            return Err(UserError::InvalidInput(format!("{field} cannot be empty")));
        }
    }
    Ok(())
}

/// Maps a unique-constraint violation to the field it was raised for.
fn map_unique_violation(err: PersistenceError) -> UserError {
    if !err.is_unique_violation() {
        return UserError::Persistence(err);
    }
    let message = err.to_string();
    if message.contains("username") {
        UserError::UsernameTaken
    } else if message.contains("email") {
        UserError::EmailTaken
    } else if message.contains("phone") {
        UserError::PhoneTaken
    } else {
        UserError::Persistence(err)
    }
}
