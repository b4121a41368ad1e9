use sqlx::any::AnyArguments;
use sqlx::query::Query;
use sqlx::Any;

/// A statement argument.
///
/// Restricted to the types every backend behind the `Any` driver understands.
///
/// [`SqlValue::Null`] is sent as a NULL of text type. SQLite accepts it in any
/// column. PostgreSQL rejects it where the parameter is inferred as a
/// non-text type (`BIGINT`, `BOOLEAN`, ...) unless the statement casts it,
/// e.g. `$1::text::bigint` or `CAST($1 AS BIGINT)`.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&String> for SqlValue {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Builds a `&[SqlValue]` argument list.
///
/// ```ignore
/// executor.exec("DELETE FROM users WHERE id = $1", params![42_i64]).await?;
/// ```
#[macro_export]
macro_rules! params {
    () => {
        &[] as &[$crate::SqlValue]
    };
    ($($value:expr),+ $(,)?) => {
        &[$($crate::SqlValue::from($value)),+] as &[$crate::SqlValue]
    };
}

pub(crate) fn bind_all<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    args: &[SqlValue],
) -> Query<'q, Any, AnyArguments<'q>> {
    for arg in args {
        query = match arg {
            // The Any driver has no untyped NULL; see `SqlValue` for the Postgres caveat.
            SqlValue::Null => query.bind(Option::<String>::None),
            SqlValue::Bool(value) => query.bind(*value),
            SqlValue::Int(value) => query.bind(*value),
            SqlValue::Float(value) => query.bind(*value),
            SqlValue::Text(value) => query.bind(value.clone()),
            SqlValue::Bytes(value) => query.bind(value.clone()),
        };
    }
    query
}
