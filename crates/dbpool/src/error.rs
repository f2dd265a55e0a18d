use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DbError {
    #[error("connecting to database: {0}")]
    Connect(String),

    #[error("{message}")]
    Query {
        message: String,
        /// Constraint name reported by the server for integrity
        /// violations, when it had one.
        constraint: Option<String>,
    },

    #[error("No available database handles")]
    NoHandles,

    #[error("Transaction failed: {0}")]
    TxFailed(String),

    #[error("database pool is shut down")]
    PoolClosed,

    #[error("decoding result row: {0}")]
    Decode(String),

    #[error("invalid database configuration: {0}")]
    Config(String),
}

impl DbError {
    pub fn query(message: impl Into<String>) -> Self {
        DbError::Query {
            message: message.into(),
            constraint: None,
        }
    }

    /// True when the error text or the reported constraint name contains
    /// `needle`. The vocabulary resolvers and the bodypart deduper use this
    /// to recognize the unique violations they recover from.
    pub fn contains(&self, needle: &str) -> bool {
        match self {
            DbError::Query {
                message,
                constraint,
            } => message.contains(needle) || constraint.as_deref() == Some(needle),
            other => other.to_string().contains(needle),
        }
    }

    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => DbError::Query {
                message: db.message().to_string(),
                constraint: db.constraint().map(|c| c.to_string()),
            },
            // A connection-level failure; the handle that sees this
            // retires itself.
            sqlx::Error::Io(io) => DbError::Connect(io.to_string()),
            _ => DbError::query(err.to_string()),
        }
    }
}
