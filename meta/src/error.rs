use crate::tablecodec::CodecError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetaError>;

/// SQLite primary result codes that indicate lock contention.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("sqlite error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt {what} record {id}: {source}")]
    Corrupt {
        what: &'static str,
        id: i64,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid {what} value `{value}`")]
    InvalidValue { what: &'static str, value: String },

    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: String },

    #[error("{what} `{name}` already exists")]
    Duplicate { what: &'static str, name: String },

    #[error("node `{node_id}` does not hold the ddl owner lease")]
    NotOwner { node_id: String },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl MetaError {
    /// Lock contention and transport hiccups are worth retrying; everything
    /// else is a statement about the data.
    pub fn is_retryable(&self) -> bool {
        match self {
            MetaError::Sqlx(err) => is_retryable_sqlx(err),
            MetaError::Migrate(sqlx::migrate::MigrateError::Execute(err)) => is_retryable_sqlx(err),
            _ => false,
        }
    }

    /// Persisted records that no longer decode need an operator.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            MetaError::Corrupt { .. } | MetaError::InvalidValue { .. } | MetaError::Codec(_)
        )
    }

    pub(crate) fn not_found(what: &'static str, id: impl ToString) -> Self {
        MetaError::NotFound {
            what,
            id: id.to_string(),
        }
    }
}

fn is_retryable_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db_err) => db_err
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED)),
        _ => false,
    }
}
