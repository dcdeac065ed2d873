use tessel_meta::ErrorClass;
use tessel_meta::JobError;
use tessel_meta::JobId;
use tessel_meta::JobState;
use tessel_meta::MetaError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DdlError>;

pub(crate) const CANCELLED_CODE: &str = "cancelled";

#[derive(Debug, Error)]
pub enum DdlError {
    #[error(transparent)]
    Meta(#[from] MetaError),

    #[error("node `{node_id}` is not the ddl owner")]
    NotOwner { node_id: String },

    #[error("schema version {version} not observed by {pending} node(s) within {timeout_ms}ms")]
    SyncTimeout {
        version: i64,
        pending: usize,
        timeout_ms: u64,
    },

    #[error("duplicate entry {value} for key `{index}`")]
    DuplicateKey { index: String, value: String },

    #[error("{kind} `{name}` already exists")]
    DuplicateObject { kind: &'static str, name: String },

    #[error("{kind} `{name}` does not exist")]
    NotFound { kind: &'static str, name: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("column `{column}` cannot be null")]
    InvalidNull { column: String },

    #[error("row {key} cannot be decoded: {message}")]
    PoisonedRow { key: String, message: String },

    #[error("job {0} was cancelled")]
    Cancelled(JobId),

    #[error("job {0} can no longer be cancelled")]
    NotCancellable(JobId),

    #[error("schema cache is outdated at version {version}")]
    SchemaOutdated { version: i64 },

    #[error("job {job_id} finished as {state}{}", .error.as_ref().map(|err| format!(": {}", err.message)).unwrap_or_default())]
    JobFailed {
        job_id: JobId,
        state: JobState,
        error: Option<JobError>,
    },

    #[error("ddl is stopped")]
    Stopped,

    #[error("{0}")]
    Fatal(String),
}

impl DdlError {
    pub(crate) fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        DdlError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub(crate) fn duplicate(kind: &'static str, name: impl Into<String>) -> Self {
        DdlError::DuplicateObject {
            kind,
            name: name.into(),
        }
    }

    /// How the worker reacts: retry, roll back, or halt.
    pub fn class(&self) -> ErrorClass {
        match self {
            DdlError::Meta(MetaError::NotOwner { .. }) => ErrorClass::Retryable,
            DdlError::Meta(err) if err.is_retryable() => ErrorClass::Retryable,
            DdlError::Meta(_) => ErrorClass::Fatal,
            DdlError::NotOwner { .. }
            | DdlError::SyncTimeout { .. }
            | DdlError::SchemaOutdated { .. }
            | DdlError::Stopped => ErrorClass::Retryable,
            DdlError::DuplicateKey { .. }
            | DdlError::DuplicateObject { .. }
            | DdlError::NotFound { .. }
            | DdlError::InvalidArgument(_)
            | DdlError::InvalidNull { .. }
            | DdlError::PoisonedRow { .. }
            | DdlError::Cancelled(_)
            | DdlError::NotCancellable(_)
            | DdlError::JobFailed { .. } => ErrorClass::Semantic,
            DdlError::Fatal(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    pub fn code(&self) -> &'static str {
        match self {
            DdlError::Meta(MetaError::NotOwner { .. }) | DdlError::NotOwner { .. } => "not_owner",
            DdlError::Meta(err) if err.is_retryable() => "meta_busy",
            DdlError::Meta(err) if err.is_corruption() => "meta_corrupt",
            DdlError::Meta(_) => "meta_error",
            DdlError::SyncTimeout { .. } => "sync_timeout",
            DdlError::DuplicateKey { .. } => "duplicate_key",
            DdlError::DuplicateObject { .. } => "duplicate_object",
            DdlError::NotFound { .. } => "not_found",
            DdlError::InvalidArgument(_) => "invalid_argument",
            DdlError::InvalidNull { .. } => "invalid_null",
            DdlError::PoisonedRow { .. } => "poisoned_row",
            DdlError::Cancelled(_) => CANCELLED_CODE,
            DdlError::NotCancellable(_) => "not_cancellable",
            DdlError::SchemaOutdated { .. } => "schema_outdated",
            DdlError::JobFailed { .. } => "job_failed",
            DdlError::Stopped => "stopped",
            DdlError::Fatal(_) => "fatal",
        }
    }

    /// The form stored on a job for its submitter.
    pub fn to_job_error(&self) -> JobError {
        JobError {
            class: self.class(),
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}
