use crate::MetaError;
use crate::Result;
use crate::model::ColumnSpec;
use crate::model::DbInfo;
use crate::model::SchemaState;
use crate::model::TableInfo;
use crate::model::TableSpec;
use serde::Deserialize;
use serde::Serialize;

pub type JobId = i64;

/// The kind of schema change a job performs. Never changes after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    CreateSchema,
    DropSchema,
    CreateTable,
    DropTable,
    RenameTable,
    AddColumn,
    DropColumn,
    AddIndex,
    DropIndex,
    AddPrimaryKey,
    DropPrimaryKey,
    RebaseAutoId,
}

impl ActionType {
    pub const fn as_str(self) -> &'static str {
        match self {
            ActionType::CreateSchema => "create_schema",
            ActionType::DropSchema => "drop_schema",
            ActionType::CreateTable => "create_table",
            ActionType::DropTable => "drop_table",
            ActionType::RenameTable => "rename_table",
            ActionType::AddColumn => "add_column",
            ActionType::DropColumn => "drop_column",
            ActionType::AddIndex => "add_index",
            ActionType::DropIndex => "drop_index",
            ActionType::AddPrimaryKey => "add_primary_key",
            ActionType::DropPrimaryKey => "drop_primary_key",
            ActionType::RebaseAutoId => "rebase_auto_id",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "create_schema" => Ok(Self::CreateSchema),
            "drop_schema" => Ok(Self::DropSchema),
            "create_table" => Ok(Self::CreateTable),
            "drop_table" => Ok(Self::DropTable),
            "rename_table" => Ok(Self::RenameTable),
            "add_column" => Ok(Self::AddColumn),
            "drop_column" => Ok(Self::DropColumn),
            "add_index" => Ok(Self::AddIndex),
            "drop_index" => Ok(Self::DropIndex),
            "add_primary_key" => Ok(Self::AddPrimaryKey),
            "drop_primary_key" => Ok(Self::DropPrimaryKey),
            "rebase_auto_id" => Ok(Self::RebaseAutoId),
            _ => Err(MetaError::InvalidValue {
                what: "action",
                value: value.to_string(),
            }),
        }
    }

    /// Index-affecting actions scan physical data and run on the reorg queue.
    pub const fn queue(self) -> JobQueue {
        match self {
            ActionType::AddIndex
            | ActionType::DropIndex
            | ActionType::AddPrimaryKey
            | ActionType::DropPrimaryKey => JobQueue::Reorg,
            _ => JobQueue::General,
        }
    }

    /// Schema-level jobs conflict with every job in the same schema.
    pub const fn is_schema_level(self) -> bool {
        matches!(self, ActionType::CreateSchema | ActionType::DropSchema)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobQueue {
    General,
    Reorg,
}

impl JobQueue {
    pub const ALL: [JobQueue; 2] = [JobQueue::General, JobQueue::Reorg];

    pub const fn as_str(self) -> &'static str {
        match self {
            JobQueue::General => "general",
            JobQueue::Reorg => "reorg",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "general" => Ok(Self::General),
            "reorg" => Ok(Self::Reorg),
            _ => Err(MetaError::InvalidValue {
                what: "queue",
                value: value.to_string(),
            }),
        }
    }
}

/// Strongly-typed arguments, one variant per action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum JobArgs {
    CreateSchema { name: String },
    DropSchema,
    CreateTable { table: TableSpec },
    DropTable,
    RenameTable { new_name: String },
    AddColumn { column: ColumnSpec },
    DropColumn { name: String },
    AddIndex {
        name: String,
        columns: Vec<String>,
        unique: bool,
    },
    DropIndex { name: String },
    AddPrimaryKey { name: String, columns: Vec<String> },
    DropPrimaryKey,
    RebaseAutoId { new_base: i64 },
}

impl JobArgs {
    pub const fn action(&self) -> ActionType {
        match self {
            JobArgs::CreateSchema { .. } => ActionType::CreateSchema,
            JobArgs::DropSchema => ActionType::DropSchema,
            JobArgs::CreateTable { .. } => ActionType::CreateTable,
            JobArgs::DropTable => ActionType::DropTable,
            JobArgs::RenameTable { .. } => ActionType::RenameTable,
            JobArgs::AddColumn { .. } => ActionType::AddColumn,
            JobArgs::DropColumn { .. } => ActionType::DropColumn,
            JobArgs::AddIndex { .. } => ActionType::AddIndex,
            JobArgs::DropIndex { .. } => ActionType::DropIndex,
            JobArgs::AddPrimaryKey { .. } => ActionType::AddPrimaryKey,
            JobArgs::DropPrimaryKey => ActionType::DropPrimaryKey,
            JobArgs::RebaseAutoId { .. } => ActionType::RebaseAutoId,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    RollingBack,
    RollbackDone,
    Done,
    Cancelled,
}

impl JobState {
    pub const fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::RollingBack => "rolling_back",
            JobState::RollbackDone => "rollback_done",
            JobState::Done => "done",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "rolling_back" => Ok(Self::RollingBack),
            "rollback_done" => Ok(Self::RollbackDone),
            "done" => Ok(Self::Done),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(MetaError::InvalidValue {
                what: "job state",
                value: value.to_string(),
            }),
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Done | JobState::RollbackDone | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Retryable,
    Semantic,
    Fatal,
}

/// Error recorded on a job for the submitter to observe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub class: ErrorClass,
    pub code: String,
    pub message: String,
}

impl JobError {
    /// A fatal error on a queued job means the worker stopped on it.
    pub fn is_fatal(&self) -> bool {
        self.class == ErrorClass::Fatal
    }
}

/// Snapshot captured when a job finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogInfo {
    pub schema_version: i64,
    pub db_info: Option<DbInfo>,
    pub table_info: Option<TableInfo>,
    pub finished_ts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub action: ActionType,
    pub schema_id: i64,
    pub table_id: i64,
    pub args: JobArgs,
    pub state: JobState,
    pub schema_state: SchemaState,
    pub error: Option<JobError>,
    pub error_count: i64,
    /// Rows processed by the reorg phase.
    pub row_count: i64,
    /// Schema version the job last published.
    pub snapshot_ver: i64,
    pub start_ts: i64,
    pub reorg_started: bool,
    pub binlog: Option<BinlogInfo>,
    /// Stored next to the record so the admin path never rewrites the job.
    #[serde(skip)]
    pub cancel_requested: bool,
}

impl Job {
    /// A fresh job. The id is assigned at enqueue time.
    pub fn new(schema_id: i64, table_id: i64, args: JobArgs) -> Self {
        Self {
            id: 0,
            action: args.action(),
            schema_id,
            table_id,
            args,
            state: JobState::Queued,
            schema_state: SchemaState::None,
            error: None,
            error_count: 0,
            row_count: 0,
            snapshot_ver: 0,
            start_ts: 0,
            reorg_started: false,
            binlog: None,
            cancel_requested: false,
        }
    }

    pub fn queue(&self) -> JobQueue {
        self.action.queue()
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Where a job currently lives. A job is in exactly one of the two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobLookup {
    Queued(Job),
    Finished(Job),
}

impl JobLookup {
    pub fn job(&self) -> &Job {
        match self {
            JobLookup::Queued(job) | JobLookup::Finished(job) => job,
        }
    }
}

pub(crate) fn encode_job(job: &Job) -> Result<String> {
    serde_json::to_string(job).map_err(|source| MetaError::Encode {
        what: "job",
        source,
    })
}

pub(crate) fn decode_job(json: &str, job_id: JobId, cancel_requested: bool) -> Result<Job> {
    let mut job: Job = serde_json::from_str(json).map_err(|source| MetaError::Corrupt {
        what: "job",
        id: job_id,
        source,
    })?;
    job.cancel_requested = cancel_requested;
    Ok(job)
}
