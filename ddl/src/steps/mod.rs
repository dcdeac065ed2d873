//! One state transition of a job per call.
//!
//! Every function here runs inside the worker's step transaction and only
//! mutates the meta store through it. The returned [`DiffTarget`] tells the
//! worker to bump the schema version in the same transaction; `None` means
//! the step changed nothing other nodes can observe.

mod column;
mod index;
mod schema;
mod table;

pub(crate) use index::target_index;

use crate::error::CANCELLED_CODE;
use crate::error::DdlError;
use crate::error::Result;
use crate::syncer::DiffTarget;
use tessel_meta::DeleteRange;
use tessel_meta::Job;
use tessel_meta::JobArgs;
use tessel_meta::JobState;
use tessel_meta::MetaTxn;
use tessel_meta::ReorgMode;
use tessel_meta::SchemaState;
use tessel_meta::TableInfo;
use tessel_meta::tablecodec;

pub(crate) struct StepCtx<'a> {
    pub(crate) txn: &'a mut MetaTxn,
    pub(crate) now_ms: i64,
    /// Rows processed by a reorg that has just completed for this job.
    pub(crate) reorg_rows: Option<i64>,
}

pub(crate) async fn run_step(ctx: &mut StepCtx<'_>, job: &mut Job) -> Result<Option<DiffTarget>> {
    check_args(job)?;
    match job.state {
        JobState::Queued => {
            job.state = JobState::Running;
            job.start_ts = ctx.now_ms;
            forward(ctx, job).await
        }
        JobState::Running => forward(ctx, job).await,
        JobState::RollingBack => rollback(ctx, job).await,
        state => Err(DdlError::Fatal(format!(
            "job {} is already {state} and has no further steps",
            job.id
        ))),
    }
}

/// A stored job whose arguments disagree with its action cannot be run.
pub(crate) fn check_args(job: &Job) -> Result<()> {
    if job.args.action() == job.action {
        Ok(())
    } else {
        Err(unexpected_args(job))
    }
}

async fn forward(ctx: &mut StepCtx<'_>, job: &mut Job) -> Result<Option<DiffTarget>> {
    match job.args {
        JobArgs::CreateSchema { .. } | JobArgs::DropSchema => schema::forward(ctx, job).await,
        JobArgs::CreateTable { .. }
        | JobArgs::DropTable
        | JobArgs::RenameTable { .. }
        | JobArgs::RebaseAutoId { .. } => table::forward(ctx, job).await,
        JobArgs::AddColumn { .. } | JobArgs::DropColumn { .. } => column::forward(ctx, job).await,
        JobArgs::AddIndex { .. }
        | JobArgs::DropIndex { .. }
        | JobArgs::AddPrimaryKey { .. }
        | JobArgs::DropPrimaryKey => index::forward(ctx, job).await,
    }
}

async fn rollback(ctx: &mut StepCtx<'_>, job: &mut Job) -> Result<Option<DiffTarget>> {
    if !has_visible_change(job) {
        finish_rollback(job);
        return Ok(None);
    }
    match job.args {
        JobArgs::AddColumn { .. } => column::rollback(ctx, job).await,
        JobArgs::AddIndex { .. } | JobArgs::AddPrimaryKey { .. } => index::rollback(ctx, job).await,
        _ => Err(DdlError::Fatal(format!(
            "{} job {} cannot roll back after publishing a schema change",
            job.action.as_str(),
            job.id
        ))),
    }
}

/// Whether any step of `job` has published a schema version.
pub(crate) fn has_visible_change(job: &Job) -> bool {
    job.snapshot_ver != 0
}

/// Terminal state of a finished rollback: cancels end `Cancelled`, anything
/// else `RollbackDone`.
pub(crate) fn finish_rollback(job: &mut Job) {
    let cancelled = job
        .error
        .as_ref()
        .is_some_and(|err| err.code == CANCELLED_CODE);
    job.state = if cancelled {
        JobState::Cancelled
    } else {
        JobState::RollbackDone
    };
}

/// The physical reorg the job needs before its next step can run.
pub(crate) fn reorg_mode(job: &Job) -> Option<ReorgMode> {
    let adds = matches!(
        job.args,
        JobArgs::AddIndex { .. } | JobArgs::AddPrimaryKey { .. }
    );
    let drops = matches!(job.args, JobArgs::DropIndex { .. } | JobArgs::DropPrimaryKey);
    match (job.state, job.schema_state) {
        (JobState::Running, SchemaState::WriteReorganization) if adds => Some(ReorgMode::Backfill),
        (JobState::Running, SchemaState::DeleteReorganization) if drops => Some(ReorgMode::Delete),
        (JobState::RollingBack, SchemaState::DeleteReorganization) if adds => {
            Some(ReorgMode::Delete)
        }
        _ => None,
    }
}

pub(crate) fn table_diff(job: &Job) -> DiffTarget {
    DiffTarget {
        schema_id: job.schema_id,
        table_id: job.table_id,
        old_schema_id: None,
    }
}

async fn load_table(txn: &mut MetaTxn, job: &Job) -> Result<TableInfo> {
    match txn.get_table(job.table_id).await? {
        Some(table) if table.schema_id == job.schema_id => Ok(table),
        _ => Err(DdlError::not_found("table", job.table_id.to_string())),
    }
}

fn table_delete_range(job: &Job, table_id: i64) -> DeleteRange {
    let start_key = tablecodec::table_prefix(table_id);
    let end_key = tablecodec::prefix_end(&start_key);
    DeleteRange {
        job_id: job.id,
        element_id: table_id,
        start_key,
        end_key,
    }
}

fn unexpected_args(job: &Job) -> DdlError {
    DdlError::Fatal(format!(
        "job {} carries arguments for {} instead of {}",
        job.id,
        job.args.action().as_str(),
        job.action.as_str()
    ))
}

fn unexpected_state(job: &Job, state: SchemaState) -> DdlError {
    DdlError::Fatal(format!(
        "{} job {} found its object in state {}",
        job.action.as_str(),
        job.id,
        state.as_str()
    ))
}
