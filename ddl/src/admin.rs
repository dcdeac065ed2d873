use crate::error::Result;
use crate::steps::has_visible_change;
use tessel_meta::ActionType;
use tessel_meta::Job;
use tessel_meta::JobId;
use tessel_meta::JobState;
use tessel_meta::MetaStore;
use tessel_meta::SchemaState;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCancelOutcome {
    /// The flag is set; the worker honours it at its next step.
    Requested,
    NotFound,
    AlreadyFinished,
    NotCancellable,
}

/// Whether a cancel can still be honoured for `job` in its current state.
///
/// Additive jobs can be undone until their object turns public. Every other
/// action is only cancellable before its first step.
pub fn is_cancellable(job: &Job) -> bool {
    if job.state.is_terminal() || job.state == JobState::RollingBack {
        return false;
    }
    match job.action {
        ActionType::AddColumn | ActionType::AddIndex | ActionType::AddPrimaryKey => {
            job.schema_state != SchemaState::Public
        }
        _ => job.state == JobState::Queued && !has_visible_change(job),
    }
}

/// Flag `job_id` for cancellation. The job record itself is left alone; the
/// worker owns every state change.
pub async fn cancel_job(store: &MetaStore, job_id: JobId) -> Result<AdminCancelOutcome> {
    let mut txn = store.begin().await?;
    let outcome = match txn.get_queued_job(job_id).await? {
        Some(job) if !is_cancellable(&job) => AdminCancelOutcome::NotCancellable,
        Some(_) => {
            txn.set_cancel_requested(job_id).await?;
            AdminCancelOutcome::Requested
        }
        None if txn.get_history_job(job_id).await?.is_some() => {
            AdminCancelOutcome::AlreadyFinished
        }
        None => AdminCancelOutcome::NotFound,
    };
    txn.commit().await?;
    if outcome == AdminCancelOutcome::Requested {
        info!(job_id, "ddl job cancel requested");
    }
    Ok(outcome)
}
