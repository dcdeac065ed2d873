//! Queue workers. Each node runs one per queue; only the owner's workers
//! make progress, and every step they commit is fenced on the owner token.

use crate::admin::is_cancellable;
use crate::clock::Clock;
use crate::config::DdlConfig;
use crate::delete_range::DeleteRangeGc;
use crate::error::DdlError;
use crate::error::Result;
use crate::hook::HookSlot;
use crate::owner::OwnerManager;
use crate::owner::OwnerToken;
use crate::reorg::Backfiller;
use crate::reorg::ReorgPoll;
use crate::reorg::ReorgRunner;
use crate::retry::Backoff;
use crate::steps::StepCtx;
use crate::steps::has_visible_change;
use crate::steps::reorg_mode;
use crate::steps::run_step;
use crate::submit::WorkerWake;
use crate::syncer::SchemaSyncer;
use std::sync::Arc;
use std::time::Duration;
use tessel_meta::BinlogInfo;
use tessel_meta::ErrorClass;
use tessel_meta::Job;
use tessel_meta::JobError;
use tessel_meta::JobId;
use tessel_meta::JobQueue;
use tessel_meta::JobState;
use tessel_meta::MetaStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::info_span;
use tracing::warn;

/// Everything a node's workers share.
pub(crate) struct WorkerShared {
    pub(crate) node_id: String,
    pub(crate) store: MetaStore,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: DdlConfig,
    pub(crate) owner: Arc<dyn OwnerManager>,
    pub(crate) syncer: Arc<SchemaSyncer>,
    pub(crate) hooks: Arc<HookSlot>,
    pub(crate) wake: Arc<WorkerWake>,
    pub(crate) backfiller: Arc<Backfiller>,
    pub(crate) gc: Arc<DeleteRangeGc>,
}

pub(crate) fn spawn(
    shared: Arc<WorkerShared>,
    queue: JobQueue,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let span = info_span!("ddl_worker", node_id = %shared.node_id, queue = queue.as_str());
    tokio::spawn(
        async move {
            let worker = Worker::new(shared, queue, cancel.clone());
            worker.run(cancel).await;
        }
        .instrument(span),
    )
}

enum Tick {
    /// Nothing to do until woken or the poll interval passes.
    Idle,
    /// Look at the queue again right away.
    Again,
    Wait(Duration),
}

enum StepResult {
    /// The job left the queue under us.
    Vanished,
    /// Another step published a version that is not synced yet.
    NeedsSync,
    Committed {
        job: Job,
        version: Option<i64>,
    },
}

struct Worker {
    queue: JobQueue,
    shared: Arc<WorkerShared>,
    runner: ReorgRunner,
    backoff: Backoff,
    /// Highest version every live node is known to have loaded.
    synced_version: i64,
}

impl Worker {
    fn new(shared: Arc<WorkerShared>, queue: JobQueue, cancel: CancellationToken) -> Self {
        let runner = ReorgRunner::new(
            Arc::clone(&shared.backfiller),
            shared.config.reorg_wait_timeout(),
            cancel,
        );
        let backoff = Backoff::new(shared.config.retry_policy());
        Self {
            queue,
            shared,
            runner,
            backoff,
            synced_version: 0,
        }
    }

    async fn run(mut self, cancel: CancellationToken) {
        let poll_interval = self.shared.config.job_poll_interval();
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let delay = match self.tick(&cancel).await {
                Ok(Tick::Again) => {
                    tokio::task::yield_now().await;
                    continue;
                }
                Ok(Tick::Idle) => poll_interval,
                Ok(Tick::Wait(delay)) => delay,
                Err(err) => {
                    debug!("ddl worker round failed: {err}");
                    self.backoff.next_delay()
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.shared.wake.notified(self.queue) => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.runner.stop().await;
        debug!("ddl worker stopped");
    }

    async fn tick(&mut self, cancel: &CancellationToken) -> Result<Tick> {
        let Some(owner) = self.shared.owner.current_token() else {
            self.runner.stop().await;
            self.synced_version = 0;
            return Ok(Tick::Idle);
        };

        let mut txn = self.shared.store.begin_read().await?;
        let job = txn.first_job(self.queue).await?;
        let blocker = match &job {
            Some(job) => txn.earlier_conflicting_job(job).await?,
            None => None,
        };
        txn.commit().await?;

        let Some(job) = job else {
            self.runner.stop().await;
            if self.queue == JobQueue::General && self.shared.gc.run_once(&owner).await? {
                return Ok(Tick::Again);
            }
            return Ok(Tick::Idle);
        };
        if let Some(blocker) = blocker {
            debug!(
                job_id = job.id,
                blocker, "waiting for an earlier job on the same object"
            );
            return Ok(Tick::Idle);
        }

        // Never run a step on top of a version some node has not loaded.
        let global = self.shared.store.global_schema_version().await?;
        if global > self.synced_version {
            self.shared
                .syncer
                .wait_version_synced(global, self.shared.config.schema_sync_timeout(), cancel)
                .await?;
            self.synced_version = global;
        }

        self.shared.hooks.get().on_job_run_before(&job).await;
        self.run_job(job, &owner, cancel).await
    }

    async fn run_job(
        &mut self,
        job: Job,
        owner: &OwnerToken,
        cancel: &CancellationToken,
    ) -> Result<Tick> {
        let honour_cancel = job.cancel_requested && is_cancellable(&job);
        let mut reorg_rows = None;
        if honour_cancel {
            self.runner.stop().await;
        } else if let Some(mode) = reorg_mode(&job) {
            match self.runner.poll(&job, mode, owner).await {
                ReorgPoll::Running => return Ok(Tick::Again),
                ReorgPoll::Done { rows } => reorg_rows = Some(rows),
                ReorgPoll::Failed(err) => return Ok(self.handle_job_error(&job, owner, err).await),
            }
        }

        let (job, version) = match self.step(job.id, owner, reorg_rows).await {
            Ok(StepResult::Vanished) => return Ok(Tick::Again),
            Ok(StepResult::NeedsSync) => return Ok(Tick::Again),
            Ok(StepResult::Committed { job, version }) => (job, version),
            Err(err) => return Ok(self.handle_job_error(&job, owner, err).await),
        };
        self.backoff.reset();
        if let Some(version) = version {
            self.shared.syncer.notify_local(version);
        }
        self.shared.hooks.get().on_job_updated(&job).await;
        if job.is_finished() {
            info!(
                job_id = job.id,
                action = job.action.as_str(),
                state = %job.state,
                "ddl job finished"
            );
            self.shared.wake.notify_all();
        }

        if let Some(version) = version {
            match self
                .shared
                .syncer
                .wait_version_synced(version, self.shared.config.schema_sync_timeout(), cancel)
                .await
            {
                Ok(()) => self.synced_version = version,
                Err(err) => warn!(
                    job_id = job.id,
                    version,
                    "schema version not synced yet, waiting again before the next step: {err}"
                ),
            }
        }
        Ok(Tick::Again)
    }

    /// Run one step of `job_id` in a single owner-fenced transaction.
    async fn step(
        &mut self,
        job_id: JobId,
        owner: &OwnerToken,
        reorg_rows: Option<i64>,
    ) -> Result<StepResult> {
        let shared = Arc::clone(&self.shared);
        let now_ms = shared.clock.now_ms();
        let mut txn = shared.store.begin().await?;
        txn.ensure_owner(&shared.node_id, &owner.token, now_ms)
            .await?;
        // Bumps are serialized by this transaction, so checking here keeps
        // at most two versions live across the cluster.
        if txn.schema_version().await? > self.synced_version {
            return Ok(StepResult::NeedsSync);
        }
        let Some(mut job) = txn.get_queued_job(job_id).await? else {
            return Ok(StepResult::Vanished);
        };

        let diff = if job.cancel_requested && is_cancellable(&job) {
            job.error = Some(DdlError::Cancelled(job.id).to_job_error());
            job.state = if has_visible_change(&job) {
                JobState::RollingBack
            } else {
                JobState::Cancelled
            };
            info!(job_id, state = %job.state, "honouring cancel request");
            None
        } else {
            let mut ctx = StepCtx {
                txn: &mut txn,
                now_ms,
                reorg_rows,
            };
            run_step(&mut ctx, &mut job).await?
        };

        if job.error.as_ref().is_some_and(JobError::is_fatal) {
            job.error = None;
        }

        let version = match diff {
            Some(target) => {
                let version = shared
                    .syncer
                    .bump_version_and_publish(&mut txn, job.action, target)
                    .await?;
                job.snapshot_ver = version;
                Some(version)
            }
            None => None,
        };

        if job.is_finished() {
            let schema_version = txn.schema_version().await?;
            let db_info = txn.get_database(job.schema_id).await?;
            let table_info = match job.table_id {
                0 => None,
                table_id => txn.get_table(table_id).await?,
            };
            job.binlog = Some(BinlogInfo {
                schema_version,
                db_info,
                table_info,
                finished_ts: now_ms,
            });
            txn.finish_job(&job, now_ms).await?;
        } else {
            txn.update_job(&job).await?;
        }
        txn.commit().await?;
        debug!(
            job_id,
            state = %job.state,
            schema_state = job.schema_state.as_str(),
            ?version,
            "ddl step committed"
        );
        Ok(StepResult::Committed { job, version })
    }

    async fn handle_job_error(&mut self, job: &Job, owner: &OwnerToken, err: DdlError) -> Tick {
        match err.class() {
            ErrorClass::Retryable => {
                let delay = self.backoff.next_delay();
                debug!(
                    job_id = job.id,
                    attempt = self.backoff.attempt(),
                    "retryable ddl step error: {err}"
                );
                if !matches!(err, DdlError::Stopped)
                    && let Err(record_err) = self.record_retry(job.id, owner).await
                {
                    debug!(job_id = job.id, "could not record retry: {record_err}");
                }
                Tick::Wait(delay)
            }
            ErrorClass::Semantic if job.state != JobState::RollingBack => {
                warn!(job_id = job.id, "ddl job failed, rolling back: {err}");
                match self.start_rollback(job.id, owner, &err).await {
                    Ok(()) => Tick::Again,
                    Err(rollback_err) => {
                        debug!(job_id = job.id, "could not start rollback: {rollback_err}");
                        Tick::Wait(self.backoff.next_delay())
                    }
                }
            }
            ErrorClass::Semantic | ErrorClass::Fatal => {
                match self.record_halt(job.id, owner, &err).await {
                    Ok(true) => error!(
                        job_id = job.id,
                        state = %job.state,
                        "ddl job halted, needs operator attention: {err}"
                    ),
                    Ok(false) => debug!(job_id = job.id, "ddl job still halted: {err}"),
                    Err(record_err) => {
                        warn!(job_id = job.id, "could not record halted job: {record_err}");
                    }
                }
                Tick::Wait(self.shared.config.retry_policy().max_interval())
            }
        }
    }

    async fn record_retry(&self, job_id: JobId, owner: &OwnerToken) -> Result<()> {
        let mut txn = self.shared.store.begin().await?;
        txn.ensure_owner(&self.shared.node_id, &owner.token, self.shared.clock.now_ms())
            .await?;
        if let Some(mut job) = txn.get_queued_job(job_id).await? {
            job.error_count += 1;
            txn.update_job(&job).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// Keep `err` on the queued record as a fatal error so waiters and admins
    /// see why the job stopped. Returns false when it was already recorded.
    async fn record_halt(
        &self,
        job_id: JobId,
        owner: &OwnerToken,
        err: &DdlError,
    ) -> Result<bool> {
        let mut txn = self.shared.store.begin().await?;
        txn.ensure_owner(&self.shared.node_id, &owner.token, self.shared.clock.now_ms())
            .await?;
        let Some(mut job) = txn.get_queued_job(job_id).await? else {
            return Ok(false);
        };
        let halted = JobError {
            class: ErrorClass::Fatal,
            ..err.to_job_error()
        };
        if job.error.as_ref() == Some(&halted) {
            return Ok(false);
        }
        job.error = Some(halted);
        job.error_count += 1;
        txn.update_job(&job).await?;
        txn.commit().await?;
        self.shared.hooks.get().on_job_updated(&job).await;
        Ok(true)
    }

    /// Switch the job to `RollingBack`, keeping `err` for its submitter.
    async fn start_rollback(
        &self,
        job_id: JobId,
        owner: &OwnerToken,
        err: &DdlError,
    ) -> Result<()> {
        let mut txn = self.shared.store.begin().await?;
        txn.ensure_owner(&self.shared.node_id, &owner.token, self.shared.clock.now_ms())
            .await?;
        let Some(mut job) = txn.get_queued_job(job_id).await? else {
            return Ok(());
        };
        job.state = JobState::RollingBack;
        job.error = Some(err.to_job_error());
        job.error_count += 1;
        txn.update_job(&job).await?;
        txn.commit().await?;
        self.shared.hooks.get().on_job_updated(&job).await;
        Ok(())
    }
}
