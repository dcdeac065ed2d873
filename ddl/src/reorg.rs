//! Resumable physical reorganization: index backfill and index deletion.
//!
//! Work is split into batches over a `[start_key, end_key)` range. Each batch
//! reads, writes and advances the checkpoint in one owner-fenced meta
//! transaction, so a new owner resumes exactly where the last committed batch
//! stopped.

use crate::clock::Clock;
use crate::error::DdlError;
use crate::error::Result;
use crate::hook::HookSlot;
use crate::owner::OwnerToken;
use crate::steps::target_index;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tessel_meta::ColumnInfo;
use tessel_meta::Datum;
use tessel_meta::IndexInfo;
use tessel_meta::Job;
use tessel_meta::JobId;
use tessel_meta::MetaError;
use tessel_meta::MetaStore;
use tessel_meta::MetaTxn;
use tessel_meta::ReorgCheckpoint;
use tessel_meta::ReorgMode;
use tessel_meta::TableInfo;
use tessel_meta::tablecodec;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing::debug;
use tracing::info;
use tracing::info_span;

/// What the reorg worker learns from one poll.
#[derive(Debug)]
pub(crate) enum ReorgPoll {
    Done { rows: i64 },
    /// Still going; check the job again and poll later.
    Running,
    Failed(DdlError),
}

pub(crate) struct Backfiller {
    node_id: String,
    store: MetaStore,
    clock: Arc<dyn Clock>,
    hooks: Arc<HookSlot>,
    backfill_batch_size: usize,
    delete_batch_size: usize,
}

impl Backfiller {
    pub(crate) fn new(
        node_id: String,
        store: MetaStore,
        clock: Arc<dyn Clock>,
        hooks: Arc<HookSlot>,
        backfill_batch_size: usize,
        delete_batch_size: usize,
    ) -> Self {
        Self {
            node_id,
            store,
            clock,
            hooks,
            backfill_batch_size: backfill_batch_size.max(1),
            delete_batch_size: delete_batch_size.max(1),
        }
    }

    /// Run batches until the range is exhausted; returns the rows processed
    /// over the whole reorg, including batches of earlier owners.
    pub(crate) async fn run(
        &self,
        job_id: JobId,
        mode: ReorgMode,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<i64> {
        loop {
            if cancel.is_cancelled() {
                return Err(DdlError::Stopped);
            }
            let checkpoint = self.run_batch(job_id, mode, token).await?;
            self.hooks
                .get()
                .on_backfill_batch(job_id, &checkpoint.next_key)
                .await;
            if checkpoint.is_complete() {
                info!(
                    job_id,
                    mode = mode.as_str(),
                    rows = checkpoint.processed_rows,
                    "reorg finished"
                );
                return Ok(checkpoint.processed_rows);
            }
        }
    }

    async fn run_batch(
        &self,
        job_id: JobId,
        mode: ReorgMode,
        token: &str,
    ) -> Result<ReorgCheckpoint> {
        let now_ms = self.clock.now_ms();
        let mut txn = self.store.begin().await?;
        txn.ensure_owner(&self.node_id, token, now_ms).await?;
        let job = txn.get_queued_job(job_id).await?.ok_or(DdlError::Stopped)?;
        if mode == ReorgMode::Backfill && job.cancel_requested {
            return Err(DdlError::Cancelled(job_id));
        }
        let table = txn
            .get_table(job.table_id)
            .await?
            .ok_or_else(|| DdlError::not_found("table", job.table_id.to_string()))?;
        let index = target_index(&table, &job.args)
            .cloned()
            .ok_or_else(|| DdlError::not_found("index", format!("of job {job_id}")))?;

        let mut checkpoint = match txn.get_reorg_checkpoint(job_id).await? {
            Some(checkpoint) if checkpoint.element_id == index.id && checkpoint.mode == mode => {
                checkpoint
            }
            _ => self.init_checkpoint(&mut txn, &job, &index, mode).await?,
        };
        if !checkpoint.is_complete() {
            match mode {
                ReorgMode::Backfill => {
                    backfill_batch(&mut txn, &table, &index, &mut checkpoint).await?
                }
                ReorgMode::Delete => delete_batch(&mut txn, &mut checkpoint).await?,
            }
        }
        txn.put_reorg_checkpoint(&checkpoint, now_ms).await?;
        txn.commit().await?;
        Ok(checkpoint)
    }

    /// Fix the range up front. Rows added past `end_key` later are written
    /// through the index by ordinary DML, because the index is already
    /// writable on every live schema version.
    async fn init_checkpoint(
        &self,
        txn: &mut MetaTxn,
        job: &Job,
        index: &IndexInfo,
        mode: ReorgMode,
    ) -> Result<ReorgCheckpoint> {
        let (start_key, end_key, batch_size) = match mode {
            ReorgMode::Backfill => {
                let start = tablecodec::record_prefix(job.table_id);
                let end = match txn
                    .kv_last_key(&start, &tablecodec::prefix_end(&start))
                    .await?
                {
                    Some(last) => tablecodec::key_next(&last),
                    None => start.clone(),
                };
                (start, end, self.backfill_batch_size)
            }
            ReorgMode::Delete => {
                let start = tablecodec::index_prefix(job.table_id, index.id);
                let end = tablecodec::prefix_end(&start);
                (start, end, self.delete_batch_size)
            }
        };
        debug!(
            job_id = job.id,
            index_id = index.id,
            mode = mode.as_str(),
            "starting reorg"
        );
        Ok(ReorgCheckpoint {
            job_id: job.id,
            element_id: index.id,
            mode,
            next_key: start_key.clone(),
            start_key,
            end_key,
            batch_size: batch_size as i64,
            processed_rows: 0,
        })
    }
}

fn advance(checkpoint: &mut ReorgCheckpoint, last_key: Option<&[u8]>, processed: usize) {
    let batch_size = usize::try_from(checkpoint.batch_size).unwrap_or(usize::MAX);
    checkpoint.next_key = match last_key {
        Some(last) if processed >= batch_size => tablecodec::key_next(last),
        _ => checkpoint.end_key.clone(),
    };
    checkpoint.processed_rows += processed as i64;
}

fn batch_limit(checkpoint: &ReorgCheckpoint) -> usize {
    usize::try_from(checkpoint.batch_size).unwrap_or(1).max(1)
}

fn hex(key: &[u8]) -> String {
    key.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn poisoned(key: &[u8], err: impl std::fmt::Display) -> DdlError {
    DdlError::PoisonedRow {
        key: hex(key),
        message: err.to_string(),
    }
}

/// Index values of one stored row; columns the row predates read their
/// origin default.
pub(crate) fn index_values(
    table: &TableInfo,
    index: &IndexInfo,
    row: &BTreeMap<i64, Datum>,
) -> Vec<Datum> {
    index
        .columns
        .iter()
        .map(|column_id| match row.get(column_id) {
            Some(value) => value.clone(),
            None => table
                .column_by_id(*column_id)
                .map(ColumnInfo::origin_default_datum)
                .unwrap_or(Datum::Null),
        })
        .collect()
}

pub(crate) fn format_values(values: &[Datum]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("-")
}

async fn backfill_batch(
    txn: &mut MetaTxn,
    table: &TableInfo,
    index: &IndexInfo,
    checkpoint: &mut ReorgCheckpoint,
) -> Result<()> {
    let rows = txn
        .kv_scan(&checkpoint.next_key, &checkpoint.end_key, batch_limit(checkpoint))
        .await?;
    for (key, value) in &rows {
        let (_, handle) = tablecodec::decode_record_key(key).map_err(|err| poisoned(key, err))?;
        let row = tablecodec::decode_row(value).map_err(|err| poisoned(key, err))?;
        let values = index_values(table, index, &row);
        if index.primary
            && let Some(position) = values.iter().position(Datum::is_null)
        {
            let column = index
                .columns
                .get(position)
                .and_then(|id| table.column_by_id(*id))
                .map(|column| column.name.clone())
                .unwrap_or_default();
            return Err(DdlError::InvalidNull { column });
        }
        let entry = tablecodec::index_entry(table.id, index, &values, handle);
        if entry.distinct
            && let Some(existing) = txn.kv_get(&entry.key).await?
        {
            let owner =
                tablecodec::index_entry_handle(&entry.key, &existing).map_err(MetaError::from)?;
            if owner != handle {
                return Err(DdlError::DuplicateKey {
                    index: index.name.clone(),
                    value: format_values(&values),
                });
            }
        }
        txn.kv_put(&entry.key, &entry.value).await?;
    }
    let last_key = rows.last().map(|(key, _)| key.as_slice());
    advance(checkpoint, last_key, rows.len());
    Ok(())
}

async fn delete_batch(txn: &mut MetaTxn, checkpoint: &mut ReorgCheckpoint) -> Result<()> {
    let entries = txn
        .kv_scan(&checkpoint.next_key, &checkpoint.end_key, batch_limit(checkpoint))
        .await?;
    for (key, _) in &entries {
        txn.kv_delete(key).await?;
    }
    let last_key = entries.last().map(|(key, _)| key.as_slice());
    advance(checkpoint, last_key, entries.len());
    Ok(())
}

struct ReorgTask {
    job_id: JobId,
    mode: ReorgMode,
    token: String,
    cancel: CancellationToken,
    handle: JoinHandle<Result<i64>>,
}

/// Owned by the reorg worker. Keeps at most one background reorg alive and
/// lets the worker check on it without blocking for longer than
/// `wait_timeout`.
pub(crate) struct ReorgRunner {
    backfiller: Arc<Backfiller>,
    wait_timeout: Duration,
    parent: CancellationToken,
    task: Option<ReorgTask>,
}

impl ReorgRunner {
    pub(crate) fn new(
        backfiller: Arc<Backfiller>,
        wait_timeout: Duration,
        parent: CancellationToken,
    ) -> Self {
        Self {
            backfiller,
            wait_timeout,
            parent,
            task: None,
        }
    }

    pub(crate) async fn poll(
        &mut self,
        job: &Job,
        mode: ReorgMode,
        owner: &OwnerToken,
    ) -> ReorgPoll {
        let stale = self.task.as_ref().is_some_and(|task| {
            task.job_id != job.id || task.mode != mode || task.token != owner.token
        });
        if stale {
            self.stop().await;
        }
        if self.task.is_none() {
            self.task = Some(self.spawn(job.id, mode, owner.token.clone()));
        }
        let Some(task) = self.task.as_mut() else {
            return ReorgPoll::Running;
        };
        match tokio::time::timeout(self.wait_timeout, &mut task.handle).await {
            Err(_) => ReorgPoll::Running,
            Ok(joined) => {
                self.task = None;
                match joined {
                    Ok(Ok(rows)) => ReorgPoll::Done { rows },
                    Ok(Err(err)) => ReorgPoll::Failed(err),
                    Err(err) => ReorgPoll::Failed(DdlError::Fatal(format!(
                        "reorg task of job {} failed: {err}",
                        job.id
                    ))),
                }
            }
        }
    }

    fn spawn(&self, job_id: JobId, mode: ReorgMode, token: String) -> ReorgTask {
        let cancel = self.parent.child_token();
        let backfiller = Arc::clone(&self.backfiller);
        let task_cancel = cancel.clone();
        let task_token = token.clone();
        let span = info_span!("reorg", job_id, mode = mode.as_str());
        let handle = tokio::spawn(
            async move {
                backfiller
                    .run(job_id, mode, &task_token, &task_cancel)
                    .await
            }
            .instrument(span),
        );
        ReorgTask {
            job_id,
            mode,
            token,
            cancel,
            handle,
        }
    }

    /// Cancel the running reorg, if any, and wait for its batch to end.
    pub(crate) async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.cancel.cancel();
            let _ = task.handle.await;
        }
    }
}
