use crate::clock::Clock;
use crate::error::DdlError;
use crate::error::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tessel_meta::Job;
use tessel_meta::JobArgs;
use tessel_meta::JobId;
use tessel_meta::JobQueue;
use tessel_meta::JobState;
use tessel_meta::MetaStore;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing::debug;
use tracing::info_span;

/// Wakes the worker of a queue when a local submission or cancel lands.
#[derive(Debug, Default)]
pub(crate) struct WorkerWake {
    general: Notify,
    reorg: Notify,
}

impl WorkerWake {
    fn notify_for(&self, queue: JobQueue) -> &Notify {
        match queue {
            JobQueue::General => &self.general,
            JobQueue::Reorg => &self.reorg,
        }
    }

    pub(crate) fn notify(&self, queue: JobQueue) {
        self.notify_for(queue).notify_one();
    }

    pub(crate) fn notify_all(&self) {
        for queue in JobQueue::ALL {
            self.notify(queue);
        }
    }

    pub(crate) async fn notified(&self, queue: JobQueue) {
        self.notify_for(queue).notified().await;
    }
}

struct SubmitRequest {
    job: Job,
    reply: oneshot::Sender<Result<JobId>>,
}

/// Front door for new jobs. Requests are drained in batches and each batch is
/// enqueued in a single meta transaction.
#[derive(Clone)]
pub(crate) struct JobSubmitter {
    tx: mpsc::Sender<SubmitRequest>,
}

impl JobSubmitter {
    pub(crate) fn spawn(
        store: MetaStore,
        clock: Arc<dyn Clock>,
        batch_size: usize,
        wake: Arc<WorkerWake>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(batch_size.max(1) * 4);
        let task = SubmitTask {
            store,
            clock,
            batch_size: batch_size.max(1),
            wake,
        };
        let handle = tokio::spawn(task.run(rx, cancel).instrument(info_span!("ddl_submit")));
        (Self { tx }, handle)
    }

    /// Returns once the job is durably queued, not once it ran.
    pub(crate) async fn submit(&self, job: Job) -> Result<JobId> {
        validate_job(&job)?;
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SubmitRequest { job, reply })
            .await
            .map_err(|_| DdlError::Stopped)?;
        rx.await.map_err(|_| DdlError::Stopped)?
    }
}

struct SubmitTask {
    store: MetaStore,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    wake: Arc<WorkerWake>,
}

impl SubmitTask {
    async fn run(self, mut rx: mpsc::Receiver<SubmitRequest>, cancel: CancellationToken) {
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => break,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            let mut batch = vec![first];
            while batch.len() < self.batch_size {
                match rx.try_recv() {
                    Ok(request) => batch.push(request),
                    Err(_) => break,
                }
            }
            self.handle_batch(batch).await;
        }
        rx.close();
        while let Ok(request) = rx.try_recv() {
            let _ = request.reply.send(Err(DdlError::Stopped));
        }
    }

    async fn handle_batch(&self, mut batch: Vec<SubmitRequest>) {
        let mut jobs: Vec<Job> = batch.iter().map(|request| request.job.clone()).collect();
        match self.enqueue(&mut jobs).await {
            Ok(()) => {
                debug!(count = jobs.len(), "enqueued ddl jobs");
                self.wake_queues(&jobs);
                for (request, job) in batch.drain(..).zip(jobs) {
                    let _ = request.reply.send(Ok(job.id));
                }
            }
            Err(err) if batch.len() == 1 => {
                if let Some(request) = batch.pop() {
                    let _ = request.reply.send(Err(err));
                }
            }
            Err(err) => {
                // Retry one by one so every submitter gets its own verdict.
                debug!("batched enqueue failed, retrying singly: {err}");
                for request in batch.drain(..) {
                    let mut single = [request.job];
                    let result = self.enqueue(&mut single).await;
                    if result.is_ok() {
                        self.wake_queues(&single);
                    }
                    let [job] = single;
                    let _ = request.reply.send(result.map(|()| job.id));
                }
            }
        }
    }

    /// Assign ids and append every job in one transaction.
    async fn enqueue(&self, jobs: &mut [Job]) -> Result<()> {
        let now_ms = self.clock.now_ms();
        let mut txn = self.store.begin().await?;
        for job in jobs.iter_mut() {
            job.id = txn.gen_global_id().await?;
            match job.args {
                JobArgs::CreateSchema { .. } => job.schema_id = txn.gen_global_id().await?,
                JobArgs::CreateTable { .. } => job.table_id = txn.gen_global_id().await?,
                _ => {}
            }
            txn.enqueue_job(job, now_ms).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    fn wake_queues(&self, jobs: &[Job]) {
        for queue in jobs.iter().map(Job::queue).collect::<HashSet<_>>() {
            self.wake.notify(queue);
        }
    }
}

/// Structural checks that need no schema: the job is fresh and its
/// arguments are well formed.
fn validate_job(job: &Job) -> Result<()> {
    if job.action != job.args.action() {
        return Err(DdlError::InvalidArgument(format!(
            "job action {} does not match its {} arguments",
            job.action.as_str(),
            job.args.action().as_str()
        )));
    }
    if job.state != JobState::Queued || job.id != 0 {
        return Err(DdlError::InvalidArgument(
            "only fresh jobs can be submitted".to_string(),
        ));
    }
    let needs_table = !matches!(
        job.args,
        JobArgs::CreateSchema { .. } | JobArgs::DropSchema | JobArgs::CreateTable { .. }
    );
    if needs_table && job.table_id == 0 {
        return Err(DdlError::InvalidArgument(format!(
            "{} needs a target table",
            job.action.as_str()
        )));
    }
    match &job.args {
        JobArgs::CreateTable { table } => {
            if table.columns.is_empty() {
                return Err(DdlError::InvalidArgument(format!(
                    "table `{}` needs at least one column",
                    table.name
                )));
            }
            let mut seen = HashSet::new();
            for column in &table.columns {
                if !seen.insert(column.name.to_ascii_lowercase()) {
                    return Err(DdlError::duplicate("column", column.name.as_str()));
                }
            }
        }
        JobArgs::AddIndex { columns, .. } | JobArgs::AddPrimaryKey { columns, .. }
            if columns.is_empty() =>
        {
            return Err(DdlError::InvalidArgument(
                "an index needs at least one column".to_string(),
            ));
        }
        JobArgs::CreateSchema { name }
        | JobArgs::RenameTable { new_name: name }
            if name.is_empty() =>
        {
            return Err(DdlError::InvalidArgument("name must not be empty".to_string()));
        }
        _ => {}
    }
    Ok(())
}
