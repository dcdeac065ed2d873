use crate::admin;
use crate::admin::AdminCancelOutcome;
use crate::clock::Clock;
use crate::clock::SystemClock;
use crate::config::DdlConfig;
use crate::delete_range::DeleteRangeGc;
use crate::dml::DmlSession;
use crate::error::DdlError;
use crate::error::Result;
use crate::hook::DdlHook;
use crate::hook::HookSlot;
use crate::hook::NoopHook;
use crate::owner::LeaseOwnerManager;
use crate::owner::OwnerManager;
use crate::reorg::Backfiller;
use crate::retry::Backoff;
use crate::schema_cache::SchemaCache;
use crate::submit::JobSubmitter;
use crate::submit::WorkerWake;
use crate::syncer::SchemaSyncer;
use crate::worker;
use crate::worker::WorkerShared;
use std::sync::Arc;
use tessel_meta::Job;
use tessel_meta::JobArgs;
use tessel_meta::JobError;
use tessel_meta::JobId;
use tessel_meta::JobLookup;
use tessel_meta::JobQueue;
use tessel_meta::JobState;
use tessel_meta::MetaStore;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

/// How a node is wired up. Everything but the node id has a default.
pub struct DdlOptions {
    pub node_id: String,
    pub clock: Arc<dyn Clock>,
    /// Defaults to a [`LeaseOwnerManager`] on the node's store.
    pub owner: Option<Arc<dyn OwnerManager>>,
    pub hook: Arc<dyn DdlHook>,
}

impl DdlOptions {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            clock: Arc::new(SystemClock),
            owner: None,
            hook: Arc::new(NoopHook),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_owner(mut self, owner: Arc<dyn OwnerManager>) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn DdlHook>) -> Self {
        self.hook = hook;
        self
    }
}

struct Running {
    cancel: CancellationToken,
    submitter: JobSubmitter,
    tasks: Vec<JoinHandle<()>>,
}

/// One node's DDL engine: owner campaign, job submission, the general and
/// reorg workers, and the node's schema cache.
pub struct Ddl {
    node_id: String,
    store: MetaStore,
    config: DdlConfig,
    clock: Arc<dyn Clock>,
    owner: Arc<dyn OwnerManager>,
    hooks: Arc<HookSlot>,
    cache: Arc<SchemaCache>,
    syncer: Arc<SchemaSyncer>,
    wake: Arc<WorkerWake>,
    running: Mutex<Option<Running>>,
}

impl Ddl {
    /// Build a node on `store` and load its schema. Nothing runs until
    /// [`Ddl::start`].
    pub async fn new(store: MetaStore, config: DdlConfig, options: DdlOptions) -> Result<Self> {
        config
            .validate()
            .map_err(|err| DdlError::InvalidArgument(err.to_string()))?;
        let DdlOptions {
            node_id,
            clock,
            owner,
            hook,
        } = options;
        let owner = owner.unwrap_or_else(|| {
            Arc::new(LeaseOwnerManager::new(
                node_id.clone(),
                store.clone(),
                Arc::clone(&clock),
                config.owner_lease(),
                config.retry_policy(),
            ))
        });
        let hooks = Arc::new(HookSlot::new(hook));
        let cache = Arc::new(SchemaCache::new(
            node_id.clone(),
            store.clone(),
            Arc::clone(&clock),
            config.schema_lease(),
            config.schema_poll_interval(),
            Arc::clone(&hooks),
        ));
        let syncer = Arc::new(SchemaSyncer::new(
            store.clone(),
            Arc::clone(&clock),
            config.schema_poll_interval(),
        ));
        cache.reload().await?;
        Ok(Self {
            node_id,
            store,
            config,
            clock,
            owner,
            hooks,
            cache,
            syncer,
            wake: Arc::new(WorkerWake::default()),
            running: Mutex::new(None),
        })
    }

    /// Start campaigning, reloading the schema, accepting jobs and running
    /// workers. Starting a running node is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        tasks.push(Arc::clone(&self.owner).campaign_owner(cancel.child_token()));
        tasks.push(
            Arc::clone(&self.cache).run(self.syncer.subscribe_local(), cancel.child_token()),
        );
        let (submitter, submit_task) = JobSubmitter::spawn(
            self.store.clone(),
            Arc::clone(&self.clock),
            self.config.submit_batch_size,
            Arc::clone(&self.wake),
            cancel.child_token(),
        );
        tasks.push(submit_task);

        let shared = Arc::new(WorkerShared {
            node_id: self.node_id.clone(),
            store: self.store.clone(),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
            owner: Arc::clone(&self.owner),
            syncer: Arc::clone(&self.syncer),
            hooks: Arc::clone(&self.hooks),
            wake: Arc::clone(&self.wake),
            backfiller: Arc::new(Backfiller::new(
                self.node_id.clone(),
                self.store.clone(),
                Arc::clone(&self.clock),
                Arc::clone(&self.hooks),
                self.config.backfill_batch_size,
                self.config.delete_range_batch_size,
            )),
            gc: Arc::new(DeleteRangeGc::new(
                self.node_id.clone(),
                self.store.clone(),
                Arc::clone(&self.clock),
                self.config.delete_range_batch_size,
            )),
        });
        for queue in JobQueue::ALL {
            tasks.push(worker::spawn(
                Arc::clone(&shared),
                queue,
                cancel.child_token(),
            ));
        }

        *running = Some(Running {
            cancel,
            submitter,
            tasks,
        });
        info!(node_id = %self.node_id, "ddl started");
        Ok(())
    }

    /// Stop every task, give up ownership and leave the live-node set.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        running.cancel.cancel();
        for task in running.tasks {
            if let Err(err) = task.await {
                warn!("ddl task ended abnormally: {err}");
            }
        }
        self.owner.resign().await?;
        self.cache.deregister().await?;
        info!(node_id = %self.node_id, "ddl stopped");
        Ok(())
    }

    /// Kill every task without resigning or deregistering, as a crashed
    /// process would. Other nodes take over once the leases expire.
    pub async fn abort(&self) {
        if let Some(running) = self.running.lock().await.take() {
            running.cancel.cancel();
            for task in &running.tasks {
                task.abort();
            }
            warn!(node_id = %self.node_id, "ddl aborted");
        }
    }

    /// Durably enqueue `job`. Returns its id, not its outcome.
    pub async fn submit_job(&self, job: Job) -> Result<JobId> {
        let submitter = match self.running.lock().await.as_ref() {
            Some(running) => running.submitter.clone(),
            None => return Err(DdlError::Stopped),
        };
        submitter.submit(job).await
    }

    /// Poll until `job_id` reaches the history and return its final record.
    /// A job the worker halted on fails right away with its recorded error.
    pub async fn wait_job(&self, job_id: JobId) -> Result<Job> {
        let mut backoff = Backoff::new(self.config.retry_policy());
        loop {
            match self.store.find_job(job_id).await? {
                Some(JobLookup::Finished(job)) => return Ok(job),
                Some(JobLookup::Queued(job))
                    if job.error.as_ref().is_some_and(JobError::is_fatal) =>
                {
                    return Err(DdlError::JobFailed {
                        job_id,
                        state: job.state,
                        error: job.error,
                    });
                }
                Some(JobLookup::Queued(_)) => {}
                None => return Err(DdlError::not_found("job", job_id.to_string())),
            }
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    /// Submit `job` and wait for it. Anything but `Done` is an error that
    /// carries the job's own error.
    pub async fn do_ddl_job(&self, job: Job) -> Result<Job> {
        let job_id = self.submit_job(job).await?;
        let job = self.wait_job(job_id).await?;
        if job.state == JobState::Done {
            Ok(job)
        } else {
            Err(DdlError::JobFailed {
                job_id,
                state: job.state,
                error: job.error,
            })
        }
    }

    pub async fn cancel_job(&self, job_id: JobId) -> Result<AdminCancelOutcome> {
        let outcome = admin::cancel_job(&self.store, job_id).await?;
        if outcome == AdminCancelOutcome::Requested {
            self.wake.notify_all();
        }
        Ok(outcome)
    }

    /// A job against table `db.table` as this node currently sees it.
    pub fn job_for_table(&self, db: &str, table: &str, args: JobArgs) -> Result<Job> {
        let schema = self.cache.snapshot();
        let table_info = schema
            .table_by_name(db, table)
            .ok_or_else(|| DdlError::not_found("table", format!("{db}.{table}")))?;
        Ok(Job::new(table_info.schema_id, table_info.id, args))
    }

    /// A job against database `db`, or a create-table job inside it.
    pub fn job_for_schema(&self, db: &str, args: JobArgs) -> Result<Job> {
        let schema = self.cache.snapshot();
        let db_info = schema
            .database_by_name(db)
            .ok_or_else(|| DdlError::not_found("database", db))?;
        Ok(Job::new(db_info.id, 0, args))
    }

    /// Install `hook`, returning the previous one.
    pub fn set_hook(&self, hook: Arc<dyn DdlHook>) -> Arc<dyn DdlHook> {
        self.hooks.set(hook)
    }

    pub fn is_owner(&self) -> bool {
        self.owner.is_owner()
    }

    pub fn schema_cache(&self) -> &Arc<SchemaCache> {
        &self.cache
    }

    /// Row access through this node's schema cache.
    pub fn dml(&self) -> DmlSession {
        DmlSession::new(self.store.clone(), Arc::clone(&self.cache))
    }

    pub fn store(&self) -> &MetaStore {
        &self.store
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &DdlConfig {
        &self.config
    }
}
