use crate::schema_cache::InfoSchema;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::sync::Arc;
use tessel_meta::Job;
use tessel_meta::JobId;

/// Observation points inside the DDL engine. Every method defaults to a
/// no-op; tests override them to inject cancels or stop a node mid-job.
#[async_trait]
pub trait DdlHook: Send + Sync {
    /// Before a worker runs the next step of `job`.
    async fn on_job_run_before(&self, _job: &Job) {}

    /// After a step of `job` committed.
    async fn on_job_updated(&self, _job: &Job) {}

    /// After a reorg batch committed; `next_key` is the resume point.
    async fn on_backfill_batch(&self, _job_id: JobId, _next_key: &[u8]) {}

    /// After this node's schema cache moved to `version`.
    async fn on_schema_changed(&self, _version: i64) {}

    /// Every schema handed to a statement passes through here; a hook may
    /// substitute another one.
    fn on_get_info_schema(&self, schema: Arc<InfoSchema>) -> Arc<InfoSchema> {
        schema
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

#[async_trait]
impl DdlHook for NoopHook {}

/// Swappable hook shared by every task of a node.
pub(crate) struct HookSlot {
    current: ArcSwap<Arc<dyn DdlHook>>,
}

impl HookSlot {
    pub(crate) fn new(hook: Arc<dyn DdlHook>) -> Self {
        Self {
            current: ArcSwap::from_pointee(hook),
        }
    }

    pub(crate) fn get(&self) -> Arc<dyn DdlHook> {
        let current = self.current.load();
        Arc::clone(&**current)
    }

    /// Install `hook`, returning the previous one.
    pub(crate) fn set(&self, hook: Arc<dyn DdlHook>) -> Arc<dyn DdlHook> {
        let previous = self.current.swap(Arc::new(hook));
        Arc::clone(&*previous)
    }
}
