use crate::clock::Clock;
use crate::error::DdlError;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tessel_meta::ActionType;
use tessel_meta::MetaStore;
use tessel_meta::MetaTxn;
use tessel_meta::SchemaDiff;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Objects one job step changed; the version is assigned at publish time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DiffTarget {
    pub(crate) schema_id: i64,
    pub(crate) table_id: i64,
    pub(crate) old_schema_id: Option<i64>,
}

/// Publishes schema versions and waits for the cluster to catch up.
pub struct SchemaSyncer {
    store: MetaStore,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    local: watch::Sender<i64>,
}

impl SchemaSyncer {
    pub fn new(store: MetaStore, clock: Arc<dyn Clock>, poll_interval: Duration) -> Self {
        let (local, _) = watch::channel(0);
        Self {
            store,
            clock,
            poll_interval,
            local,
        }
    }

    /// Bump the schema version and record its diff inside the caller's step
    /// transaction, so the new version commits together with the job state.
    pub(crate) async fn bump_version_and_publish(
        &self,
        txn: &mut MetaTxn,
        action: ActionType,
        target: DiffTarget,
    ) -> Result<i64> {
        let version = txn.bump_schema_version().await?;
        txn.set_schema_diff(&SchemaDiff {
            version,
            action,
            schema_id: target.schema_id,
            table_id: target.table_id,
            old_schema_id: target.old_schema_id,
        })
        .await?;
        Ok(version)
    }

    /// Tell this node's schema cache to reload now instead of at its next
    /// poll. Other nodes pick the version up by polling.
    pub fn notify_local(&self, version: i64) {
        self.local.send_if_modified(|current| {
            if version > *current {
                *current = version;
                true
            } else {
                false
            }
        });
    }

    pub fn subscribe_local(&self) -> watch::Receiver<i64> {
        self.local.subscribe()
    }

    /// Block until every live node reports `version` or newer.
    ///
    /// Nodes whose registration lapsed are not waited for: they already
    /// refuse statements with `SchemaOutdated`.
    pub async fn wait_version_synced(
        &self,
        version: i64,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let nodes = self.store.live_node_versions(self.clock.now_ms()).await?;
            let pending = nodes.iter().filter(|node| node.version < version).count();
            if pending == 0 {
                debug!(version, "schema version synced");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DdlError::SyncTimeout {
                    version,
                    pending,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(DdlError::Stopped),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
