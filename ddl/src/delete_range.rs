use crate::clock::Clock;
use crate::error::Result;
use crate::owner::OwnerToken;
use std::sync::Arc;
use tessel_meta::MetaStore;
use tessel_meta::tablecodec;
use tracing::debug;
use tracing::info;

/// Ranges looked at per round; each gets at most one batch.
const RANGES_PER_ROUND: usize = 16;

/// Physically removes the keys of dropped tables, one bounded batch per
/// range per round. Runs on the owner only.
pub(crate) struct DeleteRangeGc {
    node_id: String,
    store: MetaStore,
    clock: Arc<dyn Clock>,
    batch_size: usize,
}

impl DeleteRangeGc {
    pub(crate) fn new(
        node_id: String,
        store: MetaStore,
        clock: Arc<dyn Clock>,
        batch_size: usize,
    ) -> Self {
        Self {
            node_id,
            store,
            clock,
            batch_size: batch_size.max(1),
        }
    }

    /// One round over the pending ranges. Returns whether any range is left.
    pub(crate) async fn run_once(&self, owner: &OwnerToken) -> Result<bool> {
        let mut txn = self.store.begin().await?;
        txn.ensure_owner(&self.node_id, &owner.token, self.clock.now_ms())
            .await?;
        let ranges = txn.list_delete_ranges(RANGES_PER_ROUND).await?;
        if ranges.is_empty() {
            txn.commit().await?;
            return Ok(false);
        }
        let mut remaining = false;
        for range in &ranges {
            let keys = txn
                .kv_scan(&range.start_key, &range.end_key, self.batch_size)
                .await?;
            let Some((last, _)) = keys.last() else {
                txn.remove_delete_range(range).await?;
                info!(
                    job_id = range.job_id,
                    element_id = range.element_id,
                    "delete range cleared"
                );
                continue;
            };
            let next = tablecodec::key_next(last);
            let deleted = txn
                .kv_delete_range(&range.start_key, &next, self.batch_size)
                .await?;
            debug!(job_id = range.job_id, deleted, "deleted range batch");
            if keys.len() < self.batch_size {
                txn.remove_delete_range(range).await?;
                info!(
                    job_id = range.job_id,
                    element_id = range.element_id,
                    "delete range cleared"
                );
            } else {
                txn.advance_delete_range(range, &next).await?;
                remaining = true;
            }
        }
        txn.commit().await?;
        Ok(remaining || ranges.len() == RANGES_PER_ROUND)
    }
}
