use super::MetaStore;
use crate::Result;
use crate::model::DeleteRange;
use crate::model::Job;
use crate::model::JobId;
use crate::model::JobLookup;
use crate::model::JobQueue;
use crate::txn::jobs::history_job_from_row;
use crate::txn::jobs::queued_job_from_row;

impl MetaStore {
    /// Pending jobs in dequeue order, optionally restricted to one queue.
    pub async fn list_queued_jobs(&self, queue: Option<JobQueue>) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
SELECT job_id, job_json, cancel_requested
FROM job_queue
WHERE ? IS NULL OR queue = ?
ORDER BY job_id ASC
            "#,
        )
        .bind(queue.map(JobQueue::as_str))
        .bind(queue.map(JobQueue::as_str))
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.iter().map(queued_job_from_row).collect()
    }

    /// Most recently finished jobs first.
    pub async fn list_history_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
SELECT job_id, job_json
FROM job_history
ORDER BY job_id DESC
LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.iter().map(history_job_from_row).collect()
    }

    /// Look a job up in the queue and history within one snapshot.
    pub async fn find_job(&self, job_id: JobId) -> Result<Option<JobLookup>> {
        let mut txn = self.begin_read().await?;
        let lookup = match txn.get_queued_job(job_id).await? {
            Some(job) => Some(JobLookup::Queued(job)),
            None => txn.get_history_job(job_id).await?.map(JobLookup::Finished),
        };
        txn.commit().await?;
        Ok(lookup)
    }

    pub async fn history_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
SELECT job_id, job_json
FROM job_history
WHERE job_id = ?
            "#,
        )
        .bind(job_id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.map(|row| history_job_from_row(&row)).transpose()
    }

    pub async fn pending_delete_ranges(&self) -> Result<Vec<DeleteRange>> {
        let rows = sqlx::query(
            r#"
SELECT job_id, element_id, start_key, end_key
FROM gc_delete_ranges
ORDER BY job_id ASC, element_id ASC
            "#,
        )
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.iter().map(DeleteRange::try_from_row).collect()
    }

    /// Number of keys in `[start, end)`.
    pub async fn count_kv(&self, start: &[u8], end: &[u8]) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
SELECT COUNT(*) FROM kv WHERE key >= ? AND key < ?
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(count)
    }
}
