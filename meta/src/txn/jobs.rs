use super::MetaTxn;
use crate::MetaError;
use crate::Result;
use crate::model::Job;
use crate::model::JobId;
use crate::model::JobQueue;
use crate::model::SchemaDiff;
use crate::model::decode_info;
use crate::model::decode_job;
use crate::model::encode_info;
use crate::model::encode_job;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

impl MetaTxn {
    /// Append a job to its queue. The job id must already be allocated.
    pub async fn enqueue_job(&mut self, job: &Job, now_ms: i64) -> Result<()> {
        let job_json = encode_job(job)?;
        let in_history: Option<i64> = sqlx::query_scalar(
            r#"
SELECT job_id FROM job_history WHERE job_id = ?
            "#,
        )
        .bind(job.id)
        .fetch_optional(&mut *self.tx)
        .await?;
        if in_history.is_some() {
            return Err(MetaError::Duplicate {
                what: "job",
                name: job.id.to_string(),
            });
        }
        sqlx::query(
            r#"
INSERT INTO job_queue (
    job_id,
    queue,
    action,
    schema_id,
    table_id,
    job_json,
    cancel_requested,
    enqueued_at
) VALUES (?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(job.id)
        .bind(job.queue().as_str())
        .bind(job.action.as_str())
        .bind(job.schema_id)
        .bind(job.table_id)
        .bind(job_json)
        .bind(now_ms)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Head of `queue` in FIFO order.
    pub async fn first_job(&mut self, queue: JobQueue) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
SELECT job_id, job_json, cancel_requested
FROM job_queue
WHERE queue = ?
ORDER BY job_id ASC
LIMIT 1
            "#,
        )
        .bind(queue.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(|row| queued_job_from_row(&row)).transpose()
    }

    pub async fn get_queued_job(&mut self, job_id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
SELECT job_id, job_json, cancel_requested
FROM job_queue
WHERE job_id = ?
            "#,
        )
        .bind(job_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(|row| queued_job_from_row(&row)).transpose()
    }

    /// Persist a non-terminal job state. The cancel flag column is left alone.
    pub async fn update_job(&mut self, job: &Job) -> Result<()> {
        let job_json = encode_job(job)?;
        let rows_affected = sqlx::query(
            r#"
UPDATE job_queue SET job_json = ? WHERE job_id = ?
            "#,
        )
        .bind(job_json)
        .bind(job.id)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();
        if rows_affected == 0 {
            return Err(MetaError::not_found("queued job", job.id));
        }
        Ok(())
    }

    /// Move a job from its queue to history and drop its reorg checkpoint.
    pub async fn finish_job(&mut self, job: &Job, finished_ts: i64) -> Result<()> {
        let rows_affected = sqlx::query(
            r#"
DELETE FROM job_queue WHERE job_id = ?
            "#,
        )
        .bind(job.id)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();
        if rows_affected == 0 {
            return Err(MetaError::not_found("queued job", job.id));
        }
        let job_json = encode_job(job)?;
        sqlx::query(
            r#"
INSERT INTO job_history (job_id, job_json, finished_ts) VALUES (?, ?, ?)
            "#,
        )
        .bind(job.id)
        .bind(job_json)
        .bind(finished_ts)
        .execute(&mut *self.tx)
        .await?;
        self.remove_reorg_checkpoint(job.id).await
    }

    pub async fn get_history_job(&mut self, job_id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
SELECT job_id, job_json
FROM job_history
WHERE job_id = ?
            "#,
        )
        .bind(job_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(|row| history_job_from_row(&row)).transpose()
    }

    /// Flag a queued job for cancellation. Returns `false` when the job is
    /// not in any queue.
    pub async fn set_cancel_requested(&mut self, job_id: JobId) -> Result<bool> {
        let rows_affected = sqlx::query(
            r#"
UPDATE job_queue SET cancel_requested = 1 WHERE job_id = ?
            "#,
        )
        .bind(job_id)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();
        Ok(rows_affected > 0)
    }

    /// Earliest job in the other queue, enqueued before `job`, that touches
    /// the same table, or the same schema when either side is schema-level.
    pub async fn earlier_conflicting_job(&mut self, job: &Job) -> Result<Option<JobId>> {
        let job_id: Option<i64> = sqlx::query_scalar(
            r#"
SELECT job_id
FROM job_queue
WHERE job_id < ?
  AND queue != ?
  AND (
    (? != 0 AND table_id = ?)
    OR (schema_id = ? AND (table_id = 0 OR ? = 0))
  )
ORDER BY job_id ASC
LIMIT 1
            "#,
        )
        .bind(job.id)
        .bind(job.queue().as_str())
        .bind(job.table_id)
        .bind(job.table_id)
        .bind(job.schema_id)
        .bind(job.table_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(job_id)
    }

    pub async fn set_schema_diff(&mut self, diff: &SchemaDiff) -> Result<()> {
        let diff_json = encode_info("schema diff", diff)?;
        sqlx::query(
            r#"
INSERT INTO schema_diffs (version, diff_json) VALUES (?, ?)
            "#,
        )
        .bind(diff.version)
        .bind(diff_json)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn get_schema_diff(&mut self, version: i64) -> Result<Option<SchemaDiff>> {
        let json: Option<String> = sqlx::query_scalar(
            r#"
SELECT diff_json FROM schema_diffs WHERE version = ?
            "#,
        )
        .bind(version)
        .fetch_optional(&mut *self.tx)
        .await?;
        json.map(|json| decode_info("schema diff", version, &json))
            .transpose()
    }
}

pub(crate) fn queued_job_from_row(row: &SqliteRow) -> Result<Job> {
    let job_id: i64 = row.try_get("job_id")?;
    let job_json: String = row.try_get("job_json")?;
    let cancel_requested: i64 = row.try_get("cancel_requested")?;
    decode_job(&job_json, job_id, cancel_requested != 0)
}

pub(crate) fn history_job_from_row(row: &SqliteRow) -> Result<Job> {
    let job_id: i64 = row.try_get("job_id")?;
    let job_json: String = row.try_get("job_json")?;
    decode_job(&job_json, job_id, false)
}
