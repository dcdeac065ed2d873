use super::MetaTxn;
use crate::Result;
use crate::model::DeleteRange;
use crate::model::JobId;
use crate::model::ReorgCheckpoint;
use sqlx::Row;

impl MetaTxn {
    /// Move the auto-increment base up to `new_base`. The base never moves
    /// down; the resulting base is returned.
    pub async fn rebase_auto_id(&mut self, table_id: i64, new_base: i64) -> Result<i64> {
        let base: i64 = sqlx::query_scalar(
            r#"
INSERT INTO auto_ids (table_id, base) VALUES (?, ?)
ON CONFLICT(table_id) DO UPDATE SET base = MAX(base, excluded.base)
RETURNING base
            "#,
        )
        .bind(table_id)
        .bind(new_base)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(base)
    }

    pub async fn auto_id_base(&mut self, table_id: i64) -> Result<i64> {
        let base: Option<i64> = sqlx::query_scalar(
            r#"
SELECT base FROM auto_ids WHERE table_id = ?
            "#,
        )
        .bind(table_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(base.unwrap_or(0))
    }

    /// Reserve `count` row handles for `table_id`; returns the first one.
    pub async fn alloc_handles(&mut self, table_id: i64, count: i64) -> Result<i64> {
        let last: i64 = sqlx::query_scalar(
            r#"
INSERT INTO auto_ids (table_id, base) VALUES (?, ?)
ON CONFLICT(table_id) DO UPDATE SET base = base + excluded.base
RETURNING base
            "#,
        )
        .bind(table_id)
        .bind(count)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(last - count + 1)
    }

    pub async fn get_reorg_checkpoint(&mut self, job_id: JobId) -> Result<Option<ReorgCheckpoint>> {
        let row = sqlx::query(
            r#"
SELECT
    job_id,
    element_id,
    mode,
    start_key,
    end_key,
    next_key,
    batch_size,
    processed_rows
FROM reorg_checkpoints
WHERE job_id = ?
            "#,
        )
        .bind(job_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(|row| ReorgCheckpoint::try_from_row(&row))
            .transpose()
    }

    pub async fn put_reorg_checkpoint(
        &mut self,
        checkpoint: &ReorgCheckpoint,
        now_ms: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
INSERT INTO reorg_checkpoints (
    job_id,
    element_id,
    mode,
    start_key,
    end_key,
    next_key,
    batch_size,
    processed_rows,
    updated_at
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(job_id) DO UPDATE SET
    element_id = excluded.element_id,
    mode = excluded.mode,
    start_key = excluded.start_key,
    end_key = excluded.end_key,
    next_key = excluded.next_key,
    batch_size = excluded.batch_size,
    processed_rows = excluded.processed_rows,
    updated_at = excluded.updated_at
            "#,
        )
        .bind(checkpoint.job_id)
        .bind(checkpoint.element_id)
        .bind(checkpoint.mode.as_str())
        .bind(checkpoint.start_key.as_slice())
        .bind(checkpoint.end_key.as_slice())
        .bind(checkpoint.next_key.as_slice())
        .bind(checkpoint.batch_size)
        .bind(checkpoint.processed_rows)
        .bind(now_ms)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn remove_reorg_checkpoint(&mut self, job_id: JobId) -> Result<()> {
        sqlx::query(
            r#"
DELETE FROM reorg_checkpoints WHERE job_id = ?
            "#,
        )
        .bind(job_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn kv_get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value: Option<Vec<u8>> = sqlx::query_scalar(
            r#"
SELECT value FROM kv WHERE key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(value)
    }

    pub async fn kv_put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        sqlx::query(
            r#"
INSERT INTO kv (key, value) VALUES (?, ?)
ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn kv_delete(&mut self, key: &[u8]) -> Result<bool> {
        let rows_affected = sqlx::query(
            r#"
DELETE FROM kv WHERE key = ?
            "#,
        )
        .bind(key)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();
        Ok(rows_affected > 0)
    }

    /// Up to `limit` pairs in `[start, end)`, ascending by key.
    pub async fn kv_scan(
        &mut self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let rows = sqlx::query(
            r#"
SELECT key, value
FROM kv
WHERE key >= ? AND key < ?
ORDER BY key ASC
LIMIT ?
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(limit as i64)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("key")?, row.try_get("value")?)))
            .collect()
    }

    /// Largest key in `[start, end)`.
    pub async fn kv_last_key(&mut self, start: &[u8], end: &[u8]) -> Result<Option<Vec<u8>>> {
        let key: Option<Vec<u8>> = sqlx::query_scalar(
            r#"
SELECT key
FROM kv
WHERE key >= ? AND key < ?
ORDER BY key DESC
LIMIT 1
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(key)
    }

    /// Delete up to `limit` keys in `[start, end)`; returns how many went.
    pub async fn kv_delete_range(&mut self, start: &[u8], end: &[u8], limit: usize) -> Result<u64> {
        let rows_affected = sqlx::query(
            r#"
DELETE FROM kv
WHERE key IN (
    SELECT key
    FROM kv
    WHERE key >= ? AND key < ?
    ORDER BY key ASC
    LIMIT ?
)
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(limit as i64)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();
        Ok(rows_affected)
    }

    pub async fn add_delete_range(&mut self, range: &DeleteRange) -> Result<()> {
        sqlx::query(
            r#"
INSERT INTO gc_delete_ranges (job_id, element_id, start_key, end_key)
VALUES (?, ?, ?, ?)
ON CONFLICT(job_id, element_id) DO NOTHING
            "#,
        )
        .bind(range.job_id)
        .bind(range.element_id)
        .bind(range.start_key.as_slice())
        .bind(range.end_key.as_slice())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn list_delete_ranges(&mut self, limit: usize) -> Result<Vec<DeleteRange>> {
        let rows = sqlx::query(
            r#"
SELECT job_id, element_id, start_key, end_key
FROM gc_delete_ranges
ORDER BY job_id ASC, element_id ASC
LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(DeleteRange::try_from_row).collect()
    }

    /// Record cleanup progress by moving the range start forward.
    pub async fn advance_delete_range(
        &mut self,
        range: &DeleteRange,
        start_key: &[u8],
    ) -> Result<()> {
        sqlx::query(
            r#"
UPDATE gc_delete_ranges SET start_key = ? WHERE job_id = ? AND element_id = ?
            "#,
        )
        .bind(start_key)
        .bind(range.job_id)
        .bind(range.element_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn remove_delete_range(&mut self, range: &DeleteRange) -> Result<()> {
        sqlx::query(
            r#"
DELETE FROM gc_delete_ranges WHERE job_id = ? AND element_id = ?
            "#,
        )
        .bind(range.job_id)
        .bind(range.element_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }
}
