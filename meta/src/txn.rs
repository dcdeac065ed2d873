use crate::MetaError;
use crate::Result;
use crate::model::OwnerLease;
use sqlx::Sqlite;
use sqlx::Transaction;

mod data;
pub(crate) mod jobs;
mod objects;

const GLOBAL_ID_COUNTER: &str = "global_id";
const SCHEMA_VERSION_COUNTER: &str = "schema_version";

/// A single meta transaction: job queue, schema version, schema objects and
/// row data all commit or roll back together.
pub struct MetaTxn {
    tx: Transaction<'static, Sqlite>,
}

impl MetaTxn {
    pub(crate) fn new(tx: Transaction<'static, Sqlite>) -> Self {
        Self { tx }
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }

    /// Allocate `count` consecutive ids from the global id counter.
    pub async fn gen_global_ids(&mut self, count: usize) -> Result<Vec<i64>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let count = count as i64;
        let last = self.add_to_counter(GLOBAL_ID_COUNTER, count).await?;
        Ok(((last - count + 1)..=last).collect())
    }

    pub async fn gen_global_id(&mut self) -> Result<i64> {
        self.add_to_counter(GLOBAL_ID_COUNTER, 1).await
    }

    pub async fn schema_version(&mut self) -> Result<i64> {
        let value: i64 = sqlx::query_scalar(
            r#"
SELECT value FROM meta_counters WHERE name = ?
            "#,
        )
        .bind(SCHEMA_VERSION_COUNTER)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(value)
    }

    /// Increment the schema version by exactly one and return the new value.
    pub async fn bump_schema_version(&mut self) -> Result<i64> {
        self.add_to_counter(SCHEMA_VERSION_COUNTER, 1).await
    }

    async fn add_to_counter(&mut self, name: &str, delta: i64) -> Result<i64> {
        let value: i64 = sqlx::query_scalar(
            r#"
UPDATE meta_counters
SET value = value + ?
WHERE name = ?
RETURNING value
            "#,
        )
        .bind(delta)
        .bind(name)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(value)
    }

    /// Fail with `NotOwner` unless `node_id` holds a live lease under `token`.
    ///
    /// Every mutating job step calls this inside its own transaction, so a
    /// node that lost the lease between steps cannot commit.
    pub async fn ensure_owner(&mut self, node_id: &str, token: &str, now_ms: i64) -> Result<()> {
        let row = sqlx::query(
            r#"
SELECT owner_id, token, lease_until, epoch
FROM ddl_owner
WHERE id = 1
            "#,
        )
        .fetch_optional(&mut *self.tx)
        .await?;
        let lease = row.map(|row| OwnerLease::try_from_row(&row)).transpose()?;
        match lease {
            Some(lease)
                if lease.owner_id == node_id && lease.token == token && lease.is_live(now_ms) =>
            {
                Ok(())
            }
            _ => Err(MetaError::NotOwner {
                node_id: node_id.to_string(),
            }),
        }
    }
}
