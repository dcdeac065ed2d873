use super::MetaStore;
use crate::Result;
use crate::model::NodeVersion;

impl MetaStore {
    /// Register `node_id` (or refresh its registration) with the schema
    /// version it currently serves.
    pub async fn heartbeat_node(
        &self,
        node_id: &str,
        version: i64,
        lease_until: i64,
        now_ms: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
INSERT INTO schema_nodes (node_id, version, lease_until, updated_at)
VALUES (?, ?, ?, ?)
ON CONFLICT(node_id) DO UPDATE SET
    version = excluded.version,
    lease_until = excluded.lease_until,
    updated_at = excluded.updated_at
            "#,
        )
        .bind(node_id)
        .bind(version)
        .bind(lease_until)
        .bind(now_ms)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    pub async fn remove_node(&self, node_id: &str) -> Result<()> {
        sqlx::query(
            r#"
DELETE FROM schema_nodes WHERE node_id = ?
            "#,
        )
        .bind(node_id)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    /// Nodes whose registration has not expired at `now_ms`.
    pub async fn live_node_versions(&self, now_ms: i64) -> Result<Vec<NodeVersion>> {
        let rows = sqlx::query(
            r#"
SELECT node_id, version, lease_until
FROM schema_nodes
WHERE lease_until > ?
ORDER BY node_id ASC
            "#,
        )
        .bind(now_ms)
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.iter().map(NodeVersion::try_from_row).collect()
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeVersion>> {
        let rows = sqlx::query(
            r#"
SELECT node_id, version, lease_until
FROM schema_nodes
ORDER BY node_id ASC
            "#,
        )
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.iter().map(NodeVersion::try_from_row).collect()
    }

    /// Latest committed schema version.
    pub async fn global_schema_version(&self) -> Result<i64> {
        let value: i64 = sqlx::query_scalar(
            r#"
SELECT value FROM meta_counters WHERE name = 'schema_version'
            "#,
        )
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(value)
    }
}
