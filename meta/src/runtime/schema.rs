use super::MetaStore;
use crate::Result;
use crate::model::InfoSchemaSnapshot;
use crate::model::SchemaDelta;
use std::collections::HashMap;

impl MetaStore {
    /// Every database and table at one consistent version.
    pub async fn load_info_schema(&self) -> Result<InfoSchemaSnapshot> {
        let mut txn = self.begin_read().await?;
        let version = txn.schema_version().await?;
        let databases = txn.list_databases().await?;
        let tables = txn.list_tables(None).await?;
        txn.commit().await?;
        Ok(InfoSchemaSnapshot {
            version,
            databases,
            tables,
        })
    }

    /// Objects changed after `from_version`, or `None` when a diff in the
    /// range is missing and the caller must fall back to a full load.
    pub async fn load_schema_delta(&self, from_version: i64) -> Result<Option<SchemaDelta>> {
        let mut txn = self.begin_read().await?;
        let version = txn.schema_version().await?;
        let mut diffs = Vec::new();
        for diff_version in (from_version + 1)..=version {
            let Some(diff) = txn.get_schema_diff(diff_version).await? else {
                txn.commit().await?;
                return Ok(None);
            };
            diffs.push(diff);
        }

        let mut databases = HashMap::new();
        let mut tables = HashMap::new();
        for diff in &diffs {
            if diff.schema_id != 0 && !databases.contains_key(&diff.schema_id) {
                let db = txn.get_database(diff.schema_id).await?;
                databases.insert(diff.schema_id, db);
            }
            if diff.table_id != 0 && !tables.contains_key(&diff.table_id) {
                let table = txn.get_table(diff.table_id).await?;
                tables.insert(diff.table_id, table);
            }
        }
        txn.commit().await?;
        Ok(Some(SchemaDelta {
            version,
            diffs,
            databases,
            tables,
        }))
    }
}
