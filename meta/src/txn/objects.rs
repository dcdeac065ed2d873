use super::MetaTxn;
use crate::MetaError;
use crate::Result;
use crate::model::DbInfo;
use crate::model::TableInfo;
use crate::model::decode_info;
use crate::model::encode_info;
use sqlx::Row;

impl MetaTxn {
    pub async fn create_database(&mut self, db: &DbInfo) -> Result<()> {
        if self.database_by_name(&db.name).await?.is_some() {
            return Err(MetaError::Duplicate {
                what: "database",
                name: db.name.clone(),
            });
        }
        let info_json = encode_info("database", db)?;
        sqlx::query(
            r#"
INSERT INTO schemas (schema_id, name, info_json) VALUES (?, ?, ?)
            "#,
        )
        .bind(db.id)
        .bind(db.name.as_str())
        .bind(info_json)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn update_database(&mut self, db: &DbInfo) -> Result<()> {
        let info_json = encode_info("database", db)?;
        let rows_affected = sqlx::query(
            r#"
UPDATE schemas SET name = ?, info_json = ? WHERE schema_id = ?
            "#,
        )
        .bind(db.name.as_str())
        .bind(info_json)
        .bind(db.id)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();
        if rows_affected == 0 {
            return Err(MetaError::not_found("database", db.id));
        }
        Ok(())
    }

    pub async fn drop_database(&mut self, schema_id: i64) -> Result<()> {
        sqlx::query(
            r#"
DELETE FROM schemas WHERE schema_id = ?
            "#,
        )
        .bind(schema_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn get_database(&mut self, schema_id: i64) -> Result<Option<DbInfo>> {
        let json: Option<String> = sqlx::query_scalar(
            r#"
SELECT info_json FROM schemas WHERE schema_id = ?
            "#,
        )
        .bind(schema_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        json.map(|json| decode_info("database", schema_id, &json))
            .transpose()
    }

    pub async fn database_by_name(&mut self, name: &str) -> Result<Option<DbInfo>> {
        let row = sqlx::query(
            r#"
SELECT schema_id, info_json FROM schemas WHERE name = ? COLLATE NOCASE
            "#,
        )
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let schema_id: i64 = row.try_get("schema_id")?;
        let json: String = row.try_get("info_json")?;
        decode_info("database", schema_id, &json).map(Some)
    }

    pub async fn list_databases(&mut self) -> Result<Vec<DbInfo>> {
        let rows = sqlx::query(
            r#"
SELECT schema_id, info_json FROM schemas ORDER BY schema_id ASC
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter()
            .map(|row| {
                let schema_id: i64 = row.try_get("schema_id")?;
                let json: String = row.try_get("info_json")?;
                decode_info("database", schema_id, &json)
            })
            .collect()
    }

    pub async fn create_table(&mut self, table: &TableInfo) -> Result<()> {
        if self
            .table_by_name(table.schema_id, &table.name)
            .await?
            .is_some()
        {
            return Err(MetaError::Duplicate {
                what: "table",
                name: table.name.clone(),
            });
        }
        let info_json = encode_info("table", table)?;
        sqlx::query(
            r#"
INSERT INTO tables (table_id, schema_id, name, info_json) VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(table.id)
        .bind(table.schema_id)
        .bind(table.name.as_str())
        .bind(info_json)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn update_table(&mut self, table: &TableInfo) -> Result<()> {
        let info_json = encode_info("table", table)?;
        let rows_affected = sqlx::query(
            r#"
UPDATE tables SET schema_id = ?, name = ?, info_json = ? WHERE table_id = ?
            "#,
        )
        .bind(table.schema_id)
        .bind(table.name.as_str())
        .bind(info_json)
        .bind(table.id)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();
        if rows_affected == 0 {
            return Err(MetaError::not_found("table", table.id));
        }
        Ok(())
    }

    /// Remove the table definition and its auto-id allocator. Row data is
    /// left to the delete-range worker.
    pub async fn drop_table(&mut self, table_id: i64) -> Result<()> {
        sqlx::query(
            r#"
DELETE FROM tables WHERE table_id = ?
            "#,
        )
        .bind(table_id)
        .execute(&mut *self.tx)
        .await?;
        sqlx::query(
            r#"
DELETE FROM auto_ids WHERE table_id = ?
            "#,
        )
        .bind(table_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn get_table(&mut self, table_id: i64) -> Result<Option<TableInfo>> {
        let json: Option<String> = sqlx::query_scalar(
            r#"
SELECT info_json FROM tables WHERE table_id = ?
            "#,
        )
        .bind(table_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        json.map(|json| decode_info("table", table_id, &json))
            .transpose()
    }

    pub async fn table_by_name(&mut self, schema_id: i64, name: &str) -> Result<Option<TableInfo>> {
        let row = sqlx::query(
            r#"
SELECT table_id, info_json
FROM tables
WHERE schema_id = ? AND name = ? COLLATE NOCASE
            "#,
        )
        .bind(schema_id)
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let table_id: i64 = row.try_get("table_id")?;
        let json: String = row.try_get("info_json")?;
        decode_info("table", table_id, &json).map(Some)
    }

    pub async fn list_tables(&mut self, schema_id: Option<i64>) -> Result<Vec<TableInfo>> {
        let rows = sqlx::query(
            r#"
SELECT table_id, info_json
FROM tables
WHERE ? IS NULL OR schema_id = ?
ORDER BY table_id ASC
            "#,
        )
        .bind(schema_id)
        .bind(schema_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter()
            .map(|row| {
                let table_id: i64 = row.try_get("table_id")?;
                let json: String = row.try_get("info_json")?;
                decode_info("table", table_id, &json)
            })
            .collect()
    }
}
