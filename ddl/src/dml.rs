//! Row writes and reads against the cached schema.
//!
//! Every statement resolves its table through the node's schema cache and
//! maintains exactly the indexes its schema version says are writable or
//! deletable. A statement whose schema version fell two versions behind the
//! store aborts at commit with `SchemaOutdated`.

use crate::error::DdlError;
use crate::error::Result;
use crate::reorg::format_values;
use crate::reorg::index_values;
use crate::schema_cache::InfoSchema;
use crate::schema_cache::SchemaCache;
use std::collections::BTreeMap;
use std::sync::Arc;
use tessel_meta::ColumnInfo;
use tessel_meta::Datum;
use tessel_meta::MetaError;
use tessel_meta::MetaStore;
use tessel_meta::MetaTxn;
use tessel_meta::SchemaState;
use tessel_meta::TableInfo;
use tessel_meta::tablecodec;

const SCAN_PAGE: usize = 512;

type StoredRow = BTreeMap<i64, Datum>;

/// A row as seen through the public columns of one schema version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub handle: i64,
    pub values: Vec<(String, Datum)>,
}

impl Row {
    pub fn value(&self, column: &str) -> Option<&Datum> {
        self.values
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    }
}

#[derive(Clone)]
pub struct DmlSession {
    store: MetaStore,
    cache: Arc<SchemaCache>,
}

struct Statement {
    txn: MetaTxn,
    schema: Arc<InfoSchema>,
    table: Arc<TableInfo>,
}

impl DmlSession {
    pub(crate) fn new(store: MetaStore, cache: Arc<SchemaCache>) -> Self {
        Self { store, cache }
    }

    async fn begin(&self, db: &str, table: &str) -> Result<Statement> {
        let schema = self.cache.check_valid()?;
        let table_info = schema
            .database_by_name(db)
            .filter(|info| info.state == SchemaState::Public)
            .and_then(|_| schema.table_by_name(db, table))
            .filter(|info| info.state == SchemaState::Public)
            .ok_or_else(|| DdlError::not_found("table", format!("{db}.{table}")))?;
        let txn = self.store.begin().await?;
        Ok(Statement {
            txn,
            schema,
            table: table_info,
        })
    }

    /// Commit unless the store moved more than one version past the
    /// statement's schema.
    async fn commit(statement: Statement) -> Result<()> {
        let Statement {
            mut txn, schema, ..
        } = statement;
        let global = txn.schema_version().await?;
        if global > schema.version() + 1 {
            txn.rollback().await?;
            return Err(DdlError::SchemaOutdated {
                version: schema.version(),
            });
        }
        txn.commit().await?;
        Ok(())
    }

    /// Insert one row; omitted columns take their default. Returns the
    /// allocated handle.
    pub async fn insert(&self, db: &str, table: &str, values: &[(&str, Datum)]) -> Result<i64> {
        let mut statement = self.begin(db, table).await?;
        let table = Arc::clone(&statement.table);
        let mut row = StoredRow::new();
        assign(&table, &mut row, values)?;
        for column in table.writable_columns() {
            row.entry(column.id).or_insert_with(|| column.default_datum());
        }
        check_not_null(&table, &row)?;

        let handle = statement.txn.alloc_handles(table.id, 1).await?;
        write_indices(&mut statement.txn, &table, &row, handle).await?;
        put_row(&mut statement.txn, &table, &row, handle).await?;
        Self::commit(statement).await?;
        Ok(handle)
    }

    /// Overwrite the given columns of one row. Returns whether it existed.
    pub async fn update(
        &self,
        db: &str,
        table: &str,
        handle: i64,
        values: &[(&str, Datum)],
    ) -> Result<bool> {
        let mut statement = self.begin(db, table).await?;
        let table = Arc::clone(&statement.table);
        let Some(mut row) = load_row(&mut statement.txn, &table, handle).await? else {
            return Ok(false);
        };
        delete_indices(&mut statement.txn, &table, &row, handle).await?;
        assign(&table, &mut row, values)?;
        check_not_null(&table, &row)?;
        write_indices(&mut statement.txn, &table, &row, handle).await?;
        put_row(&mut statement.txn, &table, &row, handle).await?;
        Self::commit(statement).await?;
        Ok(true)
    }

    pub async fn delete(&self, db: &str, table: &str, handle: i64) -> Result<bool> {
        let mut statement = self.begin(db, table).await?;
        let table = Arc::clone(&statement.table);
        let Some(row) = load_row(&mut statement.txn, &table, handle).await? else {
            return Ok(false);
        };
        delete_indices(&mut statement.txn, &table, &row, handle).await?;
        statement
            .txn
            .kv_delete(&tablecodec::record_key(table.id, handle))
            .await?;
        Self::commit(statement).await?;
        Ok(true)
    }

    pub async fn get(&self, db: &str, table: &str, handle: i64) -> Result<Option<Row>> {
        let mut statement = self.begin(db, table).await?;
        let table = Arc::clone(&statement.table);
        let row = load_row(&mut statement.txn, &table, handle).await?;
        statement.txn.rollback().await?;
        Ok(row.map(|row| visible_row(&table, handle, &row)))
    }

    /// Every row in handle order.
    pub async fn scan(&self, db: &str, table: &str) -> Result<Vec<Row>> {
        let mut statement = self.begin(db, table).await?;
        let table = Arc::clone(&statement.table);
        let start = tablecodec::record_prefix(table.id);
        let end = tablecodec::prefix_end(&start);
        let mut rows = Vec::new();
        for (key, value) in scan_all(&mut statement.txn, start, &end).await? {
            let (_, handle) = tablecodec::decode_record_key(&key).map_err(MetaError::from)?;
            let stored = tablecodec::decode_row(&value).map_err(MetaError::from)?;
            rows.push(visible_row(&table, handle, &stored));
        }
        statement.txn.rollback().await?;
        Ok(rows)
    }

    /// Handles whose `index` entry matches `values` exactly. Only public
    /// indexes can be read.
    pub async fn index_lookup(
        &self,
        db: &str,
        table: &str,
        index: &str,
        values: &[Datum],
    ) -> Result<Vec<i64>> {
        let mut statement = self.begin(db, table).await?;
        let table = Arc::clone(&statement.table);
        let index = table
            .find_index(index)
            .filter(|info| info.state == SchemaState::Public)
            .ok_or_else(|| DdlError::not_found("index", index))?;
        if values.len() != index.columns.len() {
            return Err(DdlError::InvalidArgument(format!(
                "index `{}` has {} columns, got {} values",
                index.name,
                index.columns.len(),
                values.len()
            )));
        }
        let mut start = tablecodec::index_prefix(table.id, index.id);
        tablecodec::encode_datums(&mut start, values);
        let end = tablecodec::prefix_end(&start);
        let entries = scan_all(&mut statement.txn, start, &end).await?;
        statement.txn.rollback().await?;
        entries
            .iter()
            .map(|(key, value)| {
                tablecodec::index_entry_handle(key, value)
                    .map_err(|err| DdlError::Meta(MetaError::from(err)))
            })
            .collect()
    }
}

async fn scan_all(
    txn: &mut MetaTxn,
    mut start: Vec<u8>,
    end: &[u8],
) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut pairs = Vec::new();
    loop {
        let page = txn.kv_scan(&start, end, SCAN_PAGE).await?;
        let full = page.len() == SCAN_PAGE;
        if let Some((last, _)) = page.last() {
            start = tablecodec::key_next(last);
        }
        pairs.extend(page);
        if !full {
            return Ok(pairs);
        }
    }
}

fn public_column<'t>(table: &'t TableInfo, name: &str) -> Result<&'t ColumnInfo> {
    table
        .find_column(name)
        .filter(|column| column.state == SchemaState::Public)
        .ok_or_else(|| DdlError::not_found("column", name))
}

fn assign(table: &TableInfo, row: &mut StoredRow, values: &[(&str, Datum)]) -> Result<()> {
    for (name, value) in values {
        let column = public_column(table, name)?;
        if !value.fits(column.ty) {
            return Err(DdlError::InvalidArgument(format!(
                "{value} does not fit column `{}`",
                column.name
            )));
        }
        row.insert(column.id, value.clone());
    }
    Ok(())
}

fn check_not_null(table: &TableInfo, row: &StoredRow) -> Result<()> {
    for column in table.writable_columns().filter(|column| column.not_null) {
        if row.get(&column.id).is_none_or(Datum::is_null) {
            return Err(DdlError::InvalidNull {
                column: column.name.clone(),
            });
        }
    }
    Ok(())
}

/// Stored values plus the origin defaults of columns the row predates,
/// restricted to columns that still have storage.
async fn load_row(txn: &mut MetaTxn, table: &TableInfo, handle: i64) -> Result<Option<StoredRow>> {
    let Some(value) = txn.kv_get(&tablecodec::record_key(table.id, handle)).await? else {
        return Ok(None);
    };
    let mut row = tablecodec::decode_row(&value).map_err(MetaError::from)?;
    row.retain(|column_id, _| table.column_by_id(*column_id).is_some());
    for column in &table.columns {
        if column.state.is_writable() {
            row.entry(column.id)
                .or_insert_with(|| column.origin_default_datum());
        }
    }
    Ok(Some(row))
}

fn visible_row(table: &TableInfo, handle: i64, row: &StoredRow) -> Row {
    let values = table
        .public_columns()
        .map(|column| {
            let value = row
                .get(&column.id)
                .cloned()
                .unwrap_or_else(|| column.origin_default_datum());
            (column.name.clone(), value)
        })
        .collect();
    Row { handle, values }
}

async fn put_row(txn: &mut MetaTxn, table: &TableInfo, row: &StoredRow, handle: i64) -> Result<()> {
    let stored: StoredRow = row
        .iter()
        .filter(|(column_id, _)| {
            table
                .column_by_id(**column_id)
                .is_some_and(|column| column.state.is_writable())
        })
        .map(|(column_id, value)| (*column_id, value.clone()))
        .collect();
    let value = tablecodec::encode_row(&stored).map_err(MetaError::from)?;
    txn.kv_put(&tablecodec::record_key(table.id, handle), &value)
        .await?;
    Ok(())
}

async fn write_indices(
    txn: &mut MetaTxn,
    table: &TableInfo,
    row: &StoredRow,
    handle: i64,
) -> Result<()> {
    for index in table.writable_indices() {
        let values = index_values(table, index, row);
        if index.primary
            && let Some(position) = values.iter().position(Datum::is_null)
        {
            let column = index
                .columns
                .get(position)
                .and_then(|id| table.column_by_id(*id))
                .map(|column| column.name.clone())
                .unwrap_or_default();
            return Err(DdlError::InvalidNull { column });
        }
        let entry = tablecodec::index_entry(table.id, index, &values, handle);
        if entry.distinct
            && let Some(existing) = txn.kv_get(&entry.key).await?
        {
            let owner =
                tablecodec::index_entry_handle(&entry.key, &existing).map_err(MetaError::from)?;
            if owner != handle {
                return Err(DdlError::DuplicateKey {
                    index: index.name.clone(),
                    value: format_values(&values),
                });
            }
        }
        txn.kv_put(&entry.key, &entry.value).await?;
    }
    Ok(())
}

/// Remove the row's entries from every index that is at least delete-only.
/// A distinct entry is only removed while it still points at this row.
async fn delete_indices(
    txn: &mut MetaTxn,
    table: &TableInfo,
    row: &StoredRow,
    handle: i64,
) -> Result<()> {
    for index in table.deletable_indices() {
        let values = index_values(table, index, row);
        let entry = tablecodec::index_entry(table.id, index, &values, handle);
        if entry.distinct {
            let Some(existing) = txn.kv_get(&entry.key).await? else {
                continue;
            };
            let owner =
                tablecodec::index_entry_handle(&entry.key, &existing).map_err(MetaError::from)?;
            if owner == handle {
                txn.kv_delete(&entry.key).await?;
            }
        } else {
            txn.kv_delete(&entry.key).await?;
        }
    }
    Ok(())
}
