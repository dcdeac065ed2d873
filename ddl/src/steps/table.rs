use super::StepCtx;
use super::column::check_column_spec;
use super::column::column_info;
use super::load_table;
use super::table_delete_range;
use super::table_diff;
use super::unexpected_args;
use super::unexpected_state;
use crate::error::DdlError;
use crate::error::Result;
use crate::syncer::DiffTarget;
use std::collections::HashSet;
use tessel_meta::IndexInfo;
use tessel_meta::Job;
use tessel_meta::JobArgs;
use tessel_meta::JobState;
use tessel_meta::SchemaState;
use tessel_meta::TableInfo;
use tessel_meta::TableSpec;
use tracing::info;

pub(super) async fn forward(ctx: &mut StepCtx<'_>, job: &mut Job) -> Result<Option<DiffTarget>> {
    match job.args.clone() {
        JobArgs::CreateTable { table } => create_table(ctx, job, table).await,
        JobArgs::DropTable => drop_table(ctx, job).await,
        JobArgs::RenameTable { new_name } => rename_table(ctx, job, new_name).await,
        JobArgs::RebaseAutoId { new_base } => rebase_auto_id(ctx, job, new_base).await,
        _ => Err(unexpected_args(job)),
    }
}

/// Column ids for `names`, in order.
pub(super) fn resolve_columns(table: &TableInfo, names: &[String]) -> Result<Vec<i64>> {
    let mut ids = Vec::with_capacity(names.len());
    for name in names {
        let column = table
            .find_column(name)
            .filter(|column| column.state == SchemaState::Public)
            .ok_or_else(|| DdlError::not_found("column", name.as_str()))?;
        if ids.contains(&column.id) {
            return Err(DdlError::InvalidArgument(format!(
                "column `{name}` appears twice in one index"
            )));
        }
        ids.push(column.id);
    }
    Ok(ids)
}

async fn create_table(
    ctx: &mut StepCtx<'_>,
    job: &mut Job,
    spec: TableSpec,
) -> Result<Option<DiffTarget>> {
    match ctx.txn.get_database(job.schema_id).await? {
        Some(db) if db.state == SchemaState::Public => {}
        _ => return Err(DdlError::not_found("database", job.schema_id.to_string())),
    }
    if ctx
        .txn
        .table_by_name(job.schema_id, &spec.name)
        .await?
        .is_some()
    {
        return Err(DdlError::duplicate("table", spec.name));
    }

    let column_ids = ctx.txn.gen_global_ids(spec.columns.len()).await?;
    let mut table = TableInfo {
        id: job.table_id,
        schema_id: job.schema_id,
        name: spec.name.clone(),
        columns: Vec::with_capacity(spec.columns.len()),
        indices: Vec::with_capacity(spec.indices.len()),
        state: SchemaState::Public,
    };
    for (offset, (column, id)) in spec.columns.iter().zip(column_ids).enumerate() {
        check_column_spec(column)?;
        table
            .columns
            .push(column_info(id, offset, column, SchemaState::Public));
    }

    let mut index_names = HashSet::new();
    for index in &spec.indices {
        if !index_names.insert(index.name.to_ascii_lowercase()) {
            return Err(DdlError::duplicate("index", index.name.as_str()));
        }
        if index.primary && table.primary_index().is_some() {
            return Err(DdlError::duplicate("primary key", spec.name.as_str()));
        }
        if index.columns.is_empty() {
            return Err(DdlError::InvalidArgument(format!(
                "index `{}` has no columns",
                index.name
            )));
        }
        let columns = resolve_columns(&table, &index.columns)?;
        if index.primary {
            for column in table
                .columns
                .iter_mut()
                .filter(|column| columns.contains(&column.id))
            {
                column.not_null = true;
            }
        }
        let id = ctx.txn.gen_global_id().await?;
        table.indices.push(IndexInfo {
            id,
            name: index.name.clone(),
            columns,
            unique: index.unique || index.primary,
            primary: index.primary,
            state: SchemaState::Public,
        });
    }

    ctx.txn.create_table(&table).await?;
    info!(job_id = job.id, table_id = table.id, name = %table.name, "created table");
    job.schema_state = SchemaState::Public;
    job.state = JobState::Done;
    Ok(Some(table_diff(job)))
}

/// `Public -> WriteOnly -> DeleteOnly -> None`, then the rows and index
/// entries are queued for the delete-range worker.
async fn drop_table(ctx: &mut StepCtx<'_>, job: &mut Job) -> Result<Option<DiffTarget>> {
    let mut table = load_table(ctx.txn, job).await?;
    match table.state {
        SchemaState::Public => {
            table.state = SchemaState::WriteOnly;
            ctx.txn.update_table(&table).await?;
        }
        SchemaState::WriteOnly => {
            table.state = SchemaState::DeleteOnly;
            ctx.txn.update_table(&table).await?;
        }
        SchemaState::DeleteOnly => {
            ctx.txn.drop_table(table.id).await?;
            ctx.txn
                .add_delete_range(&table_delete_range(job, table.id))
                .await?;
            info!(job_id = job.id, table_id = table.id, "dropped table");
            table.state = SchemaState::None;
            job.state = JobState::Done;
        }
        state => return Err(unexpected_state(job, state)),
    }
    job.schema_state = table.state;
    Ok(Some(table_diff(job)))
}

async fn rename_table(
    ctx: &mut StepCtx<'_>,
    job: &mut Job,
    new_name: String,
) -> Result<Option<DiffTarget>> {
    let mut table = load_table(ctx.txn, job).await?;
    if let Some(existing) = ctx.txn.table_by_name(job.schema_id, &new_name).await?
        && existing.id != table.id
    {
        return Err(DdlError::duplicate("table", new_name));
    }
    table.name = new_name;
    ctx.txn.update_table(&table).await?;
    job.schema_state = SchemaState::Public;
    job.state = JobState::Done;
    Ok(Some(DiffTarget {
        old_schema_id: Some(job.schema_id),
        ..table_diff(job)
    }))
}

async fn rebase_auto_id(
    ctx: &mut StepCtx<'_>,
    job: &mut Job,
    new_base: i64,
) -> Result<Option<DiffTarget>> {
    let table = load_table(ctx.txn, job).await?;
    let base = ctx.txn.rebase_auto_id(table.id, new_base).await?;
    if base != new_base {
        info!(
            job_id = job.id,
            table_id = table.id,
            base,
            new_base,
            "auto id base already past requested base"
        );
    }
    job.schema_state = SchemaState::Public;
    job.state = JobState::Done;
    Ok(Some(table_diff(job)))
}
