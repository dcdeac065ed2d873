use super::StepCtx;
use super::finish_rollback;
use super::load_table;
use super::table::resolve_columns;
use super::table_diff;
use super::unexpected_args;
use super::unexpected_state;
use crate::error::DdlError;
use crate::error::Result;
use crate::syncer::DiffTarget;
use tessel_meta::IndexInfo;
use tessel_meta::Job;
use tessel_meta::JobArgs;
use tessel_meta::JobState;
use tessel_meta::SchemaState;
use tessel_meta::TableInfo;
use tracing::info;

struct NewIndex {
    name: String,
    columns: Vec<String>,
    unique: bool,
    primary: bool,
}

pub(super) async fn forward(ctx: &mut StepCtx<'_>, job: &mut Job) -> Result<Option<DiffTarget>> {
    match job.args.clone() {
        JobArgs::AddIndex {
            name,
            columns,
            unique,
        } => {
            let request = NewIndex {
                name,
                columns,
                unique,
                primary: false,
            };
            add_index(ctx, job, request).await
        }
        JobArgs::AddPrimaryKey { name, columns } => {
            let request = NewIndex {
                name,
                columns,
                unique: true,
                primary: true,
            };
            add_index(ctx, job, request).await
        }
        JobArgs::DropIndex { .. } | JobArgs::DropPrimaryKey => drop_index(ctx, job).await,
        _ => Err(unexpected_args(job)),
    }
}

/// The index an index job builds or removes, once it exists.
pub(crate) fn target_index<'t>(table: &'t TableInfo, args: &JobArgs) -> Option<&'t IndexInfo> {
    match args {
        JobArgs::AddIndex { name, .. }
        | JobArgs::AddPrimaryKey { name, .. }
        | JobArgs::DropIndex { name } => table.find_index(name),
        JobArgs::DropPrimaryKey => table.primary_index(),
        _ => None,
    }
}

fn set_index_state(table: &mut TableInfo, index_id: i64, state: SchemaState) {
    if let Some(index) = table.indices.iter_mut().find(|index| index.id == index_id) {
        index.state = state;
    }
}

fn missing_index(job: &Job) -> DdlError {
    match &job.args {
        JobArgs::AddIndex { name, .. }
        | JobArgs::AddPrimaryKey { name, .. }
        | JobArgs::DropIndex { name } => DdlError::not_found("index", name.as_str()),
        _ => DdlError::not_found("primary key", job.table_id.to_string()),
    }
}

fn reorg_rows(ctx: &StepCtx<'_>, job: &Job) -> Result<i64> {
    ctx.reorg_rows.ok_or_else(|| {
        DdlError::Fatal(format!(
            "job {} left {} before its reorg finished",
            job.id,
            job.schema_state.as_str()
        ))
    })
}

/// `None -> DeleteOnly -> WriteOnly -> WriteReorganization -> Public`, with
/// the backfill running in between the last two.
async fn add_index(
    ctx: &mut StepCtx<'_>,
    job: &mut Job,
    request: NewIndex,
) -> Result<Option<DiffTarget>> {
    let mut table = load_table(ctx.txn, job).await?;
    if table.state != SchemaState::Public {
        return Err(DdlError::not_found("table", table.name));
    }
    if job.schema_state == SchemaState::None {
        if table.find_index(&request.name).is_some() {
            return Err(DdlError::duplicate("index", request.name));
        }
        if request.primary && table.primary_index().is_some() {
            return Err(DdlError::duplicate("primary key", table.name));
        }
        let columns = resolve_columns(&table, &request.columns)?;
        let id = ctx.txn.gen_global_id().await?;
        table.indices.push(IndexInfo {
            id,
            name: request.name,
            columns,
            unique: request.unique,
            primary: request.primary,
            state: SchemaState::DeleteOnly,
        });
        ctx.txn.update_table(&table).await?;
        job.schema_state = SchemaState::DeleteOnly;
        return Ok(Some(table_diff(job)));
    }

    let index = target_index(&table, &job.args)
        .cloned()
        .ok_or_else(|| missing_index(job))?;
    let next = match index.state {
        SchemaState::DeleteOnly => SchemaState::WriteOnly,
        SchemaState::WriteOnly => {
            job.reorg_started = true;
            SchemaState::WriteReorganization
        }
        SchemaState::WriteReorganization => {
            job.row_count = reorg_rows(ctx, job)?;
            if index.primary {
                for column in table
                    .columns
                    .iter_mut()
                    .filter(|column| index.columns.contains(&column.id))
                {
                    column.not_null = true;
                }
            }
            info!(
                job_id = job.id,
                index_id = index.id,
                rows = job.row_count,
                "index is public"
            );
            job.state = JobState::Done;
            SchemaState::Public
        }
        state => return Err(unexpected_state(job, state)),
    };
    set_index_state(&mut table, index.id, next);
    ctx.txn.update_table(&table).await?;
    job.schema_state = next;
    Ok(Some(table_diff(job)))
}

/// `Public -> WriteOnly -> DeleteOnly -> DeleteReorganization -> None`; the
/// entries are deleted by a reorg before the last step.
async fn drop_index(ctx: &mut StepCtx<'_>, job: &mut Job) -> Result<Option<DiffTarget>> {
    let mut table = load_table(ctx.txn, job).await?;
    let index = target_index(&table, &job.args)
        .cloned()
        .ok_or_else(|| missing_index(job))?;
    let next = match index.state {
        SchemaState::Public => SchemaState::WriteOnly,
        SchemaState::WriteOnly => SchemaState::DeleteOnly,
        SchemaState::DeleteOnly => {
            job.reorg_started = true;
            SchemaState::DeleteReorganization
        }
        SchemaState::DeleteReorganization => {
            job.row_count = reorg_rows(ctx, job)?;
            table.indices.retain(|existing| existing.id != index.id);
            ctx.txn.update_table(&table).await?;
            job.schema_state = SchemaState::None;
            job.state = JobState::Done;
            return Ok(Some(table_diff(job)));
        }
        state => return Err(unexpected_state(job, state)),
    };
    set_index_state(&mut table, index.id, next);
    ctx.txn.update_table(&table).await?;
    job.schema_state = next;
    Ok(Some(table_diff(job)))
}

/// Undo a partially built index: stop writes (`DeleteOnly`), delete its
/// entries (`DeleteReorganization`), then drop it.
pub(super) async fn rollback(ctx: &mut StepCtx<'_>, job: &mut Job) -> Result<Option<DiffTarget>> {
    let mut table = load_table(ctx.txn, job).await?;
    let Some(index) = target_index(&table, &job.args).cloned() else {
        finish_rollback(job);
        return Ok(None);
    };
    let next = match index.state {
        SchemaState::DeleteReorganization => {
            reorg_rows(ctx, job)?;
            table.indices.retain(|existing| existing.id != index.id);
            ctx.txn.update_table(&table).await?;
            info!(job_id = job.id, index_id = index.id, "removed partial index");
            job.schema_state = SchemaState::None;
            finish_rollback(job);
            return Ok(Some(table_diff(job)));
        }
        SchemaState::DeleteOnly => SchemaState::DeleteReorganization,
        _ => SchemaState::DeleteOnly,
    };
    set_index_state(&mut table, index.id, next);
    ctx.txn.update_table(&table).await?;
    job.schema_state = next;
    Ok(Some(table_diff(job)))
}
