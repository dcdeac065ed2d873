use super::StepCtx;
use super::finish_rollback;
use super::load_table;
use super::table_diff;
use super::unexpected_args;
use super::unexpected_state;
use crate::error::DdlError;
use crate::error::Result;
use crate::syncer::DiffTarget;
use tessel_meta::ColumnInfo;
use tessel_meta::ColumnSpec;
use tessel_meta::Datum;
use tessel_meta::Job;
use tessel_meta::JobArgs;
use tessel_meta::JobState;
use tessel_meta::SchemaState;
use tessel_meta::TableInfo;

pub(super) async fn forward(ctx: &mut StepCtx<'_>, job: &mut Job) -> Result<Option<DiffTarget>> {
    match job.args.clone() {
        JobArgs::AddColumn { column } => add_column(ctx, job, column).await,
        JobArgs::DropColumn { name } => drop_column(ctx, job, name).await,
        _ => Err(unexpected_args(job)),
    }
}

pub(super) fn check_column_spec(spec: &ColumnSpec) -> Result<()> {
    if spec.name.is_empty() {
        return Err(DdlError::InvalidArgument(
            "column name must not be empty".to_string(),
        ));
    }
    match &spec.default {
        Some(default) if !default.fits(spec.ty) => Err(DdlError::InvalidArgument(format!(
            "default {default} does not fit column `{}`",
            spec.name
        ))),
        Some(Datum::Null) if spec.not_null => Err(DdlError::InvalidArgument(format!(
            "not null column `{}` cannot default to NULL",
            spec.name
        ))),
        _ => Ok(()),
    }
}

/// Rows stored before the column existed read `default` through
/// `origin_default`.
pub(super) fn column_info(
    id: i64,
    offset: usize,
    spec: &ColumnSpec,
    state: SchemaState,
) -> ColumnInfo {
    ColumnInfo {
        id,
        name: spec.name.clone(),
        offset,
        ty: spec.ty,
        not_null: spec.not_null,
        default: spec.default.clone(),
        origin_default: spec.default.clone(),
        state,
    }
}

fn column_mut<'t>(table: &'t mut TableInfo, name: &str) -> Result<&'t mut ColumnInfo> {
    table
        .columns
        .iter_mut()
        .find(|column| column.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| DdlError::not_found("column", name))
}

/// `None -> DeleteOnly -> WriteOnly -> WriteReorganization -> Public`.
async fn add_column(
    ctx: &mut StepCtx<'_>,
    job: &mut Job,
    spec: ColumnSpec,
) -> Result<Option<DiffTarget>> {
    let mut table = load_table(ctx.txn, job).await?;
    if table.state != SchemaState::Public {
        return Err(DdlError::not_found("table", table.name));
    }
    let next = match job.schema_state {
        SchemaState::None => {
            if table.find_column(&spec.name).is_some() {
                return Err(DdlError::duplicate("column", spec.name));
            }
            check_column_spec(&spec)?;
            if spec.not_null && spec.default.is_none() {
                // Existing rows need a value to read.
                return Err(DdlError::InvalidArgument(format!(
                    "added not null column `{}` needs a default",
                    spec.name
                )));
            }
            let id = ctx.txn.gen_global_id().await?;
            let offset = table.columns.len();
            table
                .columns
                .push(column_info(id, offset, &spec, SchemaState::DeleteOnly));
            SchemaState::DeleteOnly
        }
        SchemaState::DeleteOnly => SchemaState::WriteOnly,
        SchemaState::WriteOnly => SchemaState::WriteReorganization,
        SchemaState::WriteReorganization => {
            job.state = JobState::Done;
            SchemaState::Public
        }
        state => return Err(unexpected_state(job, state)),
    };
    column_mut(&mut table, &spec.name)?.state = next;
    ctx.txn.update_table(&table).await?;
    job.schema_state = next;
    Ok(Some(table_diff(job)))
}

/// `Public -> WriteOnly -> DeleteOnly -> DeleteReorganization -> None`.
async fn drop_column(
    ctx: &mut StepCtx<'_>,
    job: &mut Job,
    name: String,
) -> Result<Option<DiffTarget>> {
    let mut table = load_table(ctx.txn, job).await?;
    let column = table
        .find_column(&name)
        .ok_or_else(|| DdlError::not_found("column", name.as_str()))?
        .clone();
    let next = match column.state {
        SchemaState::Public => {
            if table
                .indices
                .iter()
                .any(|index| index.columns.contains(&column.id))
            {
                return Err(DdlError::InvalidArgument(format!(
                    "column `{name}` is covered by an index"
                )));
            }
            if table.public_columns().count() <= 1 {
                return Err(DdlError::InvalidArgument(format!(
                    "cannot drop `{name}`, the last column of `{}`",
                    table.name
                )));
            }
            SchemaState::WriteOnly
        }
        SchemaState::WriteOnly => SchemaState::DeleteOnly,
        SchemaState::DeleteOnly => SchemaState::DeleteReorganization,
        SchemaState::DeleteReorganization => {
            table.columns.retain(|existing| existing.id != column.id);
            table.reindex_columns();
            ctx.txn.update_table(&table).await?;
            job.schema_state = SchemaState::None;
            job.state = JobState::Done;
            return Ok(Some(table_diff(job)));
        }
        state => return Err(unexpected_state(job, state)),
    };
    column_mut(&mut table, &name)?.state = next;
    ctx.txn.update_table(&table).await?;
    job.schema_state = next;
    Ok(Some(table_diff(job)))
}

/// Hide the half-added column again, then remove it.
pub(super) async fn rollback(ctx: &mut StepCtx<'_>, job: &mut Job) -> Result<Option<DiffTarget>> {
    let JobArgs::AddColumn { column: spec } = job.args.clone() else {
        return Err(unexpected_args(job));
    };
    let mut table = load_table(ctx.txn, job).await?;
    let Some(column) = table.find_column(&spec.name).cloned() else {
        finish_rollback(job);
        return Ok(None);
    };
    if column.state == SchemaState::DeleteOnly {
        table.columns.retain(|existing| existing.id != column.id);
        table.reindex_columns();
        ctx.txn.update_table(&table).await?;
        job.schema_state = SchemaState::None;
        finish_rollback(job);
    } else {
        column_mut(&mut table, &spec.name)?.state = SchemaState::DeleteOnly;
        ctx.txn.update_table(&table).await?;
        job.schema_state = SchemaState::DeleteOnly;
    }
    Ok(Some(table_diff(job)))
}
