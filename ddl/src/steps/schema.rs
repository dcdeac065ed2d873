use super::StepCtx;
use super::table_delete_range;
use super::unexpected_args;
use super::unexpected_state;
use crate::error::DdlError;
use crate::error::Result;
use crate::syncer::DiffTarget;
use tessel_meta::DbInfo;
use tessel_meta::Job;
use tessel_meta::JobArgs;
use tessel_meta::JobState;
use tessel_meta::SchemaState;
use tracing::info;

pub(super) async fn forward(ctx: &mut StepCtx<'_>, job: &mut Job) -> Result<Option<DiffTarget>> {
    match job.args.clone() {
        JobArgs::CreateSchema { name } => create_schema(ctx, job, name).await,
        JobArgs::DropSchema => drop_schema(ctx, job).await,
        _ => Err(unexpected_args(job)),
    }
}

fn schema_diff(job: &Job) -> DiffTarget {
    DiffTarget {
        schema_id: job.schema_id,
        table_id: 0,
        old_schema_id: None,
    }
}

async fn create_schema(
    ctx: &mut StepCtx<'_>,
    job: &mut Job,
    name: String,
) -> Result<Option<DiffTarget>> {
    if ctx.txn.database_by_name(&name).await?.is_some() {
        return Err(DdlError::duplicate("database", name));
    }
    ctx.txn
        .create_database(&DbInfo {
            id: job.schema_id,
            name,
            state: SchemaState::Public,
        })
        .await?;
    job.schema_state = SchemaState::Public;
    job.state = JobState::Done;
    Ok(Some(schema_diff(job)))
}

/// `Public -> WriteOnly -> DeleteOnly -> None`. The last step removes the
/// metadata and leaves the data to the delete-range worker.
async fn drop_schema(ctx: &mut StepCtx<'_>, job: &mut Job) -> Result<Option<DiffTarget>> {
    let mut db = ctx
        .txn
        .get_database(job.schema_id)
        .await?
        .ok_or_else(|| DdlError::not_found("database", job.schema_id.to_string()))?;
    match db.state {
        SchemaState::Public => {
            db.state = SchemaState::WriteOnly;
            ctx.txn.update_database(&db).await?;
        }
        SchemaState::WriteOnly => {
            db.state = SchemaState::DeleteOnly;
            ctx.txn.update_database(&db).await?;
        }
        SchemaState::DeleteOnly => {
            let tables = ctx.txn.list_tables(Some(db.id)).await?;
            for table in &tables {
                ctx.txn.drop_table(table.id).await?;
                ctx.txn
                    .add_delete_range(&table_delete_range(job, table.id))
                    .await?;
            }
            ctx.txn.drop_database(db.id).await?;
            info!(
                job_id = job.id,
                schema_id = db.id,
                tables = tables.len(),
                "dropped database"
            );
            db.state = SchemaState::None;
            job.state = JobState::Done;
        }
        state => return Err(unexpected_state(job, state)),
    }
    job.schema_state = db.state;
    Ok(Some(schema_diff(job)))
}
