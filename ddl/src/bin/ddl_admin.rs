use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use tessel_ddl::AdminCancelOutcome;
use tessel_ddl::cancel_job;
use tessel_meta::Job;
use tessel_meta::JobLookup;
use tessel_meta::JobQueue;
use tessel_meta::MetaStore;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tessel-ddl-admin")]
#[command(about = "Inspect and cancel DDL jobs in a meta database")]
struct Args {
    /// Path to the meta SQLite database.
    #[arg(long, env = "TESSEL_META_DB")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Pending jobs in dequeue order.
    Jobs {
        /// Only show one queue (`general` or `reorg`).
        #[arg(long)]
        queue: Option<String>,
    },
    /// Finished jobs, newest first.
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print one job as JSON.
    Show { job_id: i64 },
    /// Ask the owner to cancel a job at its next step.
    Cancel { job_id: i64 },
    /// Current owner lease.
    Owner,
    /// Registered nodes and the schema version each one serves.
    Nodes,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let store = MetaStore::open(&args.db)
        .await
        .with_context(|| format!("failed to open {}", args.db.display()))?;
    let result = run(&store, args.command).await;
    store.close().await;
    result
}

async fn run(store: &MetaStore, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Jobs { queue } => {
            let queue = queue
                .as_deref()
                .map(JobQueue::parse)
                .transpose()
                .context("failed to parse --queue")?;
            for job in store.list_queued_jobs(queue).await? {
                println!("{}", format_job(&job));
            }
        }
        Command::History { limit } => {
            for job in store.list_history_jobs(limit).await? {
                println!("{}", format_job(&job));
            }
        }
        Command::Show { job_id } => {
            let lookup = store
                .find_job(job_id)
                .await?
                .with_context(|| format!("job {job_id} not found"))?;
            let location = match lookup {
                JobLookup::Queued(_) => "queued",
                JobLookup::Finished(_) => "history",
            };
            println!("# {location}");
            println!("{}", serde_json::to_string_pretty(lookup.job())?);
        }
        Command::Cancel { job_id } => {
            let outcome = cancel_job(store, job_id).await?;
            let message = match outcome {
                AdminCancelOutcome::Requested => "cancel requested",
                AdminCancelOutcome::NotFound => "no such job",
                AdminCancelOutcome::AlreadyFinished => "job already finished",
                AdminCancelOutcome::NotCancellable => "job can no longer be cancelled",
            };
            println!("job {job_id}: {message}");
        }
        Command::Owner => match store.current_owner().await? {
            Some(lease) => println!(
                "{} epoch={} lease_until={}",
                lease.owner_id, lease.epoch, lease.lease_until
            ),
            None => println!("no owner"),
        },
        Command::Nodes => {
            let global = store.global_schema_version().await?;
            println!("schema version {global}");
            for node in store.list_nodes().await? {
                println!(
                    "{} version={} lease_until={}",
                    node.node_id, node.version, node.lease_until
                );
            }
        }
    }
    Ok(())
}

fn format_job(job: &Job) -> String {
    let error = job
        .error
        .as_ref()
        .map(|err| format!(" error={}", err.code))
        .unwrap_or_default();
    let cancel = if job.cancel_requested {
        " cancel_requested"
    } else {
        ""
    };
    format!(
        "{:>6} {:<16} {:<14} {:<22} schema={} table={} rows={}{error}{cancel}",
        job.id,
        job.action.as_str(),
        job.state.as_str(),
        job.schema_state.as_str(),
        job.schema_id,
        job.table_id,
        job.row_count,
    )
}
