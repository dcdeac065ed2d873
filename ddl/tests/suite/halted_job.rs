#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use ddl_test_support::DB;
use ddl_test_support::TestCluster;
use ddl_test_support::int_column;
use pretty_assertions::assert_eq;
use tessel_ddl::DdlError;
use tessel_ddl::DdlHook;
use tessel_meta::ActionType;
use tessel_meta::Datum;
use tessel_meta::ErrorClass;
use tessel_meta::Job;
use tessel_meta::JobArgs;
use tessel_meta::JobLookup;
use tessel_meta::JobState;

#[derive(Default)]
struct UpdateCounter {
    updates: AtomicUsize,
}

#[async_trait]
impl DdlHook for UpdateCounter {
    async fn on_job_updated(&self, job: &Job) {
        if job.action == ActionType::RenameTable {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mismatched_job_halts_once_and_fails_its_waiter() -> anyhow::Result<()> {
    let cluster = TestCluster::start(1).await?;
    let owner = cluster.wait_for_owner().await;
    cluster.create_db(owner).await?;
    cluster
        .create_table(owner, "t", vec![int_column("a")], Vec::new())
        .await?;

    let hook = Arc::new(UpdateCounter::default());
    let ddl = cluster.node(owner);
    ddl.set_hook(hook.clone());

    // A rebase payload recorded under a rename action.
    let mut job = ddl.job_for_table(DB, "t", JobArgs::RebaseAutoId { new_base: 100 })?;
    job.action = ActionType::RenameTable;
    let store = cluster.store().await;
    let mut txn = store.begin().await?;
    job.id = txn.gen_global_id().await?;
    txn.enqueue_job(&job, 0).await?;
    txn.commit().await?;

    let err = tokio::time::timeout(Duration::from_secs(5), ddl.wait_job(job.id))
        .await?
        .expect_err("a halted job fails its waiter");
    let DdlError::JobFailed {
        job_id,
        state,
        error,
    } = err
    else {
        panic!("expected a failed job, got {err}");
    };
    assert_eq!(job_id, job.id);
    assert_eq!(state, JobState::Queued);
    let error = error.expect("halted job keeps its error");
    assert_eq!(error.class, ErrorClass::Fatal);
    assert_eq!(error.code, "fatal");
    assert!(error.message.contains("rename_table"), "{}", error.message);

    // The worker keeps revisiting the job but records the halt only once.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(hook.updates.load(Ordering::SeqCst), 1);

    let Some(JobLookup::Queued(queued)) = store.find_job(job.id).await? else {
        panic!("halted job stays queued");
    };
    assert_eq!(queued.state, JobState::Queued);
    assert_eq!(queued.error, Some(error));

    let handle = ddl
        .dml()
        .insert(DB, "t", &[("a", Datum::Int(1))])
        .await?;
    assert!(handle < 100, "auto id was rebased to {handle}");

    cluster.shutdown().await;
    Ok(())
}
