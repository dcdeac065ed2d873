#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use async_trait::async_trait;
use ddl_test_support::DB;
use ddl_test_support::TestCluster;
use ddl_test_support::int_column;
use pretty_assertions::assert_eq;
use tessel_ddl::AdminCancelOutcome;
use tessel_ddl::DdlError;
use tessel_ddl::DdlHook;
use tessel_meta::ActionType;
use tessel_meta::Datum;
use tessel_meta::Job;
use tessel_meta::JobArgs;
use tessel_meta::JobState;
use tessel_meta::tablecodec;
use tokio::sync::Notify;
use tokio::sync::watch;

/// Holds add-index jobs before their first step until released.
struct GateHook {
    reached: Notify,
    open: watch::Receiver<bool>,
}

#[async_trait]
impl DdlHook for GateHook {
    async fn on_job_run_before(&self, job: &Job) {
        if job.action != ActionType::AddIndex || job.state != JobState::Queued {
            return;
        }
        self.reached.notify_one();
        let mut open = self.open.clone();
        let _ = open.wait_for(|open| *open).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_queued_add_index_never_bumps_the_version() -> anyhow::Result<()> {
    let cluster = TestCluster::start(2).await?;
    let owner = cluster.wait_for_owner().await;
    cluster.create_db(owner).await?;
    let table_id = cluster
        .create_table(owner, "t", vec![int_column("a")], Vec::new())
        .await?;
    let dml = cluster.node(owner).dml();
    for a in 0..5 {
        dml.insert(DB, "t", &[("a", Datum::Int(a))]).await?;
    }

    let (release, open) = watch::channel(false);
    let hook = Arc::new(GateHook {
        reached: Notify::new(),
        open,
    });
    for node in cluster.nodes() {
        node.set_hook(hook.clone());
    }
    let store = cluster.store().await;
    let before = store.global_schema_version().await?;

    let ddl = cluster.node(cluster.other_than(owner));
    let job = ddl.job_for_table(DB, "t", JobArgs::AddIndex {
        name: "idx_a".to_string(),
        columns: vec!["a".to_string()],
        unique: false,
    })?;
    let job_id = ddl.submit_job(job).await?;
    hook.reached.notified().await;

    assert_eq!(ddl.cancel_job(job_id).await?, AdminCancelOutcome::Requested);
    release.send_replace(true);

    let finished = ddl.wait_job(job_id).await?;
    assert_eq!(finished.state, JobState::Cancelled);
    assert_eq!(
        finished.error.map(|error| error.code),
        Some("cancelled".to_string())
    );
    assert_eq!(finished.snapshot_ver, 0);
    assert_eq!(store.global_schema_version().await?, before);
    let (start, end) = tablecodec::index_range(table_id);
    assert_eq!(store.count_kv(&start, &end).await?, 0);

    assert_eq!(
        ddl.cancel_job(job_id).await?,
        AdminCancelOutcome::AlreadyFinished
    );
    assert_eq!(ddl.cancel_job(job_id + 1_000).await?, AdminCancelOutcome::NotFound);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn do_ddl_job_reports_a_cancel_as_failure() -> anyhow::Result<()> {
    let cluster = TestCluster::start(1).await?;
    cluster.wait_for_owner().await;
    cluster.create_db(0).await?;
    cluster
        .create_table(0, "t", vec![int_column("a")], Vec::new())
        .await?;

    let (release, open) = watch::channel(false);
    let hook = Arc::new(GateHook {
        reached: Notify::new(),
        open,
    });
    let ddl = Arc::clone(cluster.node(0));
    ddl.set_hook(hook.clone());

    let job = ddl.job_for_table(DB, "t", JobArgs::AddIndex {
        name: "idx_a".to_string(),
        columns: vec!["a".to_string()],
        unique: true,
    })?;
    let waiter = tokio::spawn({
        let ddl = Arc::clone(&ddl);
        async move { ddl.do_ddl_job(job).await }
    });
    hook.reached.notified().await;
    let queued = cluster.store().await.list_queued_jobs(None).await?;
    let job_id = queued.first().map(|job| job.id).expect("job is queued");
    assert_eq!(ddl.cancel_job(job_id).await?, AdminCancelOutcome::Requested);
    release.send_replace(true);

    let err = waiter.await?.expect_err("cancelled job fails");
    assert!(
        matches!(
            err,
            DdlError::JobFailed {
                state: JobState::Cancelled,
                ..
            }
        ),
        "{err}"
    );

    cluster.shutdown().await;
    Ok(())
}
