#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use ddl_test_support::DB;
use ddl_test_support::TestCluster;
use ddl_test_support::int_column;
use ddl_test_support::wait_until;
use pretty_assertions::assert_eq;
use tessel_ddl::DdlHook;
use tessel_meta::Datum;
use tessel_meta::JobArgs;
use tessel_meta::JobId;
use tessel_meta::JobState;
use tessel_meta::tablecodec;
use tokio::sync::Notify;

/// Signals once the cluster has committed `trip_after` backfill batches.
struct BatchCounter {
    batches: AtomicUsize,
    trip_after: usize,
    tripped: Notify,
}

#[async_trait]
impl DdlHook for BatchCounter {
    async fn on_backfill_batch(&self, _job_id: JobId, _next_key: &[u8]) {
        if self.batches.fetch_add(1, Ordering::SeqCst) + 1 == self.trip_after {
            self.tripped.notify_one();
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backfill_resumes_on_the_next_owner() -> anyhow::Result<()> {
    let cluster = TestCluster::start(2).await?;
    let owner = cluster.wait_for_owner().await;
    let survivor = cluster.other_than(owner);
    cluster.create_db(owner).await?;
    let table_id = cluster
        .create_table(owner, "t", vec![int_column("a")], Vec::new())
        .await?;
    let dml = cluster.node(survivor).dml();
    let mut handles = Vec::new();
    for a in 0..60 {
        handles.push(dml.insert(DB, "t", &[("a", Datum::Int(a))]).await?);
    }

    let counter = Arc::new(BatchCounter {
        batches: AtomicUsize::new(0),
        trip_after: 3,
        tripped: Notify::new(),
    });
    for node in cluster.nodes() {
        node.set_hook(counter.clone());
    }

    let ddl = cluster.node(survivor);
    let job = ddl.job_for_table(DB, "t", JobArgs::AddIndex {
        name: "uk_a".to_string(),
        columns: vec!["a".to_string()],
        unique: true,
    })?;
    let job_id = ddl.submit_job(job).await?;
    counter.tripped.notified().await;
    cluster.node(owner).abort().await;

    let finished = ddl.wait_job(job_id).await?;
    assert_eq!(finished.state, JobState::Done);
    assert_eq!(finished.row_count, 60);
    assert_eq!(ddl.is_owner(), true);
    // 60 rows in batches of 4 take 15 batches; a restart from scratch would
    // need at least 18.
    assert!(
        counter.batches.load(Ordering::SeqCst) < 18,
        "backfill restarted instead of resuming"
    );

    let store = cluster.store().await;
    let (start, end) = tablecodec::index_range(table_id);
    assert_eq!(store.count_kv(&start, &end).await?, 60);
    let version = finished.binlog.map_or(0, |binlog| binlog.schema_version);
    wait_until(Duration::from_secs(5), || {
        std::future::ready(ddl.schema_cache().version() >= version)
    })
    .await;
    for (a, handle) in handles.iter().enumerate() {
        let found = dml
            .index_lookup(DB, "t", "uk_a", &[Datum::Int(a as i64)])
            .await?;
        assert_eq!(found, vec![*handle]);
    }

    ddl.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queue_order_survives_an_owner_handoff() -> anyhow::Result<()> {
    let cluster = TestCluster::start(2).await?;
    let owner = cluster.wait_for_owner().await;
    let survivor = cluster.other_than(owner);
    cluster.create_db(owner).await?;
    cluster
        .create_table(owner, "t", vec![int_column("a")], Vec::new())
        .await?;

    let ddl = cluster.node(survivor);
    let mut job_ids = Vec::new();
    for i in 0..6 {
        let job = ddl.job_for_table(DB, "t", JobArgs::AddColumn {
            column: int_column(&format!("c{i}")),
        })?;
        job_ids.push(ddl.submit_job(job).await?);
    }
    let mut sorted = job_ids.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, job_ids);

    let store = cluster.store().await;
    let second = job_ids[1];
    let store_ref = &store;
    wait_until(Duration::from_secs(10), move || async move {
        store_ref
            .history_job(second)
            .await
            .expect("history")
            .is_some()
    })
    .await;
    cluster.node(owner).abort().await;

    let mut finished_versions = Vec::new();
    for job_id in &job_ids {
        let job = ddl.wait_job(*job_id).await?;
        assert_eq!(job.state, JobState::Done, "job {job_id}");
        finished_versions.push(job.binlog.map_or(0, |binlog| binlog.schema_version));
    }
    assert!(
        finished_versions.windows(2).all(|pair| pair[0] < pair[1]),
        "jobs finished out of order: {finished_versions:?}"
    );

    let last = finished_versions.last().copied().unwrap_or_default();
    wait_until(Duration::from_secs(5), || {
        std::future::ready(ddl.schema_cache().version() >= last)
    })
    .await;
    let table = ddl
        .schema_cache()
        .snapshot()
        .table_by_name(DB, "t")
        .expect("table t");
    let names: Vec<&str> = table.columns.iter().map(|column| column.name.as_str()).collect();
    assert_eq!(names, vec!["a", "c0", "c1", "c2", "c3", "c4", "c5"]);
    assert_eq!(store.list_queued_jobs(None).await?, Vec::new());

    ddl.stop().await?;
    Ok(())
}
