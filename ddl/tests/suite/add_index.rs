#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use ddl_test_support::DB;
use ddl_test_support::IndexHighWater;
use ddl_test_support::TestCluster;
use ddl_test_support::int_column;
use ddl_test_support::text_column;
use pretty_assertions::assert_eq;
use tessel_ddl::DdlError;
use tessel_meta::Datum;
use tessel_meta::JobArgs;
use tessel_meta::JobState;
use tessel_meta::tablecodec;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_values_roll_back_a_unique_index() -> anyhow::Result<()> {
    let cluster = TestCluster::start(2).await?;
    let owner = cluster.wait_for_owner().await;
    cluster.create_db(owner).await?;
    let table_id = cluster
        .create_table(owner, "t", vec![int_column("a"), text_column("s")], Vec::new())
        .await?;

    let dml = cluster.node(owner).dml();
    for (a, s) in [(1, "x"), (2, "y"), (3, "z"), (2, "w"), (4, "v"), (5, "u")] {
        dml.insert(DB, "t", &[("a", Datum::Int(a)), ("s", Datum::Text(s.to_string()))])
            .await?;
    }

    let ddl = cluster.node(cluster.other_than(owner));
    let job = ddl.job_for_table(DB, "t", JobArgs::AddIndex {
        name: "uk_a".to_string(),
        columns: vec!["a".to_string()],
        unique: true,
    })?;
    let err = ddl.do_ddl_job(job).await.expect_err("duplicates must fail");
    let DdlError::JobFailed {
        job_id,
        state,
        error,
    } = err
    else {
        panic!("expected a failed job, got {err}");
    };
    assert_eq!(state, JobState::RollbackDone);
    let error = error.expect("job keeps its error");
    assert_eq!(error.code, "duplicate_key");
    assert!(error.message.contains("uk_a"), "{}", error.message);

    let store = cluster.store().await;
    let (start, end) = tablecodec::index_range(table_id);
    assert_eq!(store.count_kv(&start, &end).await?, 0);
    let finished = store.history_job(job_id).await?.expect("job in history");
    let table = finished
        .binlog
        .and_then(|binlog| binlog.table_info)
        .expect("binlog carries the table");
    assert_eq!(table.find_index("uk_a"), None);
    assert_eq!(store.list_queued_jobs(None).await?, Vec::new());

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn index_built_during_inserts_covers_every_row() -> anyhow::Result<()> {
    let cluster = TestCluster::start(2).await?;
    let owner = cluster.wait_for_owner().await;
    let writer = cluster.other_than(owner);
    cluster.create_db(owner).await?;
    let table_id = cluster
        .create_table(owner, "t", vec![int_column("a")], Vec::new())
        .await?;

    let dml = cluster.node(writer).dml();
    for a in 0..30 {
        dml.insert(DB, "t", &[("a", Datum::Int(a % 7))]).await?;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let inserter = tokio::spawn({
        let stop = Arc::clone(&stop);
        let dml = dml.clone();
        async move {
            let mut a = 0;
            while !stop.load(Ordering::SeqCst) {
                match dml.insert(DB, "t", &[("a", Datum::Int(a % 7))]).await {
                    Ok(_) => a += 1,
                    Err(err) if err.is_retryable() => {}
                    Err(err) => return Err(err),
                }
            }
            Ok::<(), DdlError>(())
        }
    });

    let ddl = cluster.node(writer);
    let job = ddl.job_for_table(DB, "t", JobArgs::AddIndex {
        name: "idx_a".to_string(),
        columns: vec!["a".to_string()],
        unique: false,
    })?;
    let job = ddl.do_ddl_job(job).await?;
    stop.store(true, Ordering::SeqCst);
    inserter.await??;
    assert_eq!(job.state, JobState::Done);

    let version = job.binlog.as_ref().map_or(0, |binlog| binlog.schema_version);
    cluster.wait_all_synced(version).await;
    let rows = dml.scan(DB, "t").await?;
    let mut indexed = 0;
    for value in 0..7 {
        let mut expected: Vec<i64> = rows
            .iter()
            .filter(|row| row.value("a") == Some(&Datum::Int(value)))
            .map(|row| row.handle)
            .collect();
        expected.sort_unstable();
        let mut found = dml
            .index_lookup(DB, "t", "idx_a", &[Datum::Int(value)])
            .await?;
        found.sort_unstable();
        indexed += found.len();
        assert_eq!(found, expected, "value {value}");
    }
    assert_eq!(indexed, rows.len());

    let store = cluster.store().await;
    let (start, end) = tablecodec::index_range(table_id);
    assert_eq!(store.count_kv(&start, &end).await?, rows.len() as i64);

    let job = ddl.job_for_table(DB, "t", JobArgs::DropIndex {
        name: "idx_a".to_string(),
    })?;
    ddl.do_ddl_job(job).await?;
    assert_eq!(store.count_kv(&start, &end).await?, 0);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_duplicate_removes_already_committed_batches() -> anyhow::Result<()> {
    let cluster = TestCluster::start(2).await?;
    let owner = cluster.wait_for_owner().await;
    cluster.create_db(owner).await?;
    let table_id = cluster
        .create_table(owner, "t", vec![int_column("a")], Vec::new())
        .await?;

    let dml = cluster.node(owner).dml();
    for a in 0..10 {
        dml.insert(DB, "t", &[("a", Datum::Int(a))]).await?;
    }
    dml.insert(DB, "t", &[("a", Datum::Int(1))]).await?;

    let store = cluster.store().await;
    let hook = Arc::new(IndexHighWater::new(store.clone(), table_id));
    for node in cluster.nodes() {
        node.set_hook(hook.clone());
    }

    let ddl = cluster.node(cluster.other_than(owner));
    let job = ddl.job_for_table(DB, "t", JobArgs::AddIndex {
        name: "uk_a".to_string(),
        columns: vec!["a".to_string()],
        unique: true,
    })?;
    let err = ddl.do_ddl_job(job).await.expect_err("late duplicate must fail");
    let DdlError::JobFailed { state, error, .. } = err else {
        panic!("expected a failed job, got {err}");
    };
    assert_eq!(state, JobState::RollbackDone);
    assert_eq!(error.expect("job keeps its error").code, "duplicate_key");

    assert!(hook.max_entries() >= 8, "{}", hook.max_entries());
    let (start, end) = tablecodec::index_range(table_id);
    assert_eq!(store.count_kv(&start, &end).await?, 0);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn undecodable_row_rolls_back_the_index() -> anyhow::Result<()> {
    let cluster = TestCluster::start(2).await?;
    let owner = cluster.wait_for_owner().await;
    cluster.create_db(owner).await?;
    let table_id = cluster
        .create_table(owner, "t", vec![int_column("a")], Vec::new())
        .await?;

    let dml = cluster.node(owner).dml();
    for a in 0..6 {
        dml.insert(DB, "t", &[("a", Datum::Int(a))]).await?;
    }
    let store = cluster.store().await;
    let mut txn = store.begin().await?;
    txn.kv_put(&tablecodec::record_key(table_id, 1_000), b"not a row")
        .await?;
    txn.commit().await?;

    let ddl = cluster.node(cluster.other_than(owner));
    let job = ddl.job_for_table(DB, "t", JobArgs::AddIndex {
        name: "idx_a".to_string(),
        columns: vec!["a".to_string()],
        unique: false,
    })?;
    let err = ddl.do_ddl_job(job).await.expect_err("poisoned row must fail");
    let DdlError::JobFailed { state, error, .. } = err else {
        panic!("expected a failed job, got {err}");
    };
    assert_eq!(state, JobState::RollbackDone);
    assert_eq!(error.expect("job keeps its error").code, "poisoned_row");

    let (start, end) = tablecodec::index_range(table_id);
    assert_eq!(store.count_kv(&start, &end).await?, 0);
    assert_eq!(store.list_queued_jobs(None).await?, Vec::new());

    cluster.shutdown().await;
    Ok(())
}
