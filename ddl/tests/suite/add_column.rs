#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use ddl_test_support::DB;
use ddl_test_support::TestCluster;
use ddl_test_support::int_column;
use ddl_test_support::with_default;
use pretty_assertions::assert_eq;
use tessel_ddl::DdlError;
use tessel_meta::Datum;
use tessel_meta::JobArgs;
use tessel_meta::JobState;
use tessel_meta::SchemaState;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn add_column_during_inserts_gives_every_row_a_value() -> anyhow::Result<()> {
    let cluster = TestCluster::start(2).await?;
    let owner = cluster.wait_for_owner().await;
    let writer = cluster.other_than(owner);
    cluster.create_db(owner).await?;
    cluster
        .create_table(owner, "t", vec![int_column("a")], Vec::new())
        .await?;

    let dml = cluster.node(writer).dml();
    for a in 0..10 {
        dml.insert(DB, "t", &[("a", Datum::Int(a))]).await?;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let inserter = tokio::spawn({
        let stop = Arc::clone(&stop);
        let dml = dml.clone();
        async move {
            let mut inserted = 0;
            let mut a = 100;
            while !stop.load(Ordering::SeqCst) {
                match dml.insert(DB, "t", &[("a", Datum::Int(a))]).await {
                    Ok(_) => inserted += 1,
                    Err(err) if err.is_retryable() => {}
                    Err(err) => return Err(err),
                }
                a += 1;
            }
            Ok::<usize, DdlError>(inserted)
        }
    });

    let ddl = cluster.node(writer);
    let job = ddl.job_for_table(DB, "t", JobArgs::AddColumn {
        column: with_default(int_column("b"), Datum::Int(7)),
    })?;
    let job = ddl.do_ddl_job(job).await?;
    stop.store(true, Ordering::SeqCst);
    let inserted = inserter.await??;

    assert_eq!(job.state, JobState::Done);
    assert_eq!(job.schema_state, SchemaState::Public);
    let binlog = job.binlog.expect("finished job carries binlog info");
    assert_eq!(binlog.schema_version, job.snapshot_ver);
    let table = binlog.table_info.expect("binlog carries the table");
    let column = table.find_column("b").expect("column b exists");
    assert_eq!(column.state, SchemaState::Public);
    assert_eq!(column.origin_default, Some(Datum::Int(7)));

    cluster.wait_all_synced(binlog.schema_version).await;
    for node in cluster.nodes() {
        let rows = node.dml().scan(DB, "t").await?;
        assert_eq!(rows.len(), 10 + inserted);
        for row in &rows {
            assert_eq!(row.value("b"), Some(&Datum::Int(7)), "row {}", row.handle);
        }
    }

    let handle = dml
        .insert(DB, "t", &[("a", Datum::Int(-1)), ("b", Datum::Int(9))])
        .await?;
    let row = dml.get(DB, "t", handle).await?.expect("row exists");
    assert_eq!(row.value("b"), Some(&Datum::Int(9)));

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_column_rolls_back_without_a_version_bump() -> anyhow::Result<()> {
    let cluster = TestCluster::start(1).await?;
    cluster.wait_for_owner().await;
    cluster.create_db(0).await?;
    cluster
        .create_table(0, "t", vec![int_column("a")], Vec::new())
        .await?;
    let store = cluster.store().await;
    let before = store.global_schema_version().await?;

    let ddl = cluster.node(0);
    let job = ddl.job_for_table(DB, "t", JobArgs::AddColumn {
        column: int_column("A"),
    })?;
    let err = ddl.do_ddl_job(job).await.expect_err("column already exists");
    let DdlError::JobFailed { state, error, .. } = err else {
        panic!("expected a failed job, got {err}");
    };
    assert_eq!(state, JobState::RollbackDone);
    assert_eq!(
        error.map(|error| error.code),
        Some("duplicate_object".to_string())
    );
    assert_eq!(store.global_schema_version().await?, before);

    cluster.shutdown().await;
    Ok(())
}
