#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

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
async fn null_key_column_rolls_back_after_partial_backfill() -> anyhow::Result<()> {
    let cluster = TestCluster::start(2).await?;
    let owner = cluster.wait_for_owner().await;
    cluster.create_db(owner).await?;
    let table_id = cluster
        .create_table(owner, "t", vec![int_column("id"), text_column("s")], Vec::new())
        .await?;

    let dml = cluster.node(owner).dml();
    for id in 0..10 {
        dml.insert(DB, "t", &[("id", Datum::Int(id))]).await?;
    }
    dml.insert(DB, "t", &[("s", Datum::Text("no id".to_string()))])
        .await?;

    let store = cluster.store().await;
    let hook = Arc::new(IndexHighWater::new(store.clone(), table_id));
    for node in cluster.nodes() {
        node.set_hook(hook.clone());
    }

    let ddl = cluster.node(cluster.other_than(owner));
    let job = ddl.job_for_table(DB, "t", JobArgs::AddPrimaryKey {
        name: "pk".to_string(),
        columns: vec!["id".to_string()],
    })?;
    let err = ddl.do_ddl_job(job).await.expect_err("a null key must fail");
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
    assert_eq!(error.code, "invalid_null");
    assert!(error.message.contains("id"), "{}", error.message);

    assert!(hook.max_entries() >= 8);
    let (start, end) = tablecodec::index_range(table_id);
    assert_eq!(store.count_kv(&start, &end).await?, 0);
    let finished = store.history_job(job_id).await?.expect("job in history");
    let table = finished
        .binlog
        .and_then(|binlog| binlog.table_info)
        .expect("binlog carries the table");
    assert_eq!(table.primary_index(), None);
    assert!(!table.find_column("id").expect("id column").not_null);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn primary_key_is_enforced_until_dropped() -> anyhow::Result<()> {
    let cluster = TestCluster::start(2).await?;
    let owner = cluster.wait_for_owner().await;
    cluster.create_db(owner).await?;
    let table_id = cluster
        .create_table(owner, "t", vec![int_column("id"), text_column("s")], Vec::new())
        .await?;

    let dml = cluster.node(owner).dml();
    for id in 0..10 {
        dml.insert(DB, "t", &[("id", Datum::Int(id))]).await?;
    }

    let ddl = cluster.node(cluster.other_than(owner));
    let job = ddl.job_for_table(DB, "t", JobArgs::AddPrimaryKey {
        name: "pk".to_string(),
        columns: vec!["id".to_string()],
    })?;
    let job = ddl.do_ddl_job(job).await?;
    assert_eq!(job.state, JobState::Done);
    assert_eq!(job.row_count, 10);
    let version = job.binlog.as_ref().map_or(0, |binlog| binlog.schema_version);
    cluster.wait_all_synced(version).await;

    let store = cluster.store().await;
    let (start, end) = tablecodec::index_range(table_id);
    assert_eq!(store.count_kv(&start, &end).await?, 10);
    let found = dml.index_lookup(DB, "t", "pk", &[Datum::Int(7)]).await?;
    assert_eq!(found.len(), 1);

    let err = dml
        .insert(DB, "t", &[("id", Datum::Int(3))])
        .await
        .expect_err("duplicate key");
    assert_eq!(err.code(), "duplicate_key");
    let err = dml
        .insert(DB, "t", &[("s", Datum::Text("no id".to_string()))])
        .await
        .expect_err("null key");
    assert_eq!(err.code(), "invalid_null");

    let job = ddl.job_for_table(DB, "t", JobArgs::DropPrimaryKey)?;
    let job = ddl.do_ddl_job(job).await?;
    assert_eq!(job.state, JobState::Done);
    let version = job.binlog.as_ref().map_or(0, |binlog| binlog.schema_version);
    cluster.wait_all_synced(version).await;
    assert_eq!(store.count_kv(&start, &end).await?, 0);

    dml.insert(DB, "t", &[("id", Datum::Int(3))]).await?;
    let threes = dml
        .scan(DB, "t")
        .await?
        .into_iter()
        .filter(|row| row.value("id") == Some(&Datum::Int(3)))
        .count();
    assert_eq!(threes, 2);

    cluster.shutdown().await;
    Ok(())
}
