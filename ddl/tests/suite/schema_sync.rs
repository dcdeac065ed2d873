#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use ddl_test_support::DB;
use ddl_test_support::TestCluster;
use ddl_test_support::int_column;
use pretty_assertions::assert_eq;
use tessel_ddl::DdlError;
use tessel_meta::Datum;
use tessel_meta::JobArgs;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn live_versions_never_span_more_than_two() -> anyhow::Result<()> {
    let cluster = Arc::new(TestCluster::start(3).await?);
    let owner = cluster.wait_for_owner().await;
    cluster.create_db(owner).await?;
    cluster
        .create_table(owner, "t", vec![int_column("a")], Vec::new())
        .await?;
    let dml = cluster.node(owner).dml();
    for a in 0..12 {
        dml.insert(DB, "t", &[("a", Datum::Int(a))]).await?;
    }
    let store = cluster.store().await;
    let before = store.global_schema_version().await?;

    let stop = Arc::new(AtomicBool::new(false));
    let sampler = tokio::spawn({
        let cluster = Arc::clone(&cluster);
        let stop = Arc::clone(&stop);
        async move {
            let mut widest = 0;
            while !stop.load(Ordering::SeqCst) {
                let versions: Vec<i64> = cluster
                    .nodes()
                    .iter()
                    .map(|node| node.schema_cache().version())
                    .collect();
                let min = versions.iter().copied().min().unwrap_or_default();
                let max = versions.iter().copied().max().unwrap_or_default();
                widest = widest.max(max - min);
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            widest
        }
    });

    let ddl = cluster.node(cluster.other_than(owner));
    let job = ddl.job_for_table(DB, "t", JobArgs::AddIndex {
        name: "idx_a".to_string(),
        columns: vec!["a".to_string()],
        unique: false,
    })?;
    let add_index = ddl.do_ddl_job(job).await?;
    let job = ddl.job_for_table(DB, "t", JobArgs::AddColumn {
        column: int_column("b"),
    })?;
    let add_column = ddl.do_ddl_job(job).await?;
    stop.store(true, Ordering::SeqCst);
    let widest = sampler.await?;

    assert!(widest <= 1, "nodes were {widest} versions apart");
    // Each job publishes one version per state it moves through.
    let after = store.global_schema_version().await?;
    assert_eq!(after - before, 8);
    assert_eq!(add_index.snapshot_ver, before + 4);
    assert_eq!(add_column.snapshot_ver, after);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn node_that_stops_reloading_refuses_statements() -> anyhow::Result<()> {
    let cluster = TestCluster::start(2).await?;
    let owner = cluster.wait_for_owner().await;
    let stale = cluster.other_than(owner);
    cluster.create_db(owner).await?;
    cluster
        .create_table(owner, "t", vec![int_column("a")], Vec::new())
        .await?;

    let stale_dml = cluster.node(stale).dml();
    stale_dml.insert(DB, "t", &[("a", Datum::Int(1))]).await?;
    cluster.node(stale).abort().await;
    tokio::time::sleep(Duration::from_millis(
        cluster.node(stale).config().schema_lease_ms + 100,
    ))
    .await;

    let err = stale_dml
        .insert(DB, "t", &[("a", Datum::Int(2))])
        .await
        .expect_err("cache is past its lease");
    assert!(matches!(err, DdlError::SchemaOutdated { .. }), "{err}");

    // The owner no longer waits for the silent node.
    let ddl = cluster.node(owner);
    let job = ddl.job_for_table(DB, "t", JobArgs::AddColumn {
        column: int_column("b"),
    })?;
    ddl.do_ddl_job(job).await?;

    ddl.stop().await?;
    Ok(())
}
