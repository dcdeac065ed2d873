#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use ddl_test_support::DB;
use ddl_test_support::TestCluster;
use ddl_test_support::int_column;
use ddl_test_support::wait_until;
use pretty_assertions::assert_eq;
use tessel_ddl::DdlError;
use tessel_meta::Datum;
use tessel_meta::JobArgs;
use tessel_meta::JobState;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stopped_node_hands_over_and_rejoins() -> anyhow::Result<()> {
    let cluster = TestCluster::start(2).await?;
    let owner = cluster.wait_for_owner().await;
    let other = cluster.other_than(owner);
    cluster.create_db(owner).await?;
    cluster
        .create_table(owner, "t", vec![int_column("a")], Vec::new())
        .await?;

    let stopped = cluster.node(owner);
    stopped.stop().await?;
    assert_eq!(stopped.is_owner(), false);
    let job = stopped.job_for_table(DB, "t", JobArgs::RebaseAutoId { new_base: 100 })?;
    let err = stopped.submit_job(job).await.expect_err("stopped node");
    assert!(matches!(err, DdlError::Stopped), "{err}");

    // Resigning frees the lease, so the other node takes over right away.
    let ddl = cluster.node(other);
    wait_until(Duration::from_secs(5), || std::future::ready(ddl.is_owner())).await;
    let job = ddl.job_for_table(DB, "t", JobArgs::RebaseAutoId { new_base: 100 })?;
    let job = ddl.do_ddl_job(job).await?;
    assert_eq!(job.state, JobState::Done);
    let version = job.binlog.map_or(0, |binlog| binlog.schema_version);

    stopped.start().await?;
    wait_until(Duration::from_secs(5), || {
        std::future::ready(stopped.schema_cache().version() >= version)
    })
    .await;
    let handle = stopped
        .dml()
        .insert(DB, "t", &[("a", Datum::Int(1))])
        .await?;
    assert!(handle > 100, "handle {handle} must follow the rebased base");

    let job = stopped.job_for_table(DB, "t", JobArgs::RebaseAutoId { new_base: 10 })?;
    stopped.do_ddl_job(job).await?;
    let next = stopped
        .dml()
        .insert(DB, "t", &[("a", Datum::Int(2))])
        .await?;
    assert!(next > handle, "rebasing lower must not move the base back");

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_resumes_after_restart() -> anyhow::Result<()> {
    let cluster = TestCluster::start(1).await?;
    cluster.wait_for_owner().await;
    cluster.create_db(0).await?;
    let ddl = cluster.node(0);

    ddl.stop().await?;
    ddl.start().await?;
    cluster.wait_for_owner().await;

    let job = ddl.job_for_schema(DB, JobArgs::CreateTable {
        table: tessel_meta::TableSpec {
            name: "t".to_string(),
            columns: vec![int_column("a")],
            indices: Vec::new(),
        },
    })?;
    let job = ddl.do_ddl_job(job).await?;
    assert_eq!(job.state, JobState::Done);
    let table = job
        .binlog
        .and_then(|binlog| binlog.table_info)
        .expect("binlog carries the new table");
    assert_eq!(table.name, "t");

    cluster.shutdown().await;
    Ok(())
}
