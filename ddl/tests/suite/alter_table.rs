#![allow(clippy::expect_used, clippy::unwrap_used)]

use ddl_test_support::DB;
use ddl_test_support::TestCluster;
use ddl_test_support::int_column;
use ddl_test_support::with_default;
use pretty_assertions::assert_eq;
use tessel_ddl::DdlError;
use tessel_meta::Datum;
use tessel_meta::IndexSpec;
use tessel_meta::JobArgs;
use tessel_meta::JobState;

fn failed_code(err: DdlError) -> (JobState, String) {
    let DdlError::JobFailed { state, error, .. } = err else {
        panic!("expected a failed job, got {err}");
    };
    (state, error.expect("job keeps its error").code)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropped_column_disappears_from_reads_and_writes() -> anyhow::Result<()> {
    let cluster = TestCluster::start(2).await?;
    let owner = cluster.wait_for_owner().await;
    cluster.create_db(owner).await?;
    cluster
        .create_table(
            owner,
            "t",
            vec![int_column("a"), int_column("b"), int_column("c")],
            vec![IndexSpec {
                name: "idx_c".to_string(),
                columns: vec!["c".to_string()],
                unique: false,
                primary: false,
            }],
        )
        .await?;

    let dml = cluster.node(owner).dml();
    for a in 0..6 {
        dml.insert(DB, "t", &[
            ("a", Datum::Int(a)),
            ("b", Datum::Int(a * 10)),
            ("c", Datum::Int(a)),
        ])
        .await?;
    }

    let ddl = cluster.node(cluster.other_than(owner));
    let job = ddl.job_for_table(DB, "t", JobArgs::DropColumn {
        name: "c".to_string(),
    })?;
    let err = ddl.do_ddl_job(job).await.expect_err("indexed column");
    assert_eq!(
        failed_code(err),
        (JobState::RollbackDone, "invalid_argument".to_string())
    );

    let job = ddl.job_for_table(DB, "t", JobArgs::DropColumn {
        name: "b".to_string(),
    })?;
    let job = ddl.do_ddl_job(job).await?;
    assert_eq!(job.state, JobState::Done);
    let version = job.binlog.as_ref().map_or(0, |binlog| binlog.schema_version);
    cluster.wait_all_synced(version).await;

    let rows = dml.scan(DB, "t").await?;
    assert_eq!(rows.len(), 6);
    assert!(rows.iter().all(|row| row.value("b").is_none()));
    let err = dml
        .insert(DB, "t", &[("a", Datum::Int(9)), ("b", Datum::Int(1))])
        .await
        .expect_err("dropped column is gone");
    assert_eq!(err.code(), "not_found");

    // A new column under the old name does not see the old values.
    let job = ddl.job_for_table(DB, "t", JobArgs::AddColumn {
        column: with_default(int_column("b"), Datum::Int(5)),
    })?;
    let job = ddl.do_ddl_job(job).await?;
    let version = job.binlog.as_ref().map_or(0, |binlog| binlog.schema_version);
    cluster.wait_all_synced(version).await;
    let rows = dml.scan(DB, "t").await?;
    assert!(rows.iter().all(|row| row.value("b") == Some(&Datum::Int(5))));

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn renamed_table_keeps_its_rows() -> anyhow::Result<()> {
    let cluster = TestCluster::start(2).await?;
    let owner = cluster.wait_for_owner().await;
    cluster.create_db(owner).await?;
    let table_id = cluster
        .create_table(owner, "t", vec![int_column("a")], Vec::new())
        .await?;
    cluster
        .create_table(owner, "u", vec![int_column("a")], Vec::new())
        .await?;

    let dml = cluster.node(owner).dml();
    for a in 0..3 {
        dml.insert(DB, "t", &[("a", Datum::Int(a))]).await?;
    }

    let ddl = cluster.node(cluster.other_than(owner));
    let job = ddl.job_for_table(DB, "t", JobArgs::RenameTable {
        new_name: "u".to_string(),
    })?;
    let err = ddl.do_ddl_job(job).await.expect_err("name is taken");
    assert_eq!(
        failed_code(err),
        (JobState::RollbackDone, "duplicate_object".to_string())
    );

    let job = ddl.job_for_table(DB, "t", JobArgs::RenameTable {
        new_name: "t2".to_string(),
    })?;
    let job = ddl.do_ddl_job(job).await?;
    assert_eq!(job.state, JobState::Done);
    assert_eq!(job.table_id, table_id);
    let version = job.binlog.as_ref().map_or(0, |binlog| binlog.schema_version);
    cluster.wait_all_synced(version).await;

    let err = dml
        .insert(DB, "t", &[("a", Datum::Int(9))])
        .await
        .expect_err("old name is gone");
    assert_eq!(err.code(), "not_found");
    dml.insert(DB, "t2", &[("a", Datum::Int(3))]).await?;
    let mut values: Vec<Datum> = dml
        .scan(DB, "t2")
        .await?
        .iter()
        .filter_map(|row| row.value("a").cloned())
        .collect();
    values.sort();
    assert_eq!(values, (0..4).map(Datum::Int).collect::<Vec<_>>());

    cluster.shutdown().await;
    Ok(())
}
