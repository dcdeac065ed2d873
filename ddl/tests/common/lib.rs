#![expect(clippy::expect_used)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tessel_ddl::Ddl;
use tessel_ddl::DdlConfig;
use tessel_ddl::DdlHook;
use tessel_ddl::DdlOptions;
use tessel_meta::ColumnSpec;
use tessel_meta::ColumnType;
use tessel_meta::Datum;
use tessel_meta::IndexSpec;
use tessel_meta::Job;
use tessel_meta::JobArgs;
use tessel_meta::JobId;
use tessel_meta::MetaStore;
use tessel_meta::TableSpec;
use tessel_meta::tablecodec;
use tracing_subscriber::EnvFilter;

pub const DB: &str = "test";

/// Timings small enough for tests to observe lease expiry and schema sync
/// within a couple of seconds.
pub fn fast_config() -> DdlConfig {
    DdlConfig {
        owner_lease_ms: 600,
        schema_lease_ms: 1_000,
        schema_poll_interval_ms: 20,
        retry_intervals_ms: vec![10, 20, 50, 100],
        backfill_batch_size: 4,
        delete_range_batch_size: 4,
        schema_sync_timeout_ms: 3_000,
        reorg_wait_timeout_ms: 50,
        job_poll_interval_ms: 50,
        submit_batch_size: 8,
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Several DDL nodes sharing one meta database, each with its own pool.
pub struct TestCluster {
    _dir: TempDir,
    db_path: PathBuf,
    config: DdlConfig,
    nodes: Vec<Arc<Ddl>>,
}

impl TestCluster {
    pub async fn start(nodes: usize) -> anyhow::Result<Self> {
        Self::start_with_config(nodes, fast_config()).await
    }

    pub async fn start_with_config(nodes: usize, config: DdlConfig) -> anyhow::Result<Self> {
        init_tracing();
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("meta.sqlite");
        let mut cluster = Self {
            _dir: dir,
            db_path,
            config,
            nodes: Vec::new(),
        };
        for _ in 0..nodes {
            cluster.add_node().await?;
        }
        Ok(cluster)
    }

    /// Join a new, started node. Returns its index.
    pub async fn add_node(&mut self) -> anyhow::Result<usize> {
        let index = self.nodes.len();
        let store = MetaStore::open(&self.db_path).await?;
        let ddl = Ddl::new(
            store,
            self.config.clone(),
            DdlOptions::new(format!("node-{index}")),
        )
        .await?;
        ddl.start().await?;
        self.nodes.push(Arc::new(ddl));
        Ok(index)
    }

    pub fn node(&self, index: usize) -> &Arc<Ddl> {
        self.nodes.get(index).expect("node index in range")
    }

    pub fn nodes(&self) -> &[Arc<Ddl>] {
        &self.nodes
    }

    /// A store handle for assertions, independent of every node.
    pub async fn store(&self) -> MetaStore {
        MetaStore::open(&self.db_path).await.expect("open meta store")
    }

    /// Index of the node holding the owner lease, waiting for an election.
    pub async fn wait_for_owner(&self) -> usize {
        let mut found = None;
        wait_until(Duration::from_secs(5), || {
            found = self.nodes.iter().position(|node| node.is_owner());
            std::future::ready(found.is_some())
        })
        .await;
        found.expect("an owner was elected")
    }

    /// Any node other than `skip`.
    pub fn other_than(&self, skip: usize) -> usize {
        (0..self.nodes.len())
            .find(|index| *index != skip)
            .expect("cluster has another node")
    }

    /// Create the test database through `node`.
    pub async fn create_db(&self, node: usize) -> anyhow::Result<i64> {
        let job = Job::new(0, 0, JobArgs::CreateSchema {
            name: DB.to_string(),
        });
        let job = self.node(node).do_ddl_job(job).await?;
        self.wait_all_synced(job.binlog.as_ref().map_or(0, |info| info.schema_version))
            .await;
        Ok(job.schema_id)
    }

    /// Create `DB.name` through `node` and wait until every node sees it.
    pub async fn create_table(
        &self,
        node: usize,
        name: &str,
        columns: Vec<ColumnSpec>,
        indices: Vec<IndexSpec>,
    ) -> anyhow::Result<i64> {
        let ddl = self.node(node);
        let job = ddl.job_for_schema(DB, JobArgs::CreateTable {
            table: TableSpec {
                name: name.to_string(),
                columns,
                indices,
            },
        })?;
        let job = ddl.do_ddl_job(job).await?;
        self.wait_all_synced(job.binlog.as_ref().map_or(0, |info| info.schema_version))
            .await;
        Ok(job.table_id)
    }

    /// Wait until every started node's cache is at `version` or newer.
    pub async fn wait_all_synced(&self, version: i64) {
        wait_until(Duration::from_secs(5), || {
            std::future::ready(
                self.nodes
                    .iter()
                    .all(|node| node.schema_cache().version() >= version),
            )
        })
        .await;
    }

    /// Stop every node that is still running.
    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.stop().await.expect("stop node");
        }
    }
}

/// Poll `check` every 10ms until it holds, panicking after `timeout`.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(timeout, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached before timeout");
}

pub fn int_column(name: &str) -> ColumnSpec {
    ColumnSpec {
        name: name.to_string(),
        ty: ColumnType::Int,
        not_null: false,
        default: None,
    }
}

pub fn text_column(name: &str) -> ColumnSpec {
    ColumnSpec {
        name: name.to_string(),
        ty: ColumnType::Text,
        not_null: false,
        default: None,
    }
}

pub fn with_default(mut column: ColumnSpec, default: Datum) -> ColumnSpec {
    column.default = Some(default);
    column
}

pub fn primary_key(name: &str, columns: &[&str]) -> IndexSpec {
    IndexSpec {
        name: name.to_string(),
        columns: columns.iter().map(ToString::to_string).collect(),
        unique: true,
        primary: true,
    }
}

/// Records the most index entries `table_id` held after any reorg batch,
/// which shows how far a backfill got before it was rolled back.
pub struct IndexHighWater {
    store: MetaStore,
    table_id: i64,
    max_entries: AtomicI64,
}

impl IndexHighWater {
    pub fn new(store: MetaStore, table_id: i64) -> Self {
        Self {
            store,
            table_id,
            max_entries: AtomicI64::new(0),
        }
    }

    pub fn max_entries(&self) -> i64 {
        self.max_entries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DdlHook for IndexHighWater {
    async fn on_backfill_batch(&self, _job_id: JobId, _next_key: &[u8]) {
        let (start, end) = tablecodec::index_range(self.table_id);
        if let Ok(entries) = self.store.count_kv(&start, &end).await {
            self.max_entries.fetch_max(entries, Ordering::SeqCst);
        }
    }
}
