use crate::clock::Clock;
use crate::error::DdlError;
use crate::error::Result;
use crate::hook::HookSlot;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tessel_meta::DbInfo;
use tessel_meta::InfoSchemaSnapshot;
use tessel_meta::MetaStore;
use tessel_meta::SchemaDelta;
use tessel_meta::SchemaDiff;
use tessel_meta::TableInfo;
use tokio::sync::broadcast;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing::debug;
use tracing::info_span;
use tracing::warn;

/// Immutable schema at one version, as served by one node.
#[derive(Debug, Clone, Default)]
pub struct InfoSchema {
    version: i64,
    databases: HashMap<i64, DbInfo>,
    tables: HashMap<i64, Arc<TableInfo>>,
}

impl InfoSchema {
    fn from_snapshot(snapshot: InfoSchemaSnapshot) -> Self {
        Self {
            version: snapshot.version,
            databases: snapshot
                .databases
                .into_iter()
                .map(|db| (db.id, db))
                .collect(),
            tables: snapshot
                .tables
                .into_iter()
                .map(|table| (table.id, Arc::new(table)))
                .collect(),
        }
    }

    fn apply_delta(&self, delta: SchemaDelta) -> Self {
        let mut next = self.clone();
        next.version = delta.version;
        for (schema_id, db) in delta.databases {
            match db {
                Some(db) => next.databases.insert(schema_id, db),
                None => next.databases.remove(&schema_id),
            };
        }
        for (table_id, table) in delta.tables {
            match table {
                Some(table) => next.tables.insert(table_id, Arc::new(table)),
                None => next.tables.remove(&table_id),
            };
        }
        // Tables of a dropped database go with it.
        next.tables
            .retain(|_, table| next.databases.contains_key(&table.schema_id));
        next
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn database(&self, schema_id: i64) -> Option<&DbInfo> {
        self.databases.get(&schema_id)
    }

    pub fn database_by_name(&self, name: &str) -> Option<&DbInfo> {
        self.databases
            .values()
            .find(|db| db.name.eq_ignore_ascii_case(name))
    }

    pub fn table(&self, table_id: i64) -> Option<Arc<TableInfo>> {
        self.tables.get(&table_id).cloned()
    }

    pub fn table_by_name(&self, db_name: &str, table_name: &str) -> Option<Arc<TableInfo>> {
        let db = self.database_by_name(db_name)?;
        self.tables
            .values()
            .find(|table| table.schema_id == db.id && table.name.eq_ignore_ascii_case(table_name))
            .cloned()
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
}

/// A version change applied by this node's cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    pub version: i64,
    /// Empty after a full reload.
    pub diffs: Vec<SchemaDiff>,
}

/// Per-node schema cache. It registers the node in the meta store with the
/// version it serves, so the owner knows when every node has caught up.
pub struct SchemaCache {
    node_id: String,
    store: MetaStore,
    clock: Arc<dyn Clock>,
    lease: Duration,
    poll_interval: Duration,
    current: ArcSwap<InfoSchema>,
    last_reload_ms: AtomicI64,
    changes: broadcast::Sender<SchemaChange>,
    hooks: Arc<HookSlot>,
}

impl SchemaCache {
    pub(crate) fn new(
        node_id: String,
        store: MetaStore,
        clock: Arc<dyn Clock>,
        lease: Duration,
        poll_interval: Duration,
        hooks: Arc<HookSlot>,
    ) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            node_id,
            store,
            clock,
            lease,
            poll_interval,
            current: ArcSwap::from_pointee(InfoSchema::default()),
            last_reload_ms: AtomicI64::new(i64::MIN),
            changes,
            hooks,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Latest loaded schema, valid or not.
    pub fn snapshot(&self) -> Arc<InfoSchema> {
        self.current.load_full()
    }

    pub fn version(&self) -> i64 {
        self.current.load().version
    }

    /// The schema to run a new statement against. Fails when the cache has
    /// not reloaded within one schema lease, because the cluster may have
    /// moved two versions ahead without waiting for this node.
    pub fn check_valid(&self) -> Result<Arc<InfoSchema>> {
        let schema = self.snapshot();
        let last_reload_ms = self.last_reload_ms.load(Ordering::SeqCst);
        let lease_ms = self.lease.as_millis() as i64;
        if last_reload_ms == i64::MIN
            || self.clock.now_ms() >= last_reload_ms.saturating_add(lease_ms)
        {
            return Err(DdlError::SchemaOutdated {
                version: schema.version,
            });
        }
        Ok(self.hooks.get().on_get_info_schema(schema))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchemaChange> {
        self.changes.subscribe()
    }

    /// Catch up with the meta store, applying diffs when possible and
    /// reloading everything otherwise, then refresh this node's registration.
    pub async fn reload(&self) -> Result<i64> {
        let started_ms = self.clock.now_ms();
        let current = self.snapshot();
        let change = match self.store.load_schema_delta(current.version).await? {
            Some(delta) if delta.diffs.is_empty() => None,
            Some(delta) => {
                let diffs = delta.diffs.clone();
                let next = current.apply_delta(delta);
                let version = next.version;
                self.current.store(Arc::new(next));
                Some(SchemaChange { version, diffs })
            }
            None => {
                let snapshot = self.store.load_info_schema().await?;
                let next = InfoSchema::from_snapshot(snapshot);
                let version = next.version;
                debug!(version, "full schema reload");
                self.current.store(Arc::new(next));
                Some(SchemaChange {
                    version,
                    diffs: Vec::new(),
                })
            }
        };
        let version = self.version();
        let lease_until = started_ms.saturating_add(self.lease.as_millis() as i64);
        self.store
            .heartbeat_node(&self.node_id, version, lease_until, started_ms)
            .await?;
        self.last_reload_ms.store(started_ms, Ordering::SeqCst);

        if let Some(change) = change {
            debug!(version, diffs = change.diffs.len(), "schema cache moved");
            // No subscribers is fine.
            let _ = self.changes.send(change);
            self.hooks.get().on_schema_changed(version).await;
        }
        Ok(version)
    }

    /// Keep reloading until `cancel` fires: on every poll tick, and right
    /// away when this node's own worker published a version.
    pub(crate) fn run(
        self: Arc<Self>,
        mut local: watch::Receiver<i64>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let span = info_span!("schema_cache", node_id = %self.node_id);
        tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(self.poll_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                let mut local_open = true;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {}
                        changed = local.changed(), if local_open => {
                            if changed.is_err() {
                                local_open = false;
                                continue;
                            }
                        }
                    }
                    if let Err(err) = self.reload().await {
                        warn!("schema reload failed: {err}");
                    }
                }
            }
            .instrument(span),
        )
    }

    /// Drop this node's registration so the owner stops waiting for it.
    pub(crate) async fn deregister(&self) -> Result<()> {
        self.store.remove_node(&self.node_id).await?;
        self.last_reload_ms.store(i64::MIN, Ordering::SeqCst);
        Ok(())
    }
}
