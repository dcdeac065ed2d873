use crate::MetaTxn;
use crate::Result;
use crate::migrations::MIGRATOR;
use log::LevelFilter;
use sqlx::ConnectOptions;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::sqlite::SqliteSynchronous;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tracing::warn;

mod admin;
mod nodes;
mod owner;
mod schema;

/// One node's handle onto the shared meta database.
#[derive(Clone)]
pub struct MetaStore {
    path: PathBuf,
    pool: Arc<SqlitePool>,
}

impl MetaStore {
    /// Open (and migrate) the meta database at `path`, creating it if needed.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(sqlx::Error::Io)?;
        }
        let pool = match open_sqlite(path).await {
            Ok(pool) => pool,
            Err(err) => {
                warn!("failed to open meta db at {}: {err}", path.display());
                return Err(err);
            }
        };
        debug!("opened meta db at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            pool: Arc::new(pool),
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Start a write transaction. `BEGIN IMMEDIATE` takes the write lock up
    /// front, so every read inside it sees the state the writes apply to.
    pub async fn begin(&self) -> Result<MetaTxn> {
        let tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        Ok(MetaTxn::new(tx))
    }

    /// Start a read-only snapshot transaction.
    pub async fn begin_read(&self) -> Result<MetaTxn> {
        let tx = self.pool.begin().await?;
        Ok(MetaTxn::new(tx))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn open_sqlite(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .log_statements(LevelFilter::Off);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}
