//! SQLite-backed meta store for the DDL engine.
//!
//! One database file plays the role of the cluster's transactional store: it
//! holds the job queue and history, the schema version counter and diffs,
//! schema objects, the owner lease, node registrations, reorg checkpoints and
//! the row/index key space. Every node opens its own [`MetaStore`] onto the
//! same file; job-state mutations go through a [`MetaTxn`].

mod error;
mod migrations;
mod model;
mod runtime;
pub mod tablecodec;
mod txn;

pub use error::MetaError;
pub use error::Result;
pub use model::ActionType;
pub use model::BinlogInfo;
pub use model::CampaignOutcome;
pub use model::ColumnInfo;
pub use model::ColumnSpec;
pub use model::ColumnType;
pub use model::Datum;
pub use model::DbInfo;
pub use model::DeleteRange;
pub use model::ErrorClass;
pub use model::IndexInfo;
pub use model::IndexSpec;
pub use model::InfoSchemaSnapshot;
pub use model::Job;
pub use model::JobArgs;
pub use model::JobError;
pub use model::JobId;
pub use model::JobLookup;
pub use model::JobQueue;
pub use model::JobState;
pub use model::NodeVersion;
pub use model::OwnerLease;
pub use model::ReorgCheckpoint;
pub use model::ReorgMode;
pub use model::SchemaDelta;
pub use model::SchemaDiff;
pub use model::SchemaState;
pub use model::TableInfo;
pub use model::TableSpec;
pub use runtime::MetaStore;
pub use txn::MetaTxn;

pub use sqlx::Error as SqlxError;
