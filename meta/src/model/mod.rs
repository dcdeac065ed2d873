mod job;
mod owner;
mod reorg;
mod schema;

pub use job::ActionType;
pub use job::BinlogInfo;
pub use job::ErrorClass;
pub use job::Job;
pub use job::JobArgs;
pub use job::JobError;
pub use job::JobId;
pub use job::JobLookup;
pub use job::JobQueue;
pub use job::JobState;
pub use owner::CampaignOutcome;
pub use owner::NodeVersion;
pub use owner::OwnerLease;
pub use reorg::DeleteRange;
pub use reorg::ReorgCheckpoint;
pub use reorg::ReorgMode;
pub use schema::ColumnInfo;
pub use schema::ColumnSpec;
pub use schema::ColumnType;
pub use schema::Datum;
pub use schema::DbInfo;
pub use schema::IndexInfo;
pub use schema::IndexSpec;
pub use schema::InfoSchemaSnapshot;
pub use schema::SchemaDelta;
pub use schema::SchemaDiff;
pub use schema::SchemaState;
pub use schema::TableInfo;
pub use schema::TableSpec;

pub(crate) use job::decode_job;
pub(crate) use job::encode_job;
pub(crate) use schema::decode_info;
pub(crate) use schema::encode_info;
