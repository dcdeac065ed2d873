//! Online schema changes for a cluster sharing one meta store.
//!
//! One node at a time holds the DDL owner lease and runs queued jobs step by
//! step. Every step commits the job state and a schema version bump together,
//! and the owner waits for every live node to load a version before taking
//! the next step, so at most two adjacent versions are ever in use.

mod admin;
mod clock;
mod config;
mod ddl;
mod delete_range;
mod dml;
mod error;
mod hook;
mod owner;
mod reorg;
mod retry;
mod schema_cache;
mod steps;
mod submit;
mod syncer;
mod worker;

/// Preferred entrypoint: one node's DDL engine.
pub use ddl::Ddl;
pub use ddl::DdlOptions;

pub use admin::AdminCancelOutcome;
pub use admin::cancel_job;
pub use admin::is_cancellable;
pub use clock::Clock;
pub use clock::ManualClock;
pub use clock::SystemClock;
pub use config::ConfigError;
pub use config::DdlConfig;
pub use dml::DmlSession;
pub use dml::Row;
pub use error::DdlError;
pub use error::Result;
pub use hook::DdlHook;
pub use hook::NoopHook;
pub use owner::LeaseOwnerManager;
pub use owner::OwnerManager;
pub use owner::OwnerToken;
pub use retry::Backoff;
pub use retry::RetryPolicy;
pub use schema_cache::InfoSchema;
pub use schema_cache::SchemaCache;
pub use schema_cache::SchemaChange;
pub use syncer::SchemaSyncer;
