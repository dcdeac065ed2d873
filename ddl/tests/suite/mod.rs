// Aggregates all integration tests as modules.
mod add_column;
mod add_index;
mod alter_table;
mod cancel;
mod halted_job;
mod owner_failover;
mod primary_key;
mod restart;
mod schema_sync;
