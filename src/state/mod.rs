pub mod query;
pub mod snapshot_store;
