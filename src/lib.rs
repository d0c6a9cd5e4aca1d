//! Cryptocurrency quote cache.
//!
//! A [`refresh::coordinator::RefreshCoordinator`] pulls market snapshots from
//! a [`market_data::adapters::QuoteFetcher`] and swaps them into a
//! [`state::snapshot_store::SnapshotStore`]; the HTTP layer in [`api`] serves
//! whatever complete snapshot is current.

pub mod api;
pub mod config;
pub mod market_data;
pub mod metrics;
pub mod refresh;
pub mod state;
