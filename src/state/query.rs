use std::sync::Arc;
use tracing::info;

use crate::market_data::types::Snapshot;
use crate::refresh::coordinator::{RefreshCoordinator, RefreshError, Trigger};
use crate::state::snapshot_store::SnapshotStore;

/// Read side of the cache.
///
/// A cold store (nothing ever installed) blocks the caller on a cold-start
/// refresh and returns its result. Any installed snapshot, even an empty one,
/// is returned as-is without touching the provider.
#[derive(Clone)]
pub struct QuoteQuery {
    store: Arc<dyn SnapshotStore>,
    coordinator: RefreshCoordinator,
}

impl QuoteQuery {
    pub fn new(coordinator: RefreshCoordinator) -> Self {
        Self {
            store: coordinator.store(),
            coordinator,
        }
    }

    pub async fn get_current(&self) -> Result<Arc<Snapshot>, RefreshError> {
        let snapshot = self.store.read_all().await?;
        if !snapshot.is_cold() {
            return Ok(snapshot);
        }

        info!("snapshot store is cold, fetching before answering");
        self.coordinator.refresh(Trigger::ColdStart).await
    }

    /// Current snapshot without the cold-start fetch.
    pub async fn peek(&self) -> Result<Arc<Snapshot>, RefreshError> {
        Ok(self.store.read_all().await?)
    }
}
