//! Background timer driving scheduled refreshes.
//!
//! Ticks once at start so a fresh process warms its cache, then every
//! interval. Failures are logged and wait for the next tick; there is no
//! separate retry.

use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use super::coordinator::{RefreshCoordinator, Trigger};

/// Default refresh interval: 5 minutes.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Owner of a running scheduler. Dropping it also stops the loop, but only
/// `stop` waits for it to exit.
pub struct SchedulerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stops ticking. A refresh already in progress is finished first.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "refresh scheduler task failed");
        }
    }
}

pub fn start_refresh_scheduler(coordinator: RefreshCoordinator, every: Duration) -> SchedulerHandle {
    let (tx, mut rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        info!(interval_secs = every.as_secs(), "refresh scheduler started");

        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut rx => break,
                _ = ticker.tick() => run_scheduled_refresh(&coordinator).await,
            }
        }

        info!("refresh scheduler stopped");
    });

    SchedulerHandle {
        shutdown: Some(tx),
        task,
    }
}

async fn run_scheduled_refresh(coordinator: &RefreshCoordinator) {
    debug!("scheduled refresh tick");

    // The coordinator already logs the outcome; a failure here must not
    // escape the loop.
    if let Err(e) = coordinator.refresh(Trigger::Scheduled).await {
        debug!(error = %e, "scheduled refresh failed, waiting for next tick");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::adapters::FetchError;
    use crate::market_data::adapters::scripted::ScriptedFetcher;
    use crate::market_data::types::fixtures::quote;
    use crate::state::snapshot_store::{MemorySnapshotStore, SnapshotStore};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn setup(fetcher: Arc<ScriptedFetcher>) -> (RefreshCoordinator, Arc<MemorySnapshotStore>) {
        let store = Arc::new(MemorySnapshotStore::new());
        let coordinator = RefreshCoordinator::new(fetcher, store.clone(), Duration::from_secs(10));
        (coordinator, store)
    }

    #[tokio::test(start_paused = true)]
    async fn success_failure_success_ends_on_last_success() {
        let first = vec![quote("btc", dec!(1)), quote("eth", dec!(2))];
        let last = vec![quote("btc", dec!(3)), quote("sol", dec!(4))];
        let fetcher = Arc::new(ScriptedFetcher::new([
            Ok(first),
            Err(FetchError::Status(500)),
            Ok(last.clone()),
        ]));
        let (coordinator, store) = setup(fetcher.clone());

        let handle = start_refresh_scheduler(coordinator, DEFAULT_REFRESH_INTERVAL);
        // Ticks at 0, 5 and 10 minutes.
        tokio::time::sleep(DEFAULT_REFRESH_INTERVAL * 2 + Duration::from_secs(1)).await;
        handle.stop().await;

        assert_eq!(fetcher.calls(), 3);
        let snapshot = store.read_all().await.unwrap();
        assert_eq!(snapshot.quotes(), last.as_slice());
        assert_eq!(snapshot.generation(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_the_loop() {
        let fetcher = Arc::new(ScriptedFetcher::new([
            Err(FetchError::Network("connection reset".to_string())),
            Err(FetchError::Timeout(Duration::from_secs(10))),
            Ok(vec![quote("btc", dec!(1))]),
        ]));
        let (coordinator, store) = setup(fetcher.clone());

        let handle = start_refresh_scheduler(coordinator, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(121)).await;
        handle.stop().await;

        assert_eq!(fetcher.calls(), 3);
        assert_eq!(store.read_all().await.unwrap().generation(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_scheduler_no_longer_fetches() {
        let fetcher = Arc::new(ScriptedFetcher::new([
            Ok(vec![quote("btc", dec!(1))]),
            Ok(vec![quote("btc", dec!(2))]),
        ]));
        let (coordinator, _store) = setup(fetcher.clone());

        let handle = start_refresh_scheduler(coordinator, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fetcher.calls(), 1);

        handle.stop().await;
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(fetcher.calls(), 1);
    }
}
