use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::market_data::adapters::{FetchError, QuoteFetcher};
use crate::market_data::types::Snapshot;
use crate::metrics::prometheus;
use crate::state::snapshot_store::{SnapshotStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Fetching,
    Committing,
}

/// What asked for a refresh. Only used for logs and metrics; every trigger
/// goes through the same single-flight gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Scheduled,
    OnDemand,
    ColdStart,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduled",
            Trigger::OnDemand => "on_demand",
            Trigger::ColdStart => "cold_start",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RefreshError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("refresh cycle aborted: {0}")]
    Aborted(String),
}

pub type RefreshOutcome = Result<Arc<Snapshot>, RefreshError>;

type InFlight = Shared<BoxFuture<'static, RefreshOutcome>>;

struct Flight {
    phase: Phase,
    current: Option<(u64, InFlight)>,
    cycles: u64,
}

struct Inner {
    fetcher: Arc<dyn QuoteFetcher>,
    store: Arc<dyn SnapshotStore>,
    fetch_timeout: Duration,
    flight: Mutex<Flight>,
}

/// Sole writer of the snapshot store.
///
/// At most one cycle (fetch, then `replace_all`) runs at a time. A trigger
/// that arrives while a cycle is in flight waits for that cycle and gets its
/// outcome, success or failure; it never starts a second fetch. Cycles run in
/// their own task, so a caller that stops waiting does not cancel one.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        fetcher: Arc<dyn QuoteFetcher>,
        store: Arc<dyn SnapshotStore>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                store,
                fetch_timeout,
                flight: Mutex::new(Flight {
                    phase: Phase::Idle,
                    current: None,
                    cycles: 0,
                }),
            }),
        }
    }

    pub fn store(&self) -> Arc<dyn SnapshotStore> {
        self.inner.store.clone()
    }

    pub fn phase(&self) -> Phase {
        self.inner.flight().phase
    }

    /// Runs a refresh cycle, or joins the one already running.
    pub async fn refresh(&self, trigger: Trigger) -> RefreshOutcome {
        let (cycle, in_flight, joined) = {
            let mut flight = self.inner.flight();
            let running = flight.current.as_ref().map(|(c, f)| (*c, f.clone()));
            match running {
                Some((cycle, in_flight)) => (cycle, in_flight, true),
                None => {
                    flight.cycles += 1;
                    let cycle = flight.cycles;
                    flight.phase = Phase::Fetching;

                    // The task cannot clear `current` before we set it: it
                    // needs this lock first.
                    let handle = tokio::spawn(self.inner.clone().run(cycle, trigger));
                    let in_flight = async move {
                        handle
                            .await
                            .unwrap_or_else(|e| Err(RefreshError::Aborted(e.to_string())))
                    }
                    .boxed()
                    .shared();

                    flight.current = Some((cycle, in_flight.clone()));
                    (cycle, in_flight, false)
                }
            }
        };

        if joined {
            debug!(cycle, trigger = trigger.as_str(), "joined in-flight refresh");
            prometheus::record_coalesced(trigger.as_str());
        }

        in_flight.await
    }
}

impl Inner {
    fn flight(&self) -> MutexGuard<'_, Flight> {
        // Nothing panics while holding this lock, but don't wedge refreshes if
        // that ever changes.
        self.flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: Phase) {
        self.flight().phase = phase;
    }

    /// Back to idle; the next trigger starts a new cycle.
    fn finish(&self, cycle: u64) {
        let mut flight = self.flight();
        if matches!(flight.current, Some((c, _)) if c == cycle) {
            flight.current = None;
        }
        flight.phase = Phase::Idle;
    }

    async fn run(self: Arc<Self>, cycle: u64, trigger: Trigger) -> RefreshOutcome {
        let started = Instant::now();

        let outcome = AssertUnwindSafe(self.fetch_and_commit())
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(RefreshError::Aborted("refresh cycle panicked".to_string())));

        self.finish(cycle);

        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        prometheus::record_refresh_latency_ms(trigger.as_str(), elapsed_ms);

        match &outcome {
            Ok(snapshot) => {
                info!(
                    cycle,
                    trigger = trigger.as_str(),
                    generation = snapshot.generation(),
                    quotes = snapshot.quotes().len(),
                    elapsed_ms,
                    "snapshot refreshed"
                );
                prometheus::record_refresh(trigger.as_str(), "ok");
                prometheus::record_snapshot(snapshot.generation(), snapshot.quotes().len());
            }
            Err(err) => {
                warn!(
                    cycle,
                    trigger = trigger.as_str(),
                    error = %err,
                    elapsed_ms,
                    "refresh failed, keeping previous snapshot"
                );
                prometheus::record_refresh(trigger.as_str(), "failed");
            }
        }

        outcome
    }

    async fn fetch_and_commit(&self) -> RefreshOutcome {
        let records = tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch())
            .await
            .map_err(|_| FetchError::Timeout(self.fetch_timeout))??;

        debug!(fetcher = self.fetcher.name(), count = records.len(), "quotes fetched");
        self.set_phase(Phase::Committing);

        Ok(self.store.replace_all(records).await?)
    }
}
