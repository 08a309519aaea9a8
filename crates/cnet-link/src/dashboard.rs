use crate::error::LinkError;
use crate::gateway::Gateway;
use crate::supervisor::ConnectionState;
use crate::transport::TransportHandle;
use cnet_core::{DashboardSnapshot, StatusPatch};
use std::future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::debug;

/// Owns the DashboardSnapshot and the status polling timer.
///
/// The timer only exists while at least one observer is registered.
pub struct Aggregator {
    snapshot: watch::Sender<DashboardSnapshot>,
    observers: usize,
    poll: Option<Interval>,
    poll_interval: Duration,
}

impl Aggregator {
    pub fn new(poll_interval: Duration) -> Self {
        let (snapshot, _) = watch::channel(DashboardSnapshot::default());
        Self {
            snapshot,
            observers: 0,
            poll: None,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn snapshot(&self) -> DashboardSnapshot {
        *self.snapshot.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DashboardSnapshot> {
        self.snapshot.subscribe()
    }

    /// Merges the fields present in `patch` and notifies watchers with the
    /// full snapshot, even when nothing changed.
    pub fn apply_status_update(&mut self, patch: &StatusPatch) -> DashboardSnapshot {
        self.snapshot.send_modify(|snapshot| snapshot.merge(patch));
        let snapshot = self.snapshot();
        debug!(event = "dashboard_update", empty_patch = patch.is_empty(), %snapshot);
        snapshot
    }

    pub fn observers(&self) -> usize {
        self.observers
    }

    pub fn is_polling(&self) -> bool {
        self.poll.is_some()
    }

    pub fn register_observer(&mut self) {
        self.observers += 1;
        if self.poll.is_none() {
            let mut interval = time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.poll = Some(interval);
            debug!(event = "poll_started", every_ms = self.poll_interval.as_millis() as u64);
        }
    }

    pub fn release_observer(&mut self) {
        self.observers = self.observers.saturating_sub(1);
        if self.observers == 0 && self.poll.take().is_some() {
            debug!(event = "poll_stopped");
        }
    }

    pub fn stop(&mut self) {
        self.observers = 0;
        self.poll = None;
    }

    /// Resolves on the next polling tick; never resolves while unobserved.
    pub async fn next_poll(&mut self) {
        match self.poll.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => future::pending::<()>().await,
        }
    }

    /// Asks the broker for fresh counters. Returns `Ok(false)` without
    /// touching the transport unless the link is connected.
    pub fn request_refresh<H: TransportHandle + ?Sized>(
        &self,
        state: ConnectionState,
        handle: Option<&mut H>,
        gateway: &Gateway,
    ) -> Result<bool, LinkError> {
        if state != ConnectionState::Connected {
            return Ok(false);
        }
        gateway.request_status(state, handle)?;
        Ok(true)
    }
}
