//! Per-committee consensus timers on tokio.
//!
//! Each armed timer is a task that sleeps and then sends a [`TimerFired`] into
//! the service channel. Re-arming a committee's timer aborts the previous task.

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};
use tessera_consensus::ConsensusState;
use tessera_primitives::GroupId;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::trace;

/// A consensus timer expired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerFired {
    /// Committee the timer belongs to
    pub committee: GroupId,
    /// State it was armed for
    pub state: ConsensusState,
    /// Round it was armed for
    pub round: u64,
}

/// One cancellable timer per committee.
///
/// Holds only a weak sender, so pending timers never keep the receiving
/// channel open on their own.
#[derive(Debug)]
pub struct TimerManager<T> {
    timers: HashMap<GroupId, JoinHandle<()>>,
    tx: mpsc::WeakSender<T>,
}

impl<T> TimerManager<T>
where
    T: From<TimerFired> + Send + 'static,
{
    /// Create a new timer manager firing into `tx`
    pub fn new(tx: &mpsc::Sender<T>) -> Self {
        Self { timers: HashMap::new(), tx: tx.downgrade() }
    }

    /// Arm the committee's timer, replacing any armed one
    pub fn set_timer(&mut self, fired: TimerFired, after: Duration) {
        self.cancel_timer(fired.committee);

        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            trace!(target: "tessera::timers", ?fired, "Timer fired");
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(T::from(fired)).await;
            }
        });

        trace!(
            target: "tessera::timers",
            committee = fired.committee,
            state = %fired.state,
            round = fired.round,
            ?after,
            "Timer set"
        );
        self.timers.insert(fired.committee, handle);
    }

    /// Cancel the committee's timer; no-op if none is armed
    pub fn cancel_timer(&mut self, committee: GroupId) {
        if let Some(handle) = self.timers.remove(&committee) {
            handle.abort();
            trace!(target: "tessera::timers", committee, "Timer cancelled");
        }
    }

    /// Cancel every timer
    pub fn cancel_all(&mut self) {
        for (committee, handle) in self.timers.drain() {
            handle.abort();
            trace!(target: "tessera::timers", committee, "Timer cancelled (shutdown)");
        }
    }

    /// Number of armed timers, including ones that already fired
    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

impl<T> Drop for TimerManager<T> {
    fn drop(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }
}
