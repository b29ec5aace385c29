//! Debounced, cancellable recompute scheduling.

use std::time::Duration;

use parking_lot::Mutex;

use crate::progress::CancellationToken;

/// Handle for one issued recompute.
#[derive(Debug, Clone)]
pub struct RecomputeTicket {
    generation: u64,
    cancel: CancellationToken,
}

impl RecomputeTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Token that fires once this recompute is superseded.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[derive(Debug)]
struct SchedulerState {
    pending_generation: u64,
    cancel: CancellationToken,
}

/// Single owner of "which recompute is current".
///
/// Issuing a ticket cancels the previous one. A ticket's result may only be
/// committed while it is still the latest, and the check and the commit
/// happen under one lock.
#[derive(Debug)]
pub struct RecomputeScheduler {
    debounce: Duration,
    state: Mutex<SchedulerState>,
}

impl RecomputeScheduler {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            state: Mutex::new(SchedulerState {
                pending_generation: 0,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Start a new recompute, superseding any in flight.
    pub fn issue(&self) -> RecomputeTicket {
        let mut state = self.state.lock();
        state.cancel.cancel();
        state.pending_generation += 1;
        state.cancel = CancellationToken::new();
        RecomputeTicket {
            generation: state.pending_generation,
            cancel: state.cancel.clone(),
        }
    }

    /// Whether `ticket` is still the latest and has not been cancelled.
    pub fn is_current(&self, ticket: &RecomputeTicket) -> bool {
        let state = self.state.lock();
        state.pending_generation == ticket.generation && !ticket.cancel.is_cancelled()
    }

    /// Wait out the debounce window. Returns `false` if superseded meanwhile.
    pub async fn settle(&self, ticket: &RecomputeTicket) -> bool {
        if !self.debounce.is_zero() {
            tokio::time::sleep(self.debounce).await;
        }
        self.is_current(ticket)
    }

    /// Run `apply` if `ticket` is still current. Returns whether it ran.
    pub fn commit<F: FnOnce()>(&self, ticket: &RecomputeTicket, apply: F) -> bool {
        let state = self.state.lock();
        if state.pending_generation != ticket.generation || ticket.cancel.is_cancelled() {
            return false;
        }
        apply();
        true
    }

    /// Cancel whatever is in flight without issuing a replacement.
    pub fn cancel_all(&self) {
        let mut state = self.state.lock();
        state.cancel.cancel();
        state.pending_generation += 1;
        state.cancel = CancellationToken::new();
    }

    pub fn pending_generation(&self) -> u64 {
        self.state.lock().pending_generation
    }
}
