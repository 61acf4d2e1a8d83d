//! System-wide admission control.
//!
//! At most `max_concurrent` tasks run at once and at most `max_queue_size`
//! wait behind them. Anything beyond that is turned away synchronously. A
//! finished task hands its slot straight to the oldest waiter while holding
//! the state lock, so `active` and `pending` never disagree mid-transfer.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::OverloadError;

/// Point-in-time view of the controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionStats {
    pub active: usize,
    pub pending: usize,
}

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    admit: oneshot::Sender<()>,
}

#[derive(Debug, Default)]
struct AdmissionState {
    active: usize,
    next_ticket: u64,
    queue: VecDeque<Waiter>,
}

#[derive(Debug)]
pub struct AdmissionController {
    max_concurrent: usize,
    max_queue_size: usize,
    state: Mutex<AdmissionState>,
}

impl AdmissionController {
    /// `max_concurrent` is clamped to at least one slot.
    pub fn new(max_concurrent: usize, max_queue_size: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            max_queue_size,
            state: Mutex::new(AdmissionState::default()),
        }
    }

    pub fn limits(&self) -> (usize, usize) {
        (self.max_concurrent, self.max_queue_size)
    }

    fn lock(&self) -> MutexGuard<'_, AdmissionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> AdmissionStats {
        let state = self.lock();
        AdmissionStats {
            active: state.active,
            pending: state.queue.len(),
        }
    }

    /// Run `task` once a slot is available.
    ///
    /// The slot is released however `task` ends, including when the returned
    /// future is dropped mid-flight.
    pub async fn run<F: Future>(&self, task: F) -> Result<F::Output, OverloadError> {
        let _slot = self.acquire().await?;
        Ok(task.await)
    }

    async fn acquire(&self) -> Result<Slot<'_>, OverloadError> {
        let (ticket, admitted) = {
            let mut state = self.lock();
            if state.active < self.max_concurrent {
                state.active += 1;
                return Ok(Slot { controller: self });
            }
            if state.queue.len() >= self.max_queue_size {
                warn!(
                    active = state.active,
                    pending = state.queue.len(),
                    "Rejecting execution, admission queue is full"
                );
                return Err(OverloadError {
                    active: state.active,
                    pending: state.queue.len(),
                });
            }

            let ticket = state.next_ticket;
            state.next_ticket += 1;
            let (admit, admitted) = oneshot::channel();
            state.queue.push_back(Waiter { ticket, admit });
            debug!(ticket, pending = state.queue.len(), "Execution queued");
            (ticket, admitted)
        };

        let mut place = QueuePlace {
            controller: self,
            ticket,
            admitted: false,
        };
        // Senders are only dropped after being used, or by our own QueuePlace.
        let _ = admitted.await;
        place.admitted = true;
        Ok(Slot { controller: self })
    }

    /// Give a freed slot to the oldest live waiter, or return it to the pool.
    fn release(&self, state: &mut AdmissionState) {
        while let Some(waiter) = state.queue.pop_front() {
            if waiter.admit.send(()).is_ok() {
                debug!(ticket = waiter.ticket, "Queued execution admitted");
                return;
            }
        }
        state.active = state.active.saturating_sub(1);
    }
}

/// One held admission slot.
struct Slot<'a> {
    controller: &'a AdmissionController,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        let mut state = self.controller.lock();
        self.controller.release(&mut state);
    }
}

/// A waiter's position in the queue, cleaned up if the waiter goes away.
struct QueuePlace<'a> {
    controller: &'a AdmissionController,
    ticket: u64,
    admitted: bool,
}

impl Drop for QueuePlace<'_> {
    fn drop(&mut self) {
        if self.admitted {
            return;
        }
        let mut state = self.controller.lock();
        if let Some(index) = state.queue.iter().position(|w| w.ticket == self.ticket) {
            state.queue.remove(index);
        } else {
            // A slot was handed over but never picked up; pass it on.
            self.controller.release(&mut state);
        }
    }
}
