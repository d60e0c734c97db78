//! Single-consumer streaming channel for partial results
//!
//! The producer side ([`StreamSender`]) appends to a buffer and wakes the
//! consumer. The consumer side ([`ResultStream`]) drains the whole buffer per
//! wake-up. The slot cycles `Pending -> Fulfilled -> Pending` until a final
//! result has been drained, after which it stays `Finished`.

use super::PartialResult;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::Notify;

#[derive(Debug)]
enum Slot {
    Pending,
    Fulfilled(Vec<PartialResult>),
    Finished,
}

#[derive(Debug)]
struct Shared {
    slot: Mutex<Slot>,
    notify: Notify,
}

/// Results drained by one wake-up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub results: Vec<PartialResult>,
    /// False once the last drained result was final
    pub more: bool,
}

/// Create a connected producer/consumer pair
pub fn channel() -> (StreamSender, ResultStream) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot::Pending),
        notify: Notify::new(),
    });
    (
        StreamSender {
            shared: Arc::downgrade(&shared),
        },
        ResultStream { shared },
    )
}

/// Producer handle. Holds no ownership: once the consumer is dropped every
/// push is a silent no-op.
#[derive(Debug, Clone)]
pub struct StreamSender {
    shared: Weak<Shared>,
}

impl StreamSender {
    /// Append results in order. Returns false when nobody can ever read them
    /// (consumer gone, or a final result was already drained).
    pub fn push(&self, results: Vec<PartialResult>) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        {
            let mut slot = shared.slot.lock().unwrap_or_else(PoisonError::into_inner);
            match &mut *slot {
                Slot::Finished => return false,
                _ if results.is_empty() => return true,
                Slot::Fulfilled(buffer) => buffer.extend(results),
                Slot::Pending => *slot = Slot::Fulfilled(results),
            }
        }
        shared.notify.notify_one();
        true
    }

    #[cfg(test)]
    pub fn is_orphaned(&self) -> bool {
        self.shared.strong_count() == 0
    }
}

/// Consumer handle, owned by the conversation context that issued the request
#[derive(Debug)]
pub struct ResultStream {
    shared: Arc<Shared>,
}

impl ResultStream {
    /// Wait for at least one result, then drain everything buffered.
    /// After the final result has been drained this returns an empty batch
    /// with `more = false` without waiting.
    pub async fn next_batch(&mut self) -> Batch {
        loop {
            // Register interest before inspecting the slot so a push landing
            // in between is not missed.
            let shared = Arc::clone(&self.shared);
            let notified = shared.notify.notified();
            if let Some(batch) = self.try_drain() {
                return batch;
            }
            notified.await;
        }
    }

    /// Drain without waiting; `None` while nothing is buffered
    pub fn try_drain(&mut self) -> Option<Batch> {
        let mut slot = self.shared.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *slot, Slot::Pending) {
            Slot::Pending => None,
            Slot::Finished => {
                *slot = Slot::Finished;
                Some(Batch {
                    results: Vec::new(),
                    more: false,
                })
            }
            Slot::Fulfilled(results) => {
                let more = results.last().is_none_or(|r| !r.is_final);
                if !more {
                    *slot = Slot::Finished;
                }
                Some(Batch { results, more })
            }
        }
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        matches!(
            *self.shared.slot.lock().unwrap_or_else(PoisonError::into_inner),
            Slot::Finished
        )
    }
}
