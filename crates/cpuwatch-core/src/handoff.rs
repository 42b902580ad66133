//! Single-producer/single-consumer handoff between two pipeline stages.
//!
//! A handoff channel is a [`BoundedQueue`] behind a [`TimedLock`] plus its
//! two signals, `not_empty` and `not_full`. [`channel`] splits it into
//! exactly one [`Producer`] and one [`Consumer`]; neither endpoint is
//! `Clone`, so each queue is owned by exactly the two stages it connects.
//!
//! The endpoints only expose the pieces. The wait/retry protocol itself lives
//! in [`crate::stage`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bounded_queue::{BoundedQueue, QueueError, QueueStats};
use crate::sync::{AcquireError, DeadlineSignal, Guard, TimedLock, WaitOutcome};

/// Construct a handoff channel over a queue of `capacity` items.
pub fn channel<T>(capacity: usize) -> Result<(Producer<T>, Consumer<T>), QueueError> {
    let shared = Arc::new(Shared {
        queue: TimedLock::new(BoundedQueue::new(capacity)?),
        not_empty: DeadlineSignal::new(),
        not_full: DeadlineSignal::new(),
    });
    Ok((
        Producer {
            shared: Arc::clone(&shared),
        },
        Consumer { shared },
    ))
}

struct Shared<T> {
    queue: TimedLock<BoundedQueue<T>>,
    not_empty: DeadlineSignal,
    not_full: DeadlineSignal,
}

impl<T> Shared<T> {
    fn stats(&self, timeout: Duration) -> Option<QueueStats> {
        self.queue.try_acquire(timeout).ok().map(|q| q.stats())
    }
}

/// Writing end of a handoff channel.
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Producer<T> {
    pub fn lock(&self, timeout: Duration) -> Result<Guard<'_, BoundedQueue<T>>, AcquireError> {
        self.shared.queue.try_acquire(timeout)
    }

    /// Wait on "not full".
    pub fn wait_for_space(
        &self,
        guard: &mut Guard<'_, BoundedQueue<T>>,
        deadline: Instant,
    ) -> WaitOutcome {
        self.shared.not_full.wait_until(guard, deadline)
    }

    /// Signal "not empty" to the consumer.
    pub fn notify_written(&self) -> usize {
        self.shared.not_empty.signal_one()
    }

    /// Wake a consumer blocked on this channel so it re-checks cancellation.
    pub fn wake(&self) -> usize {
        self.shared.not_empty.signal_all()
    }

    pub fn stats(&self, timeout: Duration) -> Option<QueueStats> {
        self.shared.stats(timeout)
    }
}

/// Reading end of a handoff channel.
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Consumer<T> {
    pub fn lock(&self, timeout: Duration) -> Result<Guard<'_, BoundedQueue<T>>, AcquireError> {
        self.shared.queue.try_acquire(timeout)
    }

    /// Wait on "not empty".
    pub fn wait_for_data(
        &self,
        guard: &mut Guard<'_, BoundedQueue<T>>,
        deadline: Instant,
    ) -> WaitOutcome {
        self.shared.not_empty.wait_until(guard, deadline)
    }

    /// Signal "not full" to the producer.
    pub fn notify_read(&self) -> usize {
        self.shared.not_full.signal_one()
    }

    /// Wake a producer blocked on this channel so it re-checks cancellation.
    pub fn wake(&self) -> usize {
        self.shared.not_full.signal_all()
    }

    pub fn stats(&self, timeout: Duration) -> Option<QueueStats> {
        self.shared.stats(timeout)
    }
}

impl<T> std::fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer").finish_non_exhaustive()
    }
}

impl<T> std::fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer").finish_non_exhaustive()
    }
}
