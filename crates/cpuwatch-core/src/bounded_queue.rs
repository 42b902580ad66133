//! Fixed-capacity FIFO used for every handoff between pipeline workers.
//!
//! A bounded queue holds at most `capacity` items of one concrete type. The
//! backing store is allocated once at construction and addressed modulo
//! `capacity` from a read cursor, so `len` and the cursor always describe one
//! contiguous logical window.
//!
//! Two write modes exist:
//!
//! - [`BoundedQueue::try_write`] refuses to insert into a full queue and hands
//!   the item back untouched.
//! - [`BoundedQueue::write`] always inserts; on a full queue the single oldest
//!   item is dropped. The log sink uses this so producers never stall.
//!
//! The queue has no internal lock. Cross-thread access goes through
//! [`crate::handoff`], which pairs it with a timed lock and two signals.

use serde::{Deserialize, Serialize};

// =============================================================================
// Errors
// =============================================================================

/// Queue construction failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue capacity must be greater than zero")]
    ZeroCapacity,

    #[error("cannot allocate queue storage for {capacity} items of {item_size} bytes")]
    AllocationFailed { capacity: usize, item_size: usize },
}

// =============================================================================
// BoundedQueue
// =============================================================================

/// A fixed-capacity circular FIFO.
///
/// Iteration yields items from oldest to newest.
///
/// # Example
///
/// ```
/// use cpuwatch_core::bounded_queue::BoundedQueue;
///
/// let mut q = BoundedQueue::new(2).unwrap();
/// assert!(q.try_write('a').is_ok());
/// assert!(q.try_write('b').is_ok());
/// assert_eq!(q.try_write('c'), Err('c'));
/// assert_eq!(q.write('c'), Some('a')); // force mode drops the oldest
/// assert_eq!(q.read(), Some('b'));
/// ```
pub struct BoundedQueue<T> {
    slots: Vec<Option<T>>,
    capacity: usize,
    read: usize, // index of the oldest item
    len: usize,
    written: u64,
    dropped: u64,
}

impl<T> BoundedQueue<T> {
    /// Create a queue able to hold `capacity` items.
    ///
    /// The backing store is reserved fallibly, so an unsatisfiable request
    /// yields [`QueueError::AllocationFailed`] instead of aborting.
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::ZeroCapacity);
        }
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| QueueError::AllocationFailed {
                capacity,
                item_size: std::mem::size_of::<T>(),
            })?;
        slots.resize_with(capacity, || None);
        Ok(Self {
            slots,
            capacity,
            read: 0,
            len: 0,
            written: 0,
            dropped: 0,
        })
    }

    fn slot(&self, offset: usize) -> usize {
        (self.read + offset) % self.capacity
    }

    /// Insert `item` if there is room, otherwise hand it back unchanged.
    pub fn try_write(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        let idx = self.slot(self.len);
        self.slots[idx] = Some(item);
        self.len += 1;
        self.written += 1;
        Ok(())
    }

    /// Insert `item`, dropping the oldest item when the queue is full.
    ///
    /// Returns the dropped item, if any. `len` stays at `capacity`.
    pub fn write(&mut self, item: T) -> Option<T> {
        if !self.is_full() {
            // Cannot fail: there is room.
            let _ = self.try_write(item);
            return None;
        }
        // Full: the write position coincides with the read cursor.
        let evicted = self.slots[self.read].replace(item);
        self.read = self.slot(1);
        self.written += 1;
        self.dropped += 1;
        evicted
    }

    /// Remove and return the oldest item.
    pub fn read(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.read].take();
        self.read = self.slot(1);
        self.len -= 1;
        item
    }

    /// Borrow the oldest item without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        self.slots[self.read].as_ref()
    }

    /// Force-write every item, dropping the oldest as needed.
    ///
    /// Returns the number of items written, which is always the number of
    /// items yielded by `items`.
    pub fn write_many<I>(&mut self, items: I) -> usize
    where
        I: IntoIterator<Item = T>,
    {
        let mut count = 0;
        for item in items {
            self.write(item);
            count += 1;
        }
        count
    }

    /// Write items until the queue is full.
    ///
    /// Items are pulled from the iterator only while there is room, so a
    /// caller passing `&mut iter` keeps every item that was not written.
    pub fn try_write_many<I>(&mut self, items: I) -> usize
    where
        I: IntoIterator<Item = T>,
    {
        let mut iter = items.into_iter();
        let mut count = 0;
        while !self.is_full() {
            let Some(item) = iter.next() else {
                break;
            };
            if self.try_write(item).is_err() {
                break;
            }
            count += 1;
        }
        count
    }

    /// Move up to `max` items, oldest first, onto the end of `out`.
    ///
    /// Stops early when the queue runs empty. `out` is only appended to.
    pub fn read_many(&mut self, out: &mut Vec<T>, max: usize) -> usize {
        let count = max.min(self.len);
        out.reserve(count);
        for _ in 0..count {
            if let Some(item) = self.read() {
                out.push(item);
            }
        }
        count
    }

    /// Number of items currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the queue is full.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    /// Maximum number of items.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Size in bytes of one item slot's payload type.
    #[must_use]
    pub fn item_size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    /// Total items ever written (including forced overwrites).
    #[must_use]
    pub fn total_written(&self) -> u64 {
        self.written
    }

    /// Total items dropped by force-mode writes.
    #[must_use]
    pub fn total_dropped(&self) -> u64 {
        self.dropped
    }

    /// Remove all items. Lifetime counters are kept.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.read = 0;
        self.len = 0;
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> BoundedQueueIter<'_, T> {
        BoundedQueueIter {
            slots: &self.slots,
            capacity: self.capacity,
            pos: self.read,
            remaining: self.len,
        }
    }

    /// Get statistics.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            capacity: self.capacity,
            len: self.len,
            item_size: self.item_size(),
            total_written: self.written,
            total_dropped: self.dropped,
            fill_ratio: self.len as f64 / self.capacity as f64,
        }
    }
}

impl<T: Clone> BoundedQueue<T> {
    /// Copy up to `max` items, oldest first, onto the end of `out` without
    /// removing them.
    pub fn peek_many(&self, out: &mut Vec<T>, max: usize) -> usize {
        let before = out.len();
        out.extend(self.iter().take(max).cloned());
        out.len() - before
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len)
            .field("total_written", &self.written)
            .field("total_dropped", &self.dropped)
            .finish()
    }
}

// =============================================================================
// BoundedQueueIter
// =============================================================================

/// Iterator over queued items (oldest to newest).
pub struct BoundedQueueIter<'a, T> {
    slots: &'a [Option<T>],
    capacity: usize,
    pos: usize,
    remaining: usize,
}

impl<'a, T> Iterator for BoundedQueueIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let item = self.slots[self.pos].as_ref();
        self.pos = (self.pos + 1) % self.capacity;
        self.remaining -= 1;
        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T> ExactSizeIterator for BoundedQueueIter<'_, T> {}

// =============================================================================
// QueueStats (serializable)
// =============================================================================

/// Serializable statistics about a bounded queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub capacity: usize,
    pub len: usize,
    /// Payload size of one item in bytes.
    pub item_size: usize,
    pub total_written: u64,
    pub total_dropped: u64,
    /// len / capacity.
    pub fill_ratio: f64,
}

// =============================================================================
// Tests
// =============================================================================
