//! Bounded single-producer/single-consumer ring buffers (C2 Input Ring, C4 Output Ring).
//!
//! Unlike the device adapter's broadcast buffer queue (multi-subscriber,
//! `Mutex<VecDeque<_>>`), these rings are strict SPSC: one producer thread,
//! one consumer thread, a single heap allocation, and `head`/`tail` indices that are the sole
//! source of truth for occupancy. A `Mutex<()>` + `Condvar` pair per direction only parks and
//! wakes the blocked side; it never guards the data.

use std::{
    sync::atomic::{
        AtomicUsize,
        Ordering,
    },
    time::Duration,
};

use parking_lot::{
    Condvar,
    Mutex,
};

/// A bounded SPSC ring buffer of `T`.
///
/// `head` and `tail` are monotonically increasing counters modulo `2 * capacity`, not modulo
/// `capacity` directly, so that `head == tail` is unambiguous between "empty" and "completely
/// full" (the classic circular-buffer ABA problem).
pub struct Ring<T> {
    capacity: usize,
    slots: Box<[Mutex<Option<T>>]>,
    head: AtomicUsize,
    tail: AtomicUsize,
    not_empty: Condvar,
    not_empty_lock: Mutex<()>,
    not_full: Condvar,
    not_full_lock: Mutex<()>,
    producer_drops: AtomicUsize,
    read_timeouts: AtomicUsize,
}

impl<T> Ring<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            capacity,
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            not_empty: Condvar::new(),
            not_empty_lock: Mutex::new(()),
            not_full: Condvar::new(),
            not_full_lock: Mutex::new(()),
            producer_drops: AtomicUsize::new(0),
            read_timeouts: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items currently readable.
    pub fn used(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head) % (2 * self.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.used() == 0
    }

    pub fn is_full(&self) -> bool {
        self.used() == self.capacity
    }

    pub fn producer_drops(&self) -> usize {
        self.producer_drops.load(Ordering::Relaxed)
    }

    pub fn read_timeouts(&self) -> usize {
        self.read_timeouts.load(Ordering::Relaxed)
    }

    /// Writes as many of `items` as fit. If the ring lacks space for the whole slice the entire
    /// slice is dropped (never a partial write) and `producer_drops` is bumped by its length, per
    /// the "drop the entire block on overflow" contract in §3.
    pub fn write_block(&self, items: impl IntoIterator<Item = T>, len: usize) -> usize
    where
        T: Clone,
    {
        if len > self.capacity - self.used() {
            self.producer_drops.fetch_add(len, Ordering::Relaxed);
            return 0;
        }

        let was_empty = self.is_empty();
        let mut tail = self.tail.load(Ordering::Relaxed);
        let mut written = 0;
        for item in items.into_iter().take(len) {
            let index = tail % self.capacity;
            *self.slots[index].lock() = Some(item);
            tail = (tail + 1) % (2 * self.capacity);
            written += 1;
        }
        self.tail.store(tail, Ordering::Release);

        if was_empty && written > 0 {
            let _guard = self.not_empty_lock.lock();
            self.not_empty.notify_one();
        }
        written
    }

    /// Reads up to `max` items into `out`, returning the number read. Blocks up to `timeout`
    /// waiting for at least one item; on timeout bumps `read_timeouts` and returns 0.
    pub fn read_block(&self, out: &mut Vec<T>, max: usize, timeout: Duration) -> usize {
        if self.is_empty() {
            let mut guard = self.not_empty_lock.lock();
            if self.is_empty() {
                let result = self.not_empty.wait_for(&mut guard, timeout);
                if result.timed_out() && self.is_empty() {
                    self.read_timeouts.fetch_add(1, Ordering::Relaxed);
                    return 0;
                }
            }
        }

        let was_full = self.is_full();
        let mut head = self.head.load(Ordering::Relaxed);
        let available = self.used();
        let n = available.min(max);
        for _ in 0..n {
            let index = head % self.capacity;
            if let Some(item) = self.slots[index].lock().take() {
                out.push(item);
            }
            head = (head + 1) % (2 * self.capacity);
        }
        self.head.store(head, Ordering::Release);

        if was_full && n > 0 {
            let _guard = self.not_full_lock.lock();
            self.not_full.notify_one();
        }
        n
    }

    /// Drops all unread samples. Used on retune to flush stale pre-retune data (§4.4 step 2, §4.4
    /// step 6).
    pub fn clear(&self) {
        let was_full = self.is_full();
        let head = self.head.load(Ordering::Acquire);
        for slot in self.slots.iter() {
            *slot.lock() = None;
        }
        self.tail.store(head, Ordering::Release);
        if was_full {
            let _guard = self.not_full_lock.lock();
            self.not_full.notify_one();
        }
    }

    /// Blocks the producer until there is room for at least one item, up to `timeout`.
    pub fn wait_for_space(&self, timeout: Duration) -> bool {
        if !self.is_full() {
            return true;
        }
        let mut guard = self.not_full_lock.lock();
        if self.is_full() {
            !self.not_full.wait_for(&mut guard, timeout).timed_out()
        }
        else {
            true
        }
    }
}

/// Samples flowing Device Adapter → DSP Pipeline: interleaved I/Q floats, one `f32` per
/// component (so a complex sample occupies two consecutive entries).
pub type InputRing = Ring<f32>;

/// Samples flowing DSP Pipeline → consumer read API: either one `f32` per demodulated FM sample,
/// or two `f32` (I, Q) per CQPSK symbol, matching §3's "Demodulated block" representation.
pub type OutputRing = Ring<f32>;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Ring;

    #[test]
    fn write_then_read_preserves_order() {
        let ring: Ring<f32> = Ring::new(16);
        let data = [1.0, 2.0, 3.0, 4.0];
        let written = ring.write_block(data.iter().copied(), data.len());
        assert_eq!(written, 4);

        let mut out = Vec::new();
        let got = ring.read_block(&mut out, 4, Duration::from_millis(10));
        assert_eq!(got, 4);
        assert_eq!(out, data);
    }

    #[test]
    fn overflow_drops_entire_block_and_counts_it() {
        let ring: Ring<f32> = Ring::new(4);
        let data = [0.0; 5];
        let written = ring.write_block(data.iter().copied(), data.len());
        assert_eq!(written, 0);
        assert_eq!(ring.producer_drops(), 5);
        assert!(ring.is_empty());
    }

    #[test]
    fn partial_read_leaves_remainder_for_next_read() {
        let ring: Ring<f32> = Ring::new(8);
        ring.write_block([1.0, 2.0, 3.0].iter().copied(), 3);

        let mut out = Vec::new();
        let got = ring.read_block(&mut out, 2, Duration::from_millis(10));
        assert_eq!(got, 2);
        assert_eq!(out, [1.0, 2.0]);

        out.clear();
        let got = ring.read_block(&mut out, 2, Duration::from_millis(10));
        assert_eq!(got, 1);
        assert_eq!(out, [3.0]);
    }

    #[test]
    fn read_on_empty_ring_times_out_and_counts_it() {
        let ring: Ring<f32> = Ring::new(8);
        let mut out = Vec::new();
        let got = ring.read_block(&mut out, 4, Duration::from_millis(5));
        assert_eq!(got, 0);
        assert_eq!(ring.read_timeouts(), 1);
    }

    #[test]
    fn clear_drops_unread_samples() {
        let ring: Ring<f32> = Ring::new(8);
        ring.write_block([1.0, 2.0].iter().copied(), 2);
        ring.clear();
        assert!(ring.is_empty());
        let mut out = Vec::new();
        assert_eq!(ring.read_block(&mut out, 4, Duration::from_millis(5)), 0);
    }

    #[test]
    fn fills_to_capacity_without_overwriting() {
        let ring: Ring<f32> = Ring::new(4);
        let written = ring.write_block([1.0, 2.0, 3.0, 4.0].iter().copied(), 4);
        assert_eq!(written, 4);
        assert!(ring.is_full());
        // a fifth item does not fit: dropped, not overwritten
        let written = ring.write_block([5.0].iter().copied(), 1);
        assert_eq!(written, 0);
        assert_eq!(ring.producer_drops(), 1);
    }
}
