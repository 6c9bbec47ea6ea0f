//! Lock-free circular buffer of time slots
//!
//! Each slot carries an `epoch` word identifying which incarnation of the slot
//! its counters belong to (`absolute slot index + 1`). A writer that lands on
//! a slot still holding an older incarnation claims it with a CAS to
//! [`ROTATING`], waits for in-flight increments on the old incarnation to
//! drain, zeroes the counters and publishes the new epoch. Writers that
//! observe `ROTATING` spin until the new epoch is published.
//!
//! An increment registers itself in `writers` and re-checks the epoch before
//! touching a counter, so an event for an old incarnation either lands before
//! the reset (and is wiped) or is refused; it never leaks into the new one.

use std::sync::atomic::{AtomicU64, Ordering};

/// Slot has never been written
const NEVER_WRITTEN: u64 = 0;

/// Slot is being reset for a new incarnation
const ROTATING: u64 = u64::MAX;

struct Slot {
    epoch: AtomicU64,
    /// Increments in progress against the current epoch
    writers: AtomicU64,
    counts: Box<[AtomicU64]>,
}

impl Slot {
    fn new(width: usize) -> Self {
        Self {
            epoch: AtomicU64::new(NEVER_WRITTEN),
            writers: AtomicU64::new(0),
            counts: (0..width).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Add to `counter` only if the slot still holds `epoch`
    fn try_add(&self, epoch: u64, counter: usize, delta: u64) -> bool {
        self.writers.fetch_add(1, Ordering::SeqCst);
        let added = self.epoch.load(Ordering::SeqCst) == epoch;
        if added {
            self.counts[counter].fetch_add(delta, Ordering::Relaxed);
        }
        self.writers.fetch_sub(1, Ordering::Release);
        added
    }
}

pub(crate) struct SlotBuffer {
    slots: Box<[Slot]>,
    width: usize,
    start_nanos: u64,
    resolution_nanos: u64,
}

impl SlotBuffer {
    /// `width` is the number of counters per slot
    pub(crate) fn new(slot_count: usize, width: usize, resolution_nanos: u64, start_nanos: u64) -> Self {
        Self {
            slots: (0..slot_count).map(|_| Slot::new(width)).collect(),
            width,
            start_nanos,
            resolution_nanos,
        }
    }

    pub(crate) fn width(&self) -> usize {
        self.width
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn resolution_nanos(&self) -> u64 {
        self.resolution_nanos
    }

    /// Index of the slot period containing `nanos`, counted from the buffer start
    pub(crate) fn absolute_index(&self, nanos: u64) -> u64 {
        nanos.saturating_sub(self.start_nanos) / self.resolution_nanos
    }

    /// Clock time at which the given slot period begins
    pub(crate) fn period_start(&self, absolute: u64) -> u64 {
        self.start_nanos + absolute * self.resolution_nanos
    }

    /// Number of slot periods a trailing window of `trailing_nanos` spans,
    /// including the current one
    pub(crate) fn periods_in(&self, trailing_nanos: u64) -> u64 {
        let periods = trailing_nanos.div_ceil(self.resolution_nanos).max(1);
        periods.min(self.slots.len() as u64)
    }

    fn slot_for(&self, absolute: u64) -> &Slot {
        &self.slots[(absolute % self.slots.len() as u64) as usize]
    }

    /// Add `delta` to `counter` in the slot addressed by `nanos`.
    ///
    /// Returns `false` when the addressed slot has already been reused by a
    /// newer period, in which case the event is too old for the window.
    pub(crate) fn add(&self, counter: usize, delta: u64, nanos: u64) -> bool {
        let absolute = self.absolute_index(nanos);
        let epoch = absolute + 1;
        let slot = self.slot_for(absolute);

        loop {
            let current = slot.epoch.load(Ordering::Acquire);
            if current == epoch {
                if slot.try_add(epoch, counter, delta) {
                    return true;
                }
                continue;
            }
            if current == ROTATING {
                std::hint::spin_loop();
                continue;
            }
            if current > epoch {
                return false;
            }

            if slot
                .epoch
                .compare_exchange(current, ROTATING, Ordering::SeqCst, Ordering::Acquire)
                .is_ok()
            {
                while slot.writers.load(Ordering::SeqCst) != 0 {
                    std::hint::spin_loop();
                }
                for count in slot.counts.iter() {
                    count.store(0, Ordering::Relaxed);
                }
                slot.epoch.store(epoch, Ordering::Release);
                tracing::trace!(slot = absolute, previous = current, "rotated metrics slot");
            }
        }
    }

    /// Copy the counters of the given slot period into `out`.
    ///
    /// Returns `false` (leaving `out` zeroed) if the physical slot does not
    /// currently hold that period, or it changed while being read.
    pub(crate) fn read_period(&self, absolute: u64, out: &mut [u64]) -> bool {
        out.iter_mut().for_each(|v| *v = 0);

        let slot = self.slot_for(absolute);
        let epoch = absolute + 1;
        if slot.epoch.load(Ordering::Acquire) != epoch {
            return false;
        }
        for (value, count) in out.iter_mut().zip(slot.counts.iter()) {
            *value = count.load(Ordering::Relaxed);
        }
        if slot.epoch.load(Ordering::Acquire) != epoch {
            out.iter_mut().for_each(|v| *v = 0);
            return false;
        }
        true
    }

    /// Sum every counter over the trailing window ending at `now_nanos`
    pub(crate) fn sum_window(&self, trailing_nanos: u64, now_nanos: u64) -> Vec<u64> {
        let mut totals = vec![0u64; self.width];
        let mut scratch = vec![0u64; self.width];

        let now = self.absolute_index(now_nanos);
        let periods = self.periods_in(trailing_nanos);
        let first = (now + 1).saturating_sub(periods);

        for absolute in first..=now {
            if self.read_period(absolute, &mut scratch) {
                for (total, value) in totals.iter_mut().zip(scratch.iter()) {
                    *total += value;
                }
            }
        }
        totals
    }
}

impl std::fmt::Debug for SlotBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotBuffer")
            .field("slots", &self.slots.len())
            .field("width", &self.width)
            .field("resolution_nanos", &self.resolution_nanos)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const MS: u64 = 1_000_000;

    #[test]
    fn test_increment_and_sum() {
        let buffer = SlotBuffer::new(10, 2, 100 * MS, 0);

        assert!(buffer.add(0, 1, 10 * MS));
        assert!(buffer.add(0, 1, 150 * MS));
        assert!(buffer.add(1, 1, 250 * MS));

        assert_eq!(buffer.sum_window(1000 * MS, 250 * MS), vec![2, 1]);
        // Only the current slot
        assert_eq!(buffer.sum_window(100 * MS, 250 * MS), vec![0, 1]);
    }

    #[test]
    fn test_rotation_resets_slot() {
        let buffer = SlotBuffer::new(4, 1, 100 * MS, 0);

        buffer.add(0, 1, 50 * MS);
        buffer.add(0, 1, 60 * MS);
        // Same physical slot, four periods later
        buffer.add(0, 1, 450 * MS);

        let mut out = vec![0u64; 1];
        assert!(!buffer.read_period(0, &mut out));
        assert!(buffer.read_period(4, &mut out));
        assert_eq!(out, vec![1]);
    }

    #[test]
    fn test_stale_event_dropped_after_reuse() {
        let buffer = SlotBuffer::new(4, 1, 100 * MS, 0);

        buffer.add(0, 1, 450 * MS);
        assert!(!buffer.add(0, 1, 50 * MS));
        assert_eq!(buffer.sum_window(400 * MS, 450 * MS), vec![1]);
    }

    #[test]
    fn test_lazy_expiry_without_writes() {
        let buffer = SlotBuffer::new(4, 1, 100 * MS, 0);
        buffer.add(0, 1, 50 * MS);

        assert_eq!(buffer.sum_window(400 * MS, 350 * MS), vec![1]);
        // Slot never physically cleared, but outside the buffer span
        assert_eq!(buffer.sum_window(400 * MS, 450 * MS), vec![0]);
        assert_eq!(buffer.sum_window(400 * MS, 10_000 * MS), vec![0]);
    }

    #[test]
    fn test_window_clamped_to_buffer() {
        let buffer = SlotBuffer::new(3, 1, 100 * MS, 0);
        assert_eq!(buffer.periods_in(10_000 * MS), 3);
        assert_eq!(buffer.periods_in(0), 1);
        assert_eq!(buffer.periods_in(150 * MS), 2);
    }

    #[test]
    fn test_times_before_start_use_first_slot() {
        let buffer = SlotBuffer::new(3, 1, 100 * MS, 500 * MS);
        buffer.add(0, 1, 0);
        assert_eq!(buffer.sum_window(100 * MS, 500 * MS), vec![1]);
    }

    #[test]
    fn test_concurrent_increments_same_slot() {
        let buffer = Arc::new(SlotBuffer::new(8, 1, 100 * MS, 0));
        let threads = 8;
        let per_thread = 10_000u64;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let b = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for _ in 0..per_thread {
                        b.add(0, 1, 10 * MS);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread should not panic");
        }

        assert_eq!(
            buffer.sum_window(100 * MS, 10 * MS),
            vec![threads as u64 * per_thread]
        );
    }

    #[test]
    fn test_stale_writers_never_leak_into_new_period() {
        let buffer = Arc::new(SlotBuffer::new(2, 1, 100 * MS, 0));
        buffer.add(0, 1, 10 * MS);

        // Period 0 and period 2 share a physical slot
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let b = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    let nanos = if i % 2 == 0 { 10 * MS } else { 210 * MS };
                    for _ in 0..5_000 {
                        b.add(0, 1, nanos);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread should not panic");
        }

        let mut out = vec![0u64; 1];
        assert!(buffer.read_period(2, &mut out));
        assert_eq!(out, vec![4 * 5_000]);
        assert!(!buffer.add(0, 1, 10 * MS));
    }

    #[test]
    fn test_concurrent_rotation_keeps_newest_period() {
        let buffer = Arc::new(SlotBuffer::new(2, 1, 100 * MS, 0));

        // Writers race to rotate the same physical slot into period 2
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        b.add(0, 1, 210 * MS);
                    }
                })
            })
            .collect();
        buffer.add(0, 1, 10 * MS);
        for h in handles {
            h.join().expect("thread should not panic");
        }

        let mut out = vec![0u64; 1];
        assert!(buffer.read_period(2, &mut out));
        assert_eq!(out, vec![8_000]);
    }
}
