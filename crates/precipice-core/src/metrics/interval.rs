//! Per-slot iteration for external reporting

use super::buffer::SlotBuffer;
use crate::outcome::{Outcome, Rejected};
use std::marker::PhantomData;

/// Counters of one slot period
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalCounts<R> {
    /// Clock nanos at which the period starts
    pub start_nanos: u64,
    /// Clock nanos at which the period ends; the current period ends at `now`
    pub end_nanos: u64,
    counts: Vec<u64>,
    _outcome: PhantomData<R>,
}

impl<R: Outcome> IntervalCounts<R> {
    pub fn count(&self, outcome: R) -> u64 {
        self.counts[outcome.ordinal()]
    }

    pub fn rejections(&self, reason: Rejected) -> u64 {
        self.counts[R::VARIANTS.len() + reason.ordinal()]
    }

    /// Whether nothing was recorded in this period
    pub fn is_empty(&self) -> bool {
        self.counts.iter().all(|c| *c == 0)
    }
}

/// Single pass, oldest first, over the slot periods of a trailing window.
///
/// Periods that were never written or have expired yield zero counts.
pub struct Intervals<'a, R> {
    buffer: &'a SlotBuffer,
    next: u64,
    last: u64,
    now_nanos: u64,
    _outcome: PhantomData<R>,
}

impl<'a, R: Outcome> Intervals<'a, R> {
    pub(crate) fn new(buffer: &'a SlotBuffer, trailing_nanos: u64, now_nanos: u64) -> Self {
        let last = buffer.absolute_index(now_nanos);
        let periods = buffer.periods_in(trailing_nanos);
        Self {
            buffer,
            next: (last + 1).saturating_sub(periods),
            last,
            now_nanos,
            _outcome: PhantomData,
        }
    }
}

impl<R: Outcome> Iterator for Intervals<'_, R> {
    type Item = IntervalCounts<R>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next > self.last {
            return None;
        }
        let absolute = self.next;
        self.next += 1;

        let mut counts = vec![0u64; self.buffer.width()];
        self.buffer.read_period(absolute, &mut counts);

        let start_nanos = self.buffer.period_start(absolute);
        let end_nanos = (start_nanos + self.buffer.resolution_nanos()).min(self.now_nanos.max(start_nanos));

        Some(IntervalCounts {
            start_nanos,
            end_nanos,
            counts,
            _outcome: PhantomData,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.last + 1).saturating_sub(self.next) as usize;
        (remaining, Some(remaining))
    }
}

impl<R: Outcome> ExactSizeIterator for Intervals<'_, R> {}
