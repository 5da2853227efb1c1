// Copyright (c) 2023 - 2026 corral.dev.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;

use corral_types::time::MillisSinceEpoch;

#[derive(Debug)]
pub struct Timer<T> {
    wake_up_time: MillisSinceEpoch,
    // insertion order, keeps timers with equal wake up times FIFO
    seq: u64,
    payload: T,
}

impl<T> Timer<T> {
    pub fn wake_up_time(&self) -> MillisSinceEpoch {
        self.wake_up_time
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_inner(self) -> T {
        self.payload
    }
}

impl<T> Ord for Timer<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.wake_up_time
            .cmp(&other.wake_up_time)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl<T> PartialOrd for Timer<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Timer<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Timer<T> {}

/// Min-heap of payloads ordered by their wake up time.
///
/// The queue does not sleep by itself; callers poll it with the current time and use
/// [`DelayQueue::time_until_next`] to decide how long to wait.
#[derive(Debug)]
pub struct DelayQueue<T> {
    heap: BinaryHeap<Reverse<Timer<T>>>,
    next_seq: u64,
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        DelayQueue::new()
    }
}

impl<T> DelayQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn sleep_until(&mut self, wake_up_time: MillisSinceEpoch, payload: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Timer {
            wake_up_time,
            seq,
            payload,
        }))
    }

    pub fn next_wake_up_time(&self) -> Option<MillisSinceEpoch> {
        self.heap.peek().map(|Reverse(timer)| timer.wake_up_time)
    }

    /// Time left until the earliest timer fires, zero if it already expired and `None` if the
    /// queue is empty.
    pub fn time_until_next(&self, now: MillisSinceEpoch) -> Option<Duration> {
        self.next_wake_up_time()
            .map(|wake_up_time| wake_up_time.saturating_duration_since(now))
    }

    /// Removes and returns the earliest timer if it is due at `now`.
    pub fn pop_expired(&mut self, now: MillisSinceEpoch) -> Option<Timer<T>> {
        if self.next_wake_up_time()? <= now {
            self.heap.pop().map(|Reverse(timer)| timer)
        } else {
            None
        }
    }

    /// Removes every timer which is due at `now`, in wake up order.
    pub fn drain_expired(&mut self, now: MillisSinceEpoch) -> Vec<T> {
        let mut expired = Vec::new();
        while let Some(timer) = self.pop_expired(now) {
            expired.push(timer.into_inner());
        }
        expired
    }

    /// Drops all timers whose payload doesn't satisfy `f`.
    pub fn retain(&mut self, mut f: impl FnMut(&T) -> bool) {
        self.heap.retain(|Reverse(timer)| f(&timer.payload));
    }

    pub fn iter(&self) -> impl Iterator<Item = (MillisSinceEpoch, &T)> {
        self.heap
            .iter()
            .map(|Reverse(timer)| (timer.wake_up_time, &timer.payload))
    }
}

impl<T> FromIterator<(MillisSinceEpoch, T)> for DelayQueue<T> {
    fn from_iter<IT: IntoIterator<Item = (MillisSinceEpoch, T)>>(iter: IT) -> Self {
        let mut queue = DelayQueue::new();
        for (time, payload) in iter {
            queue.sleep_until(time, payload);
        }
        queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use corral_test_util::{assert, assert_eq};

    fn at(ms: u64) -> MillisSinceEpoch {
        MillisSinceEpoch::new(ms)
    }

    #[test]
    fn timer_ordering() {
        let mut queue: DelayQueue<i32> = [(at(3600), 1), (at(1), 2)].into_iter().collect();

        assert_eq!(queue.next_wake_up_time(), Some(at(1)));
        assert_eq!(queue.pop_expired(at(10)).unwrap().into_inner(), 2);
        assert!(queue.pop_expired(at(10)).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn drain_returns_only_expired_in_order() {
        let mut queue: DelayQueue<&str> = [(at(30), "c"), (at(10), "a"), (at(20), "b")]
            .into_iter()
            .collect();

        assert_eq!(queue.drain_expired(at(20)), vec!["a", "b"]);
        assert_eq!(queue.time_until_next(at(20)), Some(Duration::from_millis(10)));
        assert_eq!(queue.drain_expired(at(100)), vec!["c"]);
        assert!(queue.is_empty());
        assert_eq!(queue.time_until_next(at(100)), None);
    }

    #[test]
    fn equal_wake_up_times_are_fifo() {
        let mut queue = DelayQueue::new();
        for i in 0..5 {
            queue.sleep_until(at(5), i);
        }
        assert_eq!(queue.drain_expired(at(5)), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn overdue_timers_report_zero_wait() {
        let queue: DelayQueue<()> = [(at(5), ())].into_iter().collect();
        assert_eq!(queue.time_until_next(at(50)), Some(Duration::ZERO));
    }

    #[test]
    fn retain_removes_matching_payloads() {
        let mut queue: DelayQueue<u32> = (0..6).map(|i| (at(u64::from(i)), i)).collect();
        queue.retain(|v| v % 2 == 0);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.drain_expired(at(10)), vec![0, 2, 4]);
    }
}
