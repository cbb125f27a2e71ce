//! Time-bucketed counters
//!
//! A bucket covers one period and starts at `floor(timestamp / period) * period`.
//! Buckets older than two periods are dropped lazily whenever the counter is
//! touched.

use std::collections::BTreeMap;

use parking_lot::Mutex;

/// Count and flow recorded in one bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotTotals {
    pub count: i64,
    pub flow: i64,
}

impl SlotTotals {
    /// Whether these totals are inside the limits. Negative limits are unlimited.
    pub fn within(&self, max_count: i64, max_flow: i64) -> bool {
        (max_count < 0 || self.count <= max_count) && (max_flow < 0 || self.flow <= max_flow)
    }
}

#[derive(Debug, Default)]
pub struct SlotCounter {
    slots: Mutex<BTreeMap<i64, SlotTotals>>,
}

fn bucket_start(timestamp: i64, period_ms: i64) -> i64 {
    timestamp.div_euclid(period_ms) * period_ms
}

fn evict_stale(slots: &mut BTreeMap<i64, SlotTotals>, start: i64, period_ms: i64) {
    let oldest_kept = start - period_ms;
    if slots.first_key_value().is_some_and(|(k, _)| *k < oldest_kept) {
        slots.retain(|k, _| *k >= oldest_kept);
    }
}

impl SlotCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add to the bucket only if the result stays within the limits.
    pub fn try_add(
        &self,
        timestamp: i64,
        period_ms: i64,
        count: i64,
        flow: i64,
        max_count: i64,
        max_flow: i64,
    ) -> bool {
        let start = bucket_start(timestamp, period_ms);
        let mut slots = self.slots.lock();
        evict_stale(&mut slots, start, period_ms);

        let slot = slots.entry(start).or_default();
        let next = SlotTotals {
            count: slot.count + count,
            flow: slot.flow + flow,
        };
        if !next.within(max_count, max_flow) {
            return false;
        }
        *slot = next;
        true
    }

    /// Add unconditionally and return the new bucket totals.
    pub fn add(&self, timestamp: i64, period_ms: i64, count: i64, flow: i64) -> SlotTotals {
        let start = bucket_start(timestamp, period_ms);
        let mut slots = self.slots.lock();
        evict_stale(&mut slots, start, period_ms);

        let slot = slots.entry(start).or_default();
        slot.count += count;
        slot.flow += flow;
        *slot
    }

    /// Take back a previous add. Never goes below zero.
    pub fn minus(&self, timestamp: i64, period_ms: i64, count: i64, flow: i64) {
        let start = bucket_start(timestamp, period_ms);
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&start) {
            slot.count = (slot.count - count).max(0);
            slot.flow = (slot.flow - flow).max(0);
        }
    }

    pub fn current(&self, timestamp: i64, period_ms: i64) -> SlotTotals {
        let start = bucket_start(timestamp, period_ms);
        self.slots.lock().get(&start).copied().unwrap_or_default()
    }

    /// True when nothing is recorded in the current or previous bucket.
    pub fn is_idle(&self, timestamp: i64, period_ms: i64) -> bool {
        let start = bucket_start(timestamp, period_ms);
        let mut slots = self.slots.lock();
        evict_stale(&mut slots, start, period_ms);
        slots.values().all(|s| s.count == 0 && s.flow == 0)
    }

    pub fn bucket_count(&self) -> usize {
        self.slots.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_add_respects_limit() {
        let counter = SlotCounter::new();
        for _ in 0..3 {
            assert!(counter.try_add(1_000, 1_000, 1, 0, 3, -1));
        }
        assert!(!counter.try_add(1_500, 1_000, 1, 0, 3, -1));
        assert_eq!(counter.current(1_999, 1_000).count, 3);

        // next second is a fresh bucket
        assert!(counter.try_add(2_000, 1_000, 1, 0, 3, -1));
    }

    #[test]
    fn test_flow_limit() {
        let counter = SlotCounter::new();
        assert!(counter.try_add(0, 1_000, 1, 600, -1, 1_000));
        assert!(!counter.try_add(10, 1_000, 1, 500, -1, 1_000));
        assert!(counter.try_add(20, 1_000, 1, 400, -1, 1_000));
    }

    #[test]
    fn test_minus_never_negative() {
        let counter = SlotCounter::new();
        counter.add(0, 1_000, 1, 0);
        counter.minus(0, 1_000, 5, 0);
        assert_eq!(counter.current(0, 1_000).count, 0);
    }

    #[test]
    fn test_old_buckets_are_evicted() {
        let counter = SlotCounter::new();
        counter.add(0, 1_000, 1, 0);
        counter.add(1_000, 1_000, 1, 0);
        assert_eq!(counter.bucket_count(), 2);

        counter.add(5_000, 1_000, 1, 0);
        assert_eq!(counter.bucket_count(), 1);
        assert!(!counter.is_idle(5_000, 1_000));
        assert!(counter.is_idle(9_000, 1_000));
    }
}
