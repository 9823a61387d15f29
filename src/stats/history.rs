//! Fixed-duration bucketed time series of counters.

use serde::{Deserialize, Serialize};

use super::Counters;

pub const FIELD_RX_BYTES: u32 = 1 << 1;
pub const FIELD_RX_PACKETS: u32 = 1 << 2;
pub const FIELD_TX_BYTES: u32 = 1 << 3;
pub const FIELD_TX_PACKETS: u32 = 1 << 4;
pub const FIELD_OPERATIONS: u32 = 1 << 5;
pub const FIELD_ALL: u32 = u32::MAX;

/// One time slice of a [`History`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub start: i64,
    pub counters: Counters,
}

/// Usage reported by a carrier plan, used to rescale collected history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionPlan {
    /// Start of the current billing cycle.
    pub cycle_start: i64,
    /// Bytes the carrier counted between `cycle_start` and `data_usage_time`.
    pub data_usage_bytes: i64,
    pub data_usage_time: i64,
}

/// Ordered, non-overlapping buckets of constant duration.
///
/// Bucket starts are aligned to multiples of the duration, so two histories
/// with the same duration always share bucket boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    bucket_duration: i64,
    buckets: Vec<Bucket>,
}

impl History {
    pub fn new(bucket_duration: i64) -> Self {
        Self {
            bucket_duration: bucket_duration.max(1),
            buckets: Vec::new(),
        }
    }

    pub fn bucket_duration(&self) -> i64 {
        self.bucket_duration
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Start of the first bucket.
    pub fn start(&self) -> Option<i64> {
        self.buckets.first().map(|b| b.start)
    }

    /// End of the last bucket.
    pub fn end(&self) -> Option<i64> {
        self.buckets
            .last()
            .map(|b| b.start.saturating_add(self.bucket_duration))
    }

    fn aligned_start(&self, t: i64) -> i64 {
        t - t.rem_euclid(self.bucket_duration)
    }

    fn bucket_mut(&mut self, start: i64) -> &mut Bucket {
        let idx = match self.buckets.binary_search_by_key(&start, |b| b.start) {
            Ok(idx) => idx,
            Err(idx) => {
                self.buckets.insert(
                    idx,
                    Bucket {
                        start,
                        counters: Counters::ZERO,
                    },
                );
                idx
            }
        };
        &mut self.buckets[idx]
    }

    /// Adds `counters` to the bucket covering `t`.
    pub fn record_at(&mut self, t: i64, counters: Counters) {
        if counters.is_zero() {
            return;
        }
        let start = self.aligned_start(t);
        self.bucket_mut(start).counters += counters;
    }

    /// Spreads `counters` over the buckets overlapping `[start, end)`,
    /// proportionally to the overlap. Rounding remainders land in the last
    /// bucket so nothing is lost.
    pub fn record_data(&mut self, start: i64, end: i64, counters: Counters) {
        if counters.is_zero() {
            return;
        }
        if end <= start {
            self.record_at(start, counters);
            return;
        }

        let mut remaining = counters;
        let mut remaining_duration = end - start;
        let mut bucket_start = self.aligned_start(start);

        while bucket_start < end {
            let bucket_end = bucket_start.saturating_add(self.bucket_duration);
            let overlap = bucket_end.min(end) - bucket_start.max(start);
            if overlap > 0 {
                let part = if overlap >= remaining_duration {
                    remaining
                } else {
                    remaining.scaled(overlap, remaining_duration)
                };
                remaining = remaining - part;
                remaining_duration -= overlap;
                if !part.is_zero() {
                    self.bucket_mut(bucket_start).counters += part;
                }
            }
            bucket_start = bucket_end;
        }
    }

    /// Merges every bucket of `other` into this history.
    pub fn record_history(&mut self, other: &History) {
        self.record_history_within(other, i64::MIN, i64::MAX);
    }

    /// Merges the part of `other` that falls inside `[start, end)`.
    pub fn record_history_within(&mut self, other: &History, start: i64, end: i64) {
        let duration = other.bucket_duration;
        for bucket in &other.buckets {
            let b_start = bucket.start;
            let b_end = b_start.saturating_add(duration);
            if b_end <= start || b_start >= end {
                continue;
            }
            let overlap_start = b_start.max(start);
            let overlap_end = b_end.min(end);
            let overlap = overlap_end - overlap_start;
            let part = if overlap >= duration {
                bucket.counters
            } else {
                bucket.counters.scaled(overlap, duration)
            };
            self.record_data(overlap_start, overlap_end, part);
        }
    }

    /// Sum of counters inside `[start, end)`. Buckets that only partly
    /// overlap the range contribute proportionally.
    pub fn get_values(&self, start: i64, end: i64) -> Counters {
        let mut total = Counters::ZERO;
        for bucket in &self.buckets {
            let b_end = bucket.start.saturating_add(self.bucket_duration);
            if b_end <= start {
                continue;
            }
            if bucket.start >= end {
                break;
            }
            let overlap = b_end.min(end) - bucket.start.max(start);
            if overlap >= self.bucket_duration {
                total += bucket.counters;
            } else if overlap > 0 {
                total += bucket.counters.scaled(overlap, self.bucket_duration);
            }
        }
        total
    }

    pub fn total(&self) -> Counters {
        self.buckets
            .iter()
            .fold(Counters::ZERO, |acc, b| acc + b.counters)
    }

    pub fn total_bytes(&self) -> i64 {
        self.total().total_bytes()
    }

    /// Drops buckets that end at or before `cutoff`.
    pub fn remove_buckets_before(&mut self, cutoff: i64) {
        let duration = self.bucket_duration;
        self.buckets
            .retain(|b| b.start.saturating_add(duration) > cutoff);
    }

    /// Drops buckets that start strictly before `cutoff`, including a bucket
    /// that straddles it.
    pub fn remove_buckets_starting_before(&mut self, cutoff: i64) {
        self.buckets.retain(|b| b.start >= cutoff);
    }

    /// Drops buckets that start at or after `cutoff`.
    pub fn remove_buckets_from(&mut self, cutoff: i64) {
        self.buckets.retain(|b| b.start < cutoff);
    }

    /// Rescales byte counters of buckets fully inside `[start, end)` so the
    /// range matches `target_bytes`. Packet counters of rescaled buckets are
    /// cleared to mark the data as augmented.
    pub fn augment(&mut self, start: i64, end: i64, target_bytes: i64) {
        if end <= start {
            return;
        }
        let mut raw = self.get_values(start, end);
        if raw.rx_bytes == 0 || raw.tx_bytes == 0 {
            // Nothing collected yet: seed the range so there is something to scale.
            self.record_data(start, end, Counters::new(1, 0, 1, 0, 0));
            raw = self.get_values(start, end);
        }

        let raw_bytes = raw.total_bytes().max(1);
        let raw_rx = raw.rx_bytes.max(1);
        let raw_tx = raw.tx_bytes.max(1);
        let target_rx = mul_div(target_bytes, raw_rx, raw_bytes);
        let target_tx = mul_div(target_bytes, raw_tx, raw_bytes);

        let duration = self.bucket_duration;
        for bucket in &mut self.buckets {
            if bucket.start >= start && bucket.start.saturating_add(duration) <= end {
                bucket.counters.rx_bytes = mul_div(target_rx, bucket.counters.rx_bytes, raw_rx);
                bucket.counters.tx_bytes = mul_div(target_tx, bucket.counters.tx_bytes, raw_tx);
                bucket.counters.rx_packets = 0;
                bucket.counters.tx_packets = 0;
            }
        }
    }

    /// Applies a carrier plan: the buckets between the cycle start and the
    /// plan's usage timestamp are rescaled to the reported usage.
    pub fn augment_with_plan(&mut self, plan: &SubscriptionPlan) {
        let end = self.aligned_start(plan.data_usage_time);
        self.augment(plan.cycle_start, end, plan.data_usage_bytes);
    }

    /// Returns a copy with the fields not selected by `fields` cleared.
    pub fn masked(&self, fields: u32) -> History {
        let mut out = self.clone();
        for bucket in &mut out.buckets {
            let c = &mut bucket.counters;
            if fields & FIELD_RX_BYTES == 0 {
                c.rx_bytes = 0;
            }
            if fields & FIELD_RX_PACKETS == 0 {
                c.rx_packets = 0;
            }
            if fields & FIELD_TX_BYTES == 0 {
                c.tx_bytes = 0;
            }
            if fields & FIELD_TX_PACKETS == 0 {
                c.tx_packets = 0;
            }
            if fields & FIELD_OPERATIONS == 0 {
                c.operations = 0;
            }
        }
        out
    }

    /// Structural equality: same bucket duration, starts and counters.
    pub fn is_same_as(&self, other: &History) -> bool {
        self == other
    }
}

fn mul_div(a: i64, b: i64, c: i64) -> i64 {
    if c == 0 {
        return 0;
    }
    let r = i128::from(a) * i128::from(b) / i128::from(c);
    i64::try_from(r).unwrap_or(if r < 0 { i64::MIN } else { i64::MAX })
}
