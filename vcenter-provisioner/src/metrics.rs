// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cumulative network and disk counters built from real-time samples.
//!
//! The performance provider only hands out rates (KB/s, operations/s) over a
//! bounded window of recent intervals. Each poll folds the samples taken
//! since the previous poll into per-VM counters that never decrease.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::ops::Add;
use std::ops::AddAssign;
use std::time::Duration;
use vcenter_api::PerfCounter;
use vcenter_api::PerfSamples;

/// A monotonically non-decreasing counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cumulative {
    start_time: DateTime<Utc>,
    value: u64,
}

impl Cumulative {
    pub fn with_start_time(start_time: DateTime<Utc>, value: u64) -> Self {
        Self { start_time, value }
    }

    pub fn new(value: u64) -> Self {
        Self::with_start_time(Utc::now(), value)
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// When counting started, i.e. when the VM was first seen.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }
}

impl Add<u64> for Cumulative {
    type Output = Self;

    fn add(self, other: u64) -> Self {
        Self {
            start_time: self.start_time,
            value: self.value.saturating_add(other),
        }
    }
}

impl AddAssign<u64> for Cumulative {
    fn add_assign(&mut self, other: u64) {
        self.value = self.value.saturating_add(other);
    }
}

/// Per-VM counters carried from one poll to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CumulativeCounters {
    /// Bytes transmitted.
    pub net_tx: Cumulative,
    /// Bytes received.
    pub net_rx: Cumulative,
    pub disk_read_bytes: Cumulative,
    pub disk_write_bytes: Cumulative,
    pub disk_read_iops: Cumulative,
    pub disk_write_iops: Cumulative,
}

impl CumulativeCounters {
    pub fn new() -> Self {
        Self::with_start_time(Utc::now())
    }

    pub fn with_start_time(start_time: DateTime<Utc>) -> Self {
        let zero = Cumulative::with_start_time(start_time, 0);
        Self {
            net_tx: zero,
            net_rx: zero,
            disk_read_bytes: zero,
            disk_write_bytes: zero,
            disk_read_iops: zero,
            disk_write_iops: zero,
        }
    }

    /// Whether every counter is at least as large as the matching counter of
    /// `earlier`.
    pub fn dominates(&self, earlier: &CumulativeCounters) -> bool {
        self.values()
            .iter()
            .zip(earlier.values().iter())
            .all(|(now, before)| now >= before)
    }

    fn values(&self) -> [u64; 6] {
        [
            self.net_tx.value(),
            self.net_rx.value(),
            self.disk_read_bytes.value(),
            self.disk_write_bytes.value(),
            self.disk_read_iops.value(),
            self.disk_write_iops.value(),
        ]
    }
}

impl Default for CumulativeCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Every counter the accumulator consumes.
pub const MONITORED_COUNTERS: [PerfCounter; 6] = [
    PerfCounter::NetTransmitted,
    PerfCounter::NetBytesRx,
    PerfCounter::DiskRead,
    PerfCounter::DiskWrite,
    PerfCounter::DiskReadOps,
    PerfCounter::DiskWriteOps,
];

/// How many samples to request so the window covers the time since the
/// previous poll.
///
/// With no previous poll, `default_samples` are requested. When the previous
/// poll is older than the provider's retention, the window is widened to
/// everything the provider still keeps.
pub fn sample_count(
    since_last_poll: Option<Duration>,
    refresh_rate_secs: u32,
    retention: Duration,
    default_samples: u32,
) -> u32 {
    let refresh = u64::from(refresh_rate_secs.max(1));
    let Some(elapsed) = since_last_poll else {
        return default_samples.max(1);
    };
    let samples = if elapsed > retention {
        retention.as_secs() / refresh
    } else {
        elapsed.as_secs() / refresh + 1
    };
    u32::try_from(samples.max(1)).unwrap_or(u32::MAX)
}

/// Sum of the valid samples. The provider reports `-1` for intervals it has
/// no data for; those and any other negative values count as zero.
fn positive_sum(samples: impl IntoIterator<Item = i64>) -> u64 {
    samples
        .into_iter()
        .filter_map(|s| u64::try_from(s).ok())
        .fold(0u64, |acc, s| acc.saturating_add(s))
}

/// Bytes moved during a window of KB/s samples taken every
/// `refresh_rate_secs`.
pub fn bandwidth_bytes(
    samples: impl IntoIterator<Item = i64>,
    refresh_rate_secs: u32,
) -> u64 {
    positive_sum(samples)
        .saturating_mul(1024)
        .saturating_mul(u64::from(refresh_rate_secs))
}

/// Operations counted over a window of operations-per-interval samples.
pub fn operations(samples: impl IntoIterator<Item = i64>) -> u64 {
    positive_sum(samples)
}

/// Folds one window of samples into the counters of the previous poll.
pub fn accumulate(
    previous: &CumulativeCounters,
    samples: &PerfSamples,
    refresh_rate_secs: u32,
) -> CumulativeCounters {
    let window = |counter: PerfCounter| {
        samples.get(&counter).into_iter().flatten().copied()
    };
    let bytes = |counter| bandwidth_bytes(window(counter), refresh_rate_secs);

    let mut next = *previous;
    next.net_tx += bytes(PerfCounter::NetTransmitted);
    next.net_rx += bytes(PerfCounter::NetBytesRx);
    next.disk_read_bytes += bytes(PerfCounter::DiskRead);
    next.disk_write_bytes += bytes(PerfCounter::DiskWrite);
    next.disk_read_iops += operations(window(PerfCounter::DiskReadOps));
    next.disk_write_iops += operations(window(PerfCounter::DiskWriteOps));
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::collection::btree_map;
    use proptest::collection::vec;
    use proptest::prelude::*;
    use test_strategy::proptest;

    const RETENTION: Duration = Duration::from_secs(3600);

    #[test]
    fn test_sample_count() {
        assert_eq!(sample_count(None, 20, RETENTION, 9), 9);
        assert_eq!(
            sample_count(Some(Duration::from_secs(60)), 20, RETENTION, 9),
            4
        );
        assert_eq!(
            sample_count(Some(Duration::from_secs(5)), 20, RETENTION, 9),
            1
        );
        // Past the retention window, ask for everything still kept.
        assert_eq!(
            sample_count(Some(Duration::from_secs(7200)), 20, RETENTION, 9),
            180
        );
    }

    #[test]
    fn test_accumulate_scales_bandwidth() {
        let start = Utc::now();
        let previous = CumulativeCounters::with_start_time(start);
        let samples = PerfSamples::from([
            (PerfCounter::NetTransmitted, vec![10, -1, 5]),
            (PerfCounter::NetBytesRx, vec![2]),
            (PerfCounter::DiskReadOps, vec![3, 4, -7]),
        ]);
        let next = accumulate(&previous, &samples, 20);
        assert_eq!(next.net_tx.value(), 15 * 1024 * 20);
        assert_eq!(next.net_rx.value(), 2 * 1024 * 20);
        assert_eq!(next.disk_read_bytes.value(), 0);
        assert_eq!(next.disk_read_iops.value(), 7);
        assert_eq!(next.net_tx.start_time(), start);

        let again = accumulate(&next, &samples, 20);
        assert_eq!(again.net_tx.value(), 2 * 15 * 1024 * 20);
    }

    fn sample_windows() -> impl Strategy<Value = Vec<PerfSamples>> {
        let counter = proptest::sample::select(MONITORED_COUNTERS.to_vec());
        vec(btree_map(counter, vec(-1i64..100_000, 0..12), 0..4), 0..8)
    }

    #[proptest]
    fn proptest_counters_never_decrease(
        #[strategy(sample_windows())] windows: Vec<PerfSamples>,
        #[strategy(1u32..300)] refresh_rate: u32,
    ) {
        let mut counters = CumulativeCounters::new();
        for window in &windows {
            let next = accumulate(&counters, window, refresh_rate);
            prop_assert!(next.dominates(&counters));
            prop_assert_eq!(
                next.net_tx.start_time(),
                counters.net_tx.start_time()
            );
            counters = next;
        }
    }
}
