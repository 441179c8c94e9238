use pgslam_core::{RATE_BUCKETS, RATE_BUCKET_SIZE};
use std::num::NonZeroU32;
use std::time::Duration;

/// Smoothed recent latency of one worker, used to pace it to a target spacing.
///
/// Holds the last [`RATE_BUCKETS`] closed sub-windows of [`RATE_BUCKET_SIZE`] operations each,
/// plus the sub-window still being filled.
#[derive(Debug, Clone)]
pub(crate) struct RateWindow {
    durations: [Duration; RATE_BUCKETS],
    counts: [u64; RATE_BUCKETS],
    next: usize,
    acc_duration: Duration,
    acc_count: u64,
    spacing: Duration,
}

impl RateWindow {
    /// `None` when neither rate is configured, i.e. the worker runs flat out.
    pub fn new(
        rate: Option<NonZeroU32>,
        worker_rate: Option<NonZeroU32>,
        workers: usize,
    ) -> Option<Self> {
        let workers = u64::try_from(workers.max(1)).unwrap_or(u64::MAX);
        let shared = rate.map(|rate| Duration::from_secs(workers) / rate.get());
        let own = worker_rate.map(|rate| Duration::from_secs(1) / rate.get());
        let spacing = shared.into_iter().chain(own).max()?;

        Some(Self {
            durations: [Duration::ZERO; RATE_BUCKETS],
            counts: [0; RATE_BUCKETS],
            next: 0,
            acc_duration: Duration::ZERO,
            acc_count: 0,
            spacing,
        })
    }

    /// Target time between operations.
    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    pub fn record(&mut self, busy: Duration, ops: u64) {
        self.acc_duration += busy;
        self.acc_count += ops;
        if self.acc_count >= RATE_BUCKET_SIZE {
            self.durations[self.next] = std::mem::take(&mut self.acc_duration);
            self.counts[self.next] = std::mem::take(&mut self.acc_count);
            self.next = (self.next + 1) % RATE_BUCKETS;
        }
    }

    /// Mean duration per operation over the closed sub-windows and the open one.
    pub fn average(&self) -> Duration {
        let total: Duration = self.durations.iter().sum::<Duration>() + self.acc_duration;
        let count: u64 = self.counts.iter().sum::<u64>() + self.acc_count;
        match u32::try_from(count) {
            Ok(0) => Duration::ZERO,
            Ok(n) => total / n,
            Err(_) => Duration::from_secs_f64(total.as_secs_f64() / count as f64),
        }
    }

    /// Fold in an iteration of `ops` operations that took `busy`, and return how long to sleep
    /// before the next one. Zero whenever recent latency already exceeds the target spacing.
    pub fn delay(&mut self, busy: Duration, ops: u64) -> Duration {
        self.record(busy, ops);
        let average = self.average();
        if self.spacing > average {
            (self.spacing - average) * u32::try_from(ops.max(1)).unwrap_or(u32::MAX)
        } else {
            Duration::ZERO
        }
    }
}
