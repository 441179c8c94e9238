use crate::TAIL_QUANTILE;
use std::fmt;
use std::time::Duration;

/// Latency of one completed operation.
///
/// `time` is when the operation started, as an offset from the run's clock origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub time: Duration,
    pub latency: Duration,
}

impl Sample {
    pub fn new(time: Duration, latency: Duration) -> Self {
        Self { time, latency }
    }
}

/// Closed time slice `[start, start + width)` of samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub start: Duration,
    pub width: Duration,
    pub samples: Vec<Sample>,
}

impl Bucket {
    pub fn end(&self) -> Duration {
        self.start + self.width
    }

    pub fn contains(&self, time: Duration) -> bool {
        time >= self.start && time < self.end()
    }

    /// Reduce the bucket to the row written to the metrics sink.
    ///
    /// The tail is every sample strictly slower than the one at index `floor(0.9 * n)` once
    /// sorted by latency, so for small buckets the tail is usually empty and reported as zero.
    pub fn summarize(mut self, origin: Duration) -> BucketSummary {
        let elapsed = self.start.saturating_sub(origin);
        let count = self.samples.len();
        if count == 0 {
            return BucketSummary {
                elapsed,
                count,
                mean: Duration::ZERO,
                tail_mean: Duration::ZERO,
            };
        }

        self.samples.sort_unstable_by_key(|s| s.latency);

        let threshold_idx = (count as f64 * TAIL_QUANTILE) as usize;
        let threshold = self.samples[threshold_idx.min(count - 1)].latency;

        let total: Duration = self.samples.iter().map(|s| s.latency).sum();
        let (tail_total, tail_count) = self
            .samples
            .iter()
            .filter(|s| s.latency > threshold)
            .fold((Duration::ZERO, 0usize), |(sum, n), s| (sum + s.latency, n + 1));

        BucketSummary {
            elapsed,
            count,
            mean: mean(total, count),
            tail_mean: mean(tail_total, tail_count),
        }
    }
}

fn mean(total: Duration, count: usize) -> Duration {
    match u32::try_from(count) {
        Ok(0) => Duration::ZERO,
        Ok(n) => total / n,
        Err(_) => Duration::from_secs_f64(total.as_secs_f64() / count as f64),
    }
}

/// One metrics row: `elapsedSeconds meanLatency tailMeanLatency`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSummary {
    pub elapsed: Duration,
    pub count: usize,
    pub mean: Duration,
    pub tail_mean: Duration,
}

impl fmt::Display for BucketSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.6} {:.6} {:.6}",
            self.elapsed.as_secs_f64(),
            self.mean.as_secs_f64(),
            self.tail_mean.as_secs_f64(),
        )
    }
}
