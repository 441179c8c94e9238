use std::fmt;
use std::time::Duration;

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStatistics {
    /// Operations completed during steady state (after the priming delay).
    pub ops: u64,
    pub elapsed: Duration,
    pub mean_rate: f64,
    pub mean_latency: Option<Duration>,
    pub workers_failed: usize,
    pub buckets: u64,
    pub dropped_samples: u64,
}

impl fmt::Display for RunStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let latency = match self.mean_latency {
            Some(latency) => format!("{:.3}ms", latency.as_secs_f64() * 1e3),
            None => "-".to_string(),
        };
        write!(
            f,
            "{} ops in {:.1}s ({:.1} ops/s, mean {}), {} workers failed, {} buckets, {} samples dropped",
            self.ops,
            self.elapsed.as_secs_f64(),
            self.mean_rate,
            latency,
            self.workers_failed,
            self.buckets,
            self.dropped_samples,
        )
    }
}

/// One line of the once-per-second progress report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickReport {
    pub elapsed: Duration,
    pub rate: f64,
    /// `None` when no operation completed during the tick.
    pub mean_latency: Option<Duration>,
    pub utilization: f64,
    pub workers: usize,
}

impl fmt::Display for TickReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let latency = match self.mean_latency {
            Some(latency) => format!("{:>9.3}ms", latency.as_secs_f64() * 1e3),
            None => format!("{:>11}", "-"),
        };
        write!(
            f,
            "{:>7.1}s {:>10.1} ops/s {} mean {:>5.1}% busy ({} workers)",
            self.elapsed.as_secs_f64(),
            self.rate,
            latency,
            self.utilization,
            self.workers,
        )
    }
}
