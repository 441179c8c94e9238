use std::time::Duration;

/// Closed sub-windows kept by each worker's rate window.
pub const RATE_BUCKETS: usize = 10;

/// Operations folded into one rate window sub-window before it closes.
pub const RATE_BUCKET_SIZE: u64 = 10;

/// Default width of one metrics bucket.
pub const DEFAULT_BUCKET_WINDOW: Duration = Duration::from_secs(1);

/// How far (in bucket widths) the watermark must run ahead before a window is closed.
pub const DEFAULT_PROCESS_WINDOW_FACTOR: u32 = 5;

/// Warm-up period discarded from the live throughput report.
pub const PRIMING_DELAY: Duration = Duration::from_secs(2);

pub const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Delay between starting consecutive cluster nodes so they don't all hit the seed node at once.
pub const NODE_STAGGER: Duration = Duration::from_secs(1);

pub const MAX_START_JITTER: Duration = Duration::from_millis(1000);

/// Node HTTP ports sit this far below their SQL listen port.
pub const HTTP_PORT_OFFSET: u16 = 10_000;

/// Samples above the latency at this quantile make up a bucket's tail.
pub const TAIL_QUANTILE: f64 = 0.9;

pub const DEFAULT_ROUND_TRIPS: usize = 10;

pub const DEFAULT_CLUSTER_BINARY: &str = "cockroach";

/// Row ids fetched into a worker's working set.
pub const WORKING_SET_LIMIT: usize = 10_000;

/// Rows inserted per preload statement.
pub const PRELOAD_BATCH: u64 = 10_000;

/// Samples buffered by a worker before they are sent to the metrics pipeline.
pub const SAMPLE_BATCH_SIZE: usize = 64;

pub const SAMPLE_FLUSH_INTERVAL: Duration = Duration::from_millis(100);
