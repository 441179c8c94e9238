//! The run coordinator.
//!
//! A run brings up the optional cluster, prepares the schema, launches the workers and reports
//! throughput once per [`REPORT_INTERVAL`] until the duration elapses, the caller aborts, or
//! every worker has ended. Shutdown always drains the workers, finalizes the metrics and tears
//! the cluster down before the first error (if any) is returned.
use crate::clock::Clock;
use crate::cluster::{Cluster, RemoteExec, SshExec};
use crate::counters::{AggregateCounters, CounterSnapshot};
use crate::db::{Connector, PgConnector};
use crate::error::{RunError, WorkerError};
use crate::metrics::{MetricsPipeline, MetricsReport};
use crate::schema::{Prepare, SchemaPrep};
use crate::shutdown::{StopListener, StopSignal};
use crate::worker::{Worker, WorkerStats};
use pgslam_core::{RunConfig, RunStatistics, TickReport, PRIMING_DELAY, REPORT_INTERVAL};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
#[allow(unused)]
use tracing::{debug, error, info, instrument, trace, warn};

type Reporter = Box<dyn FnMut(&TickReport) + Send + Sync>;
type WorkerHandle = JoinHandle<Result<WorkerStats, WorkerError>>;

pub struct Harness<C, R = SshExec, P = SchemaPrep<C>> {
    connector: C,
    remote: R,
    prep: P,
    abort: StopSignal,
    reporter: Reporter,
}

impl Harness<PgConnector> {
    /// Harness against a real server using the credentials in `config`, with clusters managed
    /// over `ssh`.
    pub fn postgres(config: &RunConfig) -> Self {
        let connector = PgConnector::new(config);
        Self::new(connector.clone(), SshExec::new(), SchemaPrep::new(connector))
    }
}

impl<C, R, P> Harness<C, R, P>
where
    C: Connector,
    R: RemoteExec,
    P: Prepare,
{
    pub fn new(connector: C, remote: R, prep: P) -> Self {
        Self {
            connector,
            remote,
            prep,
            abort: StopSignal::new(),
            reporter: Box::new(|report| info!("{report}")),
        }
    }

    /// Called with every progress line. Defaults to logging it.
    pub fn with_reporter(
        mut self,
        reporter: impl FnMut(&TickReport) + Send + Sync + 'static,
    ) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    /// Use `abort` to end runs early, e.g. from a Ctrl-C handler.
    pub fn with_abort(mut self, abort: StopSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn abort_signal(&self) -> StopSignal {
        self.abort.clone()
    }

    #[instrument(name = "run", skip_all, fields(config = %config))]
    pub async fn run(&mut self, config: RunConfig) -> Result<RunStatistics, RunError> {
        if config.hosts.is_empty() {
            return Err(RunError::NoHosts);
        }
        let config = Arc::new(config);
        let mut abort = self.abort.listener();

        let cluster = match &config.cluster {
            Some(spec) => Some(
                Cluster::start(spec, &config, self.remote.clone(), abort.clone()).await?,
            ),
            None => None,
        };

        let pipeline = match self.setup(&config).await {
            Ok(pipeline) => pipeline,
            Err(err) => {
                if let Some(cluster) = cluster {
                    teardown(cluster, &mut Drain::default()).await;
                }
                return Err(err);
            }
        };

        let clock = Clock::start();
        let counters = Arc::new(AggregateCounters::new());
        let stop = StopSignal::new();
        let mut workers: Vec<WorkerHandle> = (0..config.workers)
            .map(|index| {
                Worker::new(
                    index,
                    config.clone(),
                    self.connector.clone(),
                    clock,
                    counters.clone(),
                    pipeline.sender(),
                    stop.listener(),
                )
                .spawn()
            })
            .collect();
        info!("Started {} workers", workers.len());

        let mut drain = Drain::default();
        let started = self
            .report(&config, &clock, &counters, &mut workers, &mut drain, &mut abort)
            .await;

        stop.stop();
        let stats = finish(&config, started, &counters, workers, pipeline, &mut drain).await;
        if let Some(cluster) = cluster {
            teardown(cluster, &mut drain).await;
        }

        match drain.first {
            Some(err) => Err(err),
            None => Ok(stats),
        }
    }

    async fn setup(&self, config: &RunConfig) -> Result<MetricsPipeline, RunError> {
        self.prep.prepare(config).await?;
        Ok(MetricsPipeline::create(&config.metrics).await?)
    }

    /// Sleep through the priming delay, then report every tick until it is time to stop.
    /// Returns when steady state began.
    async fn report(
        &mut self,
        config: &RunConfig,
        clock: &Clock,
        counters: &AggregateCounters,
        workers: &mut Vec<WorkerHandle>,
        drain: &mut Drain,
        abort: &mut StopListener,
    ) -> Instant {
        tokio::select! {
            _ = tokio::time::sleep(PRIMING_DELAY) => {}
            _ = abort.stopped() => {}
        }
        let started = Instant::now();
        if let Err(err) = counters.reset() {
            drain.note(err);
            return started;
        }
        let duration = config.duration.filter(|d| !d.is_zero());

        let mut timer = Timer::new(REPORT_INTERVAL).await;
        let mut last = CounterSnapshot::default();
        while !abort.is_stopped() {
            let dt = tokio::select! {
                dt = timer.tick() => dt,
                _ = abort.stopped() => break,
            };

            reap(workers, drain).await;
            let read = counters
                .take_idle()
                .and_then(|idle| Ok((idle, counters.snapshot()?)));
            let (idle, now) = match read {
                Ok(read) => read,
                Err(err) => {
                    drain.note(err);
                    break;
                }
            };
            let ops = now.ops.saturating_sub(last.ops);
            let busy = now.busy.saturating_sub(last.busy);
            last = now;

            let capacity = dt.as_secs_f64() * config.workers.max(1) as f64;
            let report = TickReport {
                elapsed: clock.now(),
                rate: ops as f64 / dt.as_secs_f64(),
                mean_latency: mean(busy, ops),
                utilization: ((1. - idle.as_secs_f64() / capacity) * 100.).clamp(0., 100.),
                workers: workers.len(),
            };
            (self.reporter)(&report);

            if workers.is_empty() {
                warn!("Every worker has stopped, ending run early");
                break;
            }
            if duration.is_some_and(|d| clock.now() >= d) {
                break;
            }
        }
        started
    }
}

/// Collects the first error of the shutdown sequence. Later ones are only logged.
#[derive(Default)]
struct Drain {
    first: Option<RunError>,
    failed: usize,
    stats: WorkerStats,
    metrics: MetricsReport,
}

impl Drain {
    fn note(&mut self, err: impl Into<RunError>) {
        let err = err.into();
        if self.first.is_none() {
            self.first = Some(err);
        } else {
            warn!("Additional error during run: {err}");
        }
    }

    fn worker(&mut self, outcome: Result<Result<WorkerStats, WorkerError>, tokio::task::JoinError>) {
        match outcome {
            Ok(Ok(stats)) => {
                self.stats.ops += stats.ops;
                self.stats.busy += stats.busy;
                self.stats.idle += stats.idle;
            }
            Ok(Err(err)) => {
                self.failed += 1;
                self.note(err);
            }
            Err(err) => {
                self.failed += 1;
                self.note(err);
            }
        }
    }

    fn metrics(&mut self, outcome: Result<MetricsReport, crate::MetricsError>) {
        match outcome {
            Ok(report) => self.metrics = report,
            Err(err) => self.note(err),
        }
    }
}

/// Collect every worker that has already ended.
async fn reap(workers: &mut Vec<WorkerHandle>, drain: &mut Drain) {
    let mut live = Vec::with_capacity(workers.len());
    for handle in workers.drain(..) {
        if handle.is_finished() {
            drain.worker(handle.await);
        } else {
            live.push(handle);
        }
    }
    *workers = live;
}

async fn drain_workers(workers: Vec<WorkerHandle>, drain: &mut Drain) {
    for handle in workers {
        drain.worker(handle.await);
    }
}

async fn finish(
    config: &RunConfig,
    started: Instant,
    counters: &AggregateCounters,
    workers: Vec<WorkerHandle>,
    pipeline: MetricsPipeline,
    drain: &mut Drain,
) -> RunStatistics {
    let elapsed = started.elapsed();
    drain_workers(workers, drain).await;
    drain.metrics(pipeline.finish().await);

    let totals = match counters.snapshot() {
        Ok(totals) => totals,
        Err(err) => {
            drain.note(err);
            CounterSnapshot::default()
        }
    };
    let stats = RunStatistics {
        ops: totals.ops,
        elapsed,
        mean_rate: rate(totals.ops, elapsed),
        mean_latency: mean(totals.busy, totals.ops),
        workers_failed: drain.failed,
        buckets: drain.metrics.buckets,
        dropped_samples: drain.metrics.dropped,
    };
    info!(
        "{} ops in {} ({:.1} ops/s over {} workers), {} metrics rows",
        stats.ops,
        humantime::format_duration(round_millis(elapsed)),
        stats.mean_rate,
        config.workers,
        stats.buckets
    );
    debug!(
        "Workers were busy for {} and idle for {} in total",
        humantime::format_duration(round_millis(drain.stats.busy)),
        humantime::format_duration(round_millis(drain.stats.idle))
    );
    stats
}

async fn teardown(cluster: Cluster, drain: &mut Drain) {
    cluster.stop();
    if let Err(err) = cluster.wait().await {
        drain.note(err);
    }
}

fn rate(ops: u64, elapsed: Duration) -> f64 {
    if elapsed.is_zero() {
        0.
    } else {
        ops as f64 / elapsed.as_secs_f64()
    }
}

fn mean(busy: Duration, ops: u64) -> Option<Duration> {
    match u32::try_from(ops) {
        Ok(0) => None,
        Ok(n) => Some(busy / n),
        Err(_) => Some(Duration::from_secs_f64(busy.as_secs_f64() / ops as f64)),
    }
}

fn round_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

/// Fixed-period ticker that reports the actual time between ticks.
struct Timer {
    interval: Interval,
    last_tick: Instant,
}

impl Timer {
    async fn new(period: Duration) -> Self {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // NOTE: First tick completes instantly
        let last_tick = interval.tick().await;
        Self {
            interval,
            last_tick,
        }
    }

    async fn tick(&mut self) -> Duration {
        let next = self.interval.tick().await;
        let elapsed = next.duration_since(self.last_tick);
        self.last_tick = next;
        elapsed
    }
}
