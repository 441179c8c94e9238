//! The worker engine: one task per database session, issuing operations under rate control.
//!
//! Each worker moves through `Connecting -> Warming -> Priming -> Looping -> Stopped`. Any error
//! is fatal to that worker only; nothing is retried.
mod operation;
mod rate_window;

use crate::clock::Clock;
use crate::counters::AggregateCounters;
use crate::db::{Connection, Connector, SqlValue};
use crate::debug::debug_sql;
use crate::error::WorkerError;
use crate::shutdown::StopListener;
use async_channel::Sender;
use operation::{OpState, Plan, ValueGen};
use pgslam_core::{
    RunConfig, Sample, MAX_START_JITTER, PRELOAD_BATCH, SAMPLE_BATCH_SIZE, SAMPLE_FLUSH_INTERVAL,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rate_window::RateWindow;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
#[allow(unused)]
use tracing::{debug, error, info, instrument, trace, warn};

/// Totals for one worker, reported when it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub ops: u64,
    pub busy: Duration,
    pub idle: Duration,
}

pub struct Worker<C> {
    index: usize,
    config: Arc<RunConfig>,
    connector: C,
    clock: Clock,
    counters: Arc<AggregateCounters>,
    samples: Sender<Vec<Sample>>,
    stop: StopListener,
}

impl<C: Connector> Worker<C> {
    pub fn new(
        index: usize,
        config: Arc<RunConfig>,
        connector: C,
        clock: Clock,
        counters: Arc<AggregateCounters>,
        samples: Sender<Vec<Sample>>,
        stop: StopListener,
    ) -> Self {
        Self {
            index,
            config,
            connector,
            clock,
            counters,
            samples,
            stop,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<WorkerStats, WorkerError>> {
        tokio::spawn(self.run())
    }

    #[instrument(name = "worker", skip_all, fields(index = self.index))]
    pub async fn run(mut self) -> Result<WorkerStats, WorkerError> {
        let result = self.phases().await;
        match &result {
            Ok(stats) => debug!(
                "Stopped after {} ops ({} busy, {} idle)",
                stats.ops,
                humantime::format_duration(stats.busy),
                humantime::format_duration(stats.idle)
            ),
            Err(err) => {
                error!("{err}");
                #[cfg(feature = "metrics")]
                metrics::counter!("pgslam_worker_errors").increment(1);
            }
        }
        result
    }

    async fn phases(&mut self) -> Result<WorkerStats, WorkerError> {
        let endpoint = self
            .config
            .endpoint(self.index)
            .ok_or(WorkerError::NoHost(self.index))?
            .to_string();
        let mut conn = self
            .connector
            .connect(&endpoint)
            .await
            .map_err(|source| WorkerError::Connect {
                worker: self.index,
                endpoint: endpoint.clone(),
                source,
            })?;
        debug!("Connected to {endpoint}");

        let mut rng = StdRng::from_entropy();
        let jitter = Duration::from_millis(rng.gen_range(0..=MAX_START_JITTER.as_millis() as u64));
        self.pause(jitter).await;

        let plan = Plan::new(&self.config)?;
        let mut state = OpState {
            worker: self.index,
            iteration: 0,
            ids: vec![],
            values: ValueGen::new(&self.config.values),
            rng,
            table: self.config.table.clone(),
        };

        self.preload(&mut conn, &plan.rows.preload).await?;
        if self.stop.is_stopped() {
            return Ok(WorkerStats::default());
        }
        plan.prime(&mut conn, &mut state).await?;

        let mut batch = SampleBatch::new(self.samples.clone());
        let result = self.looping(&mut conn, &plan, &mut state, &mut batch).await;
        batch.flush();
        result
    }

    /// Bulk insert this worker's share of the preload rows.
    async fn preload<Conn: Connection>(
        &mut self,
        conn: &mut Conn,
        sql: &str,
    ) -> Result<(), WorkerError> {
        let workers = self.config.workers.max(1) as u64;
        let index = self.index as u64;
        let share = self.config.preload / workers + u64::from(index < self.config.preload % workers);
        if share == 0 {
            return Ok(());
        }

        let started = Instant::now();
        let mut remaining = share;
        let mut batch = 0u64;
        while remaining > 0 && !self.stop.is_stopped() {
            let n = remaining.min(PRELOAD_BATCH);
            let params = [
                SqlValue::Text(format!("preload {index} batch {batch} row ")),
                SqlValue::Int(n as i64),
            ];
            trace!("{}", debug_sql(sql, &params));
            conn.execute(sql, &params)
                .await
                .map_err(|source| WorkerError::Operation {
                    worker: self.index,
                    source,
                })?;
            remaining -= n;
            batch += 1;
        }
        info!(
            "Preloaded {} rows in {}",
            share - remaining,
            humantime::format_duration(started.elapsed())
        );
        Ok(())
    }

    async fn looping<Conn: Connection>(
        &mut self,
        conn: &mut Conn,
        plan: &Plan,
        state: &mut OpState,
        batch: &mut SampleBatch,
    ) -> Result<WorkerStats, WorkerError> {
        let mut window = RateWindow::new(
            self.config.rate,
            self.config.worker_rate,
            self.config.workers,
        );
        if let Some(window) = &window {
            debug!(
                "Pacing to one operation every {}",
                humantime::format_duration(window.spacing())
            );
        }
        let mut stats = WorkerStats::default();

        while !self.stop.is_stopped() {
            let time = self.clock.now();
            let started = Instant::now();
            let ops = plan.run(conn, state).await?;
            let latency = started.elapsed();

            self.counters.record(ops, latency)?;
            stats.ops += ops;
            stats.busy += latency;
            batch.push(Sample::new(time, latency));

            #[cfg(feature = "metrics")]
            {
                metrics::histogram!("pgslam_op_latency").record(latency.as_secs_f64());
                metrics::counter!("pgslam_ops").increment(ops);
            }

            let Some(window) = window.as_mut() else {
                continue;
            };
            let delay = window.delay(latency, ops);
            if !delay.is_zero() {
                let slept = self.pause(delay).await;
                self.counters.record_idle(slept)?;
                stats.idle += slept;
            }
        }

        Ok(stats)
    }

    /// Sleep for `delay` or until stopped, returning how long was actually slept.
    async fn pause(&mut self, delay: Duration) -> Duration {
        let started = Instant::now();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.stop.stopped() => {}
        }
        started.elapsed()
    }
}

/// Buffers a worker's samples so the pipeline queue sees a handful of sends per second rather
/// than one per operation.
struct SampleBatch {
    tx: Sender<Vec<Sample>>,
    samples: Vec<Sample>,
    last_flush: Instant,
}

impl SampleBatch {
    fn new(tx: Sender<Vec<Sample>>) -> Self {
        Self {
            tx,
            samples: Vec::with_capacity(SAMPLE_BATCH_SIZE),
            last_flush: Instant::now(),
        }
    }

    fn push(&mut self, sample: Sample) {
        self.samples.push(sample);
        if self.samples.len() >= SAMPLE_BATCH_SIZE
            || self.last_flush.elapsed() >= SAMPLE_FLUSH_INTERVAL
        {
            self.flush();
        }
    }

    fn flush(&mut self) {
        self.last_flush = Instant::now();
        if self.samples.is_empty() {
            return;
        }
        let samples = std::mem::replace(&mut self.samples, Vec::with_capacity(SAMPLE_BATCH_SIZE));
        if self.tx.try_send(samples).is_err() {
            debug!("Metrics pipeline closed, dropping samples");
        }
    }
}
