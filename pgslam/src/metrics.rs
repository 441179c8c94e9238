//! Streaming latency aggregation.
//!
//! Workers send batches of [`Sample`]s into an unbounded queue. A bucketizer task groups them
//! into time windows and hands closed [`Bucket`]s to a writer task, which
//! appends one summary row per bucket to the sink.
mod bucketizer;
mod writer;

use crate::error::MetricsError;
use async_channel::{Receiver, Sender};
use bucketizer::Bucketizer;
use pgslam_core::{Bucket, MetricsSpec, Sample};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

/// Outcome of a finished pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsReport {
    /// Rows written to the sink.
    pub buckets: u64,
    /// Samples that arrived after their window had been closed.
    pub dropped: u64,
}

pub struct MetricsPipeline {
    samples: Sender<Vec<Sample>>,
    bucketizer: JoinHandle<u64>,
    writer: JoinHandle<Result<u64, MetricsError>>,
}

impl MetricsPipeline {
    /// Start a pipeline writing to the file named by `spec`, creating parent directories.
    pub async fn create(spec: &MetricsSpec) -> Result<Self, MetricsError> {
        if let Some(parent) = spec.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&spec.path).await?;
        debug!("Writing metrics to {}", spec.path.display());
        Ok(Self::start(file, spec.bucket_window, spec.process_window))
    }

    pub fn start<W>(sink: W, width: Duration, process_window: Duration) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (samples, sample_rx) = async_channel::unbounded();
        let (bucket_tx, bucket_rx) = async_channel::unbounded();

        let bucketizer = tokio::spawn(bucketize(
            sample_rx,
            bucket_tx,
            Bucketizer::new(width, process_window),
        ));
        let writer = tokio::spawn(writer::write_buckets(bucket_rx, sink));

        Self {
            samples,
            bucketizer,
            writer,
        }
    }

    /// Ingestion handle for workers.
    pub fn sender(&self) -> Sender<Vec<Sample>> {
        self.samples.clone()
    }

    /// Close the ingestion queue, flush every remaining window and wait for the sink to close.
    pub async fn finish(self) -> Result<MetricsReport, MetricsError> {
        self.samples.close();
        let dropped = self.bucketizer.await?;
        let buckets = self.writer.await??;
        if dropped > 0 {
            warn!("Dropped {dropped} late samples");
        }
        Ok(MetricsReport { buckets, dropped })
    }
}

async fn bucketize(
    samples: Receiver<Vec<Sample>>,
    buckets: Sender<Bucket>,
    mut bucketizer: Bucketizer,
) -> u64 {
    while let Ok(batch) = samples.recv().await {
        for sample in batch {
            bucketizer.push(sample);
        }
        for bucket in bucketizer.drain_ready() {
            // The writer only hangs up after failing, and reports that failure itself.
            if buckets.send(bucket).await.is_err() {
                debug!("Metrics writer stopped, no longer bucketing samples");
                return bucketizer.dropped();
            }
        }
    }

    for bucket in bucketizer.finish() {
        if buckets.send(bucket).await.is_err() {
            break;
        }
    }
    bucketizer.dropped()
}
