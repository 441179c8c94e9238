use crate::error::MetricsError;
use async_channel::Receiver;
use pgslam_core::Bucket;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

/// Write one `elapsed mean tail_mean` row per bucket, in arrival order, until the queue closes.
///
/// Elapsed time is measured from the first bucket's window start. Returns the number of rows.
pub(crate) async fn write_buckets<W>(buckets: Receiver<Bucket>, sink: W) -> Result<u64, MetricsError>
where
    W: AsyncWrite + Unpin,
{
    let mut sink = BufWriter::new(sink);
    let mut origin = None;
    let mut rows = 0;

    while let Ok(bucket) = buckets.recv().await {
        let origin = *origin.get_or_insert(bucket.start);
        let summary = bucket.summarize(origin);
        trace!(
            "Bucket at {:.3}s: {} samples",
            summary.elapsed.as_secs_f64(),
            summary.count
        );
        sink.write_all(format!("{summary}\n").as_bytes()).await?;
        rows += 1;
    }

    sink.flush().await?;
    sink.shutdown().await?;
    Ok(rows)
}
