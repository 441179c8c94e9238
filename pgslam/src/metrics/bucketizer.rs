use pgslam_core::{Bucket, Sample};
use std::time::Duration;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

/// Groups an unordered stream of samples into consecutive, width-aligned time windows.
///
/// A window `[start, start + width)` is closed once the newest timestamp seen (the watermark)
/// runs more than `process_window + width` past `start`. Samples older than the oldest open
/// window are dropped and counted.
#[derive(Debug)]
pub(crate) struct Bucketizer {
    width: Duration,
    process_window: Duration,
    buffer: Vec<Sample>,
    sorted: bool,
    watermark: Duration,
    start: Option<Duration>,
    emitted: bool,
    dropped: u64,
}

impl Bucketizer {
    pub fn new(width: Duration, process_window: Duration) -> Self {
        Self {
            width: width.max(Duration::from_nanos(1)),
            process_window,
            buffer: vec![],
            sorted: true,
            watermark: Duration::ZERO,
            start: None,
            emitted: false,
            dropped: 0,
        }
    }

    pub fn push(&mut self, sample: Sample) {
        let start = *self.start.get_or_insert_with(|| {
            let aligned = align(sample.time, self.width);
            aligned.saturating_sub(self.width)
        });

        if sample.time < start {
            self.dropped += 1;
            warn!(
                "Dropping sample from {:?}, its window starting at {:?} is already closed",
                sample.time, start
            );
            return;
        }

        if sample.time > self.watermark {
            self.watermark = sample.time;
        } else {
            self.sorted = false;
        }
        self.buffer.push(sample);
    }

    /// Close every window the watermark has moved far enough past.
    pub fn drain_ready(&mut self) -> Vec<Bucket> {
        let mut buckets = vec![];
        while let Some(start) = self.start {
            if self.watermark.saturating_sub(start) <= self.process_window + self.width {
                break;
            }
            buckets.extend(self.cut());
        }
        buckets
    }

    /// Close every remaining window. Called once the input is exhausted.
    pub fn finish(&mut self) -> Vec<Bucket> {
        let mut buckets = vec![];
        while !self.buffer.is_empty() {
            buckets.extend(self.cut());
        }
        buckets
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Slice the window at the cursor out of the buffer and advance the cursor. Empty windows
    /// before the first non-empty one are skipped.
    fn cut(&mut self) -> Option<Bucket> {
        let start = self.start?;
        if !self.sorted {
            self.buffer.sort_unstable_by_key(|s| s.time);
            self.sorted = true;
        }

        let end = start + self.width;
        let split = self.buffer.partition_point(|s| s.time < end);
        let samples: Vec<Sample> = self.buffer.drain(..split).collect();
        self.start = Some(end);

        if samples.is_empty() && !self.emitted {
            return None;
        }
        self.emitted = true;
        trace!("Closing window at {start:?} with {} samples", samples.len());

        Some(Bucket {
            start,
            width: self.width,
            samples,
        })
    }
}

fn align(time: Duration, width: Duration) -> Duration {
    let width_nanos = width.as_nanos();
    let windows = time.as_nanos() / width_nanos;
    let nanos = windows * width_nanos;
    Duration::new(
        (nanos / 1_000_000_000) as u64,
        (nanos % 1_000_000_000) as u32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    const SEC: Duration = Duration::from_secs(1);

    fn at(millis: u64) -> Sample {
        Sample::new(Duration::from_millis(millis), Duration::from_millis(1))
    }

    fn times(bucket: &Bucket) -> Vec<u64> {
        bucket
            .samples
            .iter()
            .map(|s| s.time.as_millis() as u64)
            .collect()
    }

    #[test]
    fn reordered_arrivals_land_in_their_windows() {
        let mut bucketizer = Bucketizer::new(SEC, 5 * SEC);
        for millis in [100, 200, 1_100, 900, 1_900] {
            bucketizer.push(at(millis));
        }
        assert!(bucketizer.drain_ready().is_empty());

        let buckets = bucketizer.finish();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].start, Duration::ZERO);
        assert_eq!(times(&buckets[0]), vec![100, 200, 900]);
        assert_eq!(buckets[1].start, SEC);
        assert_eq!(times(&buckets[1]), vec![1_100, 1_900]);
    }

    #[test]
    fn windows_close_once_the_watermark_is_far_enough_ahead() {
        let mut bucketizer = Bucketizer::new(SEC, 2 * SEC);
        bucketizer.push(at(3_500));
        bucketizer.push(at(4_200));
        // Cursor starts one width early, at 2s. Nothing is ready until the watermark passes 5s.
        bucketizer.push(at(5_000));
        assert!(bucketizer.drain_ready().is_empty());

        bucketizer.push(at(6_100));
        let buckets = bucketizer.drain_ready();
        // [2s, 3s) is empty and leading, so only [3s, 4s) comes out.
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].start, 3 * SEC);
        assert_eq!(times(&buckets[0]), vec![3_500]);

        let rest = bucketizer.finish();
        let starts: Vec<_> = rest.iter().map(|b| b.start.as_secs()).collect();
        assert_eq!(starts, vec![4, 5, 6]);
    }

    #[test]
    fn gaps_produce_empty_buckets() {
        let mut bucketizer = Bucketizer::new(SEC, 5 * SEC);
        bucketizer.push(at(500));
        bucketizer.push(at(3_500));
        let buckets = bucketizer.finish();
        let sizes: Vec<_> = buckets.iter().map(|b| b.samples.len()).collect();
        assert_eq!(sizes, vec![1, 0, 0, 1]);
    }

    #[tracing_test::traced_test]
    #[test]
    fn late_samples_are_dropped() {
        let mut bucketizer = Bucketizer::new(SEC, SEC);
        bucketizer.push(at(2_000));
        bucketizer.push(at(5_000));
        let closed = bucketizer.drain_ready();
        assert!(!closed.is_empty());

        bucketizer.push(at(1_500));
        assert_eq!(bucketizer.dropped(), 1);
        assert!(logs_contain("Dropping sample"));

        let all: usize = closed
            .iter()
            .chain(bucketizer.finish().iter())
            .map(|b| b.samples.len())
            .sum();
        assert_eq!(all, 2);
    }

    #[test]
    fn every_sample_is_bucketed_or_dropped() {
        let mut rng = SmallRng::seed_from_u64(42);
        let mut samples: Vec<Sample> = (0..5_000)
            .map(|_| at(rng.gen_range(10_000..40_000)))
            .collect();
        // Roughly time ordered with local disorder, the way batches from many workers arrive.
        samples.sort_by_key(|s| s.time);
        for chunk in samples.chunks_mut(200) {
            chunk.shuffle(&mut rng);
        }

        let mut bucketizer = Bucketizer::new(SEC, 2 * SEC);
        let mut buckets = vec![];
        for chunk in samples.chunks(64) {
            for sample in chunk {
                bucketizer.push(*sample);
            }
            buckets.extend(bucketizer.drain_ready());
        }
        buckets.extend(bucketizer.finish());

        let bucketed: usize = buckets.iter().map(|b| b.samples.len()).sum();
        assert_eq!(bucketed as u64 + bucketizer.dropped(), samples.len() as u64);
        for bucket in &buckets {
            assert!(bucket.samples.iter().all(|s| bucket.contains(s.time)));
        }
        for pair in buckets.windows(2) {
            assert_eq!(pair[1].start, pair[0].start + SEC);
        }
    }

    #[test]
    fn alignment() {
        assert_eq!(align(Duration::from_millis(2_750), SEC), 2 * SEC);
        assert_eq!(
            align(Duration::from_millis(2_750), Duration::from_millis(500)),
            Duration::from_millis(2_500)
        );
    }
}
