mod utils;
#[allow(unused)]
use utils::*;

#[cfg(feature = "integration")]
mod tests {
    use super::*;

    use pgslam::prelude::*;
    use std::num::NonZeroU32;
    use std::time::Duration;

    #[tokio::test]
    #[ntest::timeout(60_000)]
    async fn unlimited_inserts() {
        init();
        let dir = tempfile::tempdir().unwrap();
        let config = config(OpKind::Insert, "pgslam_insert", dir.path());
        let path = config.metrics.path.clone();

        let stats = Harness::postgres(&config).run(config).await.unwrap();

        assert!(stats.ops > 0);
        assert_eq!(stats.workers_failed, 0);
        assert!(stats.buckets > 0);

        let rows = tokio::fs::read_to_string(path).await.unwrap();
        assert!(rows.lines().count() as u64 <= stats.buckets);
        assert!(rows.lines().all(|l| l.split(' ').count() == 3));
    }

    #[tokio::test]
    #[ntest::timeout(60_000)]
    async fn rate_limited_updates_after_preload() {
        init();
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(OpKind::Update, "pgslam_update", dir.path());
        config.preload = 2_000;
        config.rate = NonZeroU32::new(200);
        config.duration = Some(Duration::from_secs(8));

        let stats = Harness::postgres(&config).run(config).await.unwrap();

        assert_eq!(stats.workers_failed, 0);
        assert!(stats.mean_rate <= 220., "rate {}", stats.mean_rate);
        assert!(stats.mean_rate >= 150., "rate {}", stats.mean_rate);
    }

    #[tokio::test]
    #[ntest::timeout(60_000)]
    async fn sequence_reads_back_its_writes() {
        init();
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(OpKind::Sequence, "pgslam_sequence", dir.path());
        config.round_trips = 3;
        config.workers = 2;

        let stats = Harness::postgres(&config).run(config).await.unwrap();

        assert_eq!(stats.workers_failed, 0);
        assert!(stats.ops > 0);
    }

    #[tokio::test]
    #[ntest::timeout(60_000)]
    async fn joins_against_secondary_table() {
        init();
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(OpKind::Join, "pgslam_join", dir.path());
        config.join_table = Some("pgslam_join_ref".to_string());
        config.join_column = Some("parent".to_string());
        config.preload = 500;
        config.duration = Some(Duration::from_secs(3));

        let stats = Harness::postgres(&config).run(config).await.unwrap();

        assert_eq!(stats.workers_failed, 0);
        assert!(stats.ops > 0);
    }

    #[tokio::test]
    #[ntest::timeout(60_000)]
    async fn abort_ends_unbounded_run() {
        init();
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(OpKind::Insert, "pgslam_abort", dir.path());
        config.duration = None;

        let abort = StopSignal::new();
        let mut harness = Harness::postgres(&config).with_abort(abort.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(4)).await;
            abort.stop();
        });

        let stats = harness.run(config).await.unwrap();
        assert!(stats.elapsed < Duration::from_secs(10));
    }
}
