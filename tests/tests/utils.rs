use pgslam_core::{MetricsSpec, OpKind, RunConfig, DEFAULT_ROUND_TRIPS};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

#[allow(unused)]
pub fn init() {
    static ONCE_LOCK: OnceLock<()> = OnceLock::new();

    ONCE_LOCK.get_or_init(|| {
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            default_panic(info);
            error!("Panic occurred: {info:?}");
            std::process::exit(1);
        }));

        FmtSubscriber::builder()
            .with_max_level(Level::DEBUG)
            .with_env_filter("pgslam=debug")
            .init();
    });
}

/// Endpoint of the server under test, `PGSLAM_TEST_HOST` or a local CockroachDB.
#[allow(unused)]
pub fn test_host() -> String {
    std::env::var("PGSLAM_TEST_HOST").unwrap_or_else(|_| "localhost:26257".to_string())
}

#[allow(unused)]
pub fn config(op: OpKind, table: &str, dir: &Path) -> RunConfig {
    let var = |name: &str| std::env::var(name).unwrap_or_else(|_| "pgslam".to_string());
    RunConfig {
        database: var("PGSLAM_TEST_DB"),
        hosts: vec![test_host()],
        user: var("PGSLAM_TEST_USER"),
        password: var("PGSLAM_TEST_PASS"),
        op,
        table: table.to_string(),
        column: "name".to_string(),
        join_table: None,
        join_column: None,
        exec: None,
        values: vec![],
        setup: vec![],
        workers: 4,
        nodes: 1,
        duration: Some(Duration::from_secs(5)),
        rate: None,
        worker_rate: None,
        round_trips: DEFAULT_ROUND_TRIPS,
        preload: 0,
        cluster: None,
        metrics: MetricsSpec::new(dir.join(format!("{table}.dat"))),
    }
}
