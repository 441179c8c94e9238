//! `pgslam` command line runner.
//!
//! Resolves one or more runs from flags and TOML files and executes them back to back against
//! a PostgreSQL-family database.
mod config;

use anyhow::Context;
use clap::Parser;
use config::PartialConfig;
use pgslam::prelude::*;
use pgslam_core::ClusterSpec;
use std::path::PathBuf;
use std::time::Duration;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(version, about = "Rate-limited load generator for PostgreSQL-family databases")]
struct Cli {
    /// TOML config files. Each holds a template and optional `[[configs]]` sweep points.
    files: Vec<PathBuf>,

    #[arg(long)]
    db: Option<String>,

    /// Comma separated `host:port` endpoints.
    #[arg(long, value_delimiter = ',')]
    host: Vec<String>,

    #[arg(long)]
    user: Option<String>,

    #[arg(long)]
    pass: Option<String>,

    #[arg(long)]
    op: Option<OpKind>,

    #[arg(long)]
    table: Option<String>,

    #[arg(long)]
    column: Option<String>,

    /// SQL template for `--op exec`.
    #[arg(long)]
    exec: Option<String>,

    /// Run length, e.g. `30s` or `5m`. `0s` runs until interrupted.
    #[arg(long, value_parser = humantime::parse_duration)]
    dur: Option<Duration>,

    #[arg(long)]
    workers: Option<usize>,

    /// Number of hosts workers are spread over.
    #[arg(long)]
    nodes: Option<usize>,

    /// Aggregate operations per second. `0` disables the limit.
    #[arg(long)]
    rate: Option<u32>,

    /// Operations per second for each worker.
    #[arg(long)]
    worker_rate: Option<u32>,

    /// Rows inserted before the measured loop.
    #[arg(long)]
    preload: Option<u64>,

    /// Start an ephemeral cluster on the hosts over ssh.
    #[arg(long)]
    cluster: bool,

    /// Directory receiving one metrics file per run.
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Print the resolved runs as TOML and exit.
    #[arg(long)]
    print_configs: bool,
}

impl Cli {
    fn overrides(&self) -> PartialConfig {
        PartialConfig {
            database: self.db.clone(),
            hosts: (!self.host.is_empty()).then(|| self.host.clone()),
            user: self.user.clone(),
            password: self.pass.clone(),
            op: self.op,
            table: self.table.clone(),
            column: self.column.clone(),
            exec: self.exec.clone(),
            duration: self.dur,
            workers: self.workers,
            nodes: self.nodes,
            rate: self.rate,
            worker_rate: self.worker_rate,
            preload: self.preload,
            cluster: self.cluster.then(ClusterSpec::default),
            ..Default::default()
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pgslam=info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let configs = config::load(&cli.files, &cli.overrides(), &cli.out_dir)?;

    if cli.print_configs {
        for config in &configs {
            println!("{}", toml::to_string(config)?);
        }
        return Ok(());
    }

    let abort = StopSignal::new();
    tokio::spawn({
        let abort = abort.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping");
                abort.stop();
            }
        }
    });

    let total = configs.len();
    for (index, config) in configs.into_iter().enumerate() {
        if abort.is_stopped() {
            info!("Skipping {} remaining runs", total - index);
            break;
        }

        println!("[{}/{}] {config}", index + 1, total);
        let mut harness = Harness::postgres(&config)
            .with_abort(abort.clone())
            .with_reporter(|report| println!("{report}"));

        let stats = harness
            .run(config)
            .await
            .with_context(|| format!("run {} of {total} failed", index + 1))?;
        println!("{stats}");
    }

    Ok(())
}
