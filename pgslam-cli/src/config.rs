use pgslam_core::{
    parse_endpoint, ClusterSpec, MetricsSpec, OpKind, RunConfig, ValueSpec, DEFAULT_BUCKET_WINDOW,
    DEFAULT_PROCESS_WINDOW_FACTOR, DEFAULT_ROUND_TRIPS, HTTP_PORT_OFFSET,
};
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::num::{NonZeroU32, NonZeroUsize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

/// Port appended to hosts given without one.
pub const DEFAULT_PORT: u16 = 26257;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("No hosts configured")]
    NoHosts,

    #[error("Invalid host {0:?}, expected host:port")]
    InvalidHost(String),

    #[error("At least one worker is required")]
    NoWorkers,

    #[error("{nodes} nodes requested but only {hosts} hosts configured")]
    TooFewHosts { nodes: usize, hosts: usize },

    #[error("Operation `exec` needs an `exec` SQL template")]
    MissingExec,

    #[error("Operation `join` needs `join_table` and `join_column`")]
    MissingJoin,

    #[error("Managed node {0} must listen on port 10000 or above")]
    LowPort(String),

    #[error("Cannot vary unknown field {0:?}")]
    UnknownVary(String),
}

/// One layer of run parameters. Unset fields fall through to the next layer.
#[serde_as]
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PartialConfig {
    pub database: Option<String>,
    pub hosts: Option<Vec<String>>,
    pub user: Option<String>,
    pub password: Option<String>,

    pub op: Option<OpKind>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub join_table: Option<String>,
    pub join_column: Option<String>,
    pub exec: Option<String>,
    pub values: Option<Vec<ValueSpec>>,
    pub setup: Option<Vec<String>>,

    pub workers: Option<usize>,
    pub nodes: Option<usize>,
    /// Zero means run until interrupted.
    #[serde_as(as = "Option<DurationSeconds>")]
    pub duration: Option<Duration>,
    /// Zero disables the limit.
    pub rate: Option<u32>,
    pub worker_rate: Option<u32>,
    pub round_trips: Option<usize>,
    pub preload: Option<u64>,

    pub cluster: Option<ClusterSpec>,
    #[serde_as(as = "Option<DurationSeconds>")]
    pub bucket_window: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds>")]
    pub process_window: Option<Duration>,

    /// Field swept by a file's `[[configs]]`, used to label metrics files.
    pub vary: Option<String>,
}

impl PartialConfig {
    pub fn defaults() -> Self {
        let workers = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);

        Self {
            database: Some("pgslam".to_string()),
            hosts: Some(vec![format!("localhost:{DEFAULT_PORT}")]),
            user: Some("pgslam".to_string()),
            password: Some("pgslam".to_string()),
            op: Some(OpKind::Insert),
            table: Some("pgslam".to_string()),
            column: Some("name".to_string()),
            workers: Some(workers),
            duration: Some(Duration::from_secs(10)),
            rate: Some(100),
            round_trips: Some(DEFAULT_ROUND_TRIPS),
            preload: Some(0),
            bucket_window: Some(DEFAULT_BUCKET_WINDOW),
            ..Default::default()
        }
    }

    /// Fill every field left unset in `self` from `lower`.
    pub fn or(self, lower: PartialConfig) -> Self {
        Self {
            database: self.database.or(lower.database),
            hosts: self.hosts.or(lower.hosts),
            user: self.user.or(lower.user),
            password: self.password.or(lower.password),
            op: self.op.or(lower.op),
            table: self.table.or(lower.table),
            column: self.column.or(lower.column),
            join_table: self.join_table.or(lower.join_table),
            join_column: self.join_column.or(lower.join_column),
            exec: self.exec.or(lower.exec),
            values: self.values.or(lower.values),
            setup: self.setup.or(lower.setup),
            workers: self.workers.or(lower.workers),
            nodes: self.nodes.or(lower.nodes),
            duration: self.duration.or(lower.duration),
            rate: self.rate.or(lower.rate),
            worker_rate: self.worker_rate.or(lower.worker_rate),
            round_trips: self.round_trips.or(lower.round_trips),
            preload: self.preload.or(lower.preload),
            cluster: self.cluster.or(lower.cluster),
            bucket_window: self.bucket_window.or(lower.bucket_window),
            process_window: self.process_window.or(lower.process_window),
            vary: self.vary.or(lower.vary),
        }
    }

    /// Apply the built-in defaults and validate, producing the `index`th run of the session.
    pub fn resolve(self, index: usize, out_dir: &Path) -> Result<RunConfig, ConfigError> {
        let merged = self.or(Self::defaults());

        let hosts: Vec<String> = merged
            .hosts
            .unwrap_or_default()
            .into_iter()
            .map(with_default_port)
            .collect();
        if hosts.is_empty() {
            return Err(ConfigError::NoHosts);
        }
        if let Some(bad) = hosts.iter().find(|h| parse_endpoint(h).is_none()) {
            return Err(ConfigError::InvalidHost(bad.clone()));
        }

        let workers = merged.workers.unwrap_or_default();
        if workers == 0 {
            return Err(ConfigError::NoWorkers);
        }

        let nodes = match merged.nodes {
            Some(0) | None => hosts.len(),
            Some(nodes) if nodes > hosts.len() => {
                return Err(ConfigError::TooFewHosts {
                    nodes,
                    hosts: hosts.len(),
                })
            }
            Some(nodes) => nodes,
        };

        let op = merged.op.unwrap_or_default();
        if op == OpKind::Exec && merged.exec.is_none() {
            return Err(ConfigError::MissingExec);
        }
        if op == OpKind::Join && (merged.join_table.is_none() || merged.join_column.is_none()) {
            return Err(ConfigError::MissingJoin);
        }

        if merged.cluster.is_some() {
            for host in &hosts[..nodes] {
                match parse_endpoint(host) {
                    Some((_, port)) if port >= HTTP_PORT_OFFSET => {}
                    _ => return Err(ConfigError::LowPort(host.clone())),
                }
            }
        }

        let bucket_window = merged.bucket_window.unwrap_or(DEFAULT_BUCKET_WINDOW);
        let process_window = merged
            .process_window
            .unwrap_or(bucket_window * DEFAULT_PROCESS_WINDOW_FACTOR);

        let mut config = RunConfig {
            database: merged.database.unwrap_or_default(),
            hosts,
            user: merged.user.unwrap_or_default(),
            password: merged.password.unwrap_or_default(),
            op,
            table: merged.table.unwrap_or_default(),
            column: merged.column.unwrap_or_default(),
            join_table: merged.join_table,
            join_column: merged.join_column,
            exec: merged.exec,
            values: merged.values.unwrap_or_default(),
            setup: merged.setup.unwrap_or_default(),
            workers,
            nodes,
            duration: merged.duration.filter(|d| !d.is_zero()),
            rate: merged.rate.and_then(NonZeroU32::new),
            worker_rate: merged.worker_rate.and_then(NonZeroU32::new),
            round_trips: merged.round_trips.unwrap_or(DEFAULT_ROUND_TRIPS),
            preload: merged.preload.unwrap_or_default(),
            cluster: merged.cluster,
            metrics: MetricsSpec {
                path: PathBuf::new(),
                bucket_window,
                process_window,
            },
        };

        let file = match merged.vary {
            Some(field) => {
                let value = vary_value(&config, &field)
                    .ok_or_else(|| ConfigError::UnknownVary(field.clone()))?;
                format!("{index}-{field}-{}.dat", sanitize(&value))
            }
            None => format!("{index}.dat"),
        };
        config.metrics.path = out_dir.join(file);

        Ok(config)
    }
}

fn with_default_port(host: String) -> String {
    if host.contains(':') {
        host
    } else {
        format!("{host}:{DEFAULT_PORT}")
    }
}

fn vary_value(config: &RunConfig, field: &str) -> Option<String> {
    let value = match field {
        "database" => config.database.clone(),
        "op" => config.op.to_string(),
        "table" => config.table.clone(),
        "column" => config.column.clone(),
        "workers" => config.workers.to_string(),
        "nodes" => config.nodes.to_string(),
        "duration" => config
            .duration
            .map(|d| humantime::format_duration(d).to_string())
            .unwrap_or_else(|| "unbounded".to_string()),
        "rate" => config.rate.map_or(0, NonZeroU32::get).to_string(),
        "worker_rate" => config.worker_rate.map_or(0, NonZeroU32::get).to_string(),
        "round_trips" => config.round_trips.to_string(),
        "preload" => config.preload.to_string(),
        _ => return None,
    };
    Some(value)
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}

/// A TOML config file: a template plus optional sweep points.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(flatten)]
    pub template: PartialConfig,
    #[serde(default)]
    pub configs: Vec<PartialConfig>,
}

impl ConfigFile {
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// One layer per sweep point, each backed by the template. No points means one run.
    pub fn expand(self) -> Vec<PartialConfig> {
        if self.configs.is_empty() {
            return vec![self.template];
        }
        let template = self.template;
        self.configs
            .into_iter()
            .map(|point| point.or(template.clone()))
            .collect()
    }
}

/// Resolve every run of the session, in order.
///
/// `overrides` (the explicit command line flags) win over every file layer. Without files the
/// flags alone describe a single run.
pub fn load(
    files: &[PathBuf],
    overrides: &PartialConfig,
    out_dir: &Path,
) -> Result<Vec<RunConfig>, ConfigError> {
    let mut layers = vec![];
    if files.is_empty() {
        layers.push(overrides.clone());
    }
    for path in files {
        let file = ConfigFile::read(path)?;
        debug!("Loaded {} ({} sweep points)", path.display(), file.configs.len());
        layers.extend(
            file.expand()
                .into_iter()
                .map(|layer| overrides.clone().or(layer)),
        );
    }

    layers
        .into_iter()
        .enumerate()
        .map(|(index, layer)| layer.resolve(index, out_dir))
        .collect()
}
