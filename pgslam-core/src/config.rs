use crate::{DEFAULT_BUCKET_WINDOW, DEFAULT_CLUSTER_BINARY, DEFAULT_PROCESS_WINDOW_FACTOR};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use std::fmt;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Fully resolved parameters for a single run.
///
/// Built once by the config layer and shared read-only (behind an `Arc`) by every task of the
/// run. Nothing mutates it after workers start.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunConfig {
    pub database: String,
    /// `host:port` SQL endpoints. With a managed cluster these are also the listen addresses.
    pub hosts: Vec<String>,
    pub user: String,
    pub password: String,

    pub op: OpKind,
    pub table: String,
    pub column: String,
    pub join_table: Option<String>,
    pub join_column: Option<String>,
    /// SQL template used by [`OpKind::Exec`].
    pub exec: Option<String>,
    pub values: Vec<ValueSpec>,
    /// Statements run once before workers launch. Empty means "create the target table".
    pub setup: Vec<String>,

    pub workers: usize,
    pub nodes: usize,
    #[serde_as(as = "Option<DurationSeconds>")]
    pub duration: Option<Duration>,
    /// Aggregate operations per second across all workers.
    pub rate: Option<NonZeroU32>,
    /// Operations per second for each worker.
    pub worker_rate: Option<NonZeroU32>,
    pub round_trips: usize,
    /// Rows bulk-inserted (split across workers) before the measured loop.
    pub preload: u64,

    pub cluster: Option<ClusterSpec>,
    pub metrics: MetricsSpec,
}

impl RunConfig {
    /// Number of endpoints workers are spread over.
    pub fn node_count(&self) -> usize {
        self.nodes.clamp(1, self.hosts.len().max(1))
    }

    /// Endpoint for the worker at `index`, round-robin across the first `nodes` hosts. `None`
    /// when no hosts are configured.
    pub fn endpoint(&self, index: usize) -> Option<&str> {
        self.hosts
            .get(index % self.node_count())
            .map(String::as_str)
    }
}

impl fmt::Display for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let duration = self
            .duration
            .map(|d| humantime::format_duration(d).to_string())
            .unwrap_or_else(|| "unbounded".to_string());
        let rate = self.rate.map(NonZeroU32::get).unwrap_or(0);
        let worker_rate = self.worker_rate.map(NonZeroU32::get).unwrap_or(0);
        write!(
            f,
            "db {:?} {}@{} {} {} x {} rate [{}/s {}/s]",
            self.database,
            self.user,
            self.hosts.join(","),
            self.op,
            duration,
            self.workers,
            rate,
            worker_rate,
        )
    }
}

/// Split a `host:port` address. IPv6 hosts may be bracketed (`[::1]:5432`).
pub fn parse_endpoint(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host, port.parse().ok()?))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    #[default]
    Insert,
    Select,
    Update,
    Delete,
    Join,
    Sequence,
    Mixed,
    Exec,
}

impl OpKind {
    pub const ALL: [OpKind; 8] = [
        OpKind::Insert,
        OpKind::Select,
        OpKind::Update,
        OpKind::Delete,
        OpKind::Join,
        OpKind::Sequence,
        OpKind::Mixed,
        OpKind::Exec,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Select => "select",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
            OpKind::Join => "join",
            OpKind::Sequence => "sequence",
            OpKind::Mixed => "mixed",
            OpKind::Exec => "exec",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownOpKind(pub String);

impl fmt::Display for UnknownOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown operation {:?}", self.0)
    }
}

impl std::error::Error for UnknownOpKind {}

impl FromStr for OpKind {
    type Err = UnknownOpKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        OpKind::ALL
            .into_iter()
            .find(|op| op.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownOpKind(s.to_string()))
    }
}

/// Generator for one statement parameter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueSpec {
    Text { string: String },
    RandomUuid,
}

/// Ephemeral cluster provisioning parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    #[serde(default = "default_cluster_binary")]
    pub binary: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            binary: default_cluster_binary(),
            extra_args: vec![],
        }
    }
}

fn default_cluster_binary() -> String {
    DEFAULT_CLUSTER_BINARY.to_string()
}

/// Where and how latency buckets are written.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricsSpec {
    pub path: PathBuf,
    #[serde_as(as = "DurationSeconds")]
    pub bucket_window: Duration,
    #[serde_as(as = "DurationSeconds")]
    pub process_window: Duration,
}

impl MetricsSpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            bucket_window: DEFAULT_BUCKET_WINDOW,
            process_window: DEFAULT_BUCKET_WINDOW * DEFAULT_PROCESS_WINDOW_FACTOR,
        }
    }
}
