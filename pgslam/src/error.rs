use std::io;
use std::sync::PoisonError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Invalid endpoint {0:?}, expected host:port")]
    InvalidEndpoint(String),

    #[error("Query returned no rows")]
    NoRows,
}

/// Fatal errors for a single worker. None of these are retried.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker {worker} failed to connect to {endpoint}: {source}")]
    Connect {
        worker: usize,
        endpoint: String,
        source: DbError,
    },

    #[error("Worker {worker} operation failed: {source}")]
    Operation { worker: usize, source: DbError },

    #[error("Worker {worker} read back {found:?} for id {id}, expected {expected:?}")]
    Mismatch {
        worker: usize,
        id: i64,
        expected: String,
        found: Option<String>,
    },

    #[error("Worker {worker} found no rows in {table} to operate on")]
    EmptyWorkingSet { worker: usize, table: String },

    #[error("Invalid operation setup: {0}")]
    Setup(String),

    #[error("Worker {0} has no host to connect to")]
    NoHost(usize),

    #[error(transparent)]
    Poisoned(#[from] PoisonedCounters),
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Invalid node address {0:?}, expected host:port")]
    InvalidAddress(String),

    #[error("Listen port {0} leaves no room for the HTTP port offset")]
    PortTooLow(u16),

    #[error("Cluster needs {nodes} hosts but only {hosts} are configured")]
    TooFewHosts { nodes: usize, hosts: usize },

    #[error("{host}: failed to spawn remote command: {source}")]
    Spawn { host: String, source: io::Error },

    #[error("{host}: remote command exited with {status}")]
    Exit { host: String, status: String },

    #[error("{host}: node task ended without reporting")]
    Lost { host: String },
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Metrics sink error: {0}")]
    Io(#[from] io::Error),

    #[error("Metrics task panicked or was cancelled: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("No hosts configured")]
    NoHosts,

    #[error("Schema preparation failed on {endpoint}: {source}")]
    Db { endpoint: String, source: DbError },
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Prepare error: {0}")]
    Prepare(#[from] PrepareError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Poisoned(#[from] PoisonedCounters),

    #[error("No hosts configured")]
    NoHosts,
}

#[derive(Debug, Error)]
#[error("Aggregate counter mutex is poisoned.")]
pub struct PoisonedCounters;

impl<T> From<PoisonError<T>> for PoisonedCounters {
    fn from(_err: PoisonError<T>) -> Self {
        Self
    }
}
