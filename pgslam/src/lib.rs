#![cfg_attr(docsrs, feature(doc_cfg))]
//! Rate-limited load testing harness for PostgreSQL-family databases.
//!
//! A run brings up an optional ephemeral cluster, prepares the schema, drives `workers`
//! concurrent connections under a self-correcting throughput controller, and streams every
//! operation's latency into time-bucketed percentile rows.

pub mod cluster;
pub mod counters;
pub mod db;
pub mod debug;
pub mod error;
pub mod metrics;
pub mod run;
pub mod schema;
pub mod shutdown;
pub mod worker;

mod clock;

pub use clock::Clock;
pub use error::{
    ClusterError, DbError, MetricsError, PoisonedCounters, PrepareError, RunError, WorkerError,
};
pub use metrics::{MetricsPipeline, MetricsReport};
pub use run::Harness;
pub use shutdown::{StopListener, StopSignal};

pub mod prelude {
    pub use crate::cluster::{Cluster, RemoteExec, SshExec};
    pub use crate::db::{Connection, Connector, PgConnector, SqlValue};
    pub use crate::run::Harness;
    pub use crate::schema::{Prepare, SchemaPrep};
    pub use crate::shutdown::StopSignal;

    pub use pgslam_core::{OpKind, RunConfig, RunStatistics, TickReport};
}
