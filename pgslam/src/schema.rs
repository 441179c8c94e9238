use crate::db::{Connection, Connector};
use crate::error::PrepareError;
use pgslam_core::{OpKind, RunConfig};
#[allow(unused)]
use tracing::{debug, error, info, instrument, trace, warn};

/// Run-wide setup executed once before any worker starts.
#[trait_variant::make(Prepare: Send)]
pub trait LocalPrepare: Send + Sync {
    async fn prepare(&self, config: &RunConfig) -> Result<(), PrepareError>;
}

/// Runs the configured setup statements against the first endpoint.
#[derive(Debug, Clone)]
pub struct SchemaPrep<C> {
    connector: C,
}

impl<C: Connector> SchemaPrep<C> {
    pub fn new(connector: C) -> Self {
        Self { connector }
    }
}

/// Statements a run executes before starting workers. Without explicit `setup` this creates the
/// target table (and the join table for `join` runs) if they are missing.
pub fn setup_statements(config: &RunConfig) -> Vec<String> {
    if !config.setup.is_empty() {
        return config.setup.clone();
    }

    let table = &config.table;
    let mut statements = vec![format!(
        "create table if not exists {table} (id bigserial primary key, {} text)",
        config.column
    )];
    if let (OpKind::Join, Some(join_table), Some(join_column)) =
        (config.op, &config.join_table, &config.join_column)
    {
        statements.push(format!(
            "create table if not exists {join_table} \
             (id bigserial primary key, {join_column} bigint references {table} (id))"
        ));
        statements.push(format!(
            "create index if not exists {join_table}_{join_column}_idx \
             on {join_table} ({join_column})"
        ));
    }
    statements
}

impl<C: Connector> Prepare for SchemaPrep<C> {
    #[instrument(name = "prepare", skip_all, fields(table = %config.table))]
    async fn prepare(&self, config: &RunConfig) -> Result<(), PrepareError> {
        let endpoint = config.endpoint(0).ok_or(PrepareError::NoHosts)?;
        let db_error = |source| PrepareError::Db {
            endpoint: endpoint.to_string(),
            source,
        };

        let mut conn = self.connector.connect(endpoint).await.map_err(db_error)?;
        for sql in setup_statements(config) {
            debug!("{sql}");
            conn.batch_execute(&sql).await.map_err(db_error)?;
        }
        info!("Schema ready on {endpoint}");
        Ok(())
    }
}
