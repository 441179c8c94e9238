//! Database connectivity.
//!
//! Workers only see [`Connector`] and [`Connection`]; [`PgConnector`] is the tokio-postgres
//! implementation used outside of tests.
use crate::error::DbError;
use pgslam_core::{parse_endpoint, RunConfig};
use std::collections::HashMap;
use std::fmt;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, NoTls, Statement};
use tracing::{debug, warn};
use uuid::Uuid;

#[cfg(test)]
pub(crate) mod mock;

/// A statement parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Text(String),
    Int(i64),
    Uuid(Uuid),
}

impl SqlValue {
    pub fn text(s: impl Into<String>) -> Self {
        SqlValue::Text(s.into())
    }

    /// Convert to the Rust type tokio-postgres expects for `ty`.
    fn bind(&self, ty: &Type) -> Box<dyn ToSql + Sync + Send> {
        match self {
            SqlValue::Uuid(id) if *ty == Type::UUID => Box::new(*id),
            SqlValue::Uuid(id) => Box::new(id.to_string()),
            SqlValue::Text(s) if *ty == Type::UUID => match Uuid::parse_str(s) {
                Ok(id) => Box::new(id),
                Err(_) => Box::new(s.clone()),
            },
            SqlValue::Text(s) => Box::new(s.clone()),
            SqlValue::Int(i) if *ty == Type::INT2 => match i16::try_from(*i) {
                Ok(v) => Box::new(v),
                Err(_) => Box::new(*i),
            },
            SqlValue::Int(i) if *ty == Type::INT4 => match i32::try_from(*i) {
                Ok(v) => Box::new(v),
                Err(_) => Box::new(*i),
            },
            SqlValue::Int(i) if *ty == Type::TEXT || *ty == Type::VARCHAR => {
                Box::new(i.to_string())
            }
            SqlValue::Int(i) => Box::new(*i),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Text(s) => f.write_str(s),
            SqlValue::Int(i) => write!(f, "{i}"),
            SqlValue::Uuid(id) => write!(f, "{id}"),
        }
    }
}

/// Opens connections to a single `host:port` endpoint.
#[trait_variant::make(Connector: Send)]
pub trait LocalConnector: Clone + Send + Sync + 'static {
    type Conn: Connection + 'static;

    async fn connect(&self, endpoint: &str) -> Result<Self::Conn, DbError>;
}

/// One open session. Every method is a single round trip.
#[trait_variant::make(Connection: Send)]
pub trait LocalConnection: Send {
    /// Returns the number of rows affected.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError>;

    /// Runs one or more `;`-separated statements without parameters.
    async fn batch_execute(&mut self, sql: &str) -> Result<(), DbError>;

    /// First column of every returned row, as `bigint`.
    async fn query_ids(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<i64>, DbError>;

    /// First column of the first returned row, `None` if there is no row or it is `NULL`.
    async fn query_text(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Option<String>, DbError>;

    async fn insert_returning_id(&mut self, sql: &str, params: &[SqlValue])
        -> Result<i64, DbError>;
}

#[derive(Clone)]
pub struct PgConnector {
    database: String,
    user: String,
    password: String,
}

impl PgConnector {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        }
    }
}

impl fmt::Debug for PgConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnector")
            .field("database", &self.database)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl Connector for PgConnector {
    type Conn = PgConnection;

    async fn connect(&self, endpoint: &str) -> Result<PgConnection, DbError> {
        let (host, port) =
            parse_endpoint(endpoint).ok_or_else(|| DbError::InvalidEndpoint(endpoint.to_string()))?;

        let mut config = tokio_postgres::Config::new();
        config
            .host(host)
            .port(port)
            .user(&self.user)
            .password(&self.password)
            .dbname(&self.database);

        let (client, connection) = config.connect(NoTls).await?;
        let endpoint = endpoint.to_string();
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!("Connection to {endpoint} closed: {err}");
            }
        });
        debug!("Connected to {host}:{port}");

        Ok(PgConnection {
            client,
            statements: HashMap::new(),
        })
    }
}

pub struct PgConnection {
    client: Client,
    statements: HashMap<String, Statement>,
}

impl PgConnection {
    async fn prepared(&mut self, sql: &str) -> Result<Statement, DbError> {
        if let Some(statement) = self.statements.get(sql) {
            return Ok(statement.clone());
        }
        let statement = self.client.prepare(sql).await?;
        self.statements.insert(sql.to_string(), statement.clone());
        Ok(statement)
    }
}

fn bind(statement: &Statement, params: &[SqlValue]) -> Vec<Box<dyn ToSql + Sync + Send>> {
    params
        .iter()
        .zip(statement.params())
        .map(|(value, ty)| value.bind(ty))
        .collect()
}

fn as_refs(bound: &[Box<dyn ToSql + Sync + Send>]) -> Vec<&(dyn ToSql + Sync)> {
    bound
        .iter()
        .map(|b| b.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

impl Connection for PgConnection {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
        let statement = self.prepared(sql).await?;
        let bound = bind(&statement, params);
        Ok(self.client.execute(&statement, &as_refs(&bound)).await?)
    }

    async fn batch_execute(&mut self, sql: &str) -> Result<(), DbError> {
        Ok(self.client.batch_execute(sql).await?)
    }

    async fn query_ids(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<i64>, DbError> {
        let statement = self.prepared(sql).await?;
        let bound = bind(&statement, params);
        let rows = self.client.query(&statement, &as_refs(&bound)).await?;
        Ok(rows
            .iter()
            .map(|row| row.try_get::<_, i64>(0))
            .collect::<Result<_, _>>()?)
    }

    async fn query_text(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Option<String>, DbError> {
        let statement = self.prepared(sql).await?;
        let bound = bind(&statement, params);
        let row = self.client.query_opt(&statement, &as_refs(&bound)).await?;
        Ok(row
            .map(|row| row.try_get::<_, Option<String>>(0))
            .transpose()?
            .flatten())
    }

    async fn insert_returning_id(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<i64, DbError> {
        let statement = self.prepared(sql).await?;
        let bound = bind(&statement, params);
        let row = self
            .client
            .query_opt(&statement, &as_refs(&bound))
            .await?
            .ok_or(DbError::NoRows)?;
        Ok(row.try_get(0)?)
    }
}
