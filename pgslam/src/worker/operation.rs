use crate::db::{Connection, SqlValue};
use crate::debug::debug_sql;
use crate::error::{DbError, WorkerError};
use pgslam_core::{OpKind, RunConfig, ValueSpec, WORKING_SET_LIMIT};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Statements for the row-level operations on the target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RowSql {
    pub insert: String,
    pub insert_returning: String,
    pub select: String,
    pub update: String,
    pub delete: String,
    pub prime: String,
    pub preload: String,
}

impl RowSql {
    fn new(table: &str, column: &str) -> Self {
        Self {
            insert: format!("insert into {table} ({column}) values ($1)"),
            insert_returning: format!("insert into {table} ({column}) values ($1) returning id"),
            select: format!("select {column} from {table} where id = $1"),
            update: format!("update {table} set {column} = $1 where id = $2"),
            delete: format!("delete from {table} where id = $1"),
            prime: format!("select id from {table} limit {WORKING_SET_LIMIT}"),
            preload: format!(
                "insert into {table} ({column}) select $1 || i::text \
                 from generate_series(1, $2::bigint) as t(i)"
            ),
        }
    }
}

/// One iteration of a worker's loop, resolved from the configured [`OpKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Operation {
    Insert,
    Select,
    Update,
    Delete,
    Join { sql: String },
    Sequence { round_trips: usize },
    Mixed,
    Exec { sql: String },
}

/// Worker-local state threaded through every iteration.
pub(crate) struct OpState {
    pub worker: usize,
    pub iteration: u64,
    pub ids: Vec<i64>,
    pub values: ValueGen,
    pub rng: StdRng,
    pub table: String,
}

/// Resolved operation plus the statements it needs.
#[derive(Debug, Clone)]
pub(crate) struct Plan {
    pub op: Operation,
    pub rows: RowSql,
}

impl Plan {
    pub fn new(config: &RunConfig) -> Result<Self, WorkerError> {
        let op = match config.op {
            OpKind::Insert => Operation::Insert,
            OpKind::Select => Operation::Select,
            OpKind::Update => Operation::Update,
            OpKind::Delete => Operation::Delete,
            OpKind::Join => {
                let (Some(join_table), Some(join_column)) = (&config.join_table, &config.join_column)
                else {
                    return Err(WorkerError::Setup(
                        "join needs a join table and join column".to_string(),
                    ));
                };
                Operation::Join {
                    sql: format!(
                        "select count(1) from {} a join {join_table} b on b.{join_column} = a.id \
                         where a.id = $1",
                        config.table
                    ),
                }
            }
            OpKind::Sequence => Operation::Sequence {
                round_trips: config.round_trips,
            },
            OpKind::Mixed => Operation::Mixed,
            OpKind::Exec => match &config.exec {
                Some(sql) if !sql.trim().is_empty() => Operation::Exec { sql: sql.clone() },
                _ => return Err(WorkerError::Setup("exec needs a SQL template".to_string())),
            },
        };

        Ok(Self {
            op,
            rows: RowSql::new(&config.table, &config.column),
        })
    }

    /// Fetch the working set for kinds that operate on existing rows.
    pub async fn prime<C: Connection>(
        &self,
        conn: &mut C,
        state: &mut OpState,
    ) -> Result<(), WorkerError> {
        if !self.needs_working_set() {
            return Ok(());
        }
        state.ids = query_ids(conn, state.worker, &self.rows.prime, &[]).await?;
        debug!("Primed {} row ids", state.ids.len());

        if state.ids.is_empty() && self.op != Operation::Mixed {
            return Err(WorkerError::EmptyWorkingSet {
                worker: state.worker,
                table: state.table.clone(),
            });
        }
        Ok(())
    }

    fn needs_working_set(&self) -> bool {
        matches!(
            self.op,
            Operation::Select
                | Operation::Update
                | Operation::Delete
                | Operation::Join { .. }
                | Operation::Mixed
        )
    }

    /// Run one iteration and return the number of statements it completed.
    pub async fn run<C: Connection>(
        &self,
        conn: &mut C,
        state: &mut OpState,
    ) -> Result<u64, WorkerError> {
        state.iteration += 1;
        let rows = &self.rows;
        match &self.op {
            Operation::Insert => {
                let value = state.values.first();
                execute(conn, state.worker, &rows.insert, &[value]).await?;
                Ok(1)
            }
            Operation::Select => {
                let id = pick(state)?;
                query_text(conn, state.worker, &rows.select, &[SqlValue::Int(id)]).await?;
                Ok(1)
            }
            Operation::Update => {
                let id = pick(state)?;
                let params = [state.values.first(), SqlValue::Int(id)];
                execute(conn, state.worker, &rows.update, &params).await?;
                Ok(1)
            }
            Operation::Delete => {
                if state.ids.is_empty() {
                    self.prime(conn, state).await?;
                }
                let id = take(state)?;
                execute(conn, state.worker, &rows.delete, &[SqlValue::Int(id)]).await?;
                Ok(1)
            }
            Operation::Join { sql } => {
                let id = pick(state)?;
                query_ids(conn, state.worker, sql, &[SqlValue::Int(id)]).await?;
                Ok(1)
            }
            Operation::Sequence { round_trips } => self.sequence(conn, state, *round_trips).await,
            Operation::Mixed => self.mixed(conn, state).await,
            Operation::Exec { sql } => {
                let params = state.values.generate();
                execute(conn, state.worker, sql, &params).await?;
                Ok(1)
            }
        }
    }

    /// Insert a row, overwrite it `round_trips` times, read it back as often, then delete it.
    async fn sequence<C: Connection>(
        &self,
        conn: &mut C,
        state: &mut OpState,
        round_trips: usize,
    ) -> Result<u64, WorkerError> {
        let worker = state.worker;
        let iteration = state.iteration;
        let rows = &self.rows;

        let mut expected = format!("worker {worker} loop {iteration}");
        let params = [SqlValue::text(&expected)];
        let id = insert_returning_id(conn, worker, &rows.insert_returning, &params).await?;

        for k in 0..round_trips {
            expected = format!("worker {worker} loop {iteration} update {k}");
            let params = [SqlValue::text(&expected), SqlValue::Int(id)];
            execute(conn, worker, &rows.update, &params).await?;
        }

        for _ in 0..round_trips {
            let found = query_text(conn, worker, &rows.select, &[SqlValue::Int(id)]).await?;
            if found.as_deref() != Some(expected.as_str()) {
                return Err(WorkerError::Mismatch {
                    worker,
                    id,
                    expected,
                    found,
                });
            }
        }

        execute(conn, worker, &rows.delete, &[SqlValue::Int(id)]).await?;
        Ok(2 * round_trips as u64 + 2)
    }

    async fn mixed<C: Connection>(
        &self,
        conn: &mut C,
        state: &mut OpState,
    ) -> Result<u64, WorkerError> {
        let rows = &self.rows;
        let worker = state.worker;
        let choice = if state.ids.is_empty() {
            0
        } else {
            state.rng.gen_range(0..4)
        };

        match choice {
            0 => {
                let value = state.values.first();
                let id = insert_returning_id(conn, worker, &rows.insert_returning, &[value]).await?;
                state.ids.push(id);
            }
            1 => {
                let id = pick(state)?;
                query_text(conn, worker, &rows.select, &[SqlValue::Int(id)]).await?;
            }
            2 => {
                let id = pick(state)?;
                let params = [state.values.first(), SqlValue::Int(id)];
                execute(conn, worker, &rows.update, &params).await?;
            }
            _ => {
                let id = take(state)?;
                execute(conn, worker, &rows.delete, &[SqlValue::Int(id)]).await?;
            }
        }
        Ok(1)
    }
}

fn pick(state: &mut OpState) -> Result<i64, WorkerError> {
    state
        .ids
        .choose(&mut state.rng)
        .copied()
        .ok_or_else(|| WorkerError::EmptyWorkingSet {
            worker: state.worker,
            table: state.table.clone(),
        })
}

fn take(state: &mut OpState) -> Result<i64, WorkerError> {
    if state.ids.is_empty() {
        return Err(WorkerError::EmptyWorkingSet {
            worker: state.worker,
            table: state.table.clone(),
        });
    }
    let index = state.rng.gen_range(0..state.ids.len());
    Ok(state.ids.swap_remove(index))
}

fn op_error(worker: usize) -> impl FnOnce(DbError) -> WorkerError {
    move |source| WorkerError::Operation { worker, source }
}

async fn execute<C: Connection>(
    conn: &mut C,
    worker: usize,
    sql: &str,
    params: &[SqlValue],
) -> Result<u64, WorkerError> {
    trace!("{}", debug_sql(sql, params));
    conn.execute(sql, params).await.map_err(op_error(worker))
}

async fn query_ids<C: Connection>(
    conn: &mut C,
    worker: usize,
    sql: &str,
    params: &[SqlValue],
) -> Result<Vec<i64>, WorkerError> {
    trace!("{}", debug_sql(sql, params));
    conn.query_ids(sql, params).await.map_err(op_error(worker))
}

async fn query_text<C: Connection>(
    conn: &mut C,
    worker: usize,
    sql: &str,
    params: &[SqlValue],
) -> Result<Option<String>, WorkerError> {
    trace!("{}", debug_sql(sql, params));
    conn.query_text(sql, params).await.map_err(op_error(worker))
}

async fn insert_returning_id<C: Connection>(
    conn: &mut C,
    worker: usize,
    sql: &str,
    params: &[SqlValue],
) -> Result<i64, WorkerError> {
    trace!("{}", debug_sql(sql, params));
    conn.insert_returning_id(sql, params)
        .await
        .map_err(op_error(worker))
}

/// Produces statement parameters from the configured value generators.
#[derive(Debug, Clone)]
pub(crate) struct ValueGen {
    specs: Vec<ValueSpec>,
}

impl ValueGen {
    pub fn new(specs: &[ValueSpec]) -> Self {
        Self {
            specs: specs.to_vec(),
        }
    }

    pub fn generate(&self) -> Vec<SqlValue> {
        self.specs.iter().map(Self::value).collect()
    }

    /// Value for single-column writes, a random UUID when nothing is configured.
    pub fn first(&self) -> SqlValue {
        self.specs
            .first()
            .map(Self::value)
            .unwrap_or_else(|| SqlValue::Uuid(Uuid::new_v4()))
    }

    fn value(spec: &ValueSpec) -> SqlValue {
        match spec {
            ValueSpec::Text { string } => SqlValue::Text(string.clone()),
            ValueSpec::RandomUuid => SqlValue::Uuid(Uuid::new_v4()),
        }
    }
}
