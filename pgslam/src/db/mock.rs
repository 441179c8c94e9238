//! In-memory stand-in for a database, understanding just the statements workers issue.
use super::{Connection, Connector, SqlValue};
use crate::error::DbError;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    db: Arc<MockDb>,
}

#[derive(Default)]
struct MockDb {
    latency: Duration,
    fail_after: Option<u64>,
    refused: Vec<String>,
    corrupt_reads: bool,
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    rows: BTreeMap<i64, String>,
    next_id: i64,
    round_trips: u64,
    statements: Vec<String>,
    connections: Vec<String>,
}

impl MockState {
    fn insert(&mut self, value: String) -> i64 {
        self.next_id += 1;
        self.rows.insert(self.next_id, value);
        self.next_id
    }
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn configure(mut self, f: impl FnOnce(&mut MockDb)) -> Self {
        // Only called while building, before any clone is handed out.
        if let Some(db) = Arc::get_mut(&mut self.db) {
            f(db);
        }
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.configure(|db| db.latency = latency)
    }

    /// Every round trip after the first `n` fails.
    pub fn failing_after(self, n: u64) -> Self {
        self.configure(|db| db.fail_after = Some(n))
    }

    pub fn refusing(self, endpoint: &str) -> Self {
        let endpoint = endpoint.to_string();
        self.configure(|db| db.refused.push(endpoint))
    }

    /// Read-backs return a value nobody wrote.
    pub fn corrupting_reads(self) -> Self {
        self.configure(|db| db.corrupt_reads = true)
    }

    pub fn with_rows(self, n: usize) -> Self {
        if let Ok(mut state) = self.db.state.lock() {
            for i in 0..n {
                state.insert(format!("row {i}"));
            }
        }
        self
    }

    pub fn rows(&self) -> BTreeMap<i64, String> {
        self.db.state.lock().unwrap().rows.clone()
    }

    pub fn statements(&self) -> Vec<String> {
        self.db.state.lock().unwrap().statements.clone()
    }

    pub fn connections(&self) -> Vec<String> {
        self.db.state.lock().unwrap().connections.clone()
    }
}

impl Connector for MockConnector {
    type Conn = MockConnection;

    async fn connect(&self, endpoint: &str) -> Result<MockConnection, DbError> {
        if self.db.refused.iter().any(|e| e == endpoint) {
            return Err(DbError::InvalidEndpoint(endpoint.to_string()));
        }
        self.db
            .state
            .lock()
            .unwrap()
            .connections
            .push(endpoint.to_string());
        Ok(MockConnection {
            db: self.db.clone(),
        })
    }
}

pub(crate) struct MockConnection {
    db: Arc<MockDb>,
}

impl MockConnection {
    async fn round_trip<T>(
        &mut self,
        sql: &str,
        f: impl FnOnce(&mut MockState) -> T,
    ) -> Result<T, DbError> {
        if self.db.latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.db.latency).await;
        }
        let mut state = self.db.state.lock().unwrap();
        state.round_trips += 1;
        if self.db.fail_after.is_some_and(|n| state.round_trips > n) {
            return Err(DbError::NoRows);
        }
        state.statements.push(sql.to_string());
        Ok(f(&mut state))
    }
}

fn id_param(params: &[SqlValue], index: usize) -> i64 {
    match params.get(index) {
        Some(SqlValue::Int(id)) => *id,
        _ => -1,
    }
}

impl Connection for MockConnection {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
        let sql_lower = sql.to_ascii_lowercase();
        self.round_trip(sql, |state| {
            if sql_lower.contains("generate_series") {
                let prefix = params.first().map(ToString::to_string).unwrap_or_default();
                let n = id_param(params, 1).max(0);
                for i in 1..=n {
                    state.insert(format!("{prefix}{i}"));
                }
                n as u64
            } else if sql_lower.starts_with("insert") {
                let value = params.first().map(ToString::to_string).unwrap_or_default();
                state.insert(value);
                1
            } else if sql_lower.starts_with("update") {
                let value = params.first().map(ToString::to_string).unwrap_or_default();
                match state.rows.get_mut(&id_param(params, 1)) {
                    Some(row) => {
                        *row = value;
                        1
                    }
                    None => 0,
                }
            } else if sql_lower.starts_with("delete") {
                u64::from(state.rows.remove(&id_param(params, 0)).is_some())
            } else {
                0
            }
        })
        .await
    }

    async fn batch_execute(&mut self, sql: &str) -> Result<(), DbError> {
        self.round_trip(sql, |_| ()).await
    }

    async fn query_ids(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<i64>, DbError> {
        let counting = sql.to_ascii_lowercase().contains("count(");
        self.round_trip(sql, |state| {
            if counting {
                vec![i64::from(state.rows.contains_key(&id_param(params, 0)))]
            } else {
                state.rows.keys().copied().take(10_000).collect()
            }
        })
        .await
    }

    async fn query_text(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Option<String>, DbError> {
        let corrupt = self.db.corrupt_reads;
        self.round_trip(sql, |state| {
            let row = state.rows.get(&id_param(params, 0)).cloned();
            if corrupt {
                row.map(|_| "corrupt".to_string())
            } else {
                row
            }
        })
        .await
    }

    async fn insert_returning_id(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<i64, DbError> {
        let value = params.first().map(ToString::to_string).unwrap_or_default();
        self.round_trip(sql, |state| state.insert(value)).await
    }
}
