//! Oracle sink.
//!
//! The driver is synchronous; every call runs on the blocking pool.

use std::sync::OnceLock;

use async_trait::async_trait;
use oracle::pool::{Pool, PoolBuilder};
use oracle::sql_type::ToSql;
use sluice_core::{Envelope, Secret, SystemInfo};
use tracing::{debug, warn};

use super::SinkAdapter;
use super::sql::{Dialect, Planned, SqlValue, Statement, plan};
use crate::error::{Error, Result};

pub struct OracleSink {
    info: SystemInfo,
    pool: OnceLock<Pool>,
}

impl OracleSink {
    pub fn new(info: SystemInfo) -> Self {
        Self {
            info,
            pool: OnceLock::new(),
        }
    }

    fn pool(&self) -> Result<Pool> {
        self.pool.get().cloned().ok_or_else(|| Error::SinkWrite {
            system: self.info.name.clone(),
            reason: "connection pool not open".to_string(),
        })
    }
}

/// Owned bind values. Booleans go over as 1/0 since SQL has no BOOLEAN
/// before 23ai.
fn to_params(values: &[SqlValue]) -> Vec<Box<dyn ToSql + Send>> {
    values
        .iter()
        .map(|v| -> Box<dyn ToSql + Send> {
            match v {
                SqlValue::Null => Box::new(None::<String>),
                SqlValue::Bool(b) => Box::new(i64::from(*b)),
                SqlValue::Int(i) => Box::new(*i),
                SqlValue::Float(f) => Box::new(*f),
                SqlValue::Text(s) => Box::new(s.clone()),
            }
        })
        .collect()
}

/// Log a failed rollback. Returns whether it succeeded.
fn rollback_ok<E: std::fmt::Display>(system: &str, result: std::result::Result<(), E>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(system = %system, error = %e, "rollback failed");
            false
        }
    }
}

fn execute_all(system: &str, pool: &Pool, statements: &[Statement]) -> Result<()> {
    let conn = pool.get()?;
    for stmt in statements {
        let owned = to_params(&stmt.params);
        let params: Vec<&dyn ToSql> = owned.iter().map(|p| p.as_ref() as &dyn ToSql).collect();
        if let Err(e) = conn.execute(&stmt.sql, &params) {
            rollback_ok(system, conn.rollback());
            return Err(e.into());
        }
    }
    conn.commit()?;
    Ok(())
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

#[async_trait]
impl SinkAdapter for OracleSink {
    fn info(&self) -> &SystemInfo {
        &self.info
    }

    async fn open_connection(&self) -> Result<()> {
        let connect_string = self.info.connection_string()?;
        let username = self.info.username.clone().unwrap_or_default();
        let password = self
            .info
            .password
            .as_ref()
            .map(Secret::expose)
            .unwrap_or_default()
            .to_string();
        let max = self.info.max_open_connections;
        let min = self.info.max_idle_connections.min(max);

        let pool = blocking(move || {
            let pool = PoolBuilder::new(username, password, connect_string)
                .min_connections(min)
                .max_connections(max)
                .build()?;
            pool.get()?.query_row("SELECT 1 FROM dual", &[])?;
            Ok(pool)
        })
        .await?;

        if self.pool.set(pool).is_err() {
            debug!(system = %self.info.name, "connection pool already open");
        }
        Ok(())
    }

    async fn write_batch(&self, object: &str, items: &[Envelope]) -> Result<()> {
        let pool = self.pool()?;
        let (table, conflict_key) = self.info.table_for(object);

        let mut statements = Vec::with_capacity(items.len());
        for envelope in items {
            match plan(Dialect::Oracle, &table, conflict_key.as_deref(), envelope) {
                Planned::Run(stmt) => statements.push(stmt),
                Planned::Skip(reason) => {
                    warn!(system = %self.info.name, object = %object, reason, "skipping envelope");
                }
            }
        }
        if statements.is_empty() {
            return Ok(());
        }

        let system = self.info.name.clone();
        blocking(move || execute_all(&system, &pool, &statements)).await
    }

    async fn close(&self) {
        if let Some(pool) = self.pool.get().cloned() {
            let name = self.info.name.clone();
            let closed = blocking(move || {
                pool.close(&oracle::pool::CloseMode::Default)?;
                Ok(())
            })
            .await;
            if let Err(e) = closed {
                debug!(system = %name, error = %e, "error closing pool");
            }
        }
    }
}
