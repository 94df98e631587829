//! PostgreSQL sink.

use std::sync::OnceLock;

use async_trait::async_trait;
use sluice_core::{Envelope, SystemInfo};
use sqlx::Postgres;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::query::Query;
use tracing::{debug, warn};

use super::sql::{Dialect, Planned, SqlValue, plan};
use super::{CONNECT_TIMEOUT, SinkAdapter};
use crate::error::{Error, Result};

pub struct PostgresSink {
    info: SystemInfo,
    pool: OnceLock<PgPool>,
}

impl PostgresSink {
    pub fn new(info: SystemInfo) -> Self {
        Self {
            info,
            pool: OnceLock::new(),
        }
    }

    fn pool(&self) -> Result<&PgPool> {
        self.pool.get().ok_or_else(|| Error::SinkWrite {
            system: self.info.name.clone(),
            reason: "connection pool not open".to_string(),
        })
    }
}

fn bind<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [SqlValue],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Bool(b) => query.bind(*b),
            SqlValue::Int(i) => query.bind(*i),
            SqlValue::Float(f) => query.bind(*f),
            SqlValue::Text(s) => query.bind(s.as_str()),
        };
    }
    query
}

#[async_trait]
impl SinkAdapter for PostgresSink {
    fn info(&self) -> &SystemInfo {
        &self.info
    }

    async fn open_connection(&self) -> Result<()> {
        let dsn = self.info.connection_string()?;
        let pool = PgPoolOptions::new()
            .max_connections(self.info.max_open_connections)
            .min_connections(self.info.max_idle_connections.min(self.info.max_open_connections))
            .idle_timeout(self.info.max_connection_idle_time)
            .acquire_timeout(CONNECT_TIMEOUT)
            .connect(&dsn)
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;

        if self.pool.set(pool).is_err() {
            debug!(system = %self.info.name, "connection pool already open");
        }
        Ok(())
    }

    async fn write_batch(&self, object: &str, items: &[Envelope]) -> Result<()> {
        let (table, conflict_key) = self.info.table_for(object);
        let mut tx = self.pool()?.begin().await?;

        for envelope in items {
            match plan(Dialect::Postgres, &table, conflict_key.as_deref(), envelope) {
                Planned::Run(stmt) => {
                    bind(sqlx::query(&stmt.sql), &stmt.params)
                        .execute(&mut *tx)
                        .await?;
                }
                Planned::Skip(reason) => {
                    warn!(system = %self.info.name, object = %object, reason, "skipping envelope");
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn close(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
    }
}
