//! Snowflake sink over the SQL REST API (`/api/v2/statements`).
//!
//! A batch is submitted as one multi-statement request wrapped in
//! `BEGIN TRANSACTION` / `COMMIT`; bindings are numbered across the whole
//! request.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use sluice_core::{Envelope, Secret, SystemInfo};
use tracing::{debug, warn};

use super::sql::{Dialect, Planned, SqlValue, Statement, plan};
use super::{CONNECT_TIMEOUT, SinkAdapter};
use crate::error::{Error, Result};

const DEFAULT_TOKEN_TYPE: &str = "PROGRAMMATIC_ACCESS_TOKEN";
const STATEMENT_TIMEOUT_SECS: u64 = 60;
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const MAX_POLLS: usize = 120;

#[derive(Debug, Serialize)]
struct Binding {
    #[serde(rename = "type")]
    kind: &'static str,
    value: Option<String>,
}

impl From<&SqlValue> for Binding {
    fn from(value: &SqlValue) -> Self {
        let (kind, value) = match value {
            SqlValue::Null => ("TEXT", None),
            SqlValue::Bool(b) => ("BOOLEAN", Some(b.to_string())),
            SqlValue::Int(i) => ("FIXED", Some(i.to_string())),
            SqlValue::Float(f) => ("REAL", Some(f.to_string())),
            SqlValue::Text(s) => ("TEXT", Some(s.clone())),
        };
        Self { kind, value }
    }
}

#[derive(Debug, Serialize)]
struct StatementRequest<'a> {
    statement: String,
    timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    database: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warehouse: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    bindings: BTreeMap<String, Binding>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    parameters: BTreeMap<&'static str, String>,
}

#[derive(Debug, Deserialize)]
struct StatementResponse {
    #[serde(default)]
    message: Option<String>,
    #[serde(rename = "statementHandle", default)]
    statement_handle: Option<String>,
}

pub struct SnowflakeSink {
    info: SystemInfo,
    base_url: String,
    client: Client,
}

impl SnowflakeSink {
    pub fn new(info: SystemInfo) -> Result<Self> {
        let base_url = info.connection_string()?.trim_end_matches('/').to_string();
        let client = Client::builder()
            .timeout(Duration::from_secs(STATEMENT_TIMEOUT_SECS + 10))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            info,
            base_url,
            client,
        })
    }

    fn token(&self) -> Result<&str> {
        self.info
            .api_key
            .as_ref()
            .or(self.info.password.as_ref())
            .map(Secret::expose)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::Config(format!(
                    "snowflake system '{}' needs 'api_key' or 'password' as a bearer token",
                    self.info.name
                ))
            })
    }

    fn request(&self, statements: &[Statement]) -> StatementRequest<'_> {
        let (statement, bindings, count) = combine(statements);
        let mut parameters = BTreeMap::new();
        if count > 1 {
            parameters.insert("MULTI_STATEMENT_COUNT", count.to_string());
        }
        StatementRequest {
            statement,
            timeout: STATEMENT_TIMEOUT_SECS,
            database: self.info.database.as_deref(),
            schema: self.info.schema.as_deref(),
            warehouse: self.info.warehouse.as_deref(),
            role: self.info.role.as_deref(),
            bindings,
            parameters,
        }
    }

    async fn submit(&self, body: &StatementRequest<'_>) -> Result<()> {
        let token = self.token()?;
        let token_type = self.info.token_type.as_deref().unwrap_or(DEFAULT_TOKEN_TYPE);

        let response = self
            .client
            .post(format!("{}/api/v2/statements", self.base_url))
            .bearer_auth(token)
            .header("X-Snowflake-Authorization-Token-Type", token_type)
            .header("Accept", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let parsed: StatementResponse = response.json().await.unwrap_or(StatementResponse {
            message: None,
            statement_handle: None,
        });

        match status {
            StatusCode::OK => Ok(()),
            StatusCode::ACCEPTED => match parsed.statement_handle {
                Some(handle) => self.wait(&handle, token, token_type).await,
                None => Err(self.failure(status, None)),
            },
            _ => Err(self.failure(status, parsed.message)),
        }
    }

    /// Poll an asynchronous statement until it finishes.
    async fn wait(&self, handle: &str, token: &str, token_type: &str) -> Result<()> {
        for _ in 0..MAX_POLLS {
            tokio::time::sleep(POLL_INTERVAL).await;
            let response = self
                .client
                .get(format!("{}/api/v2/statements/{handle}", self.base_url))
                .bearer_auth(token)
                .header("X-Snowflake-Authorization-Token-Type", token_type)
                .header("Accept", "application/json")
                .send()
                .await?;

            let status = response.status();
            match status {
                StatusCode::OK => return Ok(()),
                StatusCode::ACCEPTED => debug!(system = %self.info.name, handle, "statement still running"),
                _ => {
                    let message = response
                        .json::<StatementResponse>()
                        .await
                        .ok()
                        .and_then(|r| r.message);
                    return Err(self.failure(status, message));
                }
            }
        }
        Err(Error::Timeout(format!("snowflake statement {handle}")))
    }

    fn failure(&self, status: StatusCode, message: Option<String>) -> Error {
        Error::SinkWrite {
            system: self.info.name.clone(),
            reason: format!("{status}: {}", message.unwrap_or_default()),
        }
    }
}

/// Join statements into one request body. Returns the SQL text, the
/// request-wide bindings and the statement count.
fn combine(statements: &[Statement]) -> (String, BTreeMap<String, Binding>, usize) {
    let mut sql = Vec::with_capacity(statements.len() + 2);
    let mut bindings = BTreeMap::new();

    let wrap = statements.len() > 1;
    if wrap {
        sql.push("BEGIN TRANSACTION".to_string());
    }
    for stmt in statements {
        sql.push(stmt.sql.clone());
        for param in &stmt.params {
            bindings.insert((bindings.len() + 1).to_string(), Binding::from(param));
        }
    }
    if wrap {
        sql.push("COMMIT".to_string());
    }

    let count = sql.len();
    (sql.join(";\n"), bindings, count)
}

#[async_trait]
impl SinkAdapter for SnowflakeSink {
    fn info(&self) -> &SystemInfo {
        &self.info
    }

    async fn open_connection(&self) -> Result<()> {
        let ping = Statement {
            sql: "SELECT 1".to_string(),
            params: Vec::new(),
        };
        self.submit(&self.request(std::slice::from_ref(&ping))).await
    }

    async fn write_batch(&self, object: &str, items: &[Envelope]) -> Result<()> {
        let (table, conflict_key) = self.info.table_for(object);

        let mut statements = Vec::with_capacity(items.len());
        for envelope in items {
            match plan(Dialect::Snowflake, &table, conflict_key.as_deref(), envelope) {
                Planned::Run(stmt) => statements.push(stmt),
                Planned::Skip(reason) => {
                    warn!(system = %self.info.name, object = %object, reason, "skipping envelope");
                }
            }
        }
        if statements.is_empty() {
            return Ok(());
        }

        self.submit(&self.request(&statements)).await
    }

    async fn close(&self) {}
}
