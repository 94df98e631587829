//! ClickHouse sink.
//!
//! Upserts for a batch go out as a single `INSERT ... FORMAT JSONEachRow`
//! with the rows inline. Deduplication on the conflict key is left to the
//! table engine (`ReplacingMergeTree`); deletes use lightweight `DELETE`.

use async_trait::async_trait;
use clickhouse::Client;
use serde_json::Value;
use sluice_core::{Envelope, Operation, Secret, SystemInfo};
use tracing::{debug, warn};

use super::SinkAdapter;
use crate::error::Result;

pub struct ClickHouseSink {
    info: SystemInfo,
    client: Client,
}

impl ClickHouseSink {
    pub fn new(info: SystemInfo) -> Result<Self> {
        let url = info.connection_string()?;
        let mut client = Client::default().with_url(&url);
        if let Some(database) = info.database.as_deref().filter(|d| !d.is_empty()) {
            client = client.with_database(database);
        }
        if let Some(user) = info.username.as_deref() {
            client = client.with_user(user);
        }
        if let Some(password) = info.password.as_ref().map(Secret::expose) {
            client = client.with_password(password);
        }

        debug!(system = %info.name, url = %url, "clickhouse client configured");
        Ok(Self { info, client })
    }
}

fn quote_ident(ident: &str) -> String {
    ident
        .split('.')
        .map(|part| format!("`{}`", part.replace('`', "``")))
        .collect::<Vec<_>>()
        .join(".")
}

/// `?` is the client's bind placeholder; literal ones in inline data must
/// be doubled.
fn escape_placeholders(text: &str) -> String {
    text.replace('?', "??")
}

/// Build the inline insert for the upsert envelopes of a batch.
fn insert_sql(table: &str, rows: &[&Envelope]) -> Result<Option<String>> {
    let mut body = String::new();
    for envelope in rows {
        if envelope.payload.is_empty() {
            continue;
        }
        body.push_str(&serde_json::to_string(&envelope.payload)?);
        body.push('\n');
    }
    if body.is_empty() {
        return Ok(None);
    }
    Ok(Some(format!(
        "INSERT INTO {} FORMAT JSONEachRow\n{}",
        quote_ident(table),
        escape_placeholders(&body)
    )))
}

#[async_trait]
impl SinkAdapter for ClickHouseSink {
    fn info(&self) -> &SystemInfo {
        &self.info
    }

    async fn open_connection(&self) -> Result<()> {
        self.client.query("SELECT 1").execute().await?;
        Ok(())
    }

    async fn write_batch(&self, object: &str, items: &[Envelope]) -> Result<()> {
        let (table, conflict_key) = self.info.table_for(object);

        let (upserts, deletes): (Vec<&Envelope>, Vec<&Envelope>) =
            items.iter().partition(|e| e.operation == Operation::Upsert);

        if let Some(sql) = insert_sql(&table, &upserts)? {
            self.client.query(&sql).execute().await?;
        }

        for envelope in deletes {
            let Some(key) = conflict_key.as_deref() else {
                warn!(system = %self.info.name, object = %object, reason = "delete without conflict key", "skipping envelope");
                continue;
            };
            let sql = format!("DELETE FROM {} WHERE {} = ?", quote_ident(&table), quote_ident(key));
            let query = self.client.query(&sql);
            let query = match envelope.field(key) {
                Some(Value::String(s)) => query.bind(s.as_str()),
                Some(Value::Number(n)) => match (n.as_i64(), n.as_u64()) {
                    (Some(i), _) => query.bind(i),
                    (None, Some(u)) => query.bind(u),
                    (None, None) => query.bind(n.as_f64().unwrap_or_default()),
                },
                _ => {
                    warn!(system = %self.info.name, object = %object, reason = "missing conflict key value", "skipping envelope");
                    continue;
                }
            };
            query.execute().await?;
        }

        Ok(())
    }

    async fn close(&self) {}
}
