//! Statement generation shared by the relational sinks.
//!
//! Columns are the payload's top-level keys in sorted order. Scalars bind as
//! themselves; arrays and objects bind as JSON text.

use serde_json::Value;
use sluice_core::{Envelope, Object, Operation};

/// SQL flavour of a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Mysql,
    Mssql,
    Oracle,
    Snowflake,
}

impl Dialect {
    /// Quote an identifier. Dotted names are quoted per part so that
    /// `analytics.products` addresses a table in a schema.
    pub fn quote_ident(self, ident: &str) -> String {
        ident
            .split('.')
            .map(|part| match self {
                Self::Mysql => format!("`{}`", part.replace('`', "``")),
                Self::Mssql => format!("[{}]", part.replace(']', "]]")),
                Self::Postgres | Self::Oracle | Self::Snowflake => {
                    format!("\"{}\"", part.replace('"', "\"\""))
                }
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Bind placeholder for the 1-based parameter `n`.
    pub fn placeholder(self, n: usize) -> String {
        match self {
            Self::Postgres => format!("${n}"),
            Self::Mssql => format!("@P{n}"),
            Self::Oracle => format!(":{n}"),
            Self::Mysql | Self::Snowflake => "?".to_string(),
        }
    }

    fn placeholders(self, count: usize) -> Vec<String> {
        (1..=count).map(|n| self.placeholder(n)).collect()
    }
}

/// A value ready to bind.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&Value> for SqlValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => match n.as_f64() {
                    Some(f) if n.is_f64() => Self::Float(f),
                    _ => Self::Text(n.to_string()),
                },
            },
            Value::String(s) => Self::Text(s.clone()),
            Value::Array(_) | Value::Object(_) => Self::Text(value.to_string()),
        }
    }
}

/// One parameterised statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// What to do with one envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Planned {
    Run(Statement),
    /// Nothing can be written; the reason is logged by the caller.
    Skip(&'static str),
}

/// Plan the statement for one envelope.
pub fn plan(dialect: Dialect, table: &str, conflict_key: Option<&str>, envelope: &Envelope) -> Planned {
    let payload = &envelope.payload;
    match (envelope.operation, conflict_key) {
        (Operation::Delete, None) => Planned::Skip("delete requires a conflict_key"),
        (Operation::Delete, Some(key)) => match payload.get(key) {
            Some(value) if !value.is_null() => Planned::Run(delete(dialect, table, key, value)),
            _ => Planned::Skip("payload has no value for the conflict_key"),
        },
        (Operation::Upsert, _) if payload.is_empty() => Planned::Skip("empty payload"),
        (Operation::Upsert, None) => Planned::Run(insert(dialect, table, payload)),
        (Operation::Upsert, Some(key)) => match payload.get(key) {
            Some(value) if !value.is_null() => Planned::Run(upsert(dialect, table, key, payload)),
            _ => Planned::Skip("payload has no value for the conflict_key"),
        },
    }
}

fn sorted_columns(payload: &Object) -> Vec<&str> {
    let mut columns: Vec<&str> = payload.keys().map(String::as_str).collect();
    columns.sort_unstable();
    columns
}

fn params(payload: &Object, columns: &[&str]) -> Vec<SqlValue> {
    columns
        .iter()
        .map(|c| payload.get(*c).map_or(SqlValue::Null, SqlValue::from))
        .collect()
}

/// Plain `INSERT`.
pub fn insert(dialect: Dialect, table: &str, payload: &Object) -> Statement {
    let columns = sorted_columns(payload);
    let quoted: Vec<String> = columns.iter().map(|c| dialect.quote_ident(c)).collect();

    Statement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            dialect.quote_ident(table),
            quoted.join(", "),
            dialect.placeholders(columns.len()).join(", ")
        ),
        params: params(payload, &columns),
    }
}

/// Insert-or-update keyed on `key`.
pub fn upsert(dialect: Dialect, table: &str, key: &str, payload: &Object) -> Statement {
    let columns = sorted_columns(payload);
    let params = params(payload, &columns);
    let q = |ident: &str| dialect.quote_ident(ident);
    let quoted: Vec<String> = columns.iter().map(|c| q(c)).collect();
    let updates: Vec<&str> = columns.iter().copied().filter(|c| *c != key).collect();
    let table_q = q(table);
    let key_q = q(key);

    let sql = match dialect {
        Dialect::Postgres => {
            let action = if updates.is_empty() {
                "DO NOTHING".to_string()
            } else {
                let set: Vec<String> = updates
                    .iter()
                    .map(|c| format!("{0} = EXCLUDED.{0}", q(c)))
                    .collect();
                format!("DO UPDATE SET {}", set.join(", "))
            };
            format!(
                "INSERT INTO {table_q} ({}) VALUES ({}) ON CONFLICT ({key_q}) {action}",
                quoted.join(", "),
                dialect.placeholders(columns.len()).join(", ")
            )
        }
        Dialect::Mysql => {
            let set: Vec<String> = if updates.is_empty() {
                vec![format!("{key_q} = {key_q}")]
            } else {
                updates
                    .iter()
                    .map(|c| format!("{0} = VALUES({0})", q(c)))
                    .collect()
            };
            format!(
                "INSERT INTO {table_q} ({}) VALUES ({}) ON DUPLICATE KEY UPDATE {}",
                quoted.join(", "),
                dialect.placeholders(columns.len()).join(", "),
                set.join(", ")
            )
        }
        Dialect::Mssql | Dialect::Oracle | Dialect::Snowflake => {
            merge(dialect, &table_q, &key_q, &columns, &updates)
        }
    };

    Statement { sql, params }
}

fn merge(dialect: Dialect, table_q: &str, key_q: &str, columns: &[&str], updates: &[&str]) -> String {
    let q = |ident: &str| dialect.quote_ident(ident);
    let selected: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} AS {}", dialect.placeholder(i + 1), q(c)))
        .collect();
    let quoted: Vec<String> = columns.iter().map(|c| q(c)).collect();
    let sourced: Vec<String> = columns.iter().map(|c| format!("source.{}", q(c))).collect();

    let (from_dual, alias, on) = match dialect {
        Dialect::Oracle => (
            " FROM dual",
            " ",
            format!("(target.{key_q} = source.{key_q})"),
        ),
        _ => ("", " AS ", format!("target.{key_q} = source.{key_q}")),
    };

    let mut sql = format!(
        "MERGE INTO {table_q}{alias}target USING (SELECT {}{from_dual}){alias}source ON {on}",
        selected.join(", ")
    );
    if !updates.is_empty() {
        let set: Vec<String> = updates
            .iter()
            .map(|c| format!("target.{0} = source.{0}", q(c)))
            .collect();
        sql.push_str(&format!(" WHEN MATCHED THEN UPDATE SET {}", set.join(", ")));
    }
    sql.push_str(&format!(
        " WHEN NOT MATCHED THEN INSERT ({}) VALUES ({})",
        quoted.join(", "),
        sourced.join(", ")
    ));
    if dialect == Dialect::Mssql {
        sql.push(';');
    }
    sql
}

/// `DELETE` keyed on `key`.
pub fn delete(dialect: Dialect, table: &str, key: &str, value: &Value) -> Statement {
    Statement {
        sql: format!(
            "DELETE FROM {} WHERE {} = {}",
            dialect.quote_ident(table),
            dialect.quote_ident(key),
            dialect.placeholder(1)
        ),
        params: vec![SqlValue::from(value)],
    }
}
