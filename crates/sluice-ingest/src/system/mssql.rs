//! SQL Server sink.
//!
//! Uses a single TDS connection guarded by an async mutex; batches are
//! serialized through it. The connection is taken out of its slot for the
//! length of a batch and put back only when the batch ended with the
//! transaction either committed or rolled back. A batch that is cancelled
//! mid-way (the drain write timeout drops its future) or whose rollback
//! fails leaves the slot broken, and the next batch reconnects.

use std::borrow::Cow;

use async_trait::async_trait;
use sluice_core::{Envelope, SystemInfo};
use tiberius::{Client, ColumnData, Config, ToSql};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};

use super::SinkAdapter;
use super::sql::{Dialect, Planned, SqlValue, plan};
use crate::error::{Error, Result};

type Connection = Client<Compat<TcpStream>>;

impl ToSql for SqlValue {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            SqlValue::Null => ColumnData::String(None),
            SqlValue::Bool(b) => ColumnData::Bit(Some(*b)),
            SqlValue::Int(i) => ColumnData::I64(Some(*i)),
            SqlValue::Float(f) => ColumnData::F64(Some(*f)),
            SqlValue::Text(s) => ColumnData::String(Some(Cow::Borrowed(s.as_str()))),
        }
    }
}

/// Where the connection is between batches.
enum Slot<C> {
    Closed,
    Ready(C),
    /// Checked out and never returned.
    Broken,
}

enum Checkout<C> {
    Ready(C),
    Reconnect,
    Closed,
}

impl<C> Slot<C> {
    /// Take the connection, leaving `Broken` behind until [`Slot::restore`].
    fn checkout(&mut self) -> Checkout<C> {
        match std::mem::replace(self, Slot::Broken) {
            Slot::Ready(client) => Checkout::Ready(client),
            Slot::Broken => Checkout::Reconnect,
            Slot::Closed => {
                *self = Slot::Closed;
                Checkout::Closed
            }
        }
    }

    fn restore(&mut self, client: C) {
        *self = Slot::Ready(client);
    }
}

pub struct MssqlSink {
    info: SystemInfo,
    client: Mutex<Slot<Connection>>,
}

impl MssqlSink {
    pub fn new(info: SystemInfo) -> Self {
        Self {
            info,
            client: Mutex::new(Slot::Closed),
        }
    }

    async fn connect(&self) -> Result<Connection> {
        let config = Config::from_ado_string(&self.info.connection_string()?)?;
        let tcp = TcpStream::connect(config.get_addr()).await?;
        tcp.set_nodelay(true)?;

        let mut client = Client::connect(config, tcp.compat_write()).await?;
        client.simple_query("SELECT 1").await?.into_results().await?;
        Ok(client)
    }

    async fn transact(&self, client: &mut Connection, object: &str, items: &[Envelope]) -> Result<()> {
        client.simple_query("BEGIN TRAN").await?.into_results().await?;
        self.run_batch(client, object, items).await?;
        client.simple_query("COMMIT").await?.into_results().await?;
        Ok(())
    }

    /// Roll back whatever the failed batch left open. False means the
    /// connection state is unknown.
    async fn rollback(&self, client: &mut Connection) -> bool {
        let result = match client.simple_query("IF @@TRANCOUNT > 0 ROLLBACK").await {
            Ok(stream) => stream.into_results().await.map(|_| ()),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(system = %self.info.name, error = %e, "rollback failed, dropping connection");
                false
            }
        }
    }

    fn not_open(&self) -> Error {
        Error::SinkWrite {
            system: self.info.name.clone(),
            reason: "connection not open".to_string(),
        }
    }

    async fn run_batch(&self, client: &mut Connection, object: &str, items: &[Envelope]) -> Result<()> {
        let (table, conflict_key) = self.info.table_for(object);

        for envelope in items {
            match plan(Dialect::Mssql, &table, conflict_key.as_deref(), envelope) {
                Planned::Run(stmt) => {
                    let params: Vec<&dyn ToSql> = stmt.params.iter().map(|p| p as &dyn ToSql).collect();
                    client.execute(stmt.sql.as_str(), &params).await?;
                }
                Planned::Skip(reason) => {
                    warn!(system = %self.info.name, object = %object, reason, "skipping envelope");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SinkAdapter for MssqlSink {
    fn info(&self) -> &SystemInfo {
        &self.info
    }

    async fn open_connection(&self) -> Result<()> {
        let client = self.connect().await?;
        self.client.lock().await.restore(client);
        debug!(system = %self.info.name, "connection open");
        Ok(())
    }

    async fn write_batch(&self, object: &str, items: &[Envelope]) -> Result<()> {
        let mut slot = self.client.lock().await;
        let mut client = match slot.checkout() {
            Checkout::Ready(client) => client,
            Checkout::Reconnect => {
                warn!(system = %self.info.name, "previous batch did not finish, reconnecting");
                self.connect().await?
            }
            Checkout::Closed => return Err(self.not_open()),
        };

        match self.transact(&mut client, object, items).await {
            Ok(()) => {
                slot.restore(client);
                Ok(())
            }
            Err(e) => {
                if self.rollback(&mut client).await {
                    slot.restore(client);
                }
                Err(e)
            }
        }
    }

    async fn close(&self) {
        let slot = std::mem::replace(&mut *self.client.lock().await, Slot::Closed);
        if let Slot::Ready(client) = slot
            && let Err(e) = client.close().await
        {
            debug!(system = %self.info.name, error = %e, "error closing connection");
        }
    }
}
