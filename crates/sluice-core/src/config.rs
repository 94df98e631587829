//! Declarative system configuration loaded from YAML.
//!
//! ```yaml
//! systems:
//!   - name: stripe
//!     type: stripe
//!     api_key: "sk_..."
//!     use_cli_listener: true
//!     push_frequency: 10s
//!   - name: warehouse
//!     type: postgresql
//!     dsn: "postgres://..."
//!     max_open_connections: 20
//!     max_idle_connections: 5
//!     max_connection_idle_time: 5m
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Default interval between drain ticks.
pub const DEFAULT_PUSH_FREQUENCY: Duration = Duration::from_secs(10);

/// Default number of items a drain worker moves per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Supported external system types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemType {
    Postgresql,
    Mysql,
    Mssql,
    Oracle,
    Snowflake,
    Clickhouse,
    Stripe,
}

/// Whether a system pushes events to us or receives drained batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Source,
    Sink,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Sink => "sink",
        }
    }
}

impl SystemType {
    pub fn role(self) -> Role {
        match self {
            Self::Stripe => Role::Source,
            _ => Role::Sink,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Postgresql => "postgresql",
            Self::Mysql => "mysql",
            Self::Mssql => "mssql",
            Self::Oracle => "oracle",
            Self::Snowflake => "snowflake",
            Self::Clickhouse => "clickhouse",
            Self::Stripe => "stripe",
        }
    }

    fn default_port(self) -> Option<u16> {
        match self {
            Self::Postgresql => Some(5432),
            Self::Mysql => Some(3306),
            Self::Mssql => Some(1433),
            Self::Oracle => Some(1521),
            Self::Clickhouse => Some(8123),
            Self::Snowflake | Self::Stripe => None,
        }
    }
}

impl fmt::Display for SystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A secret string that never appears in `Debug` output or serialized config.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"***\"")
    }
}

/// How one source object type is mapped onto a schema.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ReceiveRoute {
    /// Schema key to validate against. Defaults to the source object name.
    #[serde(default)]
    pub model: Option<String>,

    /// Dotted input path → dotted canonical path.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    /// Constant fields set after renaming.
    #[serde(default)]
    pub hardcode: BTreeMap<String, Value>,
}

/// A `receive` entry: one route, or a list with one route per schema the
/// source object feeds.
#[derive(Deserialize)]
#[serde(untagged)]
enum RouteList {
    Many(Vec<ReceiveRoute>),
    One(ReceiveRoute),
}

fn deserialize_receive<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, Vec<ReceiveRoute>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, RouteList>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(object, routes)| {
            let routes = match routes {
                RouteList::Many(routes) => routes,
                RouteList::One(route) => vec![route],
            };
            (object, routes)
        })
        .collect())
}

/// Where a sink writes one object type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TableTarget {
    /// Target table. Defaults to the object type name.
    #[serde(default)]
    pub table: Option<String>,

    /// Column used for upserts and deletes.
    #[serde(default)]
    pub conflict_key: Option<String>,
}

/// Declarative configuration record for one external system.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemInfo {
    pub name: String,

    #[serde(rename = "type")]
    pub system_type: SystemType,

    /// Full connection string. Built from the discrete fields when absent.
    #[serde(default)]
    pub dsn: Option<String>,

    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub database: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<Secret>,

    #[serde(default)]
    pub api_key: Option<Secret>,

    /// Shared secret used to verify webhook signatures.
    #[serde(default)]
    pub endpoint_secret: Option<Secret>,

    /// Spawn the vendor CLI to forward events to this process.
    #[serde(default)]
    pub use_cli_listener: bool,

    #[serde(default = "default_push_frequency", with = "humantime_serde")]
    pub push_frequency: Duration,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_max_open")]
    pub max_open_connections: u32,

    #[serde(default = "default_max_idle")]
    pub max_idle_connections: u32,

    #[serde(default = "default_idle_time", with = "humantime_serde")]
    pub max_connection_idle_time: Duration,

    /// Source only: receive routes keyed by source object name. One source
    /// object may feed several schemas.
    #[serde(default, deserialize_with = "deserialize_receive")]
    pub receive: BTreeMap<String, Vec<ReceiveRoute>>,

    /// Sink only: object types to drain. `None` means every schema key.
    #[serde(default)]
    pub objects: Option<Vec<String>>,

    /// Sink only: per-object table targets.
    #[serde(default)]
    pub tables: BTreeMap<String, TableTarget>,

    // Snowflake
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub warehouse: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

fn default_push_frequency() -> Duration {
    DEFAULT_PUSH_FREQUENCY
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_max_open() -> u32 {
    10
}

fn default_max_idle() -> u32 {
    2
}

fn default_idle_time() -> Duration {
    Duration::from_secs(300)
}

impl SystemInfo {
    /// Minimal record for the given name and type, all other fields defaulted.
    pub fn new(name: impl Into<String>, system_type: SystemType) -> Self {
        Self {
            name: name.into(),
            system_type,
            dsn: None,
            hostname: None,
            port: None,
            database: None,
            username: None,
            password: None,
            api_key: None,
            endpoint_secret: None,
            use_cli_listener: false,
            push_frequency: DEFAULT_PUSH_FREQUENCY,
            batch_size: DEFAULT_BATCH_SIZE,
            max_open_connections: default_max_open(),
            max_idle_connections: default_max_idle(),
            max_connection_idle_time: default_idle_time(),
            receive: BTreeMap::new(),
            objects: None,
            tables: BTreeMap::new(),
            account: None,
            warehouse: None,
            schema: None,
            role: None,
            token_type: None,
        }
    }

    pub fn role(&self) -> Role {
        self.system_type.role()
    }

    /// Target table and conflict key for an object type.
    pub fn table_for(&self, object: &str) -> (String, Option<String>) {
        match self.tables.get(object) {
            Some(target) => (
                target.table.clone().unwrap_or_else(|| object.to_string()),
                target.conflict_key.clone(),
            ),
            None => (object.to_string(), None),
        }
    }

    /// Whether this sink drains the given object type.
    pub fn drains(&self, object: &str) -> bool {
        match &self.objects {
            Some(objects) => objects.iter().any(|o| o == object),
            None => true,
        }
    }

    /// Connection string for the system, built from discrete fields when no
    /// `dsn` is configured.
    pub fn connection_string(&self) -> Result<String> {
        if let Some(dsn) = &self.dsn
            && !dsn.is_empty()
        {
            return Ok(dsn.clone());
        }

        let host = || {
            self.hostname.as_deref().ok_or_else(|| {
                Error::Config(format!(
                    "system '{}' needs either 'dsn' or 'hostname'",
                    self.name
                ))
            })
        };
        let port = self.port.or(self.system_type.default_port()).unwrap_or(0);
        let database = self.database.as_deref().unwrap_or_default();
        let password = self.password.as_ref().map(Secret::expose).unwrap_or_default();

        let userinfo = match self.username.as_deref() {
            Some(user) if password.is_empty() => format!("{}@", encode_userinfo(user)),
            Some(user) => format!("{}:{}@", encode_userinfo(user), encode_userinfo(password)),
            None => String::new(),
        };

        let dsn = match self.system_type {
            SystemType::Postgresql => {
                format!("postgres://{userinfo}{}:{port}/{database}", host()?)
            }
            SystemType::Mysql => format!("mysql://{userinfo}{}:{port}/{database}", host()?),
            SystemType::Mssql => {
                let mut ado = format!("server=tcp:{},{port};TrustServerCertificate=true", host()?);
                if !database.is_empty() {
                    ado.push_str(&format!(";database={database}"));
                }
                if let Some(user) = &self.username {
                    ado.push_str(&format!(";user={user};password={password}"));
                }
                ado
            }
            SystemType::Oracle => format!("//{}:{port}/{database}", host()?),
            SystemType::Clickhouse => format!("http://{}:{port}", host()?),
            SystemType::Snowflake => {
                let account = self.account.as_deref().ok_or_else(|| {
                    Error::Config(format!("snowflake system '{}' needs 'account'", self.name))
                })?;
                format!("https://{account}.snowflakecomputing.com")
            }
            SystemType::Stripe => {
                return Err(Error::Config(format!(
                    "system '{}' of type stripe has no connection string",
                    self.name
                )));
            }
        };

        Ok(dsn)
    }
}

/// Percent-encode the characters that would break URL userinfo.
fn encode_userinfo(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '.' | '_' | '~' => out.push(c),
            _ => {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("%{b:02X}"));
                }
            }
        }
    }
    out
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub systems: Vec<SystemInfo>,
}

impl Config {
    /// Read, parse and validate a YAML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Config = if raw.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(&raw).map_err(|source| Error::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?
        };

        config.validate()?;

        tracing::info!(
            path = %path.display(),
            systems = config.systems.len(),
            sources = config.sources().count(),
            sinks = config.sinks().count(),
            "configuration loaded"
        );

        Ok(config)
    }

    /// Parse and validate YAML text.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(raw).map_err(|source| Error::ConfigParse {
            path: "<inline>".into(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();

        for system in &self.systems {
            if system.name.is_empty() {
                return Err(Error::Config("system with empty name".to_string()));
            }
            if system.name.contains('/') {
                return Err(Error::Config(format!(
                    "system name '{}' must be a single path segment",
                    system.name
                )));
            }
            if !names.insert(system.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate system name '{}'",
                    system.name
                )));
            }
            if system.batch_size == 0 {
                return Err(Error::Config(format!(
                    "system '{}' has batch_size 0",
                    system.name
                )));
            }
            if system.push_frequency.is_zero() {
                return Err(Error::Config(format!(
                    "system '{}' has a zero push_frequency",
                    system.name
                )));
            }

            match system.role() {
                Role::Source => {
                    if system.objects.is_some() || !system.tables.is_empty() {
                        return Err(Error::Config(format!(
                            "source '{}' cannot declare sink keys 'objects' or 'tables'",
                            system.name
                        )));
                    }
                    for (object, routes) in &system.receive {
                        let mut models = HashSet::new();
                        for route in routes {
                            let model = route.model.as_deref().unwrap_or(object.as_str());
                            if !models.insert(model) {
                                return Err(Error::Config(format!(
                                    "source '{}' routes '{object}' to '{model}' more than once",
                                    system.name
                                )));
                            }
                        }
                    }
                }
                Role::Sink => {
                    if !system.receive.is_empty() || system.use_cli_listener {
                        return Err(Error::Config(format!(
                            "sink '{}' cannot declare source keys 'receive' or 'use_cli_listener'",
                            system.name
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    pub fn sources(&self) -> impl Iterator<Item = &SystemInfo> {
        self.systems.iter().filter(|s| s.role() == Role::Source)
    }

    pub fn sinks(&self) -> impl Iterator<Item = &SystemInfo> {
        self.systems.iter().filter(|s| s.role() == Role::Sink)
    }
}
