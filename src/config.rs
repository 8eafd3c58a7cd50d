use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::cockroach::{self, CockroachBackend, CockroachConfig};
use crate::error::PhysicalError;
use crate::memory::MemoryBackend;
use crate::redb::RedbBackend;
use crate::retry::RetryPolicy;
use crate::sqlite::SqliteBackend;
use crate::traits::Backend;

/// Which storage engine to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum BackendKind {
    #[serde(rename = "cockroachdb")]
    CockroachDb,
    #[serde(rename = "sqlite")]
    Sqlite,
    #[serde(rename = "redb")]
    Redb,
    #[serde(rename = "inmem")]
    InMemory,
}

impl FromStr for BackendKind {
    type Err = PhysicalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cockroachdb" => Ok(BackendKind::CockroachDb),
            "sqlite" => Ok(BackendKind::Sqlite),
            "redb" => Ok(BackendKind::Redb),
            "inmem" => Ok(BackendKind::InMemory),
            other => Err(PhysicalError::Config(format!(
                "unknown backend kind: {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::CockroachDb => "cockroachdb",
            BackendKind::Sqlite => "sqlite",
            BackendKind::Redb => "redb",
            BackendKind::InMemory => "inmem",
        };
        f.write_str(name)
    }
}

/// Retry knobs for aborted transactions. Unset fields keep the defaults of
/// [`RetryPolicy`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let default = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(default.max_attempts),
            base_delay: self
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(default.base_delay),
            max_delay: self
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(default.max_delay),
        }
    }
}

/// Configuration for one backend instance.
///
/// In a TOML file it lives under `[backend]`:
///
/// ```toml
/// [backend]
/// kind = "cockroachdb"
/// connection_url = "postgresql://root@localhost:26257/?sslmode=disable"
/// table = "vault_kv_store"
/// max_parallel = 64
///
/// [backend.retry]
/// max_attempts = 10
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackendConfig {
    pub kind: BackendKind,

    /// Connection string handed to the database driver (cockroachdb).
    pub connection_url: Option<String>,

    /// Table or namespace holding the entries. Defaults to `vault_kv_store`.
    pub table: Option<String>,

    /// Maximum concurrent connections (cockroachdb).
    pub max_parallel: Option<u32>,

    /// Per-operation deadline: statement timeout for cockroachdb, busy
    /// timeout for sqlite.
    pub statement_timeout_ms: Option<u64>,

    pub connect_timeout_ms: Option<u64>,

    /// Database file (sqlite, redb). Sqlite falls back to in-memory.
    pub path: Option<PathBuf>,

    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    backend: BackendConfig,
}

const MAP_KEYS: &[&str] = &[
    "connection_url",
    "table",
    "max_parallel",
    "statement_timeout_ms",
    "connect_timeout_ms",
    "path",
    "retry_max_attempts",
    "retry_base_delay_ms",
    "retry_max_delay_ms",
];

fn parse_num<T: FromStr>(map: &HashMap<String, String>, key: &str) -> Result<Option<T>, PhysicalError>
where
    T::Err: fmt::Display,
{
    match map.get(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            PhysicalError::Config(format!("failed parsing {}={:?}: {}", key, raw, e))
        }),
    }
}

impl BackendConfig {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            connection_url: None,
            table: None,
            max_parallel: None,
            statement_timeout_ms: None,
            connect_timeout_ms: None,
            path: None,
            retry: RetryConfig::default(),
        }
    }

    /// Build from a flat string map, e.g.
    /// `{"connection_url": "...", "table": "vault_kv_store"}`.
    pub fn from_map(kind: &str, map: &HashMap<String, String>) -> Result<Self, PhysicalError> {
        for key in map.keys() {
            if !MAP_KEYS.contains(&key.as_str()) {
                warn!("ignoring unknown backend option {:?}", key);
            }
        }

        Ok(Self {
            kind: kind.parse()?,
            connection_url: map.get("connection_url").cloned(),
            table: map.get("table").cloned(),
            max_parallel: parse_num(map, "max_parallel")?,
            statement_timeout_ms: parse_num(map, "statement_timeout_ms")?,
            connect_timeout_ms: parse_num(map, "connect_timeout_ms")?,
            path: map.get("path").map(PathBuf::from),
            retry: RetryConfig {
                max_attempts: parse_num(map, "retry_max_attempts")?,
                base_delay_ms: parse_num(map, "retry_base_delay_ms")?,
                max_delay_ms: parse_num(map, "retry_max_delay_ms")?,
            },
        })
    }

    /// Parse the `[backend]` section of a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, PhysicalError> {
        let file: FileConfig =
            toml::from_str(text).map_err(|e| PhysicalError::Config(e.to_string()))?;
        Ok(file.backend)
    }

    /// Load the `[backend]` section from a TOML file.
    pub fn load(path: &Path) -> Result<Self, PhysicalError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PhysicalError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    fn table_or_default(&self) -> &str {
        self.table.as_deref().unwrap_or(cockroach::DEFAULT_TABLE)
    }
}

/// Build the backend described by `config`.
pub fn new_backend(config: &BackendConfig) -> Result<Arc<dyn Backend>, PhysicalError> {
    let retry = config.retry.policy();
    let backend: Arc<dyn Backend> = match config.kind {
        BackendKind::CockroachDb => {
            let url = config.connection_url.as_deref().ok_or_else(|| {
                PhysicalError::Config("connection_url must be set for cockroachdb".into())
            })?;
            let mut crdb = CockroachConfig::new(url);
            crdb.table = config.table_or_default().to_string();
            if let Some(max_parallel) = config.max_parallel {
                crdb.max_parallel = max_parallel;
            }
            if let Some(ms) = config.statement_timeout_ms {
                crdb.statement_timeout = Duration::from_millis(ms);
            }
            if let Some(ms) = config.connect_timeout_ms {
                crdb.connect_timeout = Duration::from_millis(ms);
            }
            crdb.retry = retry;
            Arc::new(CockroachBackend::new(crdb)?)
        }
        BackendKind::Sqlite => Arc::new(open_sqlite(config, retry)?),
        BackendKind::Redb => {
            let path = config
                .path
                .as_deref()
                .ok_or_else(|| PhysicalError::Config("path must be set for redb".into()))?;
            Arc::new(RedbBackend::open(path, config.table_or_default())?)
        }
        BackendKind::InMemory => Arc::new(MemoryBackend::new()),
    };
    info!("physical backend {} configured", backend.name());
    Ok(backend)
}

fn open_sqlite(config: &BackendConfig, retry: RetryPolicy) -> Result<SqliteBackend, PhysicalError> {
    let table = config.table_or_default();
    match &config.path {
        Some(path) => {
            let busy = Duration::from_millis(config.statement_timeout_ms.unwrap_or(5_000));
            SqliteBackend::open(path, table, busy, retry)
        }
        None => SqliteBackend::open_in_memory_with_retry(table, retry),
    }
}
