use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::SqliteAlarmStorage;
use crate::error::Result;
use crate::memory::MemoryAlarmStorage;
use crate::AlarmStorage;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Sqlite,
    Memory,
}

/// `[database]` section shared by every binary that opens alarm storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_path")]
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Read-only connections opened next to the writer.
    #[serde(default = "default_read_connections")]
    pub read_connections: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            path: default_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            read_connections: default_read_connections(),
        }
    }
}

fn default_path() -> PathBuf {
    PathBuf::from("data/vigil.db")
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_read_connections() -> usize {
    4
}

/// Opens the backend `config` names.
pub fn open_storage(config: &DatabaseConfig) -> Result<Box<dyn AlarmStorage>> {
    match config.backend {
        BackendKind::Sqlite => Ok(Box::new(SqliteAlarmStorage::open_with(
            &config.path,
            Duration::from_millis(config.busy_timeout_ms),
            config.read_connections,
        )?)),
        BackendKind::Memory => {
            tracing::warn!("Using in-memory alarm storage; data is lost on exit");
            Ok(Box::new(MemoryAlarmStorage::new()))
        }
    }
}
