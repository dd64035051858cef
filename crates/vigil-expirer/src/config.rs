use serde::Deserialize;
use vigil_storage::config::DatabaseConfig;

#[derive(Debug, Deserialize)]
pub struct ExpirerConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Seconds to keep alarm history. Zero or negative keeps it forever.
    #[serde(default = "default_alarm_history_time_to_live")]
    pub alarm_history_time_to_live: i64,
    /// Rows deleted per statement; 0 deletes everything expired at once.
    #[serde(default)]
    pub alarm_histories_delete_batch_size: u64,
}

fn default_alarm_history_time_to_live() -> i64 {
    -1
}

impl ExpirerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// History TTL in seconds, or `None` when expiry is disabled.
    pub fn ttl_secs(&self) -> Option<u64> {
        u64::try_from(self.alarm_history_time_to_live)
            .ok()
            .filter(|ttl| *ttl > 0)
    }

    /// Per-statement delete cap, `None` meaning unbounded.
    pub fn batch_size(&self) -> Option<u64> {
        Some(self.alarm_histories_delete_batch_size).filter(|size| *size > 0)
    }
}
