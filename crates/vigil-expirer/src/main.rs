mod config;

use anyhow::Result;
use tracing_subscriber::EnvFilter;
use vigil_storage::config::open_storage;
use vigil_storage::AlarmStorage;

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  vigil-expirer [config.toml]    Delete alarm history older than the configured TTL");
}

/// Prunes in batches until a batch comes back short. Returns the total.
fn expire(storage: &dyn AlarmStorage, ttl_secs: u64, batch: Option<u64>) -> Result<u64> {
    let mut total = 0;
    loop {
        let deleted = storage.prune_history(ttl_secs, batch)?;
        total += deleted;
        match batch {
            Some(size) if deleted >= size => {
                tracing::debug!(deleted, total, "Deleted history batch");
            }
            _ => return Ok(total),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("vigil_expirer=info".parse()?)
                .add_directive("vigil_storage=info".parse()?),
        )
        .init();

    let config_path = match std::env::args().nth(1) {
        Some(arg) if arg == "-h" || arg == "--help" => {
            print_usage();
            return Ok(());
        }
        Some(path) => path,
        None => "config/expirer.toml".to_string(),
    };

    let config = config::ExpirerConfig::load(&config_path)?;
    let Some(ttl_secs) = config.ttl_secs() else {
        tracing::info!("Alarm history time to live is disabled, nothing to clean");
        return Ok(());
    };

    let storage = open_storage(&config.database)?;
    let batch = config.batch_size();
    tracing::info!(ttl_secs, batch_size = ?batch, "Expiring alarm history");

    let total = expire(storage.as_ref(), ttl_secs, batch)?;
    tracing::info!(deleted = total, "Alarm history expiry finished");
    Ok(())
}
