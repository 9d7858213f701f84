//! `ephemera` server binary.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use ephemera_collab::{DocumentLimits, RateLimitConfig, ServerConfig, SyncServer};

/// Ephemeral collaborative document server.
#[derive(Debug, Parser)]
#[command(name = "ephemera")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "EPHEMERA_BIND", default_value = "127.0.0.1:8787")]
    bind: String,

    /// RocksDB directory. Documents are kept in memory when unset.
    #[arg(long, env = "EPHEMERA_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Origin used in the URLs of created documents.
    #[arg(long, env = "EPHEMERA_PUBLIC_ORIGIN")]
    public_origin: Option<String>,

    /// Live editors allowed per document.
    #[arg(long, env = "EPHEMERA_MAX_CONNECTIONS", default_value_t = 100)]
    max_connections: usize,

    /// Largest persisted document state, in bytes.
    #[arg(long, env = "EPHEMERA_MAX_DOCUMENT_BYTES", default_value_t = 512 * 1024)]
    max_document_bytes: usize,

    /// Quiet period before edits are written, in milliseconds.
    #[arg(long, env = "EPHEMERA_PERSIST_DEBOUNCE_MS", default_value_t = 2000)]
    persist_debounce_ms: u64,

    /// Seconds without traffic before a document actor is evicted (0 = never).
    #[arg(long, env = "EPHEMERA_IDLE_EVICTION_SECS", default_value_t = 300)]
    idle_eviction_secs: u64,

    /// Documents one client may create per window.
    #[arg(long, env = "EPHEMERA_RATE_LIMIT", default_value_t = 10)]
    rate_limit: u32,

    /// Rate-limit window, in seconds.
    #[arg(long, env = "EPHEMERA_RATE_WINDOW_SECS", default_value_t = 3600)]
    rate_window_secs: u64,
}

impl Cli {
    fn config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            storage_path: self.data_dir.clone(),
            public_origin: self.public_origin.clone(),
            limits: DocumentLimits {
                max_connections: self.max_connections,
                max_document_bytes: self.max_document_bytes,
                persist_debounce: Duration::from_millis(self.persist_debounce_ms),
            },
            idle_eviction: (self.idle_eviction_secs > 0)
                .then(|| Duration::from_secs(self.idle_eviction_secs)),
            rate_limit: RateLimitConfig {
                max_requests: self.rate_limit,
                window: Duration::from_secs(self.rate_window_secs),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let server = SyncServer::new(cli.config())?;
    server.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_match_server_defaults() {
        let cli = Cli::parse_from(["ephemera"]);
        let config = cli.config();
        let defaults = ServerConfig::default();
        assert_eq!(config.bind_addr, defaults.bind_addr);
        assert_eq!(config.limits, defaults.limits);
        assert_eq!(config.idle_eviction, defaults.idle_eviction);
        assert_eq!(config.rate_limit, defaults.rate_limit);
    }

    #[test]
    fn test_zero_idle_disables_eviction() {
        let cli = Cli::parse_from(["ephemera", "--idle-eviction-secs", "0"]);
        assert_eq!(cli.config().idle_eviction, None);
    }
}
