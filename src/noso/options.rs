use crate::noso::error::MinerError;
use clap::Parser;
use std::path::PathBuf;

/// Command line and environment configuration for the miner.
#[derive(Debug, Clone, Parser)]
#[command(name = "noso-miner", version, about = "CPU miner for Noso pools")]
pub struct Options {
    /// Pool host name or IP address
    #[arg(short = 'a', long, env = "NOSO_POOL_ADDRESS")]
    pub address: String,

    /// Pool port
    #[arg(long, env = "NOSO_POOL_PORT", default_value_t = 8082)]
    pub port: u16,

    /// Pool password
    #[arg(short = 'p', long, env = "NOSO_POOL_PASSWORD")]
    pub password: String,

    /// Wallet address; repeat to rotate between wallets on each reconnect
    #[arg(short = 'w', long = "wallet", required = true)]
    pub wallets: Vec<String>,

    /// Number of mining threads
    #[arg(short = 'c', long, default_value_t = 4)]
    pub cpu: usize,

    /// Seconds between status reports
    #[arg(long, default_value_t = 60)]
    pub status_interval: u64,

    /// Log Proof of Participation solutions at info level
    #[arg(long)]
    pub show_pop: bool,

    /// Exit instead of reconnecting when the connection is lost
    #[arg(long)]
    pub exit_on_retry: bool,

    /// CSV file recording payment requests and responses
    #[arg(long, default_value = "payments.csv")]
    pub payments_file: PathBuf,
}

impl Options {
    pub fn validate(&self) -> Result<(), MinerError> {
        if self.address.trim().is_empty() {
            return Err(MinerError::Config("pool address is required".into()));
        }
        if self.password.is_empty() {
            return Err(MinerError::Config("pool password is required".into()));
        }
        if self.wallets.iter().all(|w| w.trim().is_empty()) {
            return Err(MinerError::Config("at least one wallet is required".into()));
        }
        if self.cpu < 1 {
            return Err(MinerError::Config("cpu must be at least 1".into()));
        }
        if self.status_interval == 0 {
            return Err(MinerError::Config("status interval must be positive".into()));
        }
        Ok(())
    }

    /// `host:port` of the pool.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}
