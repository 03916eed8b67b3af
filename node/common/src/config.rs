use clap::Args;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::reliability::RetryPolicy;

/// Settings shared by every pipeline process
#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
    /// Shared document store and job queue database
    #[arg(long, env = "DIFFUZZ_DATABASE", default_value = "sqlite://diffuzz.db")]
    pub database: String,

    /// Backends that must all report before a generation is verified
    #[arg(long, env = "DIFFUZZ_BACKENDS", value_delimiter = ',')]
    pub backends: Vec<String>,

    /// Connection attempts before the process gives up
    #[arg(long, env = "DIFFUZZ_CONNECT_ATTEMPTS", default_value = "20")]
    pub connect_attempts: u32,

    /// Fixed delay between connection attempts, in seconds
    #[arg(long, env = "DIFFUZZ_CONNECT_DELAY", default_value = "5")]
    pub connect_delay_secs: u64,

    /// Seconds an unacknowledged job stays leased before redelivery
    #[arg(long, env = "DIFFUZZ_LEASE", default_value = "600")]
    pub lease_secs: u64,
}

impl PipelineArgs {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.connect_attempts.max(1),
            Duration::from_secs(self.connect_delay_secs),
        )
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

/// Install the fmt subscriber; `RUST_LOG` overrides the default `info` level
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
