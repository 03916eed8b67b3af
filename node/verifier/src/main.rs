use anyhow::{bail, Result};
use clap::Parser;
use diffuzz_common::{init_tracing, PipelineArgs, PipelineContext};
use diffuzz_verifier::{VerifierConfig, VerifierNode, COMMON_FAILURE_MARKERS};
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "verifier", about = "Compare run results across backends")]
struct Args {
    #[command(flatten)]
    pipeline: PipelineArgs,

    /// Also compare memory prefixes
    #[arg(long, env = "DIFFUZZ_CHECK_MEMORY")]
    check_memory: bool,

    /// Also compare gas consumption
    #[arg(long, env = "DIFFUZZ_CHECK_GAS")]
    check_gas: bool,

    /// Error markers treated as equivalent failures; replaces the built-in crash marker
    #[arg(long = "marker", env = "DIFFUZZ_MARKERS", value_delimiter = ',')]
    markers: Vec<String>,

    /// Add the common failure vocabulary (revert, out of gas, overflow, ...) to the markers
    #[arg(long, env = "DIFFUZZ_COMMON_MARKERS")]
    common_markers: bool,

    /// Let identical error messages correlate without a marker
    #[arg(long, env = "DIFFUZZ_IDENTICAL_ERRORS")]
    identical_errors: bool,

    #[arg(long, default_value = "100")]
    batch_size: u32,

    /// Seconds to wait when nothing is ready
    #[arg(long, default_value = "5")]
    poll_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    if args.pipeline.backends.len() < 2 {
        bail!("at least two backends are needed for differential verification");
    }

    info!("Starting verifier");

    let mut config = VerifierConfig::default();
    config.checks.memory = args.check_memory;
    config.checks.gas = args.check_gas;
    config.checks.identical_errors = args.identical_errors;
    if !args.markers.is_empty() {
        config.checks.markers = args.markers;
    }
    if args.common_markers {
        config
            .checks
            .markers
            .extend(COMMON_FAILURE_MARKERS.iter().map(|m| m.to_string()));
    }
    config.batch_size = args.batch_size;
    config.poll_interval = Duration::from_secs(args.poll_interval);

    let ctx = PipelineContext::connect(&args.pipeline).await?;
    VerifierNode::new(ctx, config).run().await
}
