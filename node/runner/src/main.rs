use anyhow::Result;
use clap::Parser;
use diffuzz_common::{init_tracing, PipelineArgs, PipelineContext};
use diffuzz_runner::{PoisonPolicy, ProcessExecutor, RunnerConfig, RunnerNode};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "runner", about = "Execute queued generations on one backend")]
struct Args {
    #[command(flatten)]
    pipeline: PipelineArgs,

    /// Backend key; also the name of the queue this runner consumes
    #[arg(long, env = "DIFFUZZ_BACKEND")]
    backend: String,

    /// Program that speaks the executor bridge protocol
    #[arg(long, env = "DIFFUZZ_BACKEND_CMD")]
    backend_cmd: String,

    /// Extra arguments passed to the backend program
    #[arg(long = "backend-arg", allow_hyphen_values = true)]
    backend_args: Vec<String>,

    /// Only run the first N input sets of each function
    #[arg(long, env = "DIFFUZZ_INPUTS_PER_FUNCTION")]
    inputs_per_function: Option<usize>,

    #[arg(long, env = "DIFFUZZ_SNAPSHOT_SLOTS", default_value = "10")]
    snapshot_slots: usize,

    #[arg(long, value_enum, env = "DIFFUZZ_POISON", default_value = "dead-letter")]
    poison: PoisonPolicy,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    info!("Starting runner for backend {}", args.backend);

    let ctx = PipelineContext::connect(&args.pipeline).await?;
    let executor = ProcessExecutor::new(args.backend_cmd, args.backend_args);

    let mut config = RunnerConfig::new(args.backend);
    config.inputs_per_function = args.inputs_per_function;
    config.snapshot_slots = args.snapshot_slots;
    config.poison_policy = args.poison;

    RunnerNode::new(ctx, executor, config).run().await
}
