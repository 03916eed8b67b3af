mod dispatcher;

use anyhow::Result;
use clap::{Parser, Subcommand};
use diffuzz_common::{init_tracing, PipelineArgs, PipelineContext};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "dispatcher", about = "Queue generated candidates for every backend")]
struct Args {
    #[command(flatten)]
    pipeline: PipelineArgs,

    /// Generations enqueued per poll
    #[arg(long, default_value = "1000")]
    batch_size: u32,

    /// Seconds between polls
    #[arg(long, default_value = "5")]
    poll_interval: u64,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the store and publish jobs (default)
    Run,
    /// Load newline-delimited generation records into the store
    Ingest { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let ctx = PipelineContext::connect(&args.pipeline).await?;

    match args.command {
        Some(Command::Ingest { file }) => {
            dispatcher::ingest(&ctx, &file).await?;
        }
        Some(Command::Run) | None => {
            info!("Starting dispatcher for {}", ctx.backends.join(", "));
            let dispatcher = dispatcher::Dispatcher::new(
                ctx,
                args.batch_size,
                Duration::from_secs(args.poll_interval),
            );
            dispatcher.run().await?;
        }
    }
    Ok(())
}
