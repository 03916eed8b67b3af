use anyhow::Result;
use clap::{Parser, Subcommand};
use diffuzz_common::{init_tracing, PipelineArgs, PipelineContext};
use diffuzz_monitor::{report, Monitor, MonitorConfig, ScriptSupervisor};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "monitor", about = "Keep the fuzzing pipeline alive and collect evidence")]
struct Args {
    #[command(flatten)]
    pipeline: PipelineArgs,

    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the control loop (default)
    Run,
    /// Print current counters
    Stats,
    /// Write every verified generation to a directory as JSON
    Dump { dir: PathBuf },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[arg(long, env = "DIFFUZZ_RESULTS_DIR", default_value = "results")]
    results_dir: PathBuf,

    /// Directory holding the lifecycle scripts
    #[arg(long, env = "DIFFUZZ_SCRIPTS_DIR", default_value = "scripts")]
    scripts_dir: PathBuf,

    #[arg(long, env = "DIFFUZZ_GENERATOR_LOG", default_value = "logs/generator.log")]
    generator_log: PathBuf,

    /// Do not wait for a seed line in the generator log
    #[arg(long)]
    no_seed: bool,

    /// Seconds between cycles
    #[arg(long, default_value = "60")]
    interval: u64,

    #[arg(long, default_value = "2")]
    restart_threshold: u32,

    /// Seconds between proactive runner recycles
    #[arg(long, default_value = "300")]
    ram_cleanup: u64,

    #[arg(long = "crash-marker", default_value = "This is an unhandled")]
    crash_markers: Vec<String>,
}

impl RunArgs {
    fn config(self) -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_secs(self.interval),
            restart_threshold: self.restart_threshold,
            ram_cleanup: Duration::from_secs(self.ram_cleanup),
            results_dir: self.results_dir,
            generator_log: (!self.no_seed).then_some(self.generator_log),
            crash_markers: self.crash_markers,
            ..MonitorConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let ctx = PipelineContext::connect(&args.pipeline).await?;

    match args.command {
        Some(Command::Stats) => {
            print!("{}", report::format_stats(&report::stats(&ctx).await?));
        }
        Some(Command::Dump { dir }) => {
            let written = report::dump(&ctx, &dir).await?;
            println!("{written} generations written to {}", dir.display());
        }
        Some(Command::Run) | None => serve(ctx, args.run).await?,
    }
    Ok(())
}

async fn serve(ctx: PipelineContext, run: RunArgs) -> Result<()> {
    info!("Starting monitor");
    let supervisor = ScriptSupervisor::new(run.scripts_dir.clone());
    let mut monitor = Monitor::new(ctx, supervisor, run.config()).await?;
    monitor.run().await;
    Ok(())
}
