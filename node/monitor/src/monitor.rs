//! Health monitor control loop.
//!
//! One cycle per interval: sample counters, write the metrics block, move
//! newly found crashes and discrepancies into the evidence files, then judge
//! throughput. Repeated stalls, and any error inside a cycle, end in a full
//! reset with a new file sequence. The loop itself never returns.

use anyhow::{Context, Result};
use diffuzz_common::{MonitorSnapshot, PipelineContext, SnapshotDelta};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::evidence::{append, discover_sequence, EvidenceFiles};
use crate::seed::wait_for_seed;
use crate::supervisor::Supervisor;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// Consecutive unhealthy cycles that trigger a full restart
    pub restart_threshold: u32,
    /// Runners are recycled whenever elapsed time is a multiple of this
    pub ram_cleanup: Duration,
    pub results_dir: PathBuf,
    pub generator_log: Option<PathBuf>,
    pub seed_window: usize,
    pub seed_poll: Duration,
    pub seed_attempts: u32,
    pub crash_markers: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            restart_threshold: 2,
            ram_cleanup: Duration::from_secs(300),
            results_dir: PathBuf::from("results"),
            generator_log: Some(PathBuf::from("logs/generator.log")),
            seed_window: 50,
            seed_poll: Duration::from_secs(5),
            seed_attempts: 120,
            crash_markers: vec!["This is an unhandled".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Grace cycle; no baseline to judge against
    Initializing,
    Running,
    RestartingSubcomponent,
    FullRestart,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthAction {
    Grace,
    Healthy,
    Restarted { runners: bool, generator: bool },
    FullRestart,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub sequence: u64,
    pub current: MonitorSnapshot,
    pub delta: SnapshotDelta,
    pub crashes_logged: usize,
    pub discrepancies_logged: usize,
    pub action: HealthAction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// The cycle failed and the monitor reset itself
    Failed(String),
}

pub struct Monitor<S: Supervisor> {
    ctx: PipelineContext,
    supervisor: S,
    config: MonitorConfig,
    files: EvidenceFiles,
    phase: Phase,
    baseline: Option<MonitorSnapshot>,
    seed: Option<String>,
    elapsed: u64,
    total_time: u64,
    runner_streak: u32,
    generator_streak: u32,
}

impl<S: Supervisor> Monitor<S> {
    pub async fn new(ctx: PipelineContext, supervisor: S, config: MonitorConfig) -> Result<Self> {
        let sequence = discover_sequence(&config.results_dir)
            .with_context(|| format!("cannot read {}", config.results_dir.display()))?;
        let files = EvidenceFiles::new(&config.results_dir, sequence);

        let mut monitor = Self {
            ctx,
            supervisor,
            config,
            files,
            phase: Phase::Initializing,
            baseline: None,
            seed: None,
            elapsed: 0,
            total_time: 0,
            runner_streak: 0,
            generator_streak: 0,
        };
        monitor.reset(sequence).await?;
        Ok(monitor)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn files(&self) -> &EvidenceFiles {
        &self.files
    }

    pub fn streaks(&self) -> (u32, u32) {
        (self.runner_streak, self.generator_streak)
    }

    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }

    pub async fn run(&mut self) {
        info!("Monitor writing to {}", self.config.results_dir.display());
        loop {
            self.cycle().await;
            sleep(self.config.interval).await;
        }
    }

    pub async fn cycle(&mut self) -> CycleOutcome {
        match self.try_cycle().await {
            Ok(report) => CycleOutcome::Completed(report),
            Err(e) => {
                let message = format!("{e:#}");
                error!("Monitor cycle failed: {}", message);
                let event = format!("monitor_event:error\nerror_message:{message}\n");
                if let Err(e) = append(&self.files.metadata, &event).await {
                    warn!("Failed to write monitor metadata: {}", e);
                }
                let next = self.files.sequence + 1;
                if let Err(e) = self.reset(next).await {
                    error!("Monitor reset failed: {:#}", e);
                }
                CycleOutcome::Failed(message)
            }
        }
    }

    async fn try_cycle(&mut self) -> Result<CycleReport> {
        if self.phase == Phase::RestartingSubcomponent {
            self.phase = Phase::Running;
        }

        let current = self
            .ctx
            .store
            .counters(&self.ctx.backends)
            .await
            .context("failed to read counters")?;
        let delta = current.delta(&self.baseline.clone().unwrap_or_default());

        self.log_metrics(&current, &delta).await?;
        let crashes_logged = self.log_compiler_crashes().await?;
        let discrepancies_logged = self.log_discrepancies().await?;

        let sequence = self.files.sequence;
        let action = self.evaluate_health(&delta).await?;

        if action == HealthAction::FullRestart {
            self.total_time += self.config.interval.as_secs();
            self.reset(sequence + 1).await?;
            self.baseline = Some(current.clone());
        } else {
            self.baseline = Some(current.clone());
            self.elapsed += self.config.interval.as_secs();
            self.total_time += self.config.interval.as_secs();
        }

        Ok(CycleReport {
            sequence,
            current,
            delta,
            crashes_logged,
            discrepancies_logged,
            action,
        })
    }

    async fn evaluate_health(&mut self, delta: &SnapshotDelta) -> Result<HealthAction> {
        if self.phase == Phase::Initializing {
            self.phase = Phase::Running;
            return Ok(HealthAction::Grace);
        }

        let metadata = self.files.metadata.clone();
        let cleanup = self.config.ram_cleanup.as_secs();
        let stalled = self.ctx.backends.iter().any(|b| delta.runs_for(b) == 0);
        let recycle = cleanup > 0 && self.elapsed % cleanup == 0;

        let runners = stalled || recycle;
        if runners {
            append(&metadata, "monitor_event:restarting_runners\n").await?;
            if stalled {
                warn!("Runner throughput stalled, restarting runners");
            } else {
                info!("Recycling runners after {}s", self.elapsed);
            }
            self.supervisor
                .restart_runners(&metadata)
                .await
                .context("failed to restart runners")?;
            self.runner_streak += 1;
        } else {
            self.runner_streak = 0;
        }

        let generator = delta.generated == 0;
        if generator {
            append(&metadata, "monitor_event:restarting_generator\n").await?;
            warn!("Generator stalled, restarting generator");
            self.supervisor
                .restart_generator(&metadata)
                .await
                .context("failed to restart generator")?;
            self.generator_streak += 1;
        } else {
            self.generator_streak = 0;
        }

        let threshold = self.config.restart_threshold;
        if self.runner_streak >= threshold || self.generator_streak >= threshold {
            self.phase = Phase::FullRestart;
            append(&metadata, "monitor_event:full_restart_triggered\n").await?;
            warn!(
                "Error streaks at runner={} generator={}, restarting pipeline",
                self.runner_streak, self.generator_streak
            );
            self.supervisor
                .restart_pipeline(&metadata)
                .await
                .context("failed to restart pipeline")?;
            return Ok(HealthAction::FullRestart);
        }

        if runners || generator {
            self.phase = Phase::RestartingSubcomponent;
            Ok(HealthAction::Restarted { runners, generator })
        } else {
            Ok(HealthAction::Healthy)
        }
    }

    /// Start a new file sequence and return to the grace cycle
    async fn reset(&mut self, sequence: u64) -> Result<()> {
        self.files = EvidenceFiles::new(&self.config.results_dir, sequence);
        self.phase = Phase::Initializing;
        self.baseline = None;
        self.elapsed = 0;
        self.runner_streak = 0;
        self.generator_streak = 0;

        self.files
            .create()
            .await
            .with_context(|| format!("cannot create evidence files for sequence {sequence}"))?;

        self.seed = match &self.config.generator_log {
            Some(log) => {
                wait_for_seed(
                    log,
                    self.config.seed_window,
                    self.config.seed_attempts,
                    self.config.seed_poll,
                    &self.files.metadata,
                )
                .await
            }
            None => None,
        };

        info!("Monitor initialized, sequence {}", sequence);
        Ok(())
    }

    fn seed(&self) -> &str {
        self.seed.as_deref().unwrap_or("unknown")
    }

    async fn log_metrics(&self, current: &MonitorSnapshot, delta: &SnapshotDelta) -> Result<()> {
        let mut block = String::new();
        block.push_str(&format!("timestamp:{}\n", chrono::Utc::now().to_rfc3339()));
        block.push_str(&format!("diff_generated_contracts:{}\n", delta.generated));
        block.push_str(&format!("diff_compilation_errors:{}\n", delta.compiler_errors));
        for backend in &self.ctx.backends {
            block.push_str(&format!("diff_{backend}_runs:{}\n", delta.runs_for(backend)));
        }
        block.push_str(&format!("diff_verified_results:{}\n", delta.verified));
        block.push_str(&format!("total_generated_contracts:{}\n", current.generated));
        block.push_str(&format!("total_compilation_errors:{}\n", current.compiler_errors));
        for backend in &self.ctx.backends {
            let runs = current.runs.get(backend).copied().unwrap_or_default();
            block.push_str(&format!("total_{backend}_runs:{runs}\n"));
        }
        block.push_str(&format!("total_verified_results:{}\n", current.verified));
        block.push_str(&format!("elapsed_time:{}\n", self.elapsed));
        block.push_str(&format!("total_time:{}\n", self.total_time));
        block.push_str(&format!("current_seed:{}\n", self.seed()));
        block.push_str(&format!("generator_errors:{}\n", self.generator_streak));
        block.push_str(&format!("runner_errors:{}\n", self.runner_streak));
        block.push('\n');

        append(&self.files.bench, &block)
            .await
            .context("failed to write metrics")
    }

    /// Write each crash, then flip its latch. A failed write leaves the crash
    /// unlogged for the next cycle.
    async fn log_compiler_crashes(&self) -> Result<usize> {
        let crashes = self
            .ctx
            .store
            .unlogged_compiler_crashes(&self.config.crash_markers)
            .await?;

        let mut logged = 0;
        for crash in crashes {
            let entry = format!(
                "seed:{}\ntime:{}\nid:{}\nerror_message:\n{}\n==========================================\n",
                self.seed(),
                self.elapsed,
                crash.generation_id,
                crash.message
            );
            append(&self.files.crashes, &entry)
                .await
                .context("failed to write compiler crash")?;
            if !self.ctx.store.mark_crash_logged(&crash.generation_id).await? {
                debug!("Crash {} was also logged by another monitor", crash.generation_id);
            }
            logged += 1;
        }

        if logged > 0 {
            warn!("Logged {} compiler crashes", logged);
        }
        Ok(logged)
    }

    async fn log_discrepancies(&self) -> Result<usize> {
        let found = self.ctx.store.unlogged_discrepancies().await?;

        let mut logged = 0;
        for verification in found {
            let id = &verification.generation_id;
            let generation = self.ctx.store.load_generation(id).await?;
            let (digest, source) = match &generation {
                Some(record) => (record.source_digest(), record.source.as_str()),
                None => ("unknown".to_string(), "<missing generation>"),
            };
            let verdicts: Vec<_> = verification.discrepancies().collect();
            let detail = serde_json::to_string_pretty(&verdicts)?;

            let entry = format!(
                "seed:{}\ntotal_time:{}\ntime_elapsed:{}\nid:{}\nsource_sha256:{}\nverification_discrepancy:\n{}\noriginal_contract:\n{}\n===================================\n",
                self.seed(),
                self.total_time,
                self.elapsed,
                id,
                digest,
                detail,
                source
            );
            append(&self.files.discrepancies, &entry)
                .await
                .context("failed to write discrepancy")?;
            if !self.ctx.store.mark_discrepancy_logged(id).await? {
                debug!("Discrepancy {} was also logged by another monitor", id);
            }
            logged += 1;
        }

        if logged > 0 {
            warn!("Logged {} verification discrepancies", logged);
        }
        Ok(logged)
    }
}
