use anyhow::{Context, Result};
use diffuzz_common::{retry_with_backoff, PipelineContext};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::checks::{verify_generation, CheckConfig};

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub checks: CheckConfig,
    /// Generations fetched per poll
    pub batch_size: u32,
    pub poll_interval: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            checks: CheckConfig::default(),
            batch_size: 100,
            poll_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Recorded { discrepancies: usize },
    /// Another pass, possibly another instance, already verified it
    AlreadyHandled,
    /// Some required backend has not reported yet
    Incomplete,
}

/// Verifier node
pub struct VerifierNode {
    ctx: PipelineContext,
    config: VerifierConfig,
}

impl VerifierNode {
    pub fn new(ctx: PipelineContext, config: VerifierConfig) -> Self {
        Self { ctx, config }
    }

    /// Main verification loop
    pub async fn run(&self) -> Result<()> {
        info!("Verifier comparing backends: {}", self.ctx.backends.join(", "));

        loop {
            let recorded = self.poll_once().await?;
            if recorded == 0 {
                sleep(self.config.poll_interval).await;
            }
        }
    }

    /// Verify every generation that is ready; returns how many were recorded
    pub async fn poll_once(&self) -> Result<usize> {
        let store = self.ctx.store.clone();
        let pending = retry_with_backoff("poll pending generations", &self.ctx.retry, || {
            store.pending_generations(&self.ctx.backends, self.config.batch_size)
        })
        .await
        .context("document store unavailable")?;

        let mut recorded = 0;
        for generation_id in pending {
            if let VerifyOutcome::Recorded { .. } = self.verify(&generation_id).await? {
                recorded += 1;
            }
        }
        Ok(recorded)
    }

    pub async fn verify(&self, generation_id: &str) -> Result<VerifyOutcome> {
        let store = self.ctx.store.clone();
        let results = retry_with_backoff("load run results", &self.ctx.retry, || {
            store.load_run_results(generation_id)
        })
        .await
        .context("document store unavailable")?;

        if results.iter().any(|r| r.is_handled) {
            return Ok(VerifyOutcome::AlreadyHandled);
        }

        let Some(verification) =
            verify_generation(generation_id, &results, &self.ctx.backends, &self.config.checks)
        else {
            debug!("Generation {} still waiting on backends", generation_id);
            return Ok(VerifyOutcome::Incomplete);
        };

        let won = retry_with_backoff("record verification", &self.ctx.retry, || {
            store.record_verification(&verification)
        })
        .await
        .context("failed to record verification")?;

        if !won {
            debug!("Generation {} was verified elsewhere", generation_id);
            return Ok(VerifyOutcome::AlreadyHandled);
        }

        let discrepancies = verification.discrepancies().count();
        for verdict in verification.discrepancies() {
            let failed: Vec<_> = verdict
                .checks
                .iter()
                .filter(|(_, outcome)| !outcome.is_pass())
                .map(|(check, _)| format!("{check:?}"))
                .collect();
            warn!(
                "Discrepancy in {} {}#{} ({} vs {}): {}",
                generation_id,
                verdict.function,
                verdict.input_index,
                verdict.reference,
                verdict.candidate,
                failed.join(", ")
            );
        }

        info!(
            "Verified generation {}: {} calls, {} discrepancies",
            generation_id,
            verification.verdicts.len(),
            discrepancies
        );
        Ok(VerifyOutcome::Recorded { discrepancies })
    }
}
