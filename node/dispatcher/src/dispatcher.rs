use anyhow::{Context, Result};
use diffuzz_common::{
    retry_with_backoff, GenerationRecord, Job, PipelineContext, RetryError, StoreError,
};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Publishes one job per backend for every generation not yet enqueued
pub struct Dispatcher {
    ctx: PipelineContext,
    batch_size: u32,
    poll_interval: Duration,
}

impl Dispatcher {
    pub fn new(ctx: PipelineContext, batch_size: u32, poll_interval: Duration) -> Self {
        Self {
            ctx,
            batch_size,
            poll_interval,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let mut handled = 0;
        loop {
            handled += self.dispatch_once().await?;
            for backend in &self.ctx.backends {
                let depth = retry_with_backoff("read queue depth", &self.ctx.retry, || {
                    self.ctx.queue.depth(backend)
                })
                .await
                .context("job queue unavailable")?;
                debug!("Queue {} holds {} jobs", backend, depth);
            }
            info!("Handled {} generations", handled);
            sleep(self.poll_interval).await;
        }
    }

    /// Enqueue one batch; returns how many generations were latched
    pub async fn dispatch_once(&self) -> Result<usize> {
        let store = self.ctx.store.clone();
        let queue = self.ctx.queue.clone();
        let ids = retry_with_backoff("poll new generations", &self.ctx.retry, || {
            store.unqueued_generations(self.batch_size)
        })
        .await
        .context("document store unavailable")?;

        let mut handled = 0;
        for id in ids {
            let record = retry_with_backoff("load generation", &self.ctx.retry, || {
                store.load_generation(&id)
            })
            .await
            .context("document store unavailable")?;
            let Some(record) = record else {
                continue;
            };

            // failed compilations are counted by the monitor but never executed
            if record.compile_error.is_none() {
                for backend in &self.ctx.backends {
                    let job = Job {
                        generation_id: id.clone(),
                        backend: backend.clone(),
                    };
                    retry_with_backoff("publish job", &self.ctx.retry, || {
                        queue.publish(backend, &job)
                    })
                    .await
                    .context("job queue unavailable")?;
                }
            }

            let latched = retry_with_backoff("mark enqueued", &self.ctx.retry, || {
                store.mark_enqueued(&id)
            })
            .await
            .context("document store unavailable")?;
            if latched {
                handled += 1;
            }
        }
        Ok(handled)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub inserted: usize,
    pub duplicates: usize,
    pub malformed: usize,
}

/// Load newline-delimited generation records written by the generator
pub async fn ingest(ctx: &PipelineContext, path: &Path) -> Result<IngestReport> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();

    let mut report = IngestReport::default();
    let mut number = 0;
    while let Some(line) = lines.next_line().await? {
        number += 1;
        if line.trim().is_empty() {
            continue;
        }

        let record: GenerationRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!("Line {} of {} is not a generation: {}", number, path.display(), e);
                report.malformed += 1;
                continue;
            }
        };

        let inserted = retry_with_backoff("insert generation", &ctx.retry, || {
            ctx.store.insert_generation(&record)
        })
        .await
        .map_err(RetryError::into_inner);
        match inserted {
            Ok(()) => report.inserted += 1,
            Err(StoreError::Duplicate(id)) => {
                warn!("Generation {} already stored, skipping", id);
                report.duplicates += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!(
        "Ingested {} generations ({} duplicates, {} malformed)",
        report.inserted, report.duplicates, report.malformed
    );
    Ok(report)
}
