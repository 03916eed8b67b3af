use anyhow::{Context, Result};
use clap::ValueEnum;
use diffuzz_common::{
    retry_with_backoff, CallOutcome, CallSuccess, Delivery, FunctionCalls, GenerationRecord, Job,
    PipelineContext, QueueError, RunResult, StateSnapshot,
};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::executor::{Executor, ExecutorError};

/// What to do with a message whose body is not a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PoisonPolicy {
    /// Reject without requeue so the message lands in the dead-letter state
    DeadLetter,
    /// Acknowledge and discard
    Drop,
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub backend: String,
    /// Use only the first N input sets of each function; all of them when unset
    pub inputs_per_function: Option<usize>,
    pub snapshot_slots: usize,
    pub memory_prefix_bytes: usize,
    /// Sleep between polls of an empty queue
    pub poll_interval: Duration,
    pub poison_policy: PoisonPolicy,
}

impl RunnerConfig {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            inputs_per_function: None,
            snapshot_slots: 10,
            memory_prefix_bytes: 1280,
            poll_interval: Duration::from_secs(1),
            poison_policy: PoisonPolicy::DeadLetter,
        }
    }
}

/// How a single delivery was disposed of
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Persisted { calls: usize },
    SkippedMissingGeneration,
    SkippedCompileError,
    Poisoned,
}

/// Queue consumer for one backend
pub struct RunnerNode<E: Executor> {
    ctx: PipelineContext,
    executor: E,
    config: RunnerConfig,
}

impl<E: Executor> RunnerNode<E> {
    pub fn new(ctx: PipelineContext, executor: E, config: RunnerConfig) -> Self {
        Self {
            ctx,
            executor,
            config,
        }
    }

    /// Consume jobs one at a time until a store or queue operation runs out of retries
    pub async fn run(&mut self) -> Result<()> {
        info!("Runner consuming queue: {}", self.config.backend);

        loop {
            if !self.poll_once().await? {
                sleep(self.config.poll_interval).await;
            }
        }
    }

    /// Handle at most one job; returns whether the queue had one
    pub async fn poll_once(&mut self) -> Result<bool> {
        let queue = self.ctx.queue.clone();
        let backend = self.config.backend.clone();
        let delivery = retry_with_backoff("receive job", &self.ctx.retry, || {
            queue.receive(&backend)
        })
        .await
        .context("job queue unavailable")?;

        match delivery {
            Some(delivery) => {
                self.handle_delivery(delivery).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn handle_delivery(&mut self, delivery: Delivery) -> Result<DeliveryOutcome> {
        if delivery.redelivered() {
            debug!(
                "Redelivery #{} of {} on {}",
                delivery.delivery_count, delivery.tag, delivery.queue
            );
        }

        let job = match delivery.decode() {
            Ok(job) => job,
            Err(e) => {
                warn!("Poison message {} on {}: {}", delivery.tag, delivery.queue, e);
                match self.config.poison_policy {
                    PoisonPolicy::DeadLetter => self.reject(&delivery).await?,
                    PoisonPolicy::Drop => self.ack(&delivery).await?,
                }
                return Ok(DeliveryOutcome::Poisoned);
            }
        };

        let outcome = self.handle_job(&job).await?;
        self.ack(&delivery).await?;
        Ok(outcome)
    }

    async fn handle_job(&mut self, job: &Job) -> Result<DeliveryOutcome> {
        let store = self.ctx.store.clone();
        let record = retry_with_backoff("load generation", &self.ctx.retry, || {
            store.load_generation(&job.generation_id)
        })
        .await
        .context("document store unavailable")?;

        let Some(record) = record else {
            warn!("Generation {} not found, skipping", job.generation_id);
            return Ok(DeliveryOutcome::SkippedMissingGeneration);
        };

        if record.compile_error.is_some() {
            debug!("Generation {} did not compile, skipping", record.id);
            return Ok(DeliveryOutcome::SkippedCompileError);
        }

        info!(
            "Executing generation {} ({}) on {}",
            record.id,
            &record.source_digest()[..12],
            self.config.backend
        );

        let result = execute_generation(&mut self.executor, &record, &self.config).await;
        let calls = result.calls.iter().map(|c| c.outcomes.len()).sum();

        retry_with_backoff("persist run result", &self.ctx.retry, || {
            store.upsert_run_result(&result)
        })
        .await
        .context("failed to persist run result")?;

        info!("Stored {} outcomes for generation {}", calls, record.id);
        Ok(DeliveryOutcome::Persisted { calls })
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let queue = self.ctx.queue.clone();
        let acked = retry_with_backoff("ack job", &self.ctx.retry, || queue.ack(delivery.tag)).await;
        settle(acked.map_err(|e| e.into_inner()), delivery)
    }

    async fn reject(&self, delivery: &Delivery) -> Result<()> {
        let queue = self.ctx.queue.clone();
        let rejected = retry_with_backoff("reject job", &self.ctx.retry, || {
            queue.reject(delivery.tag, false)
        })
        .await;
        settle(rejected.map_err(|e| e.into_inner()), delivery)
    }
}

/// A lease that expired while we worked went to another consumer; the upsert keeps that harmless
fn settle(result: Result<(), QueueError>, delivery: &Delivery) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(QueueError::UnknownDelivery(tag)) => {
            warn!("Delivery {} on {} was no longer leased", tag, delivery.queue);
            Ok(())
        }
        Err(e) => Err(e).context("failed to settle delivery"),
    }
}

/// Run every declared call of a generation on one backend
///
/// Executor failures are recorded as outcomes; this never fails.
pub async fn execute_generation<E: Executor>(
    executor: &mut E,
    record: &GenerationRecord,
    config: &RunnerConfig,
) -> RunResult {
    let source = record.source_for(&config.backend);
    let mut calls = Vec::new();

    for (constructor_index, constructor_args) in record.constructor_arg_sets().iter().enumerate() {
        match executor.deploy(source, constructor_args).await {
            Ok(handle) => {
                let exported = match executor.manifest(&handle).await {
                    Ok(manifest) => Ok(manifest.into_iter().map(|f| f.name).collect::<BTreeSet<_>>()),
                    Err(e) => Err(e),
                };

                for (function, input_sets) in &record.function_inputs {
                    let mut outcomes = Vec::new();
                    for args in selected_inputs(input_sets, config) {
                        let outcome = match &exported {
                            Ok(names) if !names.contains(function) => CallOutcome::RuntimeError {
                                message: format!("function {function} is not exported"),
                            },
                            Ok(_) => invoke(executor, &handle, function, args, config).await,
                            Err(e) => CallOutcome::RuntimeError {
                                message: e.to_string(),
                            },
                        };
                        outcomes.push(outcome);
                    }
                    calls.push(FunctionCalls {
                        constructor_index,
                        function: function.clone(),
                        outcomes,
                    });
                }
            }
            Err(e) => {
                debug!("Deploy failed on {}: {}", config.backend, e);
                let message = e.to_string();
                for (function, input_sets) in &record.function_inputs {
                    let outcomes = selected_inputs(input_sets, config)
                        .map(|_| CallOutcome::DeployError {
                            message: message.clone(),
                        })
                        .collect();
                    calls.push(FunctionCalls {
                        constructor_index,
                        function: function.clone(),
                        outcomes,
                    });
                }
            }
        }
    }

    if let Err(e) = executor.reset().await {
        warn!("Failed to reset {} backend: {}", config.backend, e);
    }

    RunResult {
        generation_id: record.id.clone(),
        backend: config.backend.clone(),
        calls,
        is_handled: false,
    }
}

fn selected_inputs<'a>(
    input_sets: &'a [Vec<Value>],
    config: &RunnerConfig,
) -> impl Iterator<Item = &'a Vec<Value>> {
    input_sets
        .iter()
        .take(config.inputs_per_function.unwrap_or(usize::MAX))
}

async fn invoke<E: Executor>(
    executor: &mut E,
    handle: &E::Handle,
    function: &str,
    args: &[Value],
    config: &RunnerConfig,
) -> CallOutcome {
    let trace = match executor.call(handle, function, args).await {
        Ok(trace) => trace,
        Err(e) => {
            debug!("Call {} failed on {}: {}", function, config.backend, e);
            return runtime_error(e);
        }
    };

    let slots = match executor.dump_state(handle).await {
        Ok(slots) => slots,
        Err(e) => return runtime_error(e),
    };

    CallOutcome::Success(CallSuccess {
        state: StateSnapshot::bounded(slots, config.snapshot_slots),
        memory: trace.memory.map(|bytes| {
            let end = bytes.len().min(config.memory_prefix_bytes);
            hex::encode(&bytes[..end])
        }),
        gas_used: trace.gas_used,
        return_value: trace.return_value.to_string(),
    })
}

fn runtime_error(e: ExecutorError) -> CallOutcome {
    CallOutcome::RuntimeError {
        message: e.to_string(),
    }
}
