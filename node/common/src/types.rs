use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::digest::sha256_hex;

/// One synthesized candidate, written once by the external generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub id: String,
    pub source: String,
    /// Backend-specific renderings of `source`, keyed by backend
    #[serde(default)]
    pub backend_sources: BTreeMap<String, String>,
    /// Argument sets per function, one entry per input-value index
    #[serde(default)]
    pub function_inputs: BTreeMap<String, Vec<Vec<Value>>>,
    #[serde(default)]
    pub constructor_inputs: Vec<Vec<Value>>,
    #[serde(default)]
    pub compile_error: Option<String>,
}

impl GenerationRecord {
    /// Source text a given backend should deploy
    pub fn source_for(&self, backend: &str) -> &str {
        self.backend_sources
            .get(backend)
            .map(String::as_str)
            .unwrap_or(&self.source)
    }

    /// Constructor argument sets; a record without any deploys once with no arguments
    pub fn constructor_arg_sets(&self) -> Vec<Vec<Value>> {
        if self.constructor_inputs.is_empty() {
            vec![Vec::new()]
        } else {
            self.constructor_inputs.clone()
        }
    }

    pub fn source_digest(&self) -> String {
        sha256_hex(self.source.as_bytes())
    }
}

/// Unit of work for one backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub generation_id: String,
    pub backend: String,
}

/// One entry of a bounded storage dump
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSlot {
    pub slot: String,
    pub value: Value,
}

/// Ordered, bounded state dump taken after a call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateSnapshot(pub Vec<StorageSlot>);

impl StateSnapshot {
    /// Keep the first `max_slots` entries in executor order
    pub fn bounded(mut slots: Vec<StorageSlot>, max_slots: usize) -> Self {
        slots.truncate(max_slots);
        Self(slots)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Observables of a successful call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSuccess {
    pub state: StateSnapshot,
    /// Hex-encoded memory prefix, when the backend exposes memory
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub gas_used: Option<u64>,
    /// JSON-encoded return value
    pub return_value: String,
}

/// Outcome of one function invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallOutcome {
    Success(CallSuccess),
    DeployError { message: String },
    RuntimeError { message: String },
}

impl CallOutcome {
    pub fn is_error(&self) -> bool {
        !matches!(self, CallOutcome::Success(_))
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            CallOutcome::Success(_) => None,
            CallOutcome::DeployError { message } | CallOutcome::RuntimeError { message } => {
                Some(message)
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CallOutcome::Success(_) => "success",
            CallOutcome::DeployError { .. } => "deploy error",
            CallOutcome::RuntimeError { .. } => "runtime error",
        }
    }
}

/// All invocations of one function under one constructor argument set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCalls {
    pub constructor_index: usize,
    pub function: String,
    /// Indexed by input-value index
    pub outcomes: Vec<CallOutcome>,
}

/// One backend's execution of a candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub generation_id: String,
    pub backend: String,
    pub calls: Vec<FunctionCalls>,
    #[serde(default)]
    pub is_handled: bool,
}

/// Named differential check
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Check {
    #[serde(rename = "Error_Correlation")]
    ErrorCorrelation,
    Storage,
    #[serde(rename = "Return_Value")]
    ReturnValue,
    Memory,
    Gas,
}

/// Mismatch between two backends, with both raw payloads for triage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub detail: String,
    pub reference: Value,
    pub candidate: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckOutcome {
    Pass,
    Discrepancy(Discrepancy),
}

impl CheckOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, CheckOutcome::Pass)
    }
}

/// Check results for one call, reference backend against one other backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallVerdict {
    pub constructor_index: usize,
    pub function: String,
    pub input_index: usize,
    pub reference: String,
    pub candidate: String,
    pub checks: BTreeMap<Check, CheckOutcome>,
}

impl CallVerdict {
    pub fn has_discrepancy(&self) -> bool {
        self.checks.values().any(|outcome| !outcome.is_pass())
    }
}

/// Comparison across backends for one generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub generation_id: String,
    pub backends: Vec<String>,
    pub verdicts: Vec<CallVerdict>,
    #[serde(default)]
    pub logged_to_file: bool,
}

impl VerificationResult {
    pub fn has_discrepancy(&self) -> bool {
        self.verdicts.iter().any(CallVerdict::has_discrepancy)
    }

    pub fn discrepancies(&self) -> impl Iterator<Item = &CallVerdict> {
        self.verdicts.iter().filter(|verdict| verdict.has_discrepancy())
    }
}

/// Generation whose compile error carries a known crash marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerCrash {
    pub generation_id: String,
    pub message: String,
}

/// Point-in-time aggregate counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    pub generated: u64,
    pub compiler_errors: u64,
    pub runs: BTreeMap<String, u64>,
    pub verified: u64,
}

impl MonitorSnapshot {
    /// Counter movement since `previous`; backends absent from `previous` count from zero
    pub fn delta(&self, previous: &MonitorSnapshot) -> SnapshotDelta {
        let diff = |now: u64, before: u64| now as i64 - before as i64;

        SnapshotDelta {
            generated: diff(self.generated, previous.generated),
            compiler_errors: diff(self.compiler_errors, previous.compiler_errors),
            runs: self
                .runs
                .iter()
                .map(|(backend, &count)| {
                    let before = previous.runs.get(backend).copied().unwrap_or(0);
                    (backend.clone(), diff(count, before))
                })
                .collect(),
            verified: diff(self.verified, previous.verified),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDelta {
    pub generated: i64,
    pub compiler_errors: i64,
    pub runs: BTreeMap<String, i64>,
    pub verified: i64,
}

impl SnapshotDelta {
    pub fn runs_for(&self, backend: &str) -> i64 {
        self.runs.get(backend).copied().unwrap_or(0)
    }
}
