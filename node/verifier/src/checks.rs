//! Named checks over pairs of call outcomes.
//!
//! The error-correlation check runs first. Whenever either side failed, it
//! is the only check recorded for that call, so an error message is never
//! compared against a computed value.

use diffuzz_common::{
    CallOutcome, CallSuccess, CallVerdict, Check, CheckOutcome, Discrepancy, RunResult,
    VerificationResult,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Crash markers that make two error messages equivalent
pub const DEFAULT_MARKERS: &[&str] = &["This is an unhandled"];

/// Broader failure vocabulary, opt-in through `--marker`
pub const COMMON_FAILURE_MARKERS: &[&str] = &[
    "out of gas",
    "revert",
    "assert",
    "overflow",
    "underflow",
    "division by zero",
    "modulo by zero",
    "out of bounds",
    "index out of range",
    "invalid opcode",
    "stack too deep",
];

#[derive(Debug, Clone)]
pub struct CheckConfig {
    pub markers: Vec<String>,
    /// Let byte-identical error messages pass without a marker
    pub identical_errors: bool,
    /// Compare memory prefixes
    pub memory: bool,
    /// Compare gas consumption
    pub gas: bool,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            markers: DEFAULT_MARKERS.iter().map(|m| m.to_string()).collect(),
            identical_errors: false,
            memory: false,
            gas: false,
        }
    }
}

impl CheckConfig {
    /// First configured marker the message contains, ignoring case
    fn marker_in(&self, message: &str) -> Option<&str> {
        let message = message.to_lowercase();
        self.markers
            .iter()
            .find(|marker| message.contains(&marker.to_lowercase()))
            .map(String::as_str)
    }
}

/// Run every applicable check on one call
pub fn compare_outcomes(
    reference: &CallOutcome,
    candidate: &CallOutcome,
    config: &CheckConfig,
) -> BTreeMap<Check, CheckOutcome> {
    let mut checks = BTreeMap::new();

    match (reference, candidate) {
        (CallOutcome::Success(a), CallOutcome::Success(b)) => {
            checks.insert(Check::Storage, storage(a, b));
            checks.insert(Check::ReturnValue, return_value(a, b));
            if config.memory {
                checks.insert(
                    Check::Memory,
                    compare("memory differs", &a.memory, &b.memory),
                );
            }
            if config.gas {
                checks.insert(
                    Check::Gas,
                    compare("gas consumption differs", &a.gas_used, &b.gas_used),
                );
            }
        }
        (CallOutcome::Success(_), _) | (_, CallOutcome::Success(_)) => {
            let detail = format!(
                "asymmetric failure: {} against {}",
                reference.kind(),
                candidate.kind()
            );
            checks.insert(
                Check::ErrorCorrelation,
                discrepancy(detail, reference, candidate),
            );
        }
        (a, b) => {
            checks.insert(Check::ErrorCorrelation, error_correlation(a, b, config));
        }
    }

    checks
}

fn error_correlation(a: &CallOutcome, b: &CallOutcome, config: &CheckConfig) -> CheckOutcome {
    let (Some(ma), Some(mb)) = (a.error_message(), b.error_message()) else {
        return CheckOutcome::Pass;
    };

    if config.identical_errors && ma == mb {
        return CheckOutcome::Pass;
    }

    match (config.marker_in(ma), config.marker_in(mb)) {
        (Some(x), Some(y)) if x == y => CheckOutcome::Pass,
        (x, y) => discrepancy(
            format!(
                "errors do not correlate: {} against {}",
                x.unwrap_or("unrecognised"),
                y.unwrap_or("unrecognised")
            ),
            a,
            b,
        ),
    }
}

fn storage(a: &CallSuccess, b: &CallSuccess) -> CheckOutcome {
    compare("storage differs", &a.state, &b.state)
}

fn return_value(a: &CallSuccess, b: &CallSuccess) -> CheckOutcome {
    let (x, y) = (decode(&a.return_value), decode(&b.return_value));
    if x == y {
        CheckOutcome::Pass
    } else {
        CheckOutcome::Discrepancy(Discrepancy {
            detail: "return values differ".to_string(),
            reference: x,
            candidate: y,
        })
    }
}

/// Encoded return values are JSON; anything else compares as raw text
fn decode(encoded: &str) -> Value {
    serde_json::from_str(encoded).unwrap_or_else(|_| Value::String(encoded.to_string()))
}

fn compare<T: PartialEq + serde::Serialize>(detail: &str, a: &T, b: &T) -> CheckOutcome {
    if a == b {
        CheckOutcome::Pass
    } else {
        discrepancy(detail.to_string(), a, b)
    }
}

fn discrepancy<T: serde::Serialize + ?Sized>(detail: String, a: &T, b: &T) -> CheckOutcome {
    CheckOutcome::Discrepancy(Discrepancy {
        detail,
        reference: serde_json::to_value(a).unwrap_or_default(),
        candidate: serde_json::to_value(b).unwrap_or_default(),
    })
}

/// Compare every other backend against the first one
///
/// Returns `None` until every required backend has a result.
pub fn verify_generation(
    generation_id: &str,
    results: &[RunResult],
    backends: &[String],
    config: &CheckConfig,
) -> Option<VerificationResult> {
    let by_backend: BTreeMap<&str, &RunResult> = results
        .iter()
        .filter(|r| r.generation_id == generation_id)
        .map(|r| (r.backend.as_str(), r))
        .collect();

    let runs = backends
        .iter()
        .map(|b| by_backend.get(b.as_str()).copied())
        .collect::<Option<Vec<_>>>()?;

    let mut verdicts = Vec::new();
    if let Some((reference, candidates)) = runs.split_first() {
        for candidate in candidates {
            verdicts.extend(compare_runs(reference, candidate, config));
        }
    }

    Some(VerificationResult {
        generation_id: generation_id.to_string(),
        backends: backends.to_vec(),
        verdicts,
        logged_to_file: false,
    })
}

fn compare_runs(reference: &RunResult, candidate: &RunResult, config: &CheckConfig) -> Vec<CallVerdict> {
    let index = |run: &'_ RunResult| {
        run.calls
            .iter()
            .map(|c| ((c.constructor_index, c.function.clone()), c.outcomes.clone()))
            .collect::<BTreeMap<_, _>>()
    };
    let (ours, theirs) = (index(reference), index(candidate));
    let keys: BTreeSet<_> = ours.keys().chain(theirs.keys()).cloned().collect();

    let mut verdicts = Vec::new();
    for key in keys {
        let a = ours.get(&key).map(Vec::as_slice).unwrap_or_default();
        let b = theirs.get(&key).map(Vec::as_slice).unwrap_or_default();

        for input_index in 0..a.len().max(b.len()) {
            let checks = match (a.get(input_index), b.get(input_index)) {
                (Some(x), Some(y)) => compare_outcomes(x, y, config),
                (x, y) => BTreeMap::from([(
                    Check::ErrorCorrelation,
                    discrepancy("outcome missing on one backend".to_string(), &x, &y),
                )]),
            };

            verdicts.push(CallVerdict {
                constructor_index: key.0,
                function: key.1.clone(),
                input_index,
                reference: reference.backend.clone(),
                candidate: candidate.backend.clone(),
                checks,
            });
        }
    }
    verdicts
}
