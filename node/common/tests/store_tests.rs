use diffuzz_common::{
    CallOutcome, CallSuccess, CallVerdict, Check, CheckOutcome, Discrepancy, DocumentStore,
    FunctionCalls, GenerationRecord, RunResult, SqliteStore, StateSnapshot, StoreError,
    VerificationResult,
};
use serde_json::json;
use std::collections::BTreeMap;

fn backends() -> Vec<String> {
    vec!["ivy".to_string(), "boa".to_string()]
}

fn generation(id: &str, compile_error: Option<&str>) -> GenerationRecord {
    GenerationRecord {
        id: id.to_string(),
        source: format!("contract {id}"),
        backend_sources: BTreeMap::new(),
        function_inputs: BTreeMap::from([("func_0".to_string(), vec![vec![json!(1)]])]),
        constructor_inputs: vec![],
        compile_error: compile_error.map(str::to_string),
    }
}

fn run_result(id: &str, backend: &str, value: &str) -> RunResult {
    RunResult {
        generation_id: id.to_string(),
        backend: backend.to_string(),
        calls: vec![FunctionCalls {
            constructor_index: 0,
            function: "func_0".to_string(),
            outcomes: vec![CallOutcome::Success(CallSuccess {
                state: StateSnapshot::default(),
                memory: None,
                gas_used: None,
                return_value: value.to_string(),
            })],
        }],
        is_handled: false,
    }
}

fn verification(id: &str, discrepant: bool) -> VerificationResult {
    let outcome = if discrepant {
        CheckOutcome::Discrepancy(Discrepancy {
            detail: "return values differ".to_string(),
            reference: json!("42"),
            candidate: json!("43"),
        })
    } else {
        CheckOutcome::Pass
    };

    VerificationResult {
        generation_id: id.to_string(),
        backends: backends(),
        verdicts: vec![CallVerdict {
            constructor_index: 0,
            function: "func_0".to_string(),
            input_index: 0,
            reference: "ivy".to_string(),
            candidate: "boa".to_string(),
            checks: BTreeMap::from([(Check::ReturnValue, outcome)]),
        }],
        logged_to_file: false,
    }
}

#[tokio::test]
async fn generations_are_written_once() -> anyhow::Result<()> {
    let store = SqliteStore::in_memory().await?;
    store.insert_generation(&generation("g1", None)).await?;

    let again = store.insert_generation(&generation("g1", None)).await;
    assert!(matches!(again, Err(StoreError::Duplicate(id)) if id == "g1"));

    let loaded = store.load_generation("g1").await?.expect("stored");
    assert_eq!(loaded, generation("g1", None));
    assert!(store.load_generation("missing").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn enqueue_latch_flips_once() -> anyhow::Result<()> {
    let store = SqliteStore::in_memory().await?;
    store.insert_generation(&generation("g1", None)).await?;
    store.insert_generation(&generation("g2", None)).await?;

    assert_eq!(store.unqueued_generations(10).await?, vec!["g1", "g2"]);
    assert!(store.mark_enqueued("g1").await?);
    assert!(!store.mark_enqueued("g1").await?);
    assert_eq!(store.unqueued_generations(10).await?, vec!["g2"]);
    Ok(())
}

#[tokio::test]
async fn redelivered_results_upsert_in_place() -> anyhow::Result<()> {
    let store = SqliteStore::in_memory().await?;
    store.upsert_run_result(&run_result("g1", "ivy", "42")).await?;
    store.upsert_run_result(&run_result("g1", "ivy", "42")).await?;

    let results = store.load_run_results("g1").await?;
    assert_eq!(results.len(), 1);

    let counters = store.counters(&backends()).await?;
    assert_eq!(counters.runs["ivy"], 1);
    assert_eq!(counters.runs["boa"], 0);
    Ok(())
}

#[tokio::test]
async fn pending_requires_every_backend() -> anyhow::Result<()> {
    let store = SqliteStore::in_memory().await?;
    store.upsert_run_result(&run_result("g1", "ivy", "42")).await?;
    store.upsert_run_result(&run_result("g2", "ivy", "1")).await?;
    store.upsert_run_result(&run_result("g2", "boa", "1")).await?;

    assert_eq!(store.pending_generations(&backends(), 10).await?, vec!["g2"]);

    store.upsert_run_result(&run_result("g1", "boa", "42")).await?;
    let mut pending = store.pending_generations(&backends(), 10).await?;
    pending.sort();
    assert_eq!(pending, vec!["g1", "g2"]);
    Ok(())
}

#[tokio::test]
async fn verification_latch_is_terminal() -> anyhow::Result<()> {
    let store = SqliteStore::in_memory().await?;
    store.upsert_run_result(&run_result("g1", "ivy", "42")).await?;
    store.upsert_run_result(&run_result("g1", "boa", "43")).await?;

    let first = verification("g1", true);
    assert!(store.record_verification(&first).await?);
    assert!(!store.record_verification(&verification("g1", false)).await?);

    let stored = store.load_verification("g1").await?.expect("recorded");
    assert_eq!(stored, first);
    assert!(store.pending_generations(&backends(), 10).await?.is_empty());

    // a late redelivery must not reopen or rewrite a handled result
    store.upsert_run_result(&run_result("g1", "boa", "99")).await?;
    let results = store.load_run_results("g1").await?;
    assert!(results.iter().all(|r| r.is_handled));
    let boa = results.iter().find(|r| r.backend == "boa").expect("boa result");
    assert_eq!(boa, &RunResult { is_handled: true, ..run_result("g1", "boa", "43") });
    assert_eq!(store.counters(&backends()).await?.verified, 1);
    Ok(())
}

#[tokio::test]
async fn discrepancy_log_latch() -> anyhow::Result<()> {
    let store = SqliteStore::in_memory().await?;
    for (id, discrepant) in [("g1", true), ("g2", false)] {
        store.upsert_run_result(&run_result(id, "ivy", "42")).await?;
        store.upsert_run_result(&run_result(id, "boa", "42")).await?;
        store.record_verification(&verification(id, discrepant)).await?;
    }

    let unlogged = store.unlogged_discrepancies().await?;
    assert_eq!(unlogged.len(), 1);
    assert_eq!(unlogged[0].generation_id, "g1");

    assert!(store.mark_discrepancy_logged("g1").await?);
    assert!(!store.mark_discrepancy_logged("g1").await?);
    assert!(store.unlogged_discrepancies().await?.is_empty());
    assert!(store.load_verification("g1").await?.expect("stored").logged_to_file);
    Ok(())
}

#[tokio::test]
async fn compiler_crashes_match_markers() -> anyhow::Result<()> {
    let store = SqliteStore::in_memory().await?;
    store.insert_generation(&generation("ok", None)).await?;
    store
        .insert_generation(&generation("typo", Some("TypeMismatch: expected uint256")))
        .await?;
    store
        .insert_generation(&generation("crash", Some("This is an unhandled internal compiler error")))
        .await?;

    let markers = vec!["This is an unhandled".to_string()];
    let crashes = store.unlogged_compiler_crashes(&markers).await?;
    assert_eq!(crashes.len(), 1);
    assert_eq!(crashes[0].generation_id, "crash");

    assert!(store.mark_crash_logged("crash").await?);
    assert!(store.unlogged_compiler_crashes(&markers).await?.is_empty());

    let counters = store.counters(&backends()).await?;
    assert_eq!(counters.generated, 3);
    assert_eq!(counters.compiler_errors, 2);
    Ok(())
}
