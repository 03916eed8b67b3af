use async_trait::async_trait;
use diffuzz_common::{
    CallOutcome, CallSuccess, CallVerdict, Check, CheckOutcome, Discrepancy, DocumentStore,
    FunctionCalls, GenerationRecord, PipelineContext, RunResult, StateSnapshot, VerificationResult,
};
use diffuzz_monitor::{report, CycleOutcome, CycleReport, HealthAction, Monitor, MonitorConfig, Phase, Supervisor};
use serde_json::json;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<&'static str>>>,
    fail_runners: bool,
}

impl Recorder {
    fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: &'static str) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl Supervisor for Recorder {
    async fn restart_runners(&self, _log: &Path) -> io::Result<()> {
        self.record("runners");
        if self.fail_runners {
            return Err(io::Error::new(io::ErrorKind::NotFound, "kill_runners.sh missing"));
        }
        Ok(())
    }

    async fn restart_generator(&self, _log: &Path) -> io::Result<()> {
        self.record("generator");
        Ok(())
    }

    async fn restart_pipeline(&self, _log: &Path) -> io::Result<()> {
        self.record("pipeline");
        Ok(())
    }
}

struct Pipeline {
    ctx: PipelineContext,
    dir: TempDir,
    next: usize,
}

impl Pipeline {
    async fn new() -> Self {
        Self {
            ctx: PipelineContext::ephemeral(&["ivy", "boa"], Duration::from_secs(60))
                .await
                .unwrap(),
            dir: tempfile::tempdir().unwrap(),
            next: 0,
        }
    }

    fn config(&self) -> MonitorConfig {
        MonitorConfig {
            results_dir: self.dir.path().to_path_buf(),
            generator_log: None,
            ..MonitorConfig::default()
        }
    }

    async fn monitor(&self, supervisor: Recorder) -> Monitor<Recorder> {
        Monitor::new(self.ctx.clone(), supervisor, self.config()).await.unwrap()
    }

    fn next_id(&mut self) -> String {
        self.next += 1;
        format!("g{}", self.next)
    }

    async fn generate(&mut self, compile_error: Option<&str>) -> String {
        let id = self.next_id();
        self.ctx
            .store
            .insert_generation(&GenerationRecord {
                id: id.clone(),
                source: format!("contract C{id}"),
                backend_sources: BTreeMap::new(),
                function_inputs: BTreeMap::new(),
                constructor_inputs: vec![],
                compile_error: compile_error.map(str::to_string),
            })
            .await
            .unwrap();
        id
    }

    async fn run_on(&mut self, backends: &[&str]) -> String {
        let id = self.next_id();
        for backend in backends {
            self.ctx.store.upsert_run_result(&run(&id, backend)).await.unwrap();
        }
        id
    }
}

fn run(id: &str, backend: &str) -> RunResult {
    RunResult {
        generation_id: id.to_string(),
        backend: backend.to_string(),
        calls: vec![FunctionCalls {
            constructor_index: 0,
            function: "f".to_string(),
            outcomes: vec![CallOutcome::Success(CallSuccess {
                state: StateSnapshot::default(),
                memory: None,
                gas_used: None,
                return_value: "1".to_string(),
            })],
        }],
        is_handled: false,
    }
}

fn completed(outcome: CycleOutcome) -> CycleReport {
    match outcome {
        CycleOutcome::Completed(report) => report,
        CycleOutcome::Failed(message) => panic!("cycle failed: {message}"),
    }
}

#[tokio::test]
async fn test_generator_stall_escalates_once() {
    let mut pipeline = Pipeline::new().await;
    let supervisor = Recorder::default();
    let mut monitor = pipeline.monitor(supervisor.clone()).await;
    assert_eq!(monitor.files().sequence, 1);

    // grace cycle, whatever the deltas
    let report = completed(monitor.cycle().await);
    assert_eq!(report.action, HealthAction::Grace);
    assert!(supervisor.events().is_empty());

    pipeline.run_on(&["ivy", "boa"]).await;
    let report = completed(monitor.cycle().await);
    assert_eq!(report.delta.generated, 0);
    assert_eq!(
        report.action,
        HealthAction::Restarted {
            runners: false,
            generator: true
        }
    );
    assert_eq!(monitor.streaks(), (0, 1));
    assert_eq!(monitor.phase(), Phase::RestartingSubcomponent);

    pipeline.run_on(&["ivy", "boa"]).await;
    let report = completed(monitor.cycle().await);
    assert_eq!(report.action, HealthAction::FullRestart);
    assert_eq!(report.sequence, 1);
    assert_eq!(monitor.streaks(), (0, 0));
    assert_eq!(monitor.phase(), Phase::Initializing);
    assert_eq!(monitor.files().sequence, 2);
    assert_eq!(monitor.elapsed(), 0);
    assert_eq!(supervisor.events(), vec!["generator", "generator", "pipeline"]);

    let report = completed(monitor.cycle().await);
    assert_eq!(report.action, HealthAction::Grace);
    assert_eq!(report.sequence, 2);

    let metadata = std::fs::read_to_string(pipeline.dir.path().join("bench/bench-metadata1.txt")).unwrap();
    assert_eq!(
        metadata.lines().collect::<Vec<_>>(),
        vec![
            "monitor_event:restarting_generator",
            "monitor_event:restarting_generator",
            "monitor_event:full_restart_triggered",
        ]
    );
}

#[tokio::test]
async fn test_runner_stall_escalates_once() {
    let mut pipeline = Pipeline::new().await;
    let supervisor = Recorder::default();
    let mut monitor = pipeline.monitor(supervisor.clone()).await;
    completed(monitor.cycle().await);

    for _ in 0..2 {
        pipeline.generate(None).await;
        pipeline.run_on(&["ivy"]).await;
        completed(monitor.cycle().await);
    }

    let events = supervisor.events();
    assert_eq!(events, vec!["runners", "runners", "pipeline"]);
    assert_eq!(monitor.streaks(), (0, 0));
    assert_eq!(monitor.phase(), Phase::Initializing);
}

#[tokio::test]
async fn test_healthy_pipeline_recycles_runners_periodically() {
    let mut pipeline = Pipeline::new().await;
    let supervisor = Recorder::default();
    let config = MonitorConfig {
        ram_cleanup: Duration::from_secs(120),
        ..pipeline.config()
    };
    let mut monitor = Monitor::new(pipeline.ctx.clone(), supervisor.clone(), config)
        .await
        .unwrap();

    let mut actions = Vec::new();
    for _ in 0..4 {
        pipeline.generate(None).await;
        pipeline.run_on(&["ivy", "boa"]).await;
        actions.push(completed(monitor.cycle().await).action);
    }

    assert_eq!(
        actions,
        vec![
            HealthAction::Grace,
            HealthAction::Healthy,
            HealthAction::Restarted {
                runners: true,
                generator: false
            },
            HealthAction::Healthy,
        ]
    );
    assert_eq!(supervisor.events(), vec!["runners"]);
}

#[tokio::test]
async fn test_metrics_follow_the_delta_law() {
    let mut pipeline = Pipeline::new().await;
    let mut monitor = pipeline.monitor(Recorder::default()).await;

    let mut total = 0;
    for batch in [3, 1, 2] {
        for _ in 0..batch {
            pipeline.generate(None).await;
        }
        pipeline.run_on(&["ivy", "boa"]).await;
        let report = completed(monitor.cycle().await);
        total += report.delta.generated;
        assert_eq!(report.current.generated as i64, total);
    }

    let bench = std::fs::read_to_string(pipeline.dir.path().join("bench/data1.txt")).unwrap();
    let blocks: Vec<_> = bench.split("\n\n").filter(|b| !b.trim().is_empty()).collect();
    assert_eq!(blocks.len(), 3);
    assert!(blocks[2].contains("diff_generated_contracts:2"));
    assert!(blocks[2].contains("total_generated_contracts:6"));
    assert!(blocks[2].contains("total_ivy_runs:3"));
    assert!(blocks[2].contains("current_seed:unknown"));
}

#[tokio::test]
async fn test_evidence_is_extracted_once() {
    let mut pipeline = Pipeline::new().await;
    let mut monitor = pipeline.monitor(Recorder::default()).await;

    pipeline
        .generate(Some("This is an unhandled exception in the optimizer"))
        .await;
    pipeline.generate(Some("SyntaxError: bad indent")).await;
    let id = pipeline.generate(None).await;
    pipeline.ctx.store.upsert_run_result(&run(&id, "ivy")).await.unwrap();
    pipeline.ctx.store.upsert_run_result(&run(&id, "boa")).await.unwrap();
    pipeline
        .ctx
        .store
        .record_verification(&VerificationResult {
            generation_id: id.clone(),
            backends: vec!["ivy".to_string(), "boa".to_string()],
            verdicts: vec![CallVerdict {
                constructor_index: 0,
                function: "f".to_string(),
                input_index: 0,
                reference: "ivy".to_string(),
                candidate: "boa".to_string(),
                checks: BTreeMap::from([(
                    Check::ReturnValue,
                    CheckOutcome::Discrepancy(Discrepancy {
                        detail: "return values differ".to_string(),
                        reference: json!(1),
                        candidate: json!(2),
                    }),
                )]),
            }],
            logged_to_file: false,
        })
        .await
        .unwrap();

    let first = completed(monitor.cycle().await);
    assert_eq!((first.crashes_logged, first.discrepancies_logged), (1, 1));
    let second = completed(monitor.cycle().await);
    assert_eq!((second.crashes_logged, second.discrepancies_logged), (0, 0));

    let crashes = std::fs::read_to_string(pipeline.dir.path().join("crashes/crash1.txt")).unwrap();
    assert_eq!(crashes.matches("error_message:").count(), 1);
    assert!(crashes.contains("optimizer"));

    let diffs = std::fs::read_to_string(pipeline.dir.path().join("storage-diff/diff1.txt")).unwrap();
    assert_eq!(diffs.matches("verification_discrepancy:").count(), 1);
    assert!(diffs.contains(&format!("id:{id}")));
    assert!(diffs.contains(&format!("contract C{id}")));
    assert!(pipeline.ctx.store.load_verification(&id).await.unwrap().unwrap().logged_to_file);
}

#[tokio::test]
async fn test_failed_evidence_write_keeps_crash_unlogged() {
    let mut pipeline = Pipeline::new().await;
    let mut monitor = pipeline.monitor(Recorder::default()).await;
    let id = pipeline
        .generate(Some("This is an unhandled exception in codegen"))
        .await;

    // a directory where the crash file should be makes the append fail
    std::fs::create_dir(pipeline.dir.path().join("crashes/crash1.txt")).unwrap();
    let outcome = monitor.cycle().await;
    assert!(matches!(outcome, CycleOutcome::Failed(message) if message.contains("compiler crash")));

    let markers = vec!["This is an unhandled".to_string()];
    let pending = pipeline.ctx.store.unlogged_compiler_crashes(&markers).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].generation_id, id);

    let report = completed(monitor.cycle().await);
    assert_eq!((report.sequence, report.crashes_logged), (2, 1));
    let crashes = std::fs::read_to_string(pipeline.dir.path().join("crashes/crash2.txt")).unwrap();
    assert!(crashes.contains(&format!("id:{id}")));
    assert!(pipeline.ctx.store.unlogged_compiler_crashes(&markers).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cycle_error_resets_state() {
    let mut pipeline = Pipeline::new().await;
    let supervisor = Recorder {
        fail_runners: true,
        ..Recorder::default()
    };
    let mut monitor = pipeline.monitor(supervisor).await;
    completed(monitor.cycle().await);

    pipeline.generate(None).await;
    let outcome = monitor.cycle().await;
    assert!(matches!(outcome, CycleOutcome::Failed(message) if message.contains("restart runners")));
    assert_eq!(monitor.files().sequence, 2);
    assert_eq!(monitor.phase(), Phase::Initializing);
    assert_eq!(monitor.streaks(), (0, 0));

    let metadata = std::fs::read_to_string(pipeline.dir.path().join("bench/bench-metadata1.txt")).unwrap();
    assert!(metadata.contains("monitor_event:error"));

    // the monitor keeps going after a failure
    assert_eq!(completed(monitor.cycle().await).action, HealthAction::Grace);
}

#[tokio::test]
async fn test_new_monitor_continues_the_sequence() {
    let pipeline = Pipeline::new().await;
    std::fs::create_dir_all(pipeline.dir.path().join("bench")).unwrap();
    std::fs::write(pipeline.dir.path().join("bench/data4.txt"), "").unwrap();

    let monitor = pipeline.monitor(Recorder::default()).await;
    assert_eq!(monitor.files().sequence, 5);
    assert!(pipeline.dir.path().join("bench/data5.txt").exists());
}

#[tokio::test]
async fn test_dump_writes_verified_generations() {
    let mut pipeline = Pipeline::new().await;
    let id = pipeline.generate(None).await;
    for backend in ["ivy", "boa"] {
        pipeline.ctx.store.upsert_run_result(&run(&id, backend)).await.unwrap();
    }
    pipeline
        .ctx
        .store
        .record_verification(&VerificationResult {
            generation_id: id.clone(),
            backends: vec!["ivy".to_string(), "boa".to_string()],
            verdicts: vec![],
            logged_to_file: false,
        })
        .await
        .unwrap();

    let out = pipeline.dir.path().join("dump");
    assert_eq!(report::dump(&pipeline.ctx, &out).await.unwrap(), 1);
    let text = std::fs::read_to_string(out.join(format!("{id}.json"))).unwrap();
    let document: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(document["id"], json!(id));
    assert_eq!(document["results"].as_array().map(Vec::len), Some(2));

    let stats = report::stats(&pipeline.ctx).await.unwrap();
    assert!(report::format_stats(&stats).contains("verified: 1"));
}
