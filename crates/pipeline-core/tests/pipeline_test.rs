//! Integration tests for the pipeline controller lifecycle

use frame_pipeline_core::{
    normalize, Item, NormalizedConfig, Outputs, Params, PipelineController, Registry, RunOutcome,
    PipelineError, RunSettings, Worker, WorkerContext, WorkerError, WorkerOutcome, WorkerState,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

type EventLog = Arc<Mutex<Vec<String>>>;

/// Emits `count` numbered items, or forever when `count` is absent
struct NumberSource {
    name: String,
    count: Option<i64>,
    next: i64,
    log: EventLog,
}

impl Worker for NumberSource {
    fn initialize(&mut self, ctx: &WorkerContext, params: &Params) -> Result<(), WorkerError> {
        self.name = ctx.name.clone();
        self.count = params.get("count").and_then(serde_json::Value::as_i64);
        Ok(())
    }

    fn run(&mut self, _item: Option<Item>, out: &Outputs) -> Result<(), WorkerError> {
        loop {
            if self.count.is_some_and(|count| self.next >= count) {
                return Ok(());
            }
            self.next += 1;
            out.done_with_item(Item::new().with("frame_number", self.next))?;
            if self.count.is_none() {
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    fn shutdown(&mut self, _ctx: &WorkerContext) -> Result<(), WorkerError> {
        self.log.lock().unwrap().push(format!("{}:shutdown", self.name));
        Ok(())
    }
}

/// Logs every item and forwards it; panics on `panic_on` when configured
struct Recorder {
    name: String,
    panic_on: Option<i64>,
    log: EventLog,
}

impl Worker for Recorder {
    fn initialize(&mut self, ctx: &WorkerContext, params: &Params) -> Result<(), WorkerError> {
        self.name = ctx.name.clone();
        self.panic_on = params.get("panic_on").and_then(serde_json::Value::as_i64);
        Ok(())
    }

    fn run(&mut self, item: Option<Item>, out: &Outputs) -> Result<(), WorkerError> {
        let item = item.ok_or_else(|| WorkerError::Other("missing item".to_string()))?;
        let n = item
            .frame_number()
            .ok_or_else(|| WorkerError::MissingKey("frame_number".to_string()))?;
        if self.panic_on == Some(n) {
            panic!("{} crashed on item {}", self.name, n);
        }
        self.log.lock().unwrap().push(format!("{}:{}", self.name, n));
        out.done_with_item(item)
    }

    fn shutdown(&mut self, _ctx: &WorkerContext) -> Result<(), WorkerError> {
        self.log.lock().unwrap().push(format!("{}:shutdown", self.name));
        Ok(())
    }
}

/// Ignores every cancellation signal while processing an item
struct Stuck;

impl Worker for Stuck {
    fn initialize(&mut self, _ctx: &WorkerContext, _params: &Params) -> Result<(), WorkerError> {
        Ok(())
    }

    fn run(&mut self, _item: Option<Item>, _out: &Outputs) -> Result<(), WorkerError> {
        thread::sleep(Duration::from_secs(3));
        Ok(())
    }
}

/// Emits `count` items, then sleeps through the halt signal
struct StuckSource {
    count: i64,
}

impl Worker for StuckSource {
    fn initialize(&mut self, _ctx: &WorkerContext, params: &Params) -> Result<(), WorkerError> {
        self.count = params.get("count").and_then(serde_json::Value::as_i64).unwrap_or(0);
        Ok(())
    }

    fn run(&mut self, _item: Option<Item>, out: &Outputs) -> Result<(), WorkerError> {
        for n in 1..=self.count {
            out.done_with_item(Item::new().with("frame_number", n))?;
        }
        thread::sleep(Duration::from_secs(3));
        Ok(())
    }
}

/// Requires a `mode` of `fast` or `slow`
struct Picky;

impl Worker for Picky {
    fn initialize(&mut self, _ctx: &WorkerContext, params: &Params) -> Result<(), WorkerError> {
        match params.get("mode").and_then(serde_json::Value::as_str) {
            Some("fast" | "slow") => Ok(()),
            other => Err(WorkerError::InvalidParams(format!("unsupported mode {other:?}"))),
        }
    }

    fn run(&mut self, _item: Option<Item>, _out: &Outputs) -> Result<(), WorkerError> {
        Ok(())
    }
}

struct FailsStartup;

impl Worker for FailsStartup {
    fn initialize(&mut self, _ctx: &WorkerContext, _params: &Params) -> Result<(), WorkerError> {
        Ok(())
    }

    fn startup(&mut self, _ctx: &WorkerContext) -> Result<(), WorkerError> {
        Err(WorkerError::Other("model file missing".to_string()))
    }

    fn run(&mut self, _item: Option<Item>, _out: &Outputs) -> Result<(), WorkerError> {
        Ok(())
    }
}

fn test_registry(log: &EventLog) -> Registry {
    let mut registry = Registry::new();

    let source_log = Arc::clone(log);
    registry.register("NumberSource", move || {
        Box::new(NumberSource {
            name: String::new(),
            count: None,
            next: 0,
            log: Arc::clone(&source_log),
        })
    });

    let recorder_log = Arc::clone(log);
    registry.register("Recorder", move || {
        Box::new(Recorder {
            name: String::new(),
            panic_on: None,
            log: Arc::clone(&recorder_log),
        })
    });

    registry.register("Stuck", || Box::new(Stuck));
    registry.register("StuckSource", || Box::new(StuckSource { count: 0 }));
    registry.register("Picky", || Box::new(Picky));
    registry.register_qualified("test_stages::FailsStartup", || Box::new(FailsStartup));
    registry
}

fn config(workers: serde_json::Value) -> NormalizedConfig {
    normalize(&json!({
        "name": "test",
        "options": {
            "grace_period_secs": 2.0,
            "poll_interval_ms": 20,
            "source_retry_backoff_ms": 10
        },
        "workers": workers
    }))
    .unwrap()
}

/// Show engine logs with `RUST_LOG=debug cargo test -- --nocapture`
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn controller(config: NormalizedConfig, log: &EventLog, dir: &tempfile::TempDir) -> PipelineController {
    init_logging();
    PipelineController::from_config(
        config,
        test_registry(log),
        RunSettings::new("test", dir.path().join("out")),
    )
    .unwrap()
}

fn events_of(log: &EventLog, worker: &str) -> Vec<String> {
    let prefix = format!("{worker}:");
    log.lock()
        .unwrap()
        .iter()
        .filter_map(|e| e.strip_prefix(&prefix).map(str::to_string))
        .collect()
}

#[test]
fn test_setup_creates_one_queue_per_consumer() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::default();
    let mut controller = controller(
        config(json!([
            {"name": "A", "type": "NumberSource", "source": true, "next": ["B", "C"], "count": 1},
            {"name": "B", "type": "Recorder", "next": ["D"]},
            {"name": "C", "type": "Recorder"},
            {"name": "D", "type": "Recorder"}
        ])),
        &log,
        &dir,
    );

    assert!(controller.setup());
    assert_eq!(controller.worker_count(), 4);
    assert_eq!(controller.queue_count(), 3);
    assert!(controller.stop());
    assert_eq!(controller.queue_count(), 0);
}

#[test]
fn test_linear_pipeline_preserves_order_and_drains() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::default();
    let mut controller = controller(
        config(json!([
            {"name": "A", "type": "NumberSource", "source": true, "next": ["B"], "count": 3},
            {"name": "B", "type": "Recorder", "next": ["C"]},
            {"name": "C", "type": "Recorder"}
        ])),
        &log,
        &dir,
    );

    assert_eq!(controller.run(), RunOutcome::Completed);
    assert_eq!(events_of(&log, "B"), vec!["1", "2", "3", "shutdown"]);
    assert_eq!(events_of(&log, "C"), vec!["1", "2", "3", "shutdown"]);

    // B saw every item before C saw the last one
    let events = log.lock().unwrap().clone();
    let b_last = events.iter().position(|e| e == "B:3").unwrap();
    let c_last = events.iter().position(|e| e == "C:3").unwrap();
    assert!(b_last < c_last);

    for (name, outcome) in controller.worker_outcomes() {
        assert_eq!(outcome, Some(WorkerOutcome::Completed), "worker {name}");
    }
    for (name, state) in controller.worker_states() {
        assert_eq!(state, WorkerState::ShutDown, "worker {name}");
    }
    assert_eq!(controller.queue_count(), 0);
    assert!(dir.path().join("out").is_dir());
}

#[test]
fn test_fan_out_delivers_to_every_branch() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::default();
    let mut controller = controller(
        config(json!([
            {"name": "A", "type": "NumberSource", "source": true, "next": ["left", "right"], "count": 5},
            {"name": "left", "type": "Recorder"},
            {"name": "right", "type": "Recorder", "queue_size": 1}
        ])),
        &log,
        &dir,
    );

    assert!(controller.run().is_success());
    let expected = vec!["1", "2", "3", "4", "5", "shutdown"];
    assert_eq!(events_of(&log, "left"), expected);
    assert_eq!(events_of(&log, "right"), expected);
}

#[test]
fn test_legacy_config_runs() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::default();
    let raw = json!({
        "pipeline": {
            "name": "legacy",
            "options": {"grace_period_secs": 2.0, "poll_interval_ms": 20},
            "tasks": [
                {"name": "A", "worker_type": "NumberSource", "count": 2},
                {"name": "B", "worker_type": "Recorder", "prev_task": "A"}
            ]
        }
    });
    let mut controller = controller(normalize(&raw).unwrap(), &log, &dir);

    assert_eq!(controller.run(), RunOutcome::Completed);
    assert_eq!(events_of(&log, "B"), vec!["1", "2", "shutdown"]);
}

#[test]
fn test_crashed_worker_fails_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::default();
    let mut controller = controller(
        config(json!([
            {"name": "A", "type": "NumberSource", "source": true, "next": ["B"]},
            {"name": "B", "type": "Recorder", "next": ["C"]},
            {"name": "C", "type": "Recorder", "params": {"panic_on": 2}}
        ])),
        &log,
        &dir,
    );

    let started = Instant::now();
    assert_eq!(controller.run(), RunOutcome::Failed);
    assert!(started.elapsed() < Duration::from_secs(5));

    let outcomes = controller.worker_outcomes();
    assert_eq!(outcomes[2].1, Some(WorkerOutcome::Panicked));
    assert_eq!(outcomes[0].1, Some(WorkerOutcome::Halted));

    // Healthy peers still went through shutdown
    assert!(events_of(&log, "A").contains(&"shutdown".to_string()));
    assert!(events_of(&log, "B").contains(&"shutdown".to_string()));
    assert!(events_of(&log, "C").contains(&"shutdown".to_string()));
}

#[test]
fn test_hung_worker_is_force_terminated() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::default();
    let raw = json!({
        "options": {"grace_period_secs": 0.3, "poll_interval_ms": 20},
        "workers": [
            {"name": "A", "type": "NumberSource", "source": true, "next": ["B"], "count": 1},
            {"name": "B", "type": "Stuck"}
        ]
    });
    let mut controller = controller(normalize(&raw).unwrap(), &log, &dir);

    assert!(controller.setup());
    assert!(controller.start());
    thread::sleep(Duration::from_millis(100));

    let stopping = Instant::now();
    assert!(!controller.stop());
    assert!(stopping.elapsed() < Duration::from_millis(1300));

    let outcomes = controller.worker_outcomes();
    assert_eq!(outcomes[1].1, Some(WorkerOutcome::Terminated));

    // Second call reports the same result without waiting again
    let again = Instant::now();
    assert!(!controller.stop());
    assert!(again.elapsed() < Duration::from_millis(100));
}

#[test]
fn test_stuck_source_does_not_hold_up_consumers() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::default();
    let raw = json!({
        "options": {"grace_period_secs": 1.0, "poll_interval_ms": 20},
        "workers": [
            {"name": "A", "type": "StuckSource", "source": true, "next": ["B"], "count": 3},
            {"name": "B", "type": "Recorder"}
        ]
    });
    let mut controller = controller(normalize(&raw).unwrap(), &log, &dir);

    assert!(controller.setup());
    assert!(controller.start());
    thread::sleep(Duration::from_millis(200));

    let stopping = Instant::now();
    assert!(!controller.stop());
    assert!(stopping.elapsed() < Duration::from_millis(1500));

    let outcomes = controller.worker_outcomes();
    assert_eq!(outcomes[0].1, Some(WorkerOutcome::Terminated));
    assert_eq!(outcomes[1].1, Some(WorkerOutcome::Completed));
    assert_eq!(events_of(&log, "B"), vec!["1", "2", "3", "shutdown"]);
}

#[test]
fn test_validate_initializes_without_running() {
    let log = EventLog::default();
    let registry = test_registry(&log);

    let good = config(json!([
        {"name": "A", "type": "NumberSource", "source": true, "next": ["B"], "count": 1},
        {"name": "B", "type": "Picky", "mode": "fast"}
    ]));
    let graph = PipelineController::validate(&good, &registry).unwrap();
    assert_eq!(graph.workers().len(), 2);

    let bad = config(json!([
        {"name": "A", "type": "NumberSource", "source": true, "next": ["B"], "count": 1},
        {"name": "B", "type": "Picky", "mode": "sideways"}
    ]));
    let err = PipelineController::validate(&bad, &registry).unwrap_err();
    assert!(matches!(err, PipelineError::WorkerInit { ref worker, .. } if worker == "B"));

    let unknown = config(json!([
        {"name": "A", "type": "NumberSource", "source": true, "next": ["B"]},
        {"name": "B", "type": "not_registered::Stage"}
    ]));
    assert!(PipelineController::validate(&unknown, &registry).is_err());

    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn test_unknown_type_starts_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::default();
    let mut controller = controller(
        config(json!([
            {"name": "A", "type": "NumberSource", "source": true, "next": ["B"], "count": 1},
            {"name": "B", "type": "not_registered::Stage"}
        ])),
        &log,
        &dir,
    );

    assert_eq!(controller.run(), RunOutcome::Failed);
    assert_eq!(controller.worker_count(), 0);
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn test_startup_failure_fails_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::default();
    let mut controller = controller(
        config(json!([
            {"name": "A", "type": "NumberSource", "source": true, "next": ["B"]},
            {"name": "B", "type": "test_stages.FailsStartup"}
        ])),
        &log,
        &dir,
    );

    assert_eq!(controller.run(), RunOutcome::Failed);
    let outcomes = controller.worker_outcomes();
    assert_eq!(outcomes[1].1, Some(WorkerOutcome::StartupFailed));
}

#[test]
fn test_interrupt_stops_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::default();
    let mut controller = controller(
        config(json!([
            {"name": "A", "type": "NumberSource", "source": true, "next": ["B"]},
            {"name": "B", "type": "Recorder"}
        ])),
        &log,
        &dir,
    );

    let interrupt = controller.interrupt_handle();
    let trigger = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        interrupt.interrupt();
    });

    assert_eq!(controller.run(), RunOutcome::Interrupted);
    trigger.join().unwrap();

    // Everything A emitted before halting reached B ahead of the stop token
    let b_events = events_of(&log, "B");
    assert_eq!(b_events.last().map(String::as_str), Some("shutdown"));
    let received: Vec<i64> = b_events
        .iter()
        .filter_map(|e| e.parse().ok())
        .collect();
    let expected: Vec<i64> = (1..=received.len() as i64).collect();
    assert_eq!(received, expected);
}
