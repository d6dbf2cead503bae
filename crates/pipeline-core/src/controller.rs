//! Pipeline controller: setup, launch, supervision and coordinated shutdown
//!
//! # Shutdown sequence
//!
//! 1. Raise *halt* so sources stop producing. As each source exits, push one
//!    stop token into each of its output queues. Consumers drain everything
//!    queued ahead of the token, then forward it downstream.
//! 2. Sources still running after the halt window get their tokens anyway.
//!    A halted source can no longer emit, so nothing lands behind a token.
//! 3. Poll worker handles until all have exited or the grace period ends.
//! 4. Raise *terminate* for the stragglers and detach their threads.

use crate::config::{NormalizedConfig, PipelineGraph, PipelineOptions};
use crate::context::{RunSettings, StateCell, WorkerContext, WorkerState};
use crate::error::{ConfigError, PipelineError};
use crate::queue::{signal_pair, QueueFabric, ShutdownSignal, SignalTrigger};
use crate::registry::{Registry, WorkerFactory};
use crate::runtime::{LoopLimits, WorkerOutcome, WorkerRuntime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Upper bound on how often `stop()` polls worker handles
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Share of the grace period spent waiting for halted sources
const HALT_WINDOW_FRACTION: f64 = 0.25;

/// Upper bound on the halt window
const MAX_HALT_WINDOW: Duration = Duration::from_secs(5);

/// Overall result of [`PipelineController::run`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every source finished and all workers drained within the grace period
    Completed,

    /// Setup or launch failed, a worker died, or shutdown needed force
    Failed,

    /// Stopped early by an external interrupt
    Interrupted,
}

impl RunOutcome {
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::Completed
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        };
        f.write_str(text)
    }
}

/// Cloneable flag used to interrupt a running pipeline from another thread
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct WorkerSlot {
    name: String,
    is_source: bool,
    state: StateCell,
    runtime: Option<WorkerRuntime>,
    handle: Option<JoinHandle<WorkerOutcome>>,
    outcome: Option<WorkerOutcome>,
}

impl WorkerSlot {
    fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// Collect the outcome if the thread has exited
    fn reap(&mut self) {
        if self.outcome.is_some() {
            return;
        }
        let finished = self.handle.as_ref().is_some_and(JoinHandle::is_finished);
        if !finished {
            return;
        }
        if let Some(handle) = self.handle.take() {
            let outcome = handle.join().unwrap_or(WorkerOutcome::Panicked);
            debug!(worker = %self.name, ?outcome, "Worker thread joined");
            self.outcome = Some(outcome);
        }
    }
}

/// Owns the worker graph and drives it through its lifecycle
pub struct PipelineController {
    config: NormalizedConfig,
    registry: Registry,
    settings: Arc<RunSettings>,
    graph: Option<Arc<PipelineGraph>>,
    fabric: Option<QueueFabric>,
    slots: Vec<WorkerSlot>,
    started: bool,
    halt: SignalTrigger,
    halt_signal: ShutdownSignal,
    terminate: SignalTrigger,
    terminate_signal: ShutdownSignal,
    interrupt: InterruptHandle,
    stop_result: Option<bool>,
}

impl PipelineController {
    /// Create a controller for the given configuration
    ///
    /// Creates the run's output directory.
    pub fn from_config(
        config: NormalizedConfig,
        registry: Registry,
        settings: RunSettings,
    ) -> Result<Self, PipelineError> {
        std::fs::create_dir_all(&settings.out_path).map_err(|source| {
            PipelineError::OutputDir {
                path: settings.out_path.clone(),
                source,
            }
        })?;

        let (halt, halt_signal) = signal_pair();
        let (terminate, terminate_signal) = signal_pair();

        Ok(Self {
            config,
            registry,
            settings: Arc::new(settings),
            graph: None,
            fabric: None,
            slots: Vec::new(),
            started: false,
            halt,
            halt_signal,
            terminate,
            terminate_signal,
            interrupt: InterruptHandle::default(),
            stop_result: None,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn options(&self) -> &PipelineOptions {
        &self.config.options
    }

    /// Handle that makes [`run`](Self::run) stop and return `Interrupted`
    #[must_use]
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    /// Number of constructed workers
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of allocated input queues, zero once stopped
    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.fabric.as_ref().map_or(0, QueueFabric::len)
    }

    /// Current lifecycle state of every worker, in configuration order
    #[must_use]
    pub fn worker_states(&self) -> Vec<(String, WorkerState)> {
        self.slots
            .iter()
            .map(|slot| (slot.name.clone(), slot.state.get()))
            .collect()
    }

    /// Outcome of every worker that has been joined so far
    #[must_use]
    pub fn worker_outcomes(&self) -> Vec<(String, Option<WorkerOutcome>)> {
        self.slots
            .iter()
            .map(|slot| (slot.name.clone(), slot.outcome))
            .collect()
    }

    /// Validate the graph, allocate queues and construct every worker
    pub fn try_setup(&mut self) -> Result<(), PipelineError> {
        if self.graph.is_some() {
            return Err(PipelineError::InvalidState("setup already ran"));
        }

        let graph = PipelineGraph::new(self.config.name.clone(), self.config.workers.clone())?;

        // Resolve every type before constructing anything
        let factories = resolve_factories(&graph, &self.registry)?;

        let graph = Arc::new(graph);

        // Pass 1: one input queue per non-source worker
        let fabric = QueueFabric::build(&graph);

        // Pass 2: wire outputs and initialize workers
        let start_time = Instant::now();
        let limits = LoopLimits {
            source_retry_backoff: self.config.options.source_retry_backoff(),
            max_consecutive_item_failures: self.config.options.max_consecutive_item_failures,
        };
        let mut slots = Vec::with_capacity(factories.len());

        for (descriptor, factory) in graph.workers().iter().zip(factories) {
            let ctx = WorkerContext {
                name: descriptor.name.clone(),
                is_source: descriptor.is_source,
                graph: Arc::clone(&graph),
                start_time,
                settings: Arc::clone(&self.settings),
            };

            let mut worker = factory();
            worker
                .initialize(&ctx, &descriptor.params)
                .map_err(|source| PipelineError::WorkerInit {
                    worker: descriptor.name.clone(),
                    source,
                })?;

            // Only sources observe halt; consumers stop on their stop token
            let halt = if descriptor.is_source {
                self.halt_signal.clone()
            } else {
                ShutdownSignal::never()
            };
            let outputs =
                fabric.outputs_for(descriptor, halt.clone(), self.terminate_signal.clone());
            let state = StateCell::new(WorkerState::Initialized);

            debug!(
                worker = %descriptor.name,
                worker_type = %descriptor.worker_type,
                next = ?descriptor.next,
                "Worker initialized"
            );

            slots.push(WorkerSlot {
                name: descriptor.name.clone(),
                is_source: descriptor.is_source,
                state: state.clone(),
                runtime: Some(WorkerRuntime::new(
                    worker,
                    ctx,
                    fabric.input_for(&descriptor.name),
                    outputs,
                    halt,
                    self.terminate_signal.clone(),
                    state,
                    limits,
                )),
                handle: None,
                outcome: None,
            });
        }

        info!(
            "Pipeline '{}' set up: {} workers, {} queues",
            self.config.name,
            slots.len(),
            fabric.len()
        );

        self.graph = Some(graph);
        self.fabric = Some(fabric);
        self.slots = slots;
        Ok(())
    }

    /// Check a configuration without running it
    ///
    /// Validates the graph, resolves every worker type and initializes each
    /// worker against a throwaway context. No thread is started and no output
    /// directory is created.
    pub fn validate(
        config: &NormalizedConfig,
        registry: &Registry,
    ) -> Result<PipelineGraph, PipelineError> {
        let graph = Arc::new(PipelineGraph::new(
            config.name.clone(),
            config.workers.clone(),
        )?);
        let factories = resolve_factories(&graph, registry)?;
        let settings = Arc::new(RunSettings::default());
        let start_time = Instant::now();

        for (descriptor, factory) in graph.workers().iter().zip(factories) {
            let ctx = WorkerContext {
                name: descriptor.name.clone(),
                is_source: descriptor.is_source,
                graph: Arc::clone(&graph),
                start_time,
                settings: Arc::clone(&settings),
            };
            factory()
                .initialize(&ctx, &descriptor.params)
                .map_err(|source| PipelineError::WorkerInit {
                    worker: descriptor.name.clone(),
                    source,
                })?;
        }

        debug!("Pipeline '{}' validated", config.name);
        Ok(Arc::unwrap_or_clone(graph))
    }

    /// [`try_setup`](Self::try_setup), logging the failure cause
    pub fn setup(&mut self) -> bool {
        match self.try_setup() {
            Ok(()) => true,
            Err(e) => {
                error!("Pipeline setup failed: {}", e);
                false
            }
        }
    }

    /// Launch one thread per worker
    pub fn try_start(&mut self) -> Result<(), PipelineError> {
        if self.graph.is_none() {
            return Err(PipelineError::InvalidState("start called before setup"));
        }
        if self.started {
            return Err(PipelineError::InvalidState("pipeline already started"));
        }
        self.started = true;

        for idx in 0..self.slots.len() {
            let slot = &mut self.slots[idx];
            let Some(runtime) = slot.runtime.take() else {
                continue;
            };
            let spawned = thread::Builder::new()
                .name(format!("worker-{}", slot.name))
                .spawn(move || runtime.run());

            match spawned {
                Ok(handle) => slot.handle = Some(handle),
                Err(source) => {
                    let worker = slot.name.clone();
                    error!(worker = %worker, "Failed to launch worker thread: {}", source);
                    self.abort_launched();
                    return Err(PipelineError::Launch { worker, source });
                }
            }
        }

        info!(
            "Pipeline '{}' started {} workers",
            self.config.name,
            self.slots.len()
        );
        Ok(())
    }

    /// [`try_start`](Self::try_start), logging the failure cause
    pub fn start(&mut self) -> bool {
        match self.try_start() {
            Ok(()) => true,
            Err(e) => {
                error!("Pipeline start failed: {}", e);
                false
            }
        }
    }

    /// Drain the pipeline and wait for every worker to exit
    ///
    /// Returns true only if no worker had to be forcibly terminated. Calling
    /// `stop` again returns the first result.
    pub fn stop(&mut self) -> bool {
        if let Some(result) = self.stop_result {
            return result;
        }
        if !self.started {
            self.slots.clear();
            self.fabric = None;
            self.stop_result = Some(true);
            return true;
        }

        let grace = self.config.options.grace_period();
        let deadline = Instant::now() + grace;
        let poll = self.config.options.poll_interval().min(STOP_POLL_INTERVAL);
        info!(
            "Stopping pipeline '{}' (grace period {:?})",
            self.config.name, grace
        );

        // Sources first, so nothing is queued behind the stop tokens
        self.halt.fire();
        let halt_deadline =
            Instant::now() + grace.mul_f64(HALT_WINDOW_FRACTION).min(MAX_HALT_WINDOW);
        let mut running_sources: Vec<usize> = (0..self.slots.len())
            .filter(|&idx| self.slots[idx].is_source)
            .collect();

        loop {
            self.reap_all();
            let (exited, running): (Vec<usize>, Vec<usize>) = running_sources
                .into_iter()
                .partition(|&idx| self.slots[idx].is_finished());
            for idx in exited {
                self.send_stop_tokens(idx, deadline);
            }
            running_sources = running;

            let now = Instant::now();
            if running_sources.is_empty() || now >= halt_deadline {
                break;
            }
            thread::sleep(poll.min(halt_deadline - now));
        }

        for idx in running_sources {
            warn!(
                worker = %self.slots[idx].name,
                "Source still running after halt, sending stop tokens downstream"
            );
            self.send_stop_tokens(idx, deadline);
        }

        self.wait_until(deadline, poll, |_| false);

        let stragglers: Vec<&WorkerSlot> =
            self.slots.iter().filter(|slot| !slot.is_finished()).collect();
        let clean = stragglers.is_empty();
        if !clean {
            self.terminate.fire();
            for slot in &stragglers {
                let depth = self
                    .fabric
                    .as_ref()
                    .and_then(|fabric| fabric.depth(&slot.name));
                warn!(
                    worker = %slot.name,
                    state = %slot.state.get(),
                    queued = ?depth,
                    "Worker did not exit within the grace period, force-terminating"
                );
            }
            // Detach the threads; they observe terminate at their next blocking point
            for slot in &mut self.slots {
                if !slot.is_finished() {
                    slot.handle = None;
                    slot.outcome = Some(WorkerOutcome::Terminated);
                }
            }
        }

        for slot in &self.slots {
            if let Some(outcome) = slot.outcome {
                if !outcome.is_orderly() {
                    warn!(worker = %slot.name, ?outcome, "Worker ended abnormally");
                }
            }
        }

        // Queues are discarded with the run; slots stay for outcome and state queries
        self.fabric = None;

        info!(
            "Pipeline '{}' stopped ({})",
            self.config.name,
            if clean { "clean" } else { "forced" }
        );
        self.stop_result = Some(clean);
        clean
    }

    /// Set up, start and supervise the pipeline until it finishes
    pub fn run(&mut self) -> RunOutcome {
        if !self.setup() || !self.start() {
            return RunOutcome::Failed;
        }

        let poll = self.config.options.poll_interval();
        loop {
            if self.interrupt.is_interrupted() {
                warn!("Pipeline '{}' interrupted, stopping", self.config.name);
                self.stop();
                return RunOutcome::Interrupted;
            }

            self.reap_all();

            let dead = self.slots.iter().find(|slot| match slot.outcome {
                Some(WorkerOutcome::Completed) => !slot.is_source,
                Some(_) => true,
                None => false,
            });
            if let Some(slot) = dead {
                error!(
                    worker = %slot.name,
                    outcome = ?slot.outcome,
                    "Worker exited unexpectedly, stopping pipeline"
                );
                self.stop();
                return RunOutcome::Failed;
            }

            if self
                .slots
                .iter()
                .filter(|slot| slot.is_source)
                .all(WorkerSlot::is_finished)
            {
                info!("All sources of '{}' finished, draining", self.config.name);
                return if self.stop() {
                    RunOutcome::Completed
                } else {
                    RunOutcome::Failed
                };
            }

            thread::sleep(poll);
        }
    }

    /// Push a stop token into every output queue of the source in `idx`
    fn send_stop_tokens(&self, idx: usize, deadline: Instant) {
        let name = &self.slots[idx].name;
        let (Some(graph), Some(fabric)) = (&self.graph, &self.fabric) else {
            return;
        };
        let Some(descriptor) = graph.get(name) else {
            return;
        };
        for target in fabric.inject_stop(&descriptor.next, deadline) {
            warn!(worker = %name, "Could not deliver stop token to '{}' before the deadline", target);
        }
    }

    fn reap_all(&mut self) {
        for slot in &mut self.slots {
            slot.reap();
        }
    }

    /// Poll until every slot is finished or skipped, or the deadline passes
    fn wait_until(
        &mut self,
        deadline: Instant,
        poll: Duration,
        skip: impl Fn(&WorkerSlot) -> bool,
    ) {
        loop {
            self.reap_all();
            if self
                .slots
                .iter()
                .all(|slot| skip(slot) || slot.is_finished())
            {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep(poll.min(deadline - now));
        }
    }

    /// Tear down after a failed launch
    fn abort_launched(&mut self) {
        self.halt.fire();
        self.terminate.fire();
        let deadline = Instant::now() + self.config.options.grace_period();
        self.wait_until(deadline, STOP_POLL_INTERVAL, |_| false);
        for slot in &mut self.slots {
            slot.runtime = None;
            slot.handle = None;
        }
        self.stop_result = Some(false);
    }
}

fn resolve_factories(
    graph: &PipelineGraph,
    registry: &Registry,
) -> Result<Vec<WorkerFactory>, ConfigError> {
    graph
        .workers()
        .iter()
        .map(|descriptor| {
            registry
                .resolve(&descriptor.worker_type)
                .map_err(|source| ConfigError::UnknownType {
                    worker: descriptor.name.clone(),
                    source,
                })
        })
        .collect()
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        // Never leave worker threads blocked on queues nobody will drain
        if self.started && self.stop_result.is_none() {
            self.halt.fire();
            self.terminate.fire();
        }
    }
}
