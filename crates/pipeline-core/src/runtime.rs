//! Worker runtime: the loop that drives one worker on its own thread
//!
//! # Lifecycle
//!
//! ```text
//! Created -> Initialized -> Started -> Running -> Draining -> ShutDown
//! ```
//!
//! `initialize` runs during setup on the controller thread. Everything from
//! `startup` on runs inside [`WorkerRuntime::run`], behind a panic boundary,
//! and `shutdown` is always called on the way out.

use crate::context::{StateCell, WorkerContext, WorkerState};
use crate::error::WorkerError;
use crate::queue::{Message, Outputs, ShutdownSignal};
use crate::worker::Worker;
use crossbeam_channel::{select, Receiver};
use frame_pipeline_common::Item;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How a worker runtime ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Source exhausted its input, or consumer drained up to its stop token
    Completed,

    /// Source stopped producing because the controller asked it to
    Halted,

    /// `startup` returned an error
    StartupFailed,

    /// Too many consecutive item failures, or the runtime was miswired
    Aborted,

    /// A lifecycle method panicked
    Panicked,

    /// Abandoned by the controller after the grace period
    Terminated,
}

impl WorkerOutcome {
    /// True for the outcomes of an orderly exit
    #[must_use]
    pub fn is_orderly(self) -> bool {
        matches!(self, Self::Completed | Self::Halted)
    }
}

/// Retry and failure limits applied by the runtime loop
#[derive(Debug, Clone, Copy)]
pub struct LoopLimits {
    pub source_retry_backoff: Duration,

    /// 0 disables the limit
    pub max_consecutive_item_failures: u32,
}

/// Everything one worker thread needs, moved onto that thread at start
pub struct WorkerRuntime {
    worker: Box<dyn Worker>,
    ctx: WorkerContext,
    input: Option<Receiver<Message>>,
    outputs: Outputs,
    halt: ShutdownSignal,
    terminate: ShutdownSignal,
    state: StateCell,
    limits: LoopLimits,
}

impl WorkerRuntime {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        worker: Box<dyn Worker>,
        ctx: WorkerContext,
        input: Option<Receiver<Message>>,
        outputs: Outputs,
        halt: ShutdownSignal,
        terminate: ShutdownSignal,
        state: StateCell,
        limits: LoopLimits,
    ) -> Self {
        Self {
            worker,
            ctx,
            input,
            outputs,
            halt,
            terminate,
            state,
            limits,
        }
    }

    /// Run the worker to completion on the current thread
    pub fn run(mut self) -> WorkerOutcome {
        let name = self.ctx.name.clone();
        info!(worker = %name, source = self.ctx.is_source, "Worker starting");

        let mut outcome = match catch_unwind(AssertUnwindSafe(|| self.start_and_loop())) {
            Ok(outcome) => outcome,
            Err(payload) => {
                error!(worker = %name, "Worker panicked: {}", panic_message(&*payload));
                WorkerOutcome::Panicked
            }
        };

        if self.state.get() != WorkerState::Draining {
            self.state.set(WorkerState::Draining);
        }

        // Flush and release on every exit path
        match catch_unwind(AssertUnwindSafe(|| self.worker.shutdown(&self.ctx))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(worker = %name, error = %e, "Worker shutdown failed"),
            Err(payload) => {
                error!(worker = %name, "Worker panicked during shutdown: {}", panic_message(&*payload));
                outcome = WorkerOutcome::Panicked;
            }
        }

        self.state.set(WorkerState::ShutDown);
        info!(worker = %name, ?outcome, elapsed = ?self.ctx.elapsed(), "Worker finished");
        outcome
    }

    fn start_and_loop(&mut self) -> WorkerOutcome {
        if let Err(e) = self.worker.startup(&self.ctx) {
            error!(worker = %self.ctx.name, error = %e, "Worker startup failed");
            return WorkerOutcome::StartupFailed;
        }
        self.state.set(WorkerState::Started);
        self.state.set(WorkerState::Running);

        if self.ctx.is_source {
            self.source_loop()
        } else {
            self.consumer_loop()
        }
    }

    fn source_loop(&mut self) -> WorkerOutcome {
        loop {
            if self.terminate.is_fired() {
                return WorkerOutcome::Terminated;
            }
            if self.halt.is_fired() {
                return WorkerOutcome::Halted;
            }

            match self.worker.run(None, &self.outputs) {
                Ok(()) => {
                    info!(worker = %self.ctx.name, "Source exhausted");
                    self.state.set(WorkerState::Draining);
                    return WorkerOutcome::Completed;
                }
                Err(WorkerError::Halted) => return WorkerOutcome::Halted,
                Err(WorkerError::Terminated) => return WorkerOutcome::Terminated,
                Err(e) => {
                    error!(
                        worker = %self.ctx.name,
                        error = %e,
                        "Source run failed, retrying in {:?}",
                        self.limits.source_retry_backoff
                    );
                    select! {
                        recv(self.halt.receiver()) -> _ => return WorkerOutcome::Halted,
                        recv(self.terminate.receiver()) -> _ => return WorkerOutcome::Terminated,
                        default(self.limits.source_retry_backoff) => {}
                    }
                }
            }
        }
    }

    fn consumer_loop(&mut self) -> WorkerOutcome {
        let Some(input) = self.input.clone() else {
            error!(worker = %self.ctx.name, "Non-source worker has no input queue");
            return WorkerOutcome::Aborted;
        };
        let mut consecutive_failures = 0u32;

        loop {
            let message = select! {
                recv(input) -> msg => msg.ok(),
                recv(self.terminate.receiver()) -> _ => return WorkerOutcome::Terminated,
            };

            let item = match message {
                Some(Message::Item(item)) => item,
                Some(Message::Stop) => return self.drain(),
                None => {
                    warn!(worker = %self.ctx.name, "Input queue disconnected, treating as stop");
                    return self.drain();
                }
            };

            match self.process(item) {
                Ok(()) => consecutive_failures = 0,
                Err(WorkerError::Terminated) => return WorkerOutcome::Terminated,
                Err(e) => {
                    consecutive_failures += 1;
                    error!(
                        worker = %self.ctx.name,
                        error = %e,
                        consecutive_failures,
                        "Item processing failed, dropping item"
                    );
                    let limit = self.limits.max_consecutive_item_failures;
                    if limit > 0 && consecutive_failures >= limit {
                        error!(
                            worker = %self.ctx.name,
                            "Aborting after {} consecutive item failures",
                            consecutive_failures
                        );
                        return WorkerOutcome::Aborted;
                    }
                }
            }
        }
    }

    fn process(&mut self, item: Item) -> Result<(), WorkerError> {
        self.worker.run(Some(item), &self.outputs)
    }

    fn drain(&mut self) -> WorkerOutcome {
        debug!(worker = %self.ctx.name, "Stop token received, draining");
        self.state.set(WorkerState::Draining);
        match self.outputs.forward_stop() {
            Ok(()) => WorkerOutcome::Completed,
            Err(_) => WorkerOutcome::Terminated,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
