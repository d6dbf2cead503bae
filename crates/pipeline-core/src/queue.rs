//! Bounded queues connecting workers
//!
//! Every non-source worker owns exactly one input queue. Producers hold a
//! sender for each consumer named in their `next` list, so fan-out is a copy
//! of the item onto each of those queues. Stop tokens travel through the same
//! FIFO queues as items, which is what lets a consumer drain everything
//! enqueued before the token.
//!
//! ```text
//! [reader] --Item/Stop--> [stats] --Item/Stop--> [writer]
//!     \
//!      ----Item/Stop--> [logger]
//! ```

use crate::config::{PipelineGraph, WorkerDescriptor};
use crate::error::WorkerError;
use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender, TryRecvError};
use frame_pipeline_common::Item;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Message carried by a queue
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// One unit of work
    Item(Item),

    /// No further items will follow on this queue
    Stop,
}

/// Receiving side of a one-shot broadcast signal
///
/// The signal fires when its [`SignalTrigger`] is dropped or fired, which
/// disconnects the channel and wakes every waiter at once.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: Receiver<()>,
}

impl ShutdownSignal {
    /// A signal that never fires
    #[must_use]
    pub fn never() -> Self {
        Self {
            rx: crossbeam_channel::never(),
        }
    }

    #[must_use]
    pub fn is_fired(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Block for up to `timeout`, returning true if the signal fired
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.rx.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

/// Sending side of a [`ShutdownSignal`]
#[derive(Debug)]
pub struct SignalTrigger {
    tx: Mutex<Option<Sender<()>>>,
}

impl SignalTrigger {
    /// Fire the signal; later calls are no-ops
    pub fn fire(&self) {
        let sender = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);
    }
}

/// Create a connected trigger/signal pair
#[must_use]
pub fn signal_pair() -> (SignalTrigger, ShutdownSignal) {
    let (tx, rx) = bounded(0);
    (
        SignalTrigger {
            tx: Mutex::new(Some(tx)),
        },
        ShutdownSignal { rx },
    )
}

/// Output queues of one worker
pub struct Outputs {
    worker: String,
    targets: Vec<(String, Sender<Message>)>,
    halt: ShutdownSignal,
    terminate: ShutdownSignal,
}

impl Outputs {
    pub(crate) fn new(
        worker: String,
        targets: Vec<(String, Sender<Message>)>,
        halt: ShutdownSignal,
        terminate: ShutdownSignal,
    ) -> Self {
        Self {
            worker,
            targets,
            halt,
            terminate,
        }
    }

    /// Output handles with no cancellation, for driving a worker directly in tests
    #[must_use]
    pub fn detached(worker: impl Into<String>, targets: Vec<(String, Sender<Message>)>) -> Self {
        Self::new(
            worker.into(),
            targets,
            ShutdownSignal::never(),
            ShutdownSignal::never(),
        )
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Emit an item to every output queue in fan-out order
    ///
    /// Blocks while a consumer queue is full. Returns [`WorkerError::Halted`]
    /// or [`WorkerError::Terminated`] if the pipeline is stopping, which a
    /// worker should propagate with `?`.
    pub fn done_with_item(&self, item: Item) -> Result<(), WorkerError> {
        if self.halt.is_fired() {
            return Err(WorkerError::Halted);
        }
        if let Some(((last_name, last_tx), rest)) = self.targets.split_last() {
            for (name, tx) in rest {
                self.send(name, tx, Message::Item(item.clone()))?;
            }
            self.send(last_name, last_tx, Message::Item(item))?;
        }
        Ok(())
    }

    /// Forward exactly one stop token to each output queue
    pub(crate) fn forward_stop(&self) -> Result<(), WorkerError> {
        for (name, tx) in &self.targets {
            select! {
                send(tx, Message::Stop) -> res => {
                    if res.is_err() {
                        warn!(worker = %self.worker, "Queue of '{}' closed before stop token", name);
                    }
                }
                recv(self.terminate.receiver()) -> _ => return Err(WorkerError::Terminated),
            }
            debug!(worker = %self.worker, "Forwarded stop token to '{}'", name);
        }
        Ok(())
    }

    fn send(&self, name: &str, tx: &Sender<Message>, msg: Message) -> Result<(), WorkerError> {
        // select! picks at random among ready arms, so check halt first
        if self.halt.is_fired() {
            return Err(WorkerError::Halted);
        }
        select! {
            send(tx, msg) -> res => res.map_err(|_| {
                WorkerError::Other(format!("queue of '{name}' is closed"))
            }),
            recv(self.halt.receiver()) -> _ => Err(WorkerError::Halted),
            recv(self.terminate.receiver()) -> _ => Err(WorkerError::Terminated),
        }
    }
}

/// All queues of a pipeline, addressable by owning worker name
#[derive(Debug)]
pub struct QueueFabric {
    inputs: HashMap<String, (Sender<Message>, Receiver<Message>)>,
}

impl QueueFabric {
    /// Allocate one bounded input queue per non-source worker
    #[must_use]
    pub fn build(graph: &PipelineGraph) -> Self {
        let inputs = graph
            .workers()
            .iter()
            .filter(|w| !w.is_source)
            .map(|w| (w.name.clone(), bounded(w.queue_capacity)))
            .collect();
        Self { inputs }
    }

    /// Number of allocated queues
    #[must_use]
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Input queue of the named worker (`None` for sources)
    #[must_use]
    pub fn input_for(&self, name: &str) -> Option<Receiver<Message>> {
        self.inputs.get(name).map(|(_, rx)| rx.clone())
    }

    /// Items currently waiting in the named worker's queue
    #[must_use]
    pub fn depth(&self, name: &str) -> Option<usize> {
        self.inputs.get(name).map(|(_, rx)| rx.len())
    }

    /// Build the output handles of a worker from its `next` list
    pub(crate) fn outputs_for(
        &self,
        descriptor: &WorkerDescriptor,
        halt: ShutdownSignal,
        terminate: ShutdownSignal,
    ) -> Outputs {
        let targets = descriptor
            .next
            .iter()
            .filter_map(|name| {
                self.inputs
                    .get(name)
                    .map(|(tx, _)| (name.clone(), tx.clone()))
            })
            .collect();
        Outputs::new(descriptor.name.clone(), targets, halt, terminate)
    }

    /// Push a stop token into each named queue, giving up at `deadline`
    ///
    /// Returns the names of the queues that could not take the token in time.
    pub fn inject_stop(&self, targets: &[String], deadline: Instant) -> Vec<String> {
        let mut undelivered = Vec::new();
        for name in targets {
            let Some((tx, _)) = self.inputs.get(name) else {
                continue;
            };
            if tx.send_deadline(Message::Stop, deadline).is_err() {
                undelivered.push(name.clone());
            }
        }
        undelivered
    }
}
