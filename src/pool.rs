//! Pool orchestration.
//!
//! A [`Pool`] flattens its queues into one ordered task list, assigns worker
//! ids in that order, and exposes the fan-in merge of every worker's result
//! sequence as a [`ResultStream`]. The stream is cold: nothing is dispatched
//! until it is first polled, and then every task is dispatched at once.
//!
//! With the default [`AdmissionPolicy::SpawnPerTask`] there is no admission
//! control: a pool of 500 tasks runs 500 execution contexts concurrently, and
//! [`Pool::max_threads`] is purely informational. [`AdmissionPolicy::Bounded`]
//! makes tasks wait for one of `max` slots before their context is created.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::thread;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use uuid::Uuid;

use crate::config::{AdmissionPolicy, clamp_capacity};
use crate::error::{DispatchError, ProtocolError, SetupError};
use crate::operator::Capabilities;
use crate::queue::TaskQueue;
use crate::task::Task;
use crate::worker::cancel::{self, KillSwitch};
use crate::worker::context::{self, ContextSeed};
use crate::worker::message::{ResultMessage, WireMessage};
use crate::worker::relay::{self, RelayReceiver};

/// Identity of a worker within one pool. Assigned from 0 in dispatch order.
pub type WorkerId = u64;

/// Live worker tracked by its pool.
struct WorkerHandle {
    key: String,
    thread: thread::JoinHandle<()>,
    kill: KillSwitch,
    _permit: Option<OwnedSemaphorePermit>,
}

#[derive(Default)]
struct WorkerTable {
    live: HashMap<WorkerId, WorkerHandle>,
    /// Set by teardown; no context is created afterwards.
    closed: bool,
}

/// State shared between a pool and its result stream.
struct PoolShared {
    pool_id: Uuid,
    capabilities: Capabilities,
    workers: Mutex<WorkerTable>,
    next_worker_id: AtomicU64,
    admission: Option<Arc<Semaphore>>,
}

impl PoolShared {
    fn table(&self) -> MutexGuard<'_, WorkerTable> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a freshly created context. Returns the handle back if the pool
    /// was torn down in the meantime.
    fn register(&self, worker_id: WorkerId, handle: WorkerHandle) -> Result<(), WorkerHandle> {
        let mut table = self.table();
        if table.closed {
            return Err(handle);
        }
        table.live.insert(worker_id, handle);
        Ok(())
    }

    /// Drop the handle of a worker that reached a terminal state. Returns
    /// false if it had already been torn down.
    fn release(&self, worker_id: WorkerId) -> bool {
        let handle = self.table().live.remove(&worker_id);
        match handle {
            Some(handle) => {
                tracing::trace!(
                    pool_id = %self.pool_id,
                    worker_id,
                    key = %handle.key,
                    finished = handle.thread.is_finished(),
                    "Released worker"
                );
                true
            }
            None => false,
        }
    }

    fn is_live(&self, worker_id: WorkerId) -> bool {
        self.table().live.contains_key(&worker_id)
    }

    fn active_count(&self) -> usize {
        self.table().live.len()
    }

    /// Kill every live worker, clear the table and refuse new contexts.
    fn terminate_all(&self) -> usize {
        let drained: Vec<(WorkerId, WorkerHandle)> = {
            let mut table = self.table();
            table.closed = true;
            table.live.drain().collect()
        };

        if let Some(admission) = &self.admission {
            admission.close();
        }

        for (worker_id, handle) in &drained {
            handle.kill.kill();
            tracing::debug!(pool_id = %self.pool_id, worker_id, key = %handle.key, "Terminated worker");
        }
        drained.len()
    }
}

/// Orchestrates one execution context per task drawn from a set of queues.
pub struct Pool {
    queues: Vec<TaskQueue>,
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Create a pool over `queues`. Fails if no queue is given.
    pub fn new(queues: Vec<TaskQueue>, capabilities: Capabilities) -> Result<Self, SetupError> {
        if queues.is_empty() {
            return Err(SetupError::NoQueues);
        }

        let admission = match capabilities.config.admission {
            AdmissionPolicy::SpawnPerTask => None,
            AdmissionPolicy::Bounded { max } => Some(Arc::new(Semaphore::new(clamp_capacity(max)))),
        };

        Ok(Self {
            queues,
            shared: Arc::new(PoolShared {
                pool_id: Uuid::new_v4(),
                capabilities,
                workers: Mutex::new(WorkerTable::default()),
                next_worker_id: AtomicU64::new(0),
                admission,
            }),
        })
    }

    /// Diagnostic identity of this pool.
    pub fn id(&self) -> Uuid {
        self.shared.pool_id
    }

    /// Take every queued task and return the merged result stream.
    ///
    /// Returns `None` when there is nothing to run: all queues are empty, or
    /// `start` already took their tasks.
    pub fn start(&mut self) -> Option<ResultStream> {
        let tasks: Vec<Task> = self
            .queues
            .iter_mut()
            .flat_map(|queue| queue.drain())
            .collect();

        if tasks.is_empty() {
            tracing::debug!(pool_id = %self.shared.pool_id, "Pool started with no tasks");
            return None;
        }

        tracing::debug!(
            pool_id = %self.shared.pool_id,
            tasks = tasks.len(),
            queues = self.queues.len(),
            max_threads = self.max_threads(),
            admission = ?self.shared.capabilities.config.admission,
            "Pool started"
        );

        let streams: Vec<BoxStream<'static, ResultMessage>> = tasks
            .into_iter()
            .map(|task| {
                let worker_id = self.shared.next_worker_id.fetch_add(1, Ordering::Relaxed);
                worker_stream(Arc::clone(&self.shared), worker_id, task)
            })
            .collect();

        Some(ResultStream {
            inner: stream::select_all(streams).boxed(),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Recommended maximum parallelism. Only enforced under bounded admission.
    pub fn max_threads(&self) -> usize {
        match self.shared.capabilities.config.admission {
            AdmissionPolicy::Bounded { max } => clamp_capacity(max),
            AdmissionPolicy::SpawnPerTask => self.shared.capabilities.config.max_threads,
        }
    }

    /// Number of execution contexts alive right now.
    pub fn active_worker_count(&self) -> usize {
        self.shared.active_count()
    }

    /// Tear down every live worker. Messages they produce afterwards are
    /// discarded, and tasks not yet dispatched never get a context.
    pub fn terminate_all(&self) {
        let terminated = self.shared.terminate_all();
        tracing::info!(pool_id = %self.shared.pool_id, terminated, "Pool terminated");
    }
}

/// Merged result stream of a started pool.
///
/// Ends once every worker has reached a terminal state or been torn down.
/// Dropping it tears down every worker of the pool that is still alive.
pub struct ResultStream {
    inner: BoxStream<'static, ResultMessage>,
    shared: Arc<PoolShared>,
}

impl ResultStream {
    /// Drive the stream to its end, grouping messages per worker.
    ///
    /// Outcomes come back in worker-id order. A worker torn down before it
    /// produced anything has no outcome.
    pub async fn collect_outcomes(mut self) -> Vec<TaskOutcome> {
        let mut outcomes: BTreeMap<WorkerId, TaskOutcome> = BTreeMap::new();

        while let Some(message) = self.next().await {
            let outcome = outcomes
                .entry(message.worker_id())
                .or_insert_with(|| TaskOutcome::new(message.worker_id(), message.key()));

            match message {
                ResultMessage::Value { payload, .. } => outcome.values.push(payload),
                ResultMessage::Error { description, .. } => outcome.error = Some(description),
                ResultMessage::Complete { .. } => outcome.completed = true,
            }
        }

        outcomes.into_values().collect()
    }
}

impl Stream for ResultStream {
    type Item = ResultMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        let terminated = self.shared.terminate_all();
        if terminated > 0 {
            tracing::debug!(
                pool_id = %self.shared.pool_id,
                terminated,
                "Result stream dropped with live workers"
            );
        }
    }
}

/// Everything one worker produced.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub worker_id: WorkerId,
    pub key: String,
    pub values: Vec<serde_json::Value>,
    pub error: Option<String>,
    pub completed: bool,
}

impl TaskOutcome {
    fn new(worker_id: WorkerId, key: &str) -> Self {
        Self {
            worker_id,
            key: key.to_string(),
            values: Vec::new(),
            error: None,
            completed: false,
        }
    }

    /// Completed without error.
    pub fn is_success(&self) -> bool {
        self.completed && self.error.is_none()
    }
}

/// Cold result sequence of one worker.
fn worker_stream(
    shared: Arc<PoolShared>,
    worker_id: WorkerId,
    task: Task,
) -> BoxStream<'static, ResultMessage> {
    stream::once(dispatch(shared, worker_id, task))
        .flatten()
        .boxed()
}

async fn dispatch(
    shared: Arc<PoolShared>,
    worker_id: WorkerId,
    task: Task,
) -> BoxStream<'static, ResultMessage> {
    let key = task.key.clone();

    match launch(&shared, worker_id, task).await {
        Ok(Some(launched)) => relay_stream(RelayState {
            shared,
            worker_id,
            key,
            rx: launched.rx,
            kill: launched.kill,
            done: false,
        }),
        Ok(None) => stream::empty().boxed(),
        Err(e) => {
            tracing::warn!(pool_id = %shared.pool_id, worker_id, key = %key, "{}", e);
            stream::iter([ResultMessage::Error {
                worker_id,
                key,
                description: e.to_string(),
            }])
            .boxed()
        }
    }
}

struct Launched {
    rx: RelayReceiver,
    kill: watch::Receiver<bool>,
}

/// Materialize the input, wait for admission, create the context.
///
/// `Ok(None)` means the pool was torn down first.
async fn launch(
    shared: &Arc<PoolShared>,
    worker_id: WorkerId,
    task: Task,
) -> Result<Option<Launched>, DispatchError> {
    let values = task
        .input
        .materialize()
        .await
        .map_err(|reason| DispatchError::Input {
            key: task.key.clone(),
            reason,
        })?;

    let permit = match &shared.admission {
        Some(admission) => match Arc::clone(admission).acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(_) => return Ok(None),
        },
        None => None,
    };

    let program = task
        .computation
        .to_wire()
        .map_err(|e| DispatchError::Encode {
            worker_id,
            what: "computation",
            reason: e.to_string(),
        })?;
    let input = serde_json::to_string(&values).map_err(|e| DispatchError::Encode {
        worker_id,
        what: "input",
        reason: e.to_string(),
    })?;

    let kill = KillSwitch::new();
    let kill_rx = kill.subscribe();
    let capabilities = Capabilities {
        cancel: shared.capabilities.cancel.linked(&kill),
        ..shared.capabilities.clone()
    };
    let (relay_tx, relay_rx) = relay::channel(shared.capabilities.config.relay);

    let thread = context::spawn(
        ContextSeed {
            worker_id,
            program,
            input,
            capabilities,
            relay: relay_tx,
        },
        &shared.capabilities.config,
    )?;

    let handle = WorkerHandle {
        key: task.key.clone(),
        thread,
        kill,
        _permit: permit,
    };

    if let Err(handle) = shared.register(worker_id, handle) {
        handle.kill.kill();
        return Ok(None);
    }

    tracing::debug!(
        pool_id = %shared.pool_id,
        worker_id,
        key = %task.key,
        operator = %task.computation.operator,
        items = values.len(),
        "Worker dispatched"
    );

    Ok(Some(Launched {
        rx: relay_rx,
        kill: kill_rx,
    }))
}

struct RelayState {
    shared: Arc<PoolShared>,
    worker_id: WorkerId,
    key: String,
    rx: RelayReceiver,
    kill: watch::Receiver<bool>,
    done: bool,
}

/// Decode a worker's relay into result messages until its terminal message,
/// or until it is torn down.
fn relay_stream(state: RelayState) -> BoxStream<'static, ResultMessage> {
    stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }

        let received = tokio::select! {
            biased;
            _ = cancel::killed(&mut state.kill) => None,
            text = state.rx.recv() => Some(text),
        };

        // Torn down: whatever the context still sends is discarded.
        let received = received?;
        let worker_id = state.worker_id;

        let message = match received {
            Some(text) => match WireMessage::decode(&text) {
                Ok(wire) if wire.worker_id() != worker_id => {
                    protocol_error(&state, ProtocolError::WorkerIdMismatch {
                        worker_id,
                        found: wire.worker_id(),
                    })
                }
                Ok(wire) => ResultMessage::from_wire(wire, &state.key),
                Err(e) => protocol_error(&state, ProtocolError::Malformed {
                    worker_id,
                    reason: e.to_string(),
                }),
            },
            None => {
                if !state.shared.is_live(worker_id) {
                    return None;
                }
                protocol_error(&state, ProtocolError::MissingTerminal { worker_id })
            }
        };

        if message.is_terminal() {
            state.done = true;
            if !state.shared.release(worker_id) {
                return None;
            }
        } else if !state.shared.is_live(worker_id) {
            return None;
        }

        Some((message, state))
    })
    .boxed()
}

fn protocol_error(state: &RelayState, error: ProtocolError) -> ResultMessage {
    tracing::warn!(pool_id = %state.shared.pool_id, key = %state.key, "{}", error);
    ResultMessage::Error {
        worker_id: state.worker_id,
        key: state.key.clone(),
        description: error.to_string(),
    }
}
