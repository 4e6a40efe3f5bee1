//! Isolated execution context.
//!
//! A context is a dedicated OS thread running its own single-threaded
//! runtime. It receives the computation and its input as JSON text, rebuilds
//! the computation against the capability registry, runs it, and relays every
//! emitted item back as an encoded [`WireMessage`]. Nothing it produces is
//! shared with the pool except through the relay.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use futures::StreamExt;
use serde_json::Value;

use crate::config::PoolConfig;
use crate::error::{DispatchError, ExecutionError};
use crate::operator::{Capabilities, WorkerContext};
use crate::pool::WorkerId;
use crate::task::Task;
use crate::worker::message::WireMessage;
use crate::worker::relay::RelaySender;

/// Everything handed to a new context.
pub(crate) struct ContextSeed {
    pub worker_id: WorkerId,
    /// Encoded [`Computation`](crate::computation::Computation).
    pub program: String,
    /// Encoded materialized input (a JSON array).
    pub input: String,
    /// Capabilities, with this worker's kill switch already linked in.
    pub capabilities: Capabilities,
    pub relay: RelaySender,
}

/// How a context's run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Completed,
    Failed,
    Cancelled,
    Disconnected,
}

/// Create a context and start it.
pub(crate) fn spawn(
    seed: ContextSeed,
    config: &PoolConfig,
) -> Result<thread::JoinHandle<()>, DispatchError> {
    let worker_id = seed.worker_id;
    let mut builder =
        thread::Builder::new().name(format!("{}-{}", config.thread_prefix, worker_id));
    if let Some(size) = config.stack_size {
        builder = builder.stack_size(size);
    }

    builder
        .spawn(move || run(seed))
        .map_err(|e| DispatchError::Spawn {
            worker_id,
            reason: e.to_string(),
        })
}

fn run(seed: ContextSeed) {
    let ContextSeed {
        worker_id,
        program,
        input,
        capabilities,
        relay,
    } = seed;

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let error = DispatchError::Runtime {
                worker_id,
                reason: e.to_string(),
            };
            tracing::error!(worker_id, "{}", error);
            send_blocking(&relay, error_message(worker_id, error.to_string()));
            return;
        }
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        runtime.block_on(execute(worker_id, &program, &input, capabilities, &relay))
    }));

    match outcome {
        Ok(exit) => {
            tracing::debug!(worker_id, exit = ?exit, "Execution context finished");
        }
        Err(payload) => {
            let error = ExecutionError::Panicked {
                reason: panic_message(payload.as_ref()),
            };
            tracing::error!(worker_id, "{}", error);
            send_blocking(&relay, error_message(worker_id, error.to_string()));
        }
    }
}

async fn execute(
    worker_id: WorkerId,
    program: &str,
    input: &str,
    capabilities: Capabilities,
    relay: &RelaySender,
) -> Exit {
    let cancel = capabilities.cancel.clone();

    let work = async {
        let rebuilt = match capabilities.registry.reconstruct(program) {
            Ok(rebuilt) => rebuilt,
            Err(e) => return fail(relay, worker_id, e).await,
        };
        let operator_name = rebuilt.operator.name().to_string();

        let values: Vec<Value> = match serde_json::from_str(input) {
            Ok(values) => values,
            Err(e) => {
                return fail(relay, worker_id, ExecutionError::invalid_input(operator_name, e))
                    .await;
            }
        };

        tracing::debug!(
            worker_id,
            operator = %operator_name,
            items = values.len(),
            depth = capabilities.cancel.depth(),
            "Worker running"
        );

        let ctx = WorkerContext::new(worker_id, capabilities.clone());
        let mut output = rebuilt
            .operator
            .apply(rebuilt.params, Task::replay(values), ctx);

        while let Some(item) = output.next().await {
            match item {
                Ok(value) => {
                    if !send(relay, WireMessage::Next { worker_id, value }).await {
                        return Exit::Disconnected;
                    }
                }
                Err(e) => return fail(relay, worker_id, e).await,
            }
        }

        if send(relay, WireMessage::Complete { worker_id }).await {
            Exit::Completed
        } else {
            Exit::Disconnected
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Exit::Cancelled,
        exit = work => exit,
    }
}

async fn fail(relay: &RelaySender, worker_id: WorkerId, error: ExecutionError) -> Exit {
    tracing::debug!(worker_id, "Worker failed: {}", error);
    if send(relay, error_message(worker_id, error.to_string())).await {
        Exit::Failed
    } else {
        Exit::Disconnected
    }
}

fn error_message(worker_id: WorkerId, error: String) -> WireMessage {
    WireMessage::Error { worker_id, error }
}

async fn send(relay: &RelaySender, message: WireMessage) -> bool {
    match message.encode() {
        Ok(text) => relay.send(text).await,
        Err(e) => {
            tracing::error!(worker_id = message.worker_id(), "Failed to encode wire message: {}", e);
            false
        }
    }
}

fn send_blocking(relay: &RelaySender, message: WireMessage) -> bool {
    match message.encode() {
        Ok(text) => relay.send_blocking(text),
        Err(e) => {
            tracing::error!(worker_id = message.worker_id(), "Failed to encode wire message: {}", e);
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
