//! Operators and the capability set every execution context receives.
//!
//! An [`Operator`] is the executable half of a [`Computation`]: the
//! computation names it and carries its parameters, the registry inside each
//! execution context resolves the name back to code. Nothing else is
//! resolvable from inside a worker.
//!
//! [`Computation`]: crate::computation::Computation

pub mod builtin;
pub mod registry;

use std::sync::Arc;

use futures::stream::BoxStream;
use serde_json::Value;

use crate::computation::CAPABILITY_VERSION;
use crate::config::PoolConfig;
use crate::error::ExecutionError;
use crate::pool::WorkerId;
use crate::worker::cancel::CancelSignal;

pub use registry::OperatorRegistry;

/// Input sequence handed to an operator.
pub type ValueStream = BoxStream<'static, Value>;

/// Output sequence produced by an operator. The first `Err` ends the worker.
pub type OutputStream = BoxStream<'static, Result<Value, ExecutionError>>;

/// Executable code reachable by name from inside an execution context.
pub trait Operator: Send + Sync {
    /// Name used to address the operator in a [`Computation`](crate::computation::Computation).
    fn name(&self) -> &str;

    /// One-line description.
    fn description(&self) -> &str {
        ""
    }

    /// Map an input sequence to an output sequence.
    ///
    /// Must not touch state outside `params`, `input` and `ctx`.
    fn apply(&self, params: Value, input: ValueStream, ctx: WorkerContext) -> OutputStream;
}

/// Explicit, versioned capability set passed into every execution context.
#[derive(Clone)]
pub struct Capabilities {
    /// Interface version; see [`CAPABILITY_VERSION`].
    pub version: u32,
    /// Operators resolvable inside the context.
    pub registry: Arc<OperatorRegistry>,
    /// Configuration for pools built with these capabilities.
    pub config: PoolConfig,
    /// Cancellation chain of every enclosing worker.
    pub cancel: CancelSignal,
}

impl Capabilities {
    /// Top-level capabilities with default configuration.
    pub fn new(registry: OperatorRegistry) -> Self {
        Self::with_config(registry, PoolConfig::default())
    }

    pub fn with_config(registry: OperatorRegistry, config: PoolConfig) -> Self {
        Self {
            version: CAPABILITY_VERSION,
            registry: Arc::new(registry),
            config,
            cancel: CancelSignal::root(),
        }
    }

    /// Same capabilities, different configuration.
    pub fn reconfigured(&self, config: PoolConfig) -> Self {
        Self {
            config,
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("version", &self.version)
            .field("operators", &self.registry.names())
            .field("config", &self.config)
            .field("depth", &self.cancel.depth())
            .finish()
    }
}

/// What an operator knows about the context it runs in.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    worker_id: WorkerId,
    capabilities: Capabilities,
}

impl WorkerContext {
    pub fn new(worker_id: WorkerId, capabilities: Capabilities) -> Self {
        Self {
            worker_id,
            capabilities,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Capabilities to build child pools with. Cancellation of this worker
    /// reaches every pool built from them.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn is_cancelled(&self) -> bool {
        self.capabilities.cancel.is_cancelled()
    }

    /// Recursion depth: how many workers enclose this one, itself included.
    pub fn depth(&self) -> usize {
        self.capabilities.cancel.depth()
    }
}
