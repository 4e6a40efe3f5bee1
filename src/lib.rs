//! forkpool: dispatch tasks to isolated workers and merge their results,
//! with workers free to build pools of their own.

pub mod computation;
pub mod config;
pub mod error;
pub mod operator;
pub mod pool;
pub mod queue;
pub mod recursive;
pub mod task;
pub mod telemetry;
pub mod worker;

pub use computation::{CAPABILITY_VERSION, Computation};
pub use config::{AdmissionPolicy, PoolConfig, RelayMode};
pub use error::{Error, Result};
pub use operator::{Capabilities, Operator, OperatorRegistry, WorkerContext};
pub use pool::{Pool, ResultStream, TaskOutcome, WorkerId};
pub use queue::TaskQueue;
pub use recursive::{DivideAndConquer, RecursiveOperator, SelfHosted};
pub use task::Task;
pub use worker::{ResultMessage, WireMessage};
