//! Recursive self-hosting.
//!
//! A computation running inside a worker cannot hand "itself" to child
//! workers as a function reference: a fresh execution context only resolves
//! what its registry offers. Instead every recursive computation declares
//! [`SelfHosted`] input, pairing its payload with its own [`Computation`], and
//! every child task it spawns carries that same computation forward as data.
//!
//! [`RecursiveOperator`] drives a [`DivideAndConquer`] strategy through the
//! per-task state machine in [`state`]: base case → solve, otherwise split,
//! run one child pool, combine child outputs by split index.

pub mod state;

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::computation::Computation;
use crate::error::ExecutionError;
use crate::operator::{Operator, OutputStream, ValueStream, WorkerContext};
use crate::pool::{Pool, TaskOutcome};
use crate::queue::TaskQueue;
use crate::task::Task;

pub use state::{RecursionState, RecursionTrace, StateTransition};

/// Input item of a recursive computation: the payload plus the computation's
/// own code-transfer representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfHosted<P> {
    pub payload: P,
    pub program: Computation,
}

/// A divide-and-conquer algorithm.
///
/// Methods must be pure functions of their arguments; they run inside
/// execution contexts that share nothing with the caller.
pub trait DivideAndConquer: Send + Sync + 'static {
    /// Operator name the strategy is registered under.
    const NAME: &'static str;

    type Params: DeserializeOwned + Send + Sync + 'static;
    type Payload: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    fn is_base_case(&self, params: &Self::Params, payload: &Self::Payload) -> bool;

    fn solve(&self, params: &Self::Params, payload: Self::Payload) -> Result<Self::Output, String>;

    /// Partition into sub-payloads. Each becomes one child task.
    fn split(
        &self,
        params: &Self::Params,
        payload: &Self::Payload,
    ) -> Result<Vec<Self::Payload>, String>;

    /// Merge child outputs, given in the order `split` produced their payloads.
    fn combine(
        &self,
        params: &Self::Params,
        payload: Self::Payload,
        parts: Vec<Self::Output>,
    ) -> Result<Self::Output, String>;
}

/// Operator running a [`DivideAndConquer`] strategy, one recursion level per
/// input item.
pub struct RecursiveOperator<D> {
    strategy: Arc<D>,
}

impl<D: DivideAndConquer> RecursiveOperator<D> {
    pub fn new(strategy: D) -> Self {
        Self {
            strategy: Arc::new(strategy),
        }
    }

    /// Computation invoking this strategy with `params`.
    pub fn computation<P: Serialize>(params: &P) -> crate::Result<Computation> {
        Ok(Computation::new(D::NAME).with_params(params)?)
    }
}

impl<D: DivideAndConquer> Operator for RecursiveOperator<D> {
    fn name(&self) -> &str {
        D::NAME
    }

    fn description(&self) -> &str {
        "Divide-and-conquer over self-hosted payloads"
    }

    fn apply(&self, params: Value, input: ValueStream, ctx: WorkerContext) -> OutputStream {
        let params: Arc<D::Params> = match Computation::decode_params(D::NAME, params) {
            Ok(params) => Arc::new(params),
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };
        let strategy = Arc::clone(&self.strategy);

        input
            .then(move |item| {
                let level = Level {
                    strategy: Arc::clone(&strategy),
                    params: Arc::clone(&params),
                    ctx: ctx.clone(),
                };
                level.run(item)
            })
            .boxed()
    }
}

/// Root task for a recursive computation.
pub fn root_task<P: Serialize>(program: Computation, payload: P) -> crate::Result<Task> {
    Ok(Task::from_items(
        program.clone(),
        [SelfHosted { payload, program }],
    )?)
}

/// One recursion level: a single self-hosted item inside one worker.
struct Level<D: DivideAndConquer> {
    strategy: Arc<D>,
    params: Arc<D::Params>,
    ctx: WorkerContext,
}

impl<D: DivideAndConquer> Level<D> {
    async fn run(self, item: Value) -> Result<Value, ExecutionError> {
        let mut trace = RecursionTrace::new(self.ctx.worker_id(), self.ctx.depth());
        let result = self.drive(item, &mut trace).await;

        if let Err(e) = &result {
            trace.fail(e.to_string());
        }
        tracing::debug!(
            worker_id = trace.worker_id,
            depth = trace.depth,
            operator = D::NAME,
            state = %trace.state,
            path = ?trace.path(),
            elapsed_us = trace.elapsed().as_micros() as u64,
            "Recursive task finished"
        );

        result
    }

    async fn drive(&self, item: Value, trace: &mut RecursionTrace) -> Result<Value, ExecutionError> {
        let SelfHosted { payload, program } =
            serde_json::from_value::<SelfHosted<D::Payload>>(item)
                .map_err(|e| ExecutionError::invalid_input(D::NAME, e))?;
        let strategy = self.strategy.as_ref();
        let params = self.params.as_ref();

        if strategy.is_base_case(params, &payload) {
            advance(trace, RecursionState::DirectCompute, None)?;
            let output = strategy.solve(params, payload).map_err(failed::<D>)?;
            advance(trace, RecursionState::Completed, None)?;
            return encode::<D>(&output);
        }

        advance(trace, RecursionState::Splitting, None)?;
        let parts = strategy.split(params, &payload).map_err(failed::<D>)?;
        if parts.is_empty() {
            return Err(failed::<D>("split produced no sub-payloads".to_string()));
        }
        let expected = parts.len();

        let mut queue = TaskQueue::new(format!(
            "{}-w{}-d{}",
            D::NAME,
            self.ctx.worker_id(),
            self.ctx.depth()
        ));
        for (index, part) in parts.into_iter().enumerate() {
            let child = SelfHosted {
                payload: part,
                program: program.clone(),
            };
            let task = Task::from_items(program.clone(), [child])
                .map_err(|e| failed::<D>(e.to_string()))?
                .with_key(index.to_string());
            queue.enqueue(task);
        }

        if self.ctx.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        advance(
            trace,
            RecursionState::AwaitingChildren,
            Some(format!("{expected} children")),
        )?;
        let mut pool = Pool::new(vec![queue], self.ctx.capabilities().clone())
            .map_err(|e| failed::<D>(e.to_string()))?;
        let results = pool
            .start()
            .ok_or_else(|| failed::<D>("child pool had nothing to run".to_string()))?;
        let outcomes = results.collect_outcomes().await;

        advance(trace, RecursionState::Combining, None)?;
        let mut by_key: HashMap<String, TaskOutcome> = outcomes
            .into_iter()
            .map(|outcome| (outcome.key.clone(), outcome))
            .collect();

        let mut outputs = Vec::with_capacity(expected);
        for index in 0..expected {
            let key = index.to_string();
            let outcome = by_key.remove(&key).ok_or_else(|| ExecutionError::Child {
                key: key.clone(),
                reason: "no result".to_string(),
            })?;
            outputs.push(child_output::<D>(outcome)?);
        }

        let combined = strategy
            .combine(params, payload, outputs)
            .map_err(failed::<D>)?;
        advance(trace, RecursionState::Completed, None)?;
        encode::<D>(&combined)
    }
}

/// The single output of a finished child.
fn child_output<D: DivideAndConquer>(outcome: TaskOutcome) -> Result<D::Output, ExecutionError> {
    let TaskOutcome {
        key,
        values,
        error,
        completed,
        ..
    } = outcome;

    if let Some(reason) = error {
        return Err(ExecutionError::Child { key, reason });
    }
    if !completed {
        return Err(ExecutionError::Child {
            key,
            reason: "torn down before completing".to_string(),
        });
    }

    let [value] = <[Value; 1]>::try_from(values).map_err(|values| ExecutionError::Child {
        key: key.clone(),
        reason: format!("expected exactly one result, got {}", values.len()),
    })?;

    serde_json::from_value(value).map_err(|e| ExecutionError::Child {
        key,
        reason: e.to_string(),
    })
}

fn advance(
    trace: &mut RecursionTrace,
    state: RecursionState,
    reason: Option<String>,
) -> Result<(), ExecutionError> {
    trace
        .transition_to(state, reason)
        .map_err(|reason| ExecutionError::Failed {
            operator: "recursion".to_string(),
            reason,
        })
}

fn failed<D: DivideAndConquer>(reason: String) -> ExecutionError {
    ExecutionError::failed(D::NAME, reason)
}

fn encode<D: DivideAndConquer>(output: &D::Output) -> Result<Value, ExecutionError> {
    serde_json::to_value(output).map_err(|e| failed::<D>(e.to_string()))
}
