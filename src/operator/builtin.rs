//! Built-in operators available in every registry built with
//! [`OperatorRegistry::with_builtins`](crate::operator::OperatorRegistry::with_builtins).

use futures::StreamExt;
use futures::stream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::computation::Computation;
use crate::error::ExecutionError;
use crate::operator::{Operator, OutputStream, ValueStream, WorkerContext};

pub const ECHO: &str = "echo";
pub const FOLD: &str = "fold";

/// Replays its input unchanged.
pub struct Echo;

impl Operator for Echo {
    fn name(&self) -> &str {
        ECHO
    }

    fn description(&self) -> &str {
        "Emit every input item unchanged"
    }

    fn apply(&self, _params: Value, input: ValueStream, _ctx: WorkerContext) -> OutputStream {
        input.map(Ok).boxed()
    }
}

/// Numeric reduction performed by [`Fold`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FoldOp {
    Sum,
    Count,
    Min,
    Max,
}

#[derive(Debug, Deserialize)]
struct FoldParams {
    op: FoldOp,
}

/// Reduces a numeric input to a single value. An empty input emits nothing
/// for `min`/`max` and zero for `sum`/`count`. All-integer input is reduced
/// exactly and an overflowing sum fails; non-numeric items fail everything
/// but `count`.
pub struct Fold;

impl Fold {
    /// Computation running this fold.
    pub fn computation(op: FoldOp) -> Computation {
        Computation {
            params: json!({ "op": op }),
            ..Computation::new(FOLD)
        }
    }

    fn reduce(op: FoldOp, items: Vec<Value>) -> Result<Option<Value>, ExecutionError> {
        if op == FoldOp::Count {
            return Ok(Some(json!(items.len())));
        }

        let integers: Option<Vec<i64>> = items.iter().map(Value::as_i64).collect();
        if let Some(integers) = integers {
            return Self::reduce_integers(op, &integers).map(|n| n.map(|n| json!(n)));
        }

        let numbers = items
            .iter()
            .map(|v| {
                v.as_f64()
                    .ok_or_else(|| ExecutionError::invalid_input(FOLD, format!("{v} is not a number")))
            })
            .collect::<Result<Vec<f64>, _>>()?;

        let result = match op {
            FoldOp::Sum => Some(numbers.iter().sum::<f64>()),
            FoldOp::Min => numbers.iter().copied().reduce(f64::min),
            FoldOp::Max => numbers.iter().copied().reduce(f64::max),
            FoldOp::Count => Some(numbers.len() as f64),
        };
        Ok(result.map(|n| json!(n)))
    }

    /// Exact reduction when every item is an integer.
    fn reduce_integers(op: FoldOp, items: &[i64]) -> Result<Option<i64>, ExecutionError> {
        match op {
            FoldOp::Sum => items
                .iter()
                .try_fold(0_i64, |acc, &n| acc.checked_add(n))
                .map(Some)
                .ok_or_else(|| ExecutionError::failed(FOLD, "integer sum overflows i64")),
            FoldOp::Min => Ok(items.iter().copied().min()),
            FoldOp::Max => Ok(items.iter().copied().max()),
            FoldOp::Count => Ok(Some(items.len() as i64)),
        }
    }
}

impl Operator for Fold {
    fn name(&self) -> &str {
        FOLD
    }

    fn description(&self) -> &str {
        "Reduce numeric input with sum, count, min or max"
    }

    fn apply(&self, params: Value, input: ValueStream, _ctx: WorkerContext) -> OutputStream {
        stream::once(async move {
            let params: FoldParams = Computation::decode_params(FOLD, params)?;
            let items: Vec<Value> = input.collect().await;
            Self::reduce(params.op, items)
        })
        .filter_map(|result| async move { result.transpose() })
        .boxed()
    }
}
