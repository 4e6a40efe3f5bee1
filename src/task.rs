//! Task types.

use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use futures::TryStreamExt;
use futures::stream::{self, BoxStream};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::computation::Computation;

/// Factory producing a fresh pass over a task's input.
pub type InputFactory =
    Arc<dyn Fn() -> BoxStream<'static, Result<Value, String>> + Send + Sync>;

/// Finite input sequence of a task.
#[derive(Clone)]
pub enum TaskInput {
    /// Items known up front.
    Values(Arc<Vec<Value>>),
    /// Items produced by a stream that must complete before dispatch.
    Stream(InputFactory),
}

impl TaskInput {
    /// Drain the input into an ordered collection.
    pub async fn materialize(&self) -> Result<Vec<Value>, String> {
        match self {
            Self::Values(values) => Ok(values.as_ref().clone()),
            Self::Stream(factory) => factory().try_collect().await,
        }
    }
}

impl fmt::Debug for TaskInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Values(values) => f.debug_tuple("Values").field(&values.len()).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// A computation bound to a finite input, dispatched exactly once.
#[derive(Debug, Clone)]
pub struct Task {
    /// Stable identifier, carried through to every result of this task.
    pub key: String,
    /// What to run.
    pub computation: Computation,
    /// What to run it on.
    pub input: TaskInput,
}

impl Task {
    /// Create a task over already-encoded values.
    pub fn new(computation: Computation, values: Vec<Value>) -> Self {
        Self {
            key: Uuid::new_v4().to_string(),
            computation,
            input: TaskInput::Values(Arc::new(values)),
        }
    }

    /// Create a task over typed items.
    pub fn from_items<T, I>(computation: Computation, items: I) -> Result<Self, serde_json::Error>
    where
        T: Serialize,
        I: IntoIterator<Item = T>,
    {
        let values = items
            .into_iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(computation, values))
    }

    /// Create a task whose input is produced by a stream.
    pub fn from_stream<F>(computation: Computation, factory: F) -> Self
    where
        F: Fn() -> BoxStream<'static, Result<Value, String>> + Send + Sync + 'static,
    {
        Self {
            key: Uuid::new_v4().to_string(),
            computation,
            input: TaskInput::Stream(Arc::new(factory)),
        }
    }

    /// Override the stable identifier.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Replay a materialized input as a fresh stream.
    pub(crate) fn replay(values: Vec<Value>) -> BoxStream<'static, Value> {
        stream::iter(values).boxed()
    }
}
