//! Code-transfer representation.
//!
//! A [`Computation`] names a registered operator and carries its parameters
//! as plain data. It holds no reference to anything outside itself, so it can
//! be serialized to text, shipped into a fresh execution context, and
//! reconstructed there against that context's [`OperatorRegistry`].
//!
//! [`OperatorRegistry`]: crate::operator::OperatorRegistry

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExecutionError;

/// Version of the capability interface handed to every execution context.
///
/// Bumped whenever the operator calling convention changes; a computation
/// built against another version refuses to reconstruct.
pub const CAPABILITY_VERSION: u32 = 1;

/// Serializable description of a computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Computation {
    /// Capability version this computation was built against.
    pub abi: u32,
    /// Registered operator name.
    pub operator: String,
    /// Operator parameters.
    #[serde(default)]
    pub params: Value,
}

impl Computation {
    /// A computation invoking `operator` with no parameters.
    pub fn new(operator: impl Into<String>) -> Self {
        Self {
            abi: CAPABILITY_VERSION,
            operator: operator.into(),
            params: Value::Null,
        }
    }

    /// Attach parameters.
    pub fn with_params<P: Serialize>(mut self, params: &P) -> Result<Self, serde_json::Error> {
        self.params = serde_json::to_value(params)?;
        Ok(self)
    }

    /// Encode into the text form that crosses the isolation boundary.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode from the text form.
    pub fn from_wire(text: &str) -> Result<Self, ExecutionError> {
        serde_json::from_str(text).map_err(|e| ExecutionError::MalformedComputation {
            reason: e.to_string(),
        })
    }

    /// Decode parameters into the operator's own type.
    pub fn decode_params<P: serde::de::DeserializeOwned>(
        operator: &str,
        params: Value,
    ) -> Result<P, ExecutionError> {
        serde_json::from_value(params).map_err(|e| ExecutionError::InvalidParams {
            operator: operator.to_string(),
            reason: e.to_string(),
        })
    }
}
