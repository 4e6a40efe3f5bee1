//! Operator registry: the name → code table every execution context shares.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use crate::computation::{CAPABILITY_VERSION, Computation};
use crate::error::ExecutionError;
use crate::operator::Operator;
use crate::operator::builtin;

/// Names of built-in operators that cannot be shadowed.
const PROTECTED_OPERATOR_NAMES: &[&str] = &[builtin::ECHO, builtin::FOLD];

/// A computation resolved back into executable form.
#[derive(Clone)]
pub struct Reconstructed {
    pub operator: Arc<dyn Operator>,
    pub params: Value,
}

/// Registry of operators.
///
/// Populated before any pool starts and immutable afterwards; every
/// execution context sees the same table.
#[derive(Default)]
pub struct OperatorRegistry {
    operators: HashMap<String, Arc<dyn Operator>>,
    builtin_names: HashSet<String>,
}

impl OperatorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in operators.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_builtin(Arc::new(builtin::Echo));
        registry.register_builtin(Arc::new(builtin::Fold));
        registry
    }

    fn register_builtin(&mut self, operator: Arc<dyn Operator>) {
        let name = operator.name().to_string();
        if PROTECTED_OPERATOR_NAMES.contains(&name.as_str()) {
            self.builtin_names.insert(name.clone());
        }
        self.operators.insert(name.clone(), operator);
        tracing::debug!("Registered built-in operator: {}", name);
    }

    /// Register an operator. Rejects operators that try to shadow a built-in
    /// name; returns whether the operator was registered.
    pub fn register(&mut self, operator: Arc<dyn Operator>) -> bool {
        let name = operator.name().to_string();
        if self.builtin_names.contains(&name) {
            tracing::warn!(
                operator = %name,
                "Rejected operator registration: would shadow a built-in operator"
            );
            return false;
        }
        if self.operators.insert(name.clone(), operator).is_some() {
            tracing::debug!("Replaced operator: {}", name);
        } else {
            tracing::debug!("Registered operator: {}", name);
        }
        true
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, operator: Arc<dyn Operator>) -> Self {
        self.register(operator);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Operator>> {
        self.operators.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.operators.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operators.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.operators.len()
    }

    /// Resolve a decoded computation.
    pub fn resolve(&self, computation: Computation) -> Result<Reconstructed, ExecutionError> {
        if computation.abi != CAPABILITY_VERSION {
            return Err(ExecutionError::VersionMismatch {
                expected: CAPABILITY_VERSION,
                found: computation.abi,
            });
        }

        let operator = self
            .get(&computation.operator)
            .ok_or_else(|| ExecutionError::UnknownOperator {
                name: computation.operator.clone(),
            })?;

        Ok(Reconstructed {
            operator,
            params: computation.params,
        })
    }

    /// Rebuild an executable computation from its wire text.
    pub fn reconstruct(&self, wire: &str) -> Result<Reconstructed, ExecutionError> {
        self.resolve(Computation::from_wire(wire)?)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::operator::{Capabilities, OutputStream, ValueStream, WorkerContext};

    struct Doubler;

    impl Operator for Doubler {
        fn name(&self) -> &str {
            "double"
        }

        fn apply(&self, _params: Value, input: ValueStream, _ctx: WorkerContext) -> OutputStream {
            input
                .map(|v| {
                    v.as_i64()
                        .map(|n| json!(n * 2))
                        .ok_or_else(|| ExecutionError::invalid_input("double", "not an integer"))
                })
                .boxed()
        }
    }

    struct FakeEcho;

    impl Operator for FakeEcho {
        fn name(&self) -> &str {
            builtin::ECHO
        }

        fn apply(&self, _params: Value, input: ValueStream, _ctx: WorkerContext) -> OutputStream {
            input.map(|_| Ok(Value::Null)).boxed()
        }
    }

    #[test]
    fn builtins_cannot_be_shadowed() {
        let mut registry = OperatorRegistry::with_builtins();
        assert_eq!(registry.count(), 2);
        assert!(!registry.register(Arc::new(FakeEcho)));
        assert!(registry.register(Arc::new(Doubler)));
        assert_eq!(registry.names(), vec!["double", "echo", "fold"]);
        assert_eq!(registry.count(), 3);
        assert!(registry.has("double"));
        assert!(!registry.has("quicksort"));

        // The built-in survived the shadowing attempt.
        let echo = registry.get(builtin::ECHO).unwrap();
        assert_eq!(echo.description(), "Emit every input item unchanged");
    }

    #[test]
    fn reconstruct_rejects_unknown_and_foreign_versions() {
        let registry = OperatorRegistry::with_builtins();

        let err = registry
            .reconstruct(&Computation::new("quicksort").to_wire().unwrap())
            .err()
            .unwrap();
        assert_eq!(
            err,
            ExecutionError::UnknownOperator {
                name: "quicksort".to_string()
            }
        );

        let mut foreign = Computation::new("echo");
        foreign.abi = CAPABILITY_VERSION + 1;
        let err = registry.reconstruct(&foreign.to_wire().unwrap()).err().unwrap();
        assert!(matches!(err, ExecutionError::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn reconstructed_matches_direct_invocation() {
        let registry = OperatorRegistry::new().with(Arc::new(Doubler));
        let capabilities = Capabilities::new(OperatorRegistry::new());
        let input = || futures::stream::iter(vec![json!(1), json!(5), json!(-3)]).boxed();

        let direct: Vec<_> = Doubler
            .apply(Value::Null, input(), WorkerContext::new(3, capabilities.clone()))
            .collect()
            .await;

        let wire = Computation::new("double").to_wire().unwrap();
        let rebuilt = registry.reconstruct(&wire).ok().unwrap();
        let shipped: Vec<_> = rebuilt
            .operator
            .apply(rebuilt.params, input(), WorkerContext::new(3, capabilities))
            .collect()
            .await;

        assert_eq!(direct, shipped);
        assert_eq!(shipped[1], Ok(json!(10)));
    }
}
