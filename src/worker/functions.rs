use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{RaisinError, Result};
use crate::model::ArgValue;

/// A registered job handler. Returns the result value or a reason string;
/// the reason travels back to the submitter as a job-execution failure.
pub type Handler = dyn Fn(&[ArgValue]) -> std::result::Result<ArgValue, String> + Send + Sync;

/// Maps function identifiers to local handlers.
///
/// Job payloads name a function instead of carrying code, so a worker only
/// ever runs what it registered itself. An unknown identifier is an
/// execution failure like any other — the job gets requeued for a worker
/// that does know it.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    handlers: HashMap<String, Arc<Handler>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&[ArgValue]) -> std::result::Result<ArgValue, String> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<Handler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Resolve and invoke, converting handler failures and panics into
    /// typed execution errors.
    pub fn call(&self, name: &str, args: &[ArgValue]) -> Result<ArgValue> {
        let handler = self
            .resolve(name)
            .ok_or_else(|| RaisinError::JobExecution(format!("unknown function: {name}")))?;
        let outcome =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(args)))
                .map_err(|_| RaisinError::JobExecution(format!("{name} panicked")))?;
        outcome.map_err(RaisinError::JobExecution)
    }

    /// The arithmetic demo set used by the CLI and the examples.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("square", |args| {
            let x = args
                .first()
                .and_then(ArgValue::as_int)
                .ok_or("square expects one integer")?;
            Ok(ArgValue::Int(x * x))
        });
        registry.register("add", |args| {
            let mut total = 0i64;
            for arg in args {
                total += arg.as_int().ok_or("add expects integers")?;
            }
            Ok(ArgValue::Int(total))
        });
        registry.register("concat", |args| {
            let mut out = String::new();
            for arg in args {
                out.push_str(arg.as_text().ok_or("concat expects text")?);
            }
            Ok(ArgValue::Text(out))
        });
        registry
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_square() {
        let registry = FunctionRegistry::with_builtins();
        let result = registry
            .call("square", &[ArgValue::Int(7)])
            .expect("square should succeed");
        assert_eq!(result, ArgValue::Int(49));
    }

    #[test]
    fn unknown_function_is_execution_failure() {
        let registry = FunctionRegistry::new();
        let err = registry.call("nope", &[]).expect_err("must fail");
        assert!(matches!(err, RaisinError::JobExecution(_)));
    }

    #[test]
    fn handler_panic_is_contained() {
        let mut registry = FunctionRegistry::new();
        registry.register("boom", |_| panic!("kaboom"));
        let err = registry.call("boom", &[]).expect_err("panic becomes error");
        assert!(matches!(err, RaisinError::JobExecution(_)));
    }

    #[test]
    fn bad_arguments_are_reported() {
        let registry = FunctionRegistry::with_builtins();
        let err = registry
            .call("square", &[ArgValue::Text("seven".into())])
            .expect_err("type mismatch");
        assert!(matches!(err, RaisinError::JobExecution(_)));
    }
}
