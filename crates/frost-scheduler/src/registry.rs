//! Name-keyed registry of work functions.
//!
//! Closures cannot be persisted, so durable jobs refer to their body by a
//! stable name that is resolved through this registry on reload.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;

use serde_json::Value;

use frost_resilience::BoxError;

use crate::job::{WorkFn, work_fn};

#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, WorkFn>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a function under `name`.
    pub fn register(&mut self, name: impl Into<String>, work: WorkFn) -> &mut Self {
        self.functions.insert(name.into(), work);
        self
    }

    /// Register an async closure under `name`.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        self.register(name, work_fn(f))
    }

    pub fn get(&self, name: &str) -> Option<WorkFn> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}
