//! A single identity-bearing invocation of a function.
//!
//! An [`Execution`] binds a function to its explicit keyword arguments and
//! the configuration in effect at call time. Its identity hashes the
//! function name, the explicit kwargs, and the *filtered* context kwargs:
//! configuration entries restricted to the function's dependent arguments.
//! Two calls differing only in irrelevant global configuration therefore
//! collapse to the same cache entry.
//!
//! Identity is recomputed on demand rather than frozen at construction: the
//! dependency graph is discovered while the program runs, and the set of
//! dependent arguments (and with it the identity) legitimately shifts as
//! new edges appear.

use crate::config::Configuration;
use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::fingerprint::{identity_digest, serialize_value};
use crate::function::{Function, FunctionRecord};
use crate::{Kwargs, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

pub struct Execution {
    function: Arc<Function>,
    kwargs: Kwargs,
    configuration: Arc<Configuration>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    value: Option<Value>,
    duration: Option<Duration>,
    dependencies: Vec<Arc<Execution>>,
}

impl Execution {
    pub fn new(function: Arc<Function>, configuration: Arc<Configuration>, kwargs: Kwargs) -> Self {
        Self {
            function,
            kwargs,
            configuration,
            state: Mutex::new(State::default()),
        }
    }

    pub fn function(&self) -> &Arc<Function> {
        &self.function
    }

    /// Explicit keyword arguments, already resolved through the dynamic
    /// scope by the execution context.
    pub fn kwargs(&self) -> &Kwargs {
        &self.kwargs
    }

    /// Configuration values relevant to this call: restricted to the
    /// function's dependent arguments and to names not already bound
    /// explicitly.
    pub fn context_kwargs(&self) -> Kwargs {
        let mut out = Kwargs::new();
        for arg in self.function.dependent_arguments() {
            if self.kwargs.contains_key(&arg) {
                continue;
            }
            if let Some(value) = self.configuration.get(&arg) {
                out.insert(arg, value);
            }
        }
        out
    }

    /// Stable identity: `{function}.{sha1 hex}` over the function name and
    /// both kwargs maps.
    pub fn identity(&self) -> String {
        format!(
            "{}.{}",
            self.function.name(),
            identity_digest(self.function.name(), &self.kwargs, &self.context_kwargs())
        )
    }

    /// Human-readable call signature: defaults overlaid with the explicit
    /// kwargs, key-sorted.
    pub fn signature(&self) -> String {
        let mut merged = Kwargs::new();
        for param in self.function.params() {
            if let Some(default) = &param.default {
                merged.insert(param.name.clone(), default.clone());
            }
        }
        for (key, value) in &self.kwargs {
            merged.insert(key.clone(), value.clone());
        }
        let rendered: Vec<String> = merged
            .iter()
            .map(|(key, value)| format!("{key}={}", serialize_value(value)))
            .collect();
        format!("{}({})", self.function.name(), rendered.join(","))
    }

    /// Record a dependency execution. Idempotent by identity.
    pub fn add_dependency(&self, other: Arc<Execution>) {
        let identity = other.identity();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.dependencies.iter().all(|d| d.identity() != identity) {
            state.dependencies.push(other);
        }
    }

    /// Snapshot of the dependency executions discovered so far.
    pub fn dependencies(&self) -> Vec<Arc<Execution>> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .dependencies
            .clone()
    }

    /// Wall-clock duration of the run, once executed.
    pub fn duration(&self) -> Option<Duration> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .duration
    }

    /// The memoized result, if this instance has already run.
    pub fn value(&self) -> Option<Value> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .value
            .clone()
    }

    pub fn has_run(&self) -> bool {
        self.value().is_some()
    }

    /// Execute the wrapped function exactly once for this instance.
    /// Subsequent calls return the memoized in-object result. A failing run
    /// stores nothing, so the next call retries from scratch.
    pub fn run(&self, ctx: &ExecutionContext) -> Result<Value> {
        if let Some(value) = self.value() {
            return Ok(value);
        }
        let call_kwargs = self.call_kwargs();
        let started = Instant::now();
        let value = self
            .function
            .invoke(ctx, &call_kwargs)
            .map_err(|err| match err.downcast::<Error>() {
                // Engine errors surfacing through a nested call propagate
                // unchanged; everything else is a wrapped-function failure.
                Ok(engine) => engine,
                Err(user) => Error::Execution(user),
            })?;
        let elapsed = started.elapsed();
        debug!(
            operation = "execute",
            identity = %self.identity(),
            duration_ms = elapsed.as_millis() as u64,
            "function executed"
        );
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.value.is_none() {
            state.value = Some(value.clone());
            state.duration = Some(elapsed);
        }
        Ok(value)
    }

    // Defaults overlaid with the explicit kwargs; what the body receives.
    fn call_kwargs(&self) -> Kwargs {
        let mut merged = Kwargs::new();
        for param in self.function.params() {
            if let Some(default) = &param.default {
                merged.insert(param.name.clone(), default.clone());
            }
        }
        for (key, value) in &self.kwargs {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    /// Transport form, including the recursively serialized dependency
    /// subgraph.
    pub fn to_record(&self) -> ExecutionRecord {
        ExecutionRecord {
            function: self.function.to_record(),
            kwargs: self.kwargs.clone(),
            context_kwargs: self.context_kwargs(),
            dependencies: self
                .dependencies()
                .iter()
                .map(|dep| dep.to_record())
                .collect(),
        }
    }

    /// Rebuild an execution (and its dependency subgraph) from its
    /// transport form against the given registry and configuration.
    pub fn from_record(
        registry: &crate::function::Registry,
        configuration: Arc<Configuration>,
        record: &ExecutionRecord,
    ) -> Result<Arc<Execution>> {
        let function = registry.resolve_record(&record.function)?;
        let execution = Arc::new(Execution::new(
            function,
            Arc::clone(&configuration),
            record.kwargs.clone(),
        ));
        for dep in &record.dependencies {
            execution.add_dependency(Self::from_record(
                registry,
                Arc::clone(&configuration),
                dep,
            )?);
        }
        Ok(execution)
    }
}

impl fmt::Debug for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution")
            .field("function", &self.function.name())
            .field("kwargs", &self.kwargs)
            .field("identity", &self.identity())
            .finish()
    }
}

impl PartialEq for Execution {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Execution {}

/// Serialized form of an execution for persistence; round-trips dependency
/// subgraphs recursively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub function: FunctionRecord,
    pub kwargs: Kwargs,
    #[serde(default)]
    pub context_kwargs: Kwargs,
    #[serde(default)]
    pub dependencies: Vec<ExecutionRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{FunctionSpec, Registry};
    use crate::kwargs;
    use serde_json::json;

    fn echo_spec(name: &str) -> FunctionSpec {
        FunctionSpec::new(name, |_, kw| Ok(kw.get("a").cloned().unwrap_or(Value::Null)))
            .param_with_default("a", Value::Null)
    }

    #[test]
    fn test_structural_equality() {
        let registry = Registry::new();
        let fun = registry.register(echo_spec("tests.eq"));
        let config = Arc::new(Configuration::empty());

        let first = Execution::new(Arc::clone(&fun), Arc::clone(&config), kwargs! { a: 1 });
        let second = Execution::new(Arc::clone(&fun), Arc::clone(&config), kwargs! { a: 1 });
        let third = Execution::new(fun, config, kwargs! { a: 2 });

        assert_eq!(first, second);
        assert_ne!(first, third);
    }

    #[test]
    fn test_context_kwargs_filtering() {
        let registry = Registry::new();
        let inner = registry.register(echo_spec("tests.ctx_inner"));
        let outer = registry.register(
            FunctionSpec::new("tests.ctx_outer", |_, _| Ok(Value::Null)).param("b"),
        );
        outer.add_dependency(&inner);

        let config =
            Arc::new(Configuration::new(kwargs! { a: 1, b: 2, unrelated: 3 }).unwrap());
        let execution = Execution::new(outer, config, kwargs! { b: 5 });

        // `a` is inherited through the dependency, `b` is explicit, and the
        // unrelated key must not leak into the identity.
        assert_eq!(execution.context_kwargs(), kwargs! { a: 1 });
    }

    #[test]
    fn test_run_is_idempotent_per_instance() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let registry = Registry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_body = Arc::clone(&calls);
        let fun = registry.register(
            FunctionSpec::new("tests.once", move |_, _| {
                calls_in_body.fetch_add(1, Ordering::SeqCst);
                Ok(json!(42))
            }),
        );
        let ctx = ExecutionContext::new(
            registry,
            Configuration::empty(),
            None,
            Arc::new(crate::locker::Locker::new(None).unwrap()),
        );

        let execution = Execution::new(fun, Arc::new(Configuration::empty()), kwargs! {});
        assert!(!execution.has_run());
        assert_eq!(execution.run(&ctx).unwrap(), json!(42));
        assert_eq!(execution.run(&ctx).unwrap(), json!(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(execution.has_run());
        assert!(execution.duration().is_some());
    }

    #[test]
    fn test_signature_overlays_defaults() {
        let registry = Registry::new();
        let fun = registry.register(
            FunctionSpec::new("tests.sig", |_, _| Ok(Value::Null))
                .param_with_default("a", json!(1))
                .param_with_default("b", json!(2)),
        );
        let execution = Execution::new(
            fun,
            Arc::new(Configuration::empty()),
            kwargs! { b: 7 },
        );
        assert_eq!(execution.signature(), "tests.sig(a=1,b=7)");
    }

    #[test]
    fn test_record_round_trip_with_dependencies() {
        let registry = Registry::new();
        let parent = registry.register(echo_spec("tests.rt_parent"));
        let child = registry.register(echo_spec("tests.rt_child"));
        parent.add_dependency(&child);

        let config = Arc::new(Configuration::empty());
        let execution = Arc::new(Execution::new(
            Arc::clone(&parent),
            Arc::clone(&config),
            kwargs! { a: 1 },
        ));
        execution.add_dependency(Arc::new(Execution::new(
            child,
            Arc::clone(&config),
            kwargs! { a: 2 },
        )));

        let record = execution.to_record();
        let json = serde_json::to_string(&record).unwrap();
        let parsed: ExecutionRecord = serde_json::from_str(&json).unwrap();

        let rebuilt = Execution::from_record(&registry, config, &parsed).unwrap();
        assert_eq!(*rebuilt, *execution);
        assert_eq!(rebuilt.dependencies().len(), 1);
        assert_eq!(
            rebuilt.dependencies()[0].identity(),
            execution.dependencies()[0].identity()
        );
    }
}
