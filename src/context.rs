//! Call dispatch: argument inheritance, cycle detection, cache routing.
//!
//! The context keeps one call stack per calling thread. The stack drives
//! two things: cycle detection (an execution reappearing in the active
//! chain is an error, not infinite recursion) and dynamic-scope argument
//! resolution: a missing argument is taken from the nearest active
//! ancestor that supplies it, then from the global configuration. Only
//! ancestors on the *current thread's* stack participate; cross-thread
//! calls are independent lineages.

use crate::cache::CacheProvider;
use crate::config::{ConfigScope, Configuration};
use crate::error::{Error, Result};
use crate::execution::Execution;
use crate::function::{Function, Registry};
use crate::locker::Locker;
use crate::{Kwargs, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use tracing::debug;

pub struct ExecutionContext {
    registry: Registry,
    configuration: Arc<Configuration>,
    provider: Option<Arc<dyn CacheProvider>>,
    locker: Arc<Locker>,
    stacks: Mutex<HashMap<ThreadId, Vec<Arc<Execution>>>>,
    // Realized (non-cache-hit) executions by call signature.
    counts: Mutex<HashMap<String, u64>>,
}

impl ExecutionContext {
    pub fn new(
        registry: Registry,
        configuration: Configuration,
        provider: Option<Arc<dyn CacheProvider>>,
        locker: Arc<Locker>,
    ) -> Self {
        Self {
            registry,
            configuration: Arc::new(configuration),
            provider,
            locker,
            stacks: Mutex::new(HashMap::new()),
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn configuration(&self) -> &Arc<Configuration> {
        &self.configuration
    }

    pub fn provider(&self) -> Option<&Arc<dyn CacheProvider>> {
        self.provider.as_ref()
    }

    pub fn locker(&self) -> &Arc<Locker> {
        &self.locker
    }

    /// Push a nested configuration scope on this context.
    pub fn scope(&self, overrides: Kwargs) -> Result<ConfigScope> {
        self.configuration.push(overrides)
    }

    /// Call a registered function by name, honoring its registered caching
    /// flag. This is the form function bodies use for nested calls.
    pub fn call(&self, name: &str, kwargs: Kwargs) -> Result<Value> {
        self.call_with(name, &[], kwargs)
    }

    /// Like [`call`](Self::call), with positional arguments merged by
    /// parameter position.
    pub fn call_with(&self, name: &str, positional: &[Value], kwargs: Kwargs) -> Result<Value> {
        let function = self.registry.lookup(name)?;
        let use_cache = function.is_cached();
        self.execute(&function, positional, kwargs, use_cache)
    }

    /// Run a function under this context, optionally through the cache
    /// provider chain.
    pub fn execute(
        &self,
        function: &Arc<Function>,
        positional: &[Value],
        mut kwargs: Kwargs,
        use_cache: bool,
    ) -> Result<Value> {
        let arguments = function.arguments();
        if positional.len() > arguments.len() {
            return Err(Error::TooManyPositional {
                function: function.name().to_string(),
                expected: arguments.len(),
                given: positional.len(),
            });
        }
        for (name, value) in arguments.iter().zip(positional) {
            if kwargs.contains_key(name) {
                return Err(Error::ArgumentConflict {
                    function: function.name().to_string(),
                    name: name.clone(),
                });
            }
            kwargs.insert(name.clone(), value.clone());
        }

        let kwargs = self.resolve_kwargs(function, kwargs);
        let execution = Arc::new(Execution::new(
            Arc::clone(function),
            Arc::clone(&self.configuration),
            kwargs,
        ));

        let thread = thread::current().id();
        {
            let mut stacks = self.stacks.lock().unwrap_or_else(PoisonError::into_inner);
            let stack = stacks.entry(thread).or_default();
            let identity = execution.identity();
            if stack.iter().any(|active| active.identity() == identity) {
                return Err(Error::CyclicExecution {
                    head: function.name().to_string(),
                    chain: stack.iter().map(|active| active.signature()).collect(),
                });
            }
            // The dependency DAG is discovered purely from dynamic call
            // nesting: every still-active ancestor gains an edge.
            for ancestor in stack.iter() {
                ancestor.add_dependency(Arc::clone(&execution));
                ancestor.function().add_dependency(function);
            }
            stack.push(Arc::clone(&execution));
        }
        let _guard = StackGuard {
            context: self,
            thread,
        };

        let (executed, value) = match (&self.provider, use_cache) {
            (Some(provider), true) => provider.get_or_execute(self, &execution, false)?,
            _ => (true, execution.run(self)?),
        };

        if executed {
            let signature = execution.signature();
            debug!(operation = "execute", status = "realized", signature = %signature, "");
            *self
                .counts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(signature)
                .or_insert(0) += 1;
        }
        Ok(value)
    }

    // Resolution priority for a declared parameter: explicit kwargs, then
    // the nearest active ancestor on this thread's stack that binds it,
    // then the global configuration.
    fn resolve_kwargs(&self, function: &Function, mut kwargs: Kwargs) -> Kwargs {
        let arguments = function.arguments();
        {
            let stacks = self.stacks.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(stack) = stacks.get(&thread::current().id()) {
                for ancestor in stack.iter().rev() {
                    for (key, value) in ancestor.kwargs() {
                        if arguments.iter().any(|a| a == key) && !kwargs.contains_key(key) {
                            kwargs.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
        }
        for name in &arguments {
            if !kwargs.contains_key(name) {
                if let Some(value) = self.configuration.get(name) {
                    kwargs.insert(name.clone(), value);
                }
            }
        }
        kwargs
    }

    /// How many times the given call was actually executed (cache hits do
    /// not count). Keyed by the human-readable signature: defaults overlaid
    /// with the given kwargs.
    pub fn count_executions(&self, name: &str, kwargs: Kwargs) -> Result<u64> {
        let function = self.registry.lookup(name)?;
        let probe = Execution::new(function, Arc::new(Configuration::empty()), kwargs);
        Ok(self
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&probe.signature())
            .copied()
            .unwrap_or(0))
    }
}

// Pops the execution pushed by `execute` even when the call fails.
struct StackGuard<'a> {
    context: &'a ExecutionContext,
    thread: ThreadId,
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        let mut stacks = self
            .context
            .stacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(stack) = stacks.get_mut(&self.thread) {
            stack.pop();
            if stack.is_empty() {
                stacks.remove(&self.thread);
            }
        }
    }
}
