//! Function identity, parameter descriptors, and the process-wide registry.
//!
//! A [`Function`] is the stable identity of a wrapped callable: a globally
//! unique name plus an ordered parameter descriptor list built once at
//! registration time. The registry also owns the dependency graph between
//! functions, discovered at runtime from dynamic call nesting and
//! accumulated for the lifetime of the process (or re-registered from
//! persisted metadata).

use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::{Kwargs, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, LazyLock, Mutex, PoisonError, Weak};

/// Signature of a registered function body. Bodies receive the execution
/// context so nested calls re-enter the engine, and the fully resolved
/// keyword arguments (defaults filled in).
pub type Body = dyn Fn(&ExecutionContext, &Kwargs) -> anyhow::Result<Value> + Send + Sync;

/// Statically-declared parameter descriptor: name plus optional default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default)]
    pub default: Option<Value>,
}

/// Registration-time description of a function. Built with the fluent
/// methods and handed to [`Registry::register`].
pub struct FunctionSpec {
    name: String,
    params: Vec<Param>,
    cached: bool,
    body: Arc<Body>,
}

impl FunctionSpec {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&ExecutionContext, &Kwargs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            params: Vec::new(),
            cached: false,
            body: Arc::new(body),
        }
    }

    /// Declare a required parameter.
    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.params.push(Param {
            name: name.into(),
            default: None,
        });
        self
    }

    /// Declare a parameter with a default value.
    pub fn param_with_default(mut self, name: impl Into<String>, default: Value) -> Self {
        self.params.push(Param {
            name: name.into(),
            default: Some(default),
        });
        self
    }

    /// Route calls through the cache provider chain.
    pub fn cached(mut self, cached: bool) -> Self {
        self.cached = cached;
        self
    }
}

pub struct Function {
    name: String,
    params: Vec<Param>,
    cached: bool,
    body: Arc<Body>,
    registry: Weak<RegistryInner>,
}

impl Function {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Ordered formal parameter names.
    pub fn arguments(&self) -> Vec<String> {
        self.params.iter().map(|p| p.name.clone()).collect()
    }

    pub fn default_of(&self, name: &str) -> Option<&Value> {
        self.params
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| p.default.as_ref())
    }

    pub fn is_cached(&self) -> bool {
        self.cached
    }

    pub(crate) fn invoke(&self, ctx: &ExecutionContext, kwargs: &Kwargs) -> anyhow::Result<Value> {
        (self.body)(ctx, kwargs)
    }

    /// Record a dependency edge. Idempotent; a function never depends on
    /// itself.
    pub fn add_dependency(&self, other: &Function) {
        if other.name == self.name {
            return;
        }
        if let Some(inner) = self.registry.upgrade() {
            inner.add_edge(&self.name, &other.name);
        }
    }

    /// Snapshot of the direct dependency functions currently registered.
    pub fn dependencies(&self) -> Vec<Arc<Function>> {
        let Some(inner) = self.registry.upgrade() else {
            return Vec::new();
        };
        inner
            .direct_edges(&self.name)
            .into_iter()
            .filter_map(|name| inner.get(&name))
            .collect()
    }

    /// Names of direct dependencies, including ones not (yet) registered in
    /// this process.
    pub fn dependency_names(&self) -> Vec<String> {
        match self.registry.upgrade() {
            Some(inner) => inner.direct_edges(&self.name),
            None => Vec::new(),
        }
    }

    /// Own parameters plus, transitively, the parameters of everything this
    /// function calls. Computed from whatever edges exist at call time, so
    /// it terminates even while the graph is still being discovered.
    pub fn dependent_arguments(&self) -> BTreeSet<String> {
        let mut result: BTreeSet<String> = self.arguments().into_iter().collect();
        let Some(inner) = self.registry.upgrade() else {
            return result;
        };
        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(self.name.clone());
        let mut queue = inner.direct_edges(&self.name);
        while let Some(name) = queue.pop() {
            if !seen.insert(name.clone()) {
                continue;
            }
            if let Some(function) = inner.get(&name) {
                result.extend(function.arguments());
            }
            queue.extend(inner.direct_edges(&name));
        }
        result
    }

    /// Transport form of this function and its dependency subgraph.
    pub fn to_record(&self) -> FunctionRecord {
        let mut visited = HashSet::new();
        self.record_from(&mut visited)
    }

    fn record_from(&self, visited: &mut HashSet<String>) -> FunctionRecord {
        visited.insert(self.name.clone());
        let mut dependencies = Vec::new();
        for dep in self.dependencies() {
            if !visited.contains(dep.name()) {
                dependencies.push(dep.record_from(visited));
            }
        }
        FunctionRecord {
            name: self.name.clone(),
            dependencies,
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("cached", &self.cached)
            .finish()
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl PartialEq for Function {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Function {}

/// Transport form of a function's dependency subgraph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRecord {
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<FunctionRecord>,
}

struct RegistryInner {
    functions: Mutex<HashMap<String, Arc<Function>>>,
    // Direct dependency edges by name, insertion-ordered and deduplicated.
    edges: Mutex<HashMap<String, Vec<String>>>,
}

impl RegistryInner {
    fn get(&self, name: &str) -> Option<Arc<Function>> {
        self.functions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn add_edge(&self, from: &str, to: &str) {
        if from == to {
            return;
        }
        let mut edges = self.edges.lock().unwrap_or_else(PoisonError::into_inner);
        let targets = edges.entry(from.to_string()).or_default();
        if !targets.iter().any(|t| t == to) {
            targets.push(to.to_string());
        }
    }

    fn direct_edges(&self, name: &str) -> Vec<String> {
        self.edges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .unwrap_or_default()
    }
}

/// Process-scoped function table and dependency graph with an explicit
/// lifecycle. Cloning shares the underlying state; tests can construct
/// private registries for isolation.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

static GLOBAL: LazyLock<Registry> = LazyLock::new(Registry::new);

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                functions: Mutex::new(HashMap::new()),
                edges: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The process-wide default registry backing the session entry points.
    pub fn global() -> &'static Registry {
        &GLOBAL
    }

    /// Register (or replace) a function under its stable name.
    pub fn register(&self, spec: FunctionSpec) -> Arc<Function> {
        let function = Arc::new(Function {
            name: spec.name,
            params: spec.params,
            cached: spec.cached,
            body: spec.body,
            registry: Arc::downgrade(&self.inner),
        });
        self.inner
            .functions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(function.name.clone(), Arc::clone(&function));
        function
    }

    /// Resolve a function from its stable name.
    pub fn lookup(&self, name: &str) -> Result<Arc<Function>> {
        self.inner
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .functions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Record a dependency edge by name, e.g. when re-registering edges
    /// loaded from persisted metadata.
    pub fn add_edge(&self, from: &str, to: &str) {
        self.inner.add_edge(from, to);
    }

    /// Rebuild a function reference from its transport form, re-adding the
    /// recorded dependency edges.
    pub fn resolve_record(&self, record: &FunctionRecord) -> Result<Arc<Function>> {
        let function = self.lookup(&record.name)?;
        for dep in &record.dependencies {
            let resolved = self.resolve_record(dep)?;
            function.add_dependency(&resolved);
        }
        Ok(function)
    }

    /// Clear all discovered dependency edges. Registered functions survive;
    /// intended for test isolation.
    pub fn reset(&self) {
        self.inner
            .edges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Full clear: functions and edges.
    pub fn clear(&self) {
        self.inner
            .functions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.reset();
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
