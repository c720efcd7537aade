//! Memoizing execution engine with multi-tier persistent caching.
//!
//! Functions register under stable global names with declared parameters.
//! Each call materializes an [`Execution`] whose identity hashes the
//! function name, the explicit arguments, and the configuration values the
//! function (transitively) depends on. Results flow through a cache
//! provider chain, by default a bounded in-memory tier over a durable
//! filesystem tier that independent processes can share; cross-process
//! file locks keep concurrent computations of the same identity
//! single-flight.
//!
//! The dependency graph between functions is not declared up front. It is
//! discovered from dynamic call nesting while the program runs, persisted
//! alongside results, and used both for argument-sensitive identities and
//! for dependency-aware invalidation of stored entries.
//!
//! ```no_run
//! use marmot::{kwargs, FunctionSpec, Session};
//!
//! let double = marmot::register(
//!     FunctionSpec::new("demo.double", |_, kw| {
//!         let n = kw.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
//!         Ok(serde_json::json!(n * 2))
//!     })
//!     .param("n")
//!     .cached(true),
//! );
//!
//! let _session = Session::builder().directory(".marmot").build()?;
//! let value = double.call(kwargs! { n: 21 })?;
//! assert_eq!(value, serde_json::json!(42));
//! # Ok::<(), marmot::Error>(())
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod execution;
pub mod fingerprint;
pub mod function;
pub mod locker;
pub mod logging;
pub mod session;
pub mod storage;

pub use cache::{CacheProvider, InMemoryCacheProvider, StorageCacheProvider};
pub use config::{ConfigScope, Configuration};
pub use context::ExecutionContext;
pub use error::{Error, Result};
pub use execution::{Execution, ExecutionRecord};
pub use fingerprint::Fingerprint;
pub use function::{Function, FunctionRecord, FunctionSpec, Param, Registry};
pub use locker::Locker;
pub use logging::{LogFormat, Verbosity};
pub use session::{configuration, execution_context, Session, SessionBuilder};
pub use storage::{DependencyRef, ExecutionMeta, FileStorage, Storage, StoreInfo};

use std::collections::BTreeMap;

/// Argument and result values are JSON values; arbitrary user types take
/// part through [`Fingerprint`].
pub type Value = serde_json::Value;

/// Keyword arguments, ordered by name so serialized forms are stable.
pub type Kwargs = BTreeMap<String, Value>;

#[doc(hidden)]
pub use serde_json as __serde_json;

/// Build a [`Kwargs`] map from `key: value` pairs; values go through
/// `serde_json::json!`.
///
/// ```
/// use marmot::kwargs;
/// let kw = kwargs! { n: 21, label: "answer" };
/// assert_eq!(kw["n"], 21);
/// ```
#[macro_export]
macro_rules! kwargs {
    () => { $crate::Kwargs::new() };
    ($($key:ident : $value:expr),+ $(,)?) => {{
        let mut map = $crate::Kwargs::new();
        $(
            map.insert(
                stringify!($key).to_string(),
                $crate::__serde_json::json!($value),
            );
        )+
        map
    }};
}

/// Handle to a function registered in the process-wide registry. Calls go
/// through the currently installed session context.
#[derive(Debug, Clone)]
pub struct FunctionHandle {
    name: String,
}

impl FunctionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call with keyword arguments through the current session.
    pub fn call(&self, kwargs: Kwargs) -> Result<Value> {
        execution_context()?.call(&self.name, kwargs)
    }

    /// Call with positional arguments, matched against the declared
    /// parameter order, plus keyword arguments.
    pub fn call_with(&self, positional: &[Value], kwargs: Kwargs) -> Result<Value> {
        execution_context()?.call_with(&self.name, positional, kwargs)
    }

    /// How many times this call was actually executed in the current
    /// session; cache hits do not count.
    pub fn count_executions(&self, kwargs: Kwargs) -> Result<u64> {
        execution_context()?.count_executions(&self.name, kwargs)
    }
}

/// Register a function in the process-wide registry and return a call
/// handle for it. Sessions built without a private registry dispatch to
/// functions registered here.
pub fn register(spec: FunctionSpec) -> FunctionHandle {
    let function = Registry::global().register(spec);
    FunctionHandle {
        name: function.name().to_string(),
    }
}
