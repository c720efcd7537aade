//! Durable persistence of execution results and metadata.
//!
//! The durable unit is keyed by execution identity: a result payload, a
//! metadata record (stamps, kwargs, dependency references, the recursive
//! transport record), and a readiness marker. A store-wide info record
//! holds the monotonically increasing logical stamp counter and the
//! override boundary below which all entries are treated as stale.

pub mod filesystem;

pub use filesystem::FileStorage;

use crate::error::Result;
use crate::execution::{Execution, ExecutionRecord};
use crate::function::Registry;
use crate::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-wide info record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreInfo {
    /// Next logical stamp to hand out.
    #[serde(default)]
    pub next_stamp: u64,
    /// Entries stamped below this boundary are stale.
    #[serde(default)]
    pub override_boundary: u64,
}

/// Reference to a persisted dependency, with the stamp observed when the
/// referencing entry was written. Validity always re-reads the dependency's
/// own record; the recorded stamp is kept for introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyRef {
    pub function: String,
    pub identity: String,
    #[serde(default)]
    pub stamp: Option<u64>,
}

/// Durable metadata record for one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMeta {
    pub function: String,
    pub stamp: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub hits: u64,
    #[serde(default)]
    pub dependencies: Vec<DependencyRef>,
    pub record: ExecutionRecord,
}

/// Storage backend seam for the durable cache tier. Also the read-only
/// introspection surface consumed by outer tooling: known functions, an
/// individual function's cached executions, the store-wide info record.
pub trait Storage: Send + Sync {
    /// Read the persisted result payload, if present.
    fn read_value(&self, execution: &Execution) -> Result<Option<Value>>;

    /// Read the persisted metadata record for an identity.
    fn read_meta(&self, function: &str, identity: &str) -> Result<Option<ExecutionMeta>>;

    /// Dependency-aware validity: ready marker present, stamp at or above
    /// the override boundary, stamp at or above every dependency's stamp,
    /// and every dependency recursively valid by the same rule (re-reading
    /// its persisted record). A dependency with no record counts as
    /// infinitely new and invalidates the entry.
    fn is_valid(&self, execution: &Execution, override_boundary: u64) -> Result<bool>;

    /// Persist the result payload, its metadata and the readiness marker,
    /// and fold the function-level dependency names into the function
    /// record. The caller holds the identity lock.
    fn persist(&self, execution: &Execution, value: &Value, stamp: u64) -> Result<()>;

    /// Bump the hit counter on an entry. The caller holds the identity
    /// lock.
    fn record_hit(&self, execution: &Execution) -> Result<()>;

    /// Hand out the next logical stamp (store-wide, under the global lock).
    fn allocate_stamp(&self) -> Result<u64>;

    /// Move the override boundary up to the current stamp counter and
    /// return it; everything persisted so far becomes stale.
    fn activate_override(&self) -> Result<u64>;

    fn info(&self) -> Result<StoreInfo>;

    /// Re-register persisted function dependency edges (recursively) into
    /// the registry's graph.
    fn load_function_dependencies(&self, registry: &Registry, function: &str) -> Result<()>;

    /// Names of functions with persisted state.
    fn functions(&self) -> Result<Vec<String>>;

    /// Metadata records of a function's cached executions.
    fn executions(&self, function: &str) -> Result<Vec<ExecutionMeta>>;

    /// Number of ready entries across all functions.
    fn size(&self) -> Result<usize>;

    /// Drop all persisted entries and the info record.
    fn clear(&self) -> Result<()>;
}
