//! The cache provider chain.
//!
//! Providers share one get-or-execute contract so they compose arbitrarily:
//! the shipped configuration is a bounded in-memory tier over a durable
//! storage tier, but a provider must not assume what, if anything, it
//! wraps. Locking is by execution identity; an inner tier invoked with
//! `already_exclusive` trusts the outer tier's lock instead of taking its
//! own, which keeps the chain single-flight without double-locking.

pub mod memory;
pub mod storage;

pub use memory::InMemoryCacheProvider;
pub use storage::StorageCacheProvider;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::execution::Execution;
use crate::function::Registry;
use crate::Value;
use std::sync::Arc;

pub trait CacheProvider: Send + Sync {
    /// Session start: open durable resources, capture the override
    /// boundary, warm any lazy index structures.
    fn prepare(&self, registry: &Registry) -> Result<()>;

    /// Serve the execution's value from this tier if it is valid, otherwise
    /// obtain it (directly or through the wrapped provider), record it, and
    /// return it. The flag reports whether the function actually ran.
    fn get_or_execute(
        &self,
        ctx: &ExecutionContext,
        execution: &Arc<Execution>,
        already_exclusive: bool,
    ) -> Result<(bool, Value)>;

    /// Number of entries held by this tier.
    fn size(&self) -> Result<usize>;

    /// Drop this tier's entries; with `recursive`, cascade to wrapped
    /// providers.
    fn clear(&self, recursive: bool) -> Result<()>;

    /// Whether a fresh, servable entry exists for the execution in this
    /// tier.
    fn is_valid(&self, execution: &Arc<Execution>) -> Result<bool>;
}
