//! Durable cache tier over a storage backend.
//!
//! `prepare()` must run before any dispatch: it captures (and, when a
//! force-recompute was requested, advances) the override boundary, and
//! drains the persisted execution index once so dependency edges recorded
//! by earlier runs are known before any identity is computed.

use super::CacheProvider;
use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::execution::Execution;
use crate::function::Registry;
use crate::locker::Locker;
use crate::storage::Storage;
use crate::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

pub struct StorageCacheProvider {
    storage: Arc<dyn Storage>,
    wrapped: Option<Arc<dyn CacheProvider>>,
    locker: Arc<Locker>,
    override_cache: bool,
    initialized: AtomicBool,
    // Active override boundary captured at prepare().
    boundary: AtomicU64,
}

impl StorageCacheProvider {
    pub fn new(
        storage: Arc<dyn Storage>,
        locker: Arc<Locker>,
        override_cache: bool,
        wrapped: Option<Arc<dyn CacheProvider>>,
    ) -> Self {
        Self {
            storage,
            wrapped,
            locker,
            override_cache,
            initialized: AtomicBool::new(false),
            boundary: AtomicU64::new(0),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    fn ensure_initialized(&self) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized);
        }
        Ok(())
    }
}

impl CacheProvider for StorageCacheProvider {
    fn prepare(&self, registry: &Registry) -> Result<()> {
        let boundary = if self.override_cache {
            // Everything persisted so far becomes stale; entries written
            // from here on carry stamps at or above the boundary.
            self.storage.activate_override()?
        } else {
            self.storage.info()?.override_boundary
        };
        self.boundary.store(boundary, Ordering::SeqCst);

        // Drain the execution index once: re-registering persisted function
        // dependency edges makes identities converge across processes.
        for name in self.storage.functions()? {
            self.storage.load_function_dependencies(registry, &name)?;
        }

        if let Some(wrapped) = &self.wrapped {
            wrapped.prepare(registry)?;
        }
        self.initialized.store(true, Ordering::SeqCst);
        debug!(operation = "prepare", tier = "storage", boundary, "prepared");
        Ok(())
    }

    fn get_or_execute(
        &self,
        ctx: &ExecutionContext,
        execution: &Arc<Execution>,
        already_exclusive: bool,
    ) -> Result<(bool, Value)> {
        self.ensure_initialized()?;
        let identity = execution.identity();
        let _guard = if already_exclusive {
            None
        } else {
            Some(self.locker.lock(Some(&identity))?)
        };

        let boundary = self.boundary.load(Ordering::SeqCst);
        if self.storage.is_valid(execution, boundary)? {
            if let Some(value) = self.storage.read_value(execution)? {
                self.storage.record_hit(execution)?;
                debug!(
                    operation = "get",
                    status = "hit",
                    tier = "storage",
                    identity = %identity,
                    "served from storage"
                );
                return Ok((false, value));
            }
        }

        let (executed, value) = match &self.wrapped {
            Some(wrapped) => wrapped.get_or_execute(ctx, execution, true)?,
            None => (true, execution.run(ctx)?),
        };

        // Result and metadata are written under the identity lock held
        // above, so a concurrent reader never observes a ready marker
        // without a matching payload.
        let stamp = self.storage.allocate_stamp()?;
        self.storage.persist(execution, &value, stamp)?;
        let value = self.storage.read_value(execution)?.ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("result for `{}` missing after write", execution.identity()),
            ))
        })?;
        debug!(
            operation = "put",
            tier = "storage",
            identity = %execution.identity(),
            stamp,
            "persisted"
        );
        Ok((executed, value))
    }

    fn size(&self) -> Result<usize> {
        self.storage.size()
    }

    fn clear(&self, recursive: bool) -> Result<()> {
        self.storage.clear()?;
        if recursive {
            if let Some(wrapped) = &self.wrapped {
                wrapped.clear(true)?;
            }
        }
        Ok(())
    }

    fn is_valid(&self, execution: &Arc<Execution>) -> Result<bool> {
        self.storage
            .is_valid(execution, self.boundary.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::function::FunctionSpec;
    use crate::kwargs;
    use crate::storage::FileStorage;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn storage_context(
        dir: &TempDir,
        registry: Registry,
        override_cache: bool,
    ) -> (ExecutionContext, Arc<StorageCacheProvider>) {
        let locker =
            Arc::new(Locker::new(Some(dir.path().join("locks"))).unwrap());
        let storage = Arc::new(
            FileStorage::new(dir.path().to_path_buf(), Arc::clone(&locker)).unwrap(),
        );
        let provider = Arc::new(StorageCacheProvider::new(
            storage,
            Arc::clone(&locker),
            override_cache,
            None,
        ));
        provider.prepare(&registry).unwrap();
        let ctx = ExecutionContext::new(
            registry,
            Configuration::empty(),
            Some(Arc::clone(&provider) as Arc<dyn CacheProvider>),
            locker,
        );
        (ctx, provider)
    }

    fn register_counting_echo(registry: &Registry, calls: &Arc<AtomicUsize>) {
        let calls = Arc::clone(calls);
        registry.register(
            FunctionSpec::new("tests.sto_echo", move |_, kw| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(kw.get("a").cloned().unwrap_or(Value::Null))
            })
            .param_with_default("a", Value::Null)
            .cached(true),
        );
    }

    #[test]
    fn test_dispatch_before_prepare_is_rejected() {
        let dir = TempDir::new().unwrap();
        let locker = Arc::new(Locker::new(Some(dir.path().join("locks"))).unwrap());
        let storage =
            Arc::new(FileStorage::new(dir.path().to_path_buf(), Arc::clone(&locker)).unwrap());
        let provider = StorageCacheProvider::new(storage, Arc::clone(&locker), false, None);

        let registry = Registry::new();
        register_counting_echo(&registry, &Arc::new(AtomicUsize::new(0)));
        let function = registry.lookup("tests.sto_echo").unwrap();
        let ctx = ExecutionContext::new(registry, Configuration::empty(), None, locker);
        let execution = Arc::new(Execution::new(
            function,
            Arc::clone(ctx.configuration()),
            kwargs! {},
        ));

        assert!(matches!(
            provider.get_or_execute(&ctx, &execution, false),
            Err(Error::NotInitialized)
        ));
    }

    #[test]
    fn test_persisted_results_survive_new_provider() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let registry = Registry::new();
        register_counting_echo(&registry, &calls);
        let (ctx, provider) = storage_context(&dir, registry.clone(), false);
        assert_eq!(
            ctx.call("tests.sto_echo", kwargs! { a: 1 }).unwrap(),
            json!(1)
        );
        assert_eq!(provider.size().unwrap(), 1);
        drop(ctx);

        // A fresh provider over the same directory serves the cached value.
        let (ctx, _) = storage_context(&dir, registry, false);
        assert_eq!(
            ctx.call("tests.sto_echo", kwargs! { a: 1 }).unwrap(),
            json!(1)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_drops_entries() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Registry::new();
        register_counting_echo(&registry, &calls);
        let (ctx, provider) = storage_context(&dir, registry, false);

        ctx.call("tests.sto_echo", kwargs! { a: 1 }).unwrap();
        provider.clear(false).unwrap();
        assert_eq!(provider.size().unwrap(), 0);
        ctx.call("tests.sto_echo", kwargs! { a: 1 }).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_override_forces_single_recompute() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Registry::new();
        register_counting_echo(&registry, &calls);

        let (ctx, _) = storage_context(&dir, registry.clone(), false);
        ctx.call("tests.sto_echo", kwargs! { a: 1 }).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        drop(ctx);

        // Force-recompute session: exactly one re-execution, then cached
        // again within the same session.
        let (ctx, _) = storage_context(&dir, registry.clone(), true);
        ctx.call("tests.sto_echo", kwargs! { a: 1 }).unwrap();
        ctx.call("tests.sto_echo", kwargs! { a: 1 }).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        drop(ctx);

        // And a later plain session sees the refreshed entry.
        let (ctx, _) = storage_context(&dir, registry, false);
        ctx.call("tests.sto_echo", kwargs! { a: 1 }).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
