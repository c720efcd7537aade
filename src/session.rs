//! Session lifecycle: wiring the cache chain and installing the
//! process-wide execution context.
//!
//! A session assembles the storage backend, the provider chain and the
//! locker around one cache directory, prepares the chain, and installs the
//! resulting context as the process default used by the top-level call
//! entry points. Dropping the session uninstalls the context it installed;
//! a context installed by a later session is left alone.

use crate::cache::{CacheProvider, InMemoryCacheProvider, StorageCacheProvider};
use crate::config::{ConfigScope, Configuration};
use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::function::Registry;
use crate::locker::Locker;
use crate::logging::{self, Verbosity};
use crate::storage::FileStorage;
use crate::Kwargs;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

static CONTEXT: RwLock<Option<Arc<ExecutionContext>>> = RwLock::new(None);

/// The currently installed execution context.
pub fn execution_context() -> Result<Arc<ExecutionContext>> {
    CONTEXT
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or(Error::NotInitialized)
}

/// Push a configuration scope on the current session. The overrides apply
/// to calls made while the returned guard is alive.
pub fn configuration(overrides: Kwargs) -> Result<ConfigScope> {
    execution_context()?.scope(overrides)
}

/// Builder for a [`Session`].
///
/// Without a directory the session runs memory-only: results are cached for
/// the life of the process but nothing is persisted or shared.
pub struct SessionBuilder {
    directory: Option<PathBuf>,
    override_cache: bool,
    verbosity: Verbosity,
    max_in_memory_entries: usize,
    globals: Kwargs,
    registry: Option<Registry>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            directory: None,
            override_cache: false,
            verbosity: Verbosity::default(),
            max_in_memory_entries: 1000,
            globals: Kwargs::new(),
            registry: None,
        }
    }

    /// Cache directory shared across sessions and processes.
    pub fn directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    /// Treat everything persisted before this session as stale, forcing one
    /// recomputation per entry.
    pub fn override_cache(mut self, override_cache: bool) -> Self {
        self.override_cache = override_cache;
        self
    }

    pub fn verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Bound on the in-memory tier entry count.
    pub fn max_in_memory_entries(mut self, max_entries: usize) -> Self {
        self.max_in_memory_entries = max_entries;
        self
    }

    /// Session-global configuration values, the outermost resolution layer.
    pub fn globals(mut self, globals: Kwargs) -> Self {
        self.globals = globals;
        self
    }

    /// Use a private registry instead of the process-wide one. Intended for
    /// tests and embedders managing their own function tables.
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Assemble the cache chain, prepare it, and install the context.
    pub fn build(self) -> Result<Session> {
        logging::init(self.verbosity);
        let registry = self.registry.unwrap_or_else(|| Registry::global().clone());

        let (locker, provider) = match &self.directory {
            Some(directory) => {
                let locker = Arc::new(Locker::new(Some(directory.join("locks")))?);
                let storage = Arc::new(FileStorage::new(directory.clone(), Arc::clone(&locker))?);
                let durable = Arc::new(StorageCacheProvider::new(
                    storage,
                    Arc::clone(&locker),
                    self.override_cache,
                    None,
                ));
                let memory = Arc::new(InMemoryCacheProvider::new(
                    self.max_in_memory_entries,
                    Some(durable as Arc<dyn CacheProvider>),
                    Arc::clone(&locker),
                ));
                (locker, memory as Arc<dyn CacheProvider>)
            }
            None => {
                let locker = Arc::new(Locker::new(None)?);
                let memory = Arc::new(InMemoryCacheProvider::new(
                    self.max_in_memory_entries,
                    None,
                    Arc::clone(&locker),
                ));
                (locker, memory as Arc<dyn CacheProvider>)
            }
        };
        provider.prepare(&registry)?;

        let context = Arc::new(ExecutionContext::new(
            registry,
            Configuration::new(self.globals)?,
            Some(provider),
            locker,
        ));
        *CONTEXT.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&context));
        info!(
            operation = "session",
            directory = %self
                .directory
                .as_deref()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|| "<memory>".to_string()),
            override_cache = self.override_cache,
            "session started"
        );
        Ok(Session { context })
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A live session. Holds the context it installed and uninstalls it on
/// drop.
pub struct Session {
    context: Arc<ExecutionContext>,
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.context
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let mut installed = CONTEXT.write().unwrap_or_else(PoisonError::into_inner);
        if installed
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &self.context))
        {
            *installed = None;
        }
    }
}
