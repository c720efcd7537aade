//! Bounded in-memory cache tier.
//!
//! Fast and ephemeral. An entry is servable only while every dependency
//! identity recorded on it is (recursively) also present in this tier;
//! otherwise the lookup falls through to the wrapped provider or to direct
//! execution. Eviction is deliberately coarse: when the entry count
//! exceeds the bound, the lowest-priority half of all entries is dropped
//! in one batch and the priority bookkeeping starts over.

use super::CacheProvider;
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::execution::Execution;
use crate::function::Registry;
use crate::locker::Locker;
use crate::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

struct Entry {
    value: Value,
    dependencies: Vec<String>,
    priority: u64,
}

pub struct InMemoryCacheProvider {
    max_entries: usize,
    wrapped: Option<Arc<dyn CacheProvider>>,
    locker: Arc<Locker>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryCacheProvider {
    pub fn new(
        max_entries: usize,
        wrapped: Option<Arc<dyn CacheProvider>>,
        locker: Arc<Locker>,
    ) -> Self {
        Self {
            max_entries,
            wrapped,
            locker,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lookup(&self, identity: &str) -> Option<Value> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if !Self::present(&entries, identity, &mut HashSet::new()) {
            return None;
        }
        let entry = entries.get_mut(identity)?;
        entry.priority += 1;
        Some(entry.value.clone())
    }

    fn present(
        entries: &HashMap<String, Entry>,
        identity: &str,
        visited: &mut HashSet<String>,
    ) -> bool {
        if !visited.insert(identity.to_string()) {
            return true;
        }
        match entries.get(identity) {
            None => false,
            Some(entry) => entry
                .dependencies
                .iter()
                .all(|dep| Self::present(entries, dep, visited)),
        }
    }

    fn insert(&self, identity: String, value: Value, dependencies: Vec<String>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let priority = entries.get(&identity).map(|e| e.priority).unwrap_or(0);
        entries.insert(
            identity,
            Entry {
                value,
                dependencies,
                priority,
            },
        );
        if entries.len() > self.max_entries {
            let mut ranked: Vec<(String, u64)> = entries
                .iter()
                .map(|(key, entry)| (key.clone(), entry.priority))
                .collect();
            ranked.sort_by(|a, b| a.1.cmp(&b.1));
            let evict = entries.len() / 2;
            for (key, _) in ranked.into_iter().take(evict) {
                entries.remove(&key);
            }
            for entry in entries.values_mut() {
                entry.priority = 0;
            }
            debug!(
                operation = "evict",
                tier = "memory",
                remaining = entries.len(),
                "batch eviction"
            );
        }
    }
}

impl CacheProvider for InMemoryCacheProvider {
    fn prepare(&self, registry: &Registry) -> Result<()> {
        if let Some(wrapped) = &self.wrapped {
            wrapped.prepare(registry)?;
        }
        Ok(())
    }

    fn get_or_execute(
        &self,
        ctx: &ExecutionContext,
        execution: &Arc<Execution>,
        already_exclusive: bool,
    ) -> Result<(bool, Value)> {
        let identity = execution.identity();
        let _guard = if already_exclusive {
            None
        } else {
            Some(self.locker.lock(Some(&identity))?)
        };

        if let Some(value) = self.lookup(&identity) {
            debug!(
                operation = "get",
                status = "hit",
                tier = "memory",
                identity = %identity,
                "served from memory"
            );
            return Ok((false, value));
        }

        let (executed, value) = match &self.wrapped {
            Some(wrapped) => wrapped.get_or_execute(ctx, execution, true)?,
            None => (true, execution.run(ctx)?),
        };

        // The identity may have shifted while the body ran, as nested calls
        // extended the dependency graph; record the entry under the current
        // identity so the next call finds it.
        let identity = execution.identity();
        let dependencies = execution
            .dependencies()
            .iter()
            .map(|dep| dep.identity())
            .collect();
        self.insert(identity, value.clone(), dependencies);
        Ok((executed, value))
    }

    fn size(&self) -> Result<usize> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len())
    }

    fn clear(&self, recursive: bool) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        if recursive {
            if let Some(wrapped) = &self.wrapped {
                wrapped.clear(true)?;
            }
        }
        Ok(())
    }

    fn is_valid(&self, execution: &Arc<Execution>) -> Result<bool> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(Self::present(
            &entries,
            &execution.identity(),
            &mut HashSet::new(),
        ))
    }
}
