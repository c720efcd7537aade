//! Filesystem-backed storage.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/info.json                          store-wide counters
//! <root>/<function>/function.json           accumulated dependency names
//! <root>/<function>/<identity>.value.json   result payload
//! <root>/<function>/<identity>.meta.json    metadata record
//! <root>/<function>/<identity>.ready        readiness marker, written last
//! <root>/locks/                             locker directory, not entries
//! ```
//!
//! All JSON writes go through a temp file in the same directory followed by
//! a rename, so a reader holding the identity lock never sees a torn file.
//! Store-wide counters are mutated under the global lock only; entry files
//! are mutated under the owning identity lock, which the cache tier holds
//! across the whole read-or-write cycle.

use super::{DependencyRef, ExecutionMeta, Storage, StoreInfo};
use crate::error::Result;
use crate::execution::Execution;
use crate::function::Registry;
use crate::locker::Locker;
use crate::Value;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const INFO_FILE: &str = "info.json";
const FUNCTION_FILE: &str = "function.json";
const LOCKS_DIR: &str = "locks";

/// Per-function record: every dependency name ever observed for the
/// function, merged across sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FunctionInfo {
    #[serde(default)]
    dependencies: Vec<String>,
}

pub struct FileStorage {
    root: PathBuf,
    locker: Arc<Locker>,
}

impl FileStorage {
    pub fn new(root: PathBuf, locker: Arc<Locker>) -> Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root, locker })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn function_dir(&self, function: &str) -> PathBuf {
        self.root.join(function)
    }

    fn value_path(&self, function: &str, identity: &str) -> PathBuf {
        self.function_dir(function).join(format!("{identity}.value.json"))
    }

    fn meta_path(&self, function: &str, identity: &str) -> PathBuf {
        self.function_dir(function).join(format!("{identity}.meta.json"))
    }

    fn ready_path(&self, function: &str, identity: &str) -> PathBuf {
        self.function_dir(function).join(format!("{identity}.ready"))
    }

    fn write_json<T: Serialize>(&self, path: &Path, payload: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Suffix with pid and thread id so concurrent writers in other
        // processes never collide on the temp name.
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("entry");
        let temp_path = path.with_file_name(format!(
            "{file_name}.tmp.{}.{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(serde_json::to_string_pretty(payload)?.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    fn read_json<T: for<'de> Deserialize<'de>>(&self, path: &Path) -> Result<Option<T>> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn read_info(&self) -> Result<StoreInfo> {
        Ok(self
            .read_json(&self.root.join(INFO_FILE))?
            .unwrap_or_default())
    }

    fn write_info(&self, info: &StoreInfo) -> Result<()> {
        self.write_json(&self.root.join(INFO_FILE), info)
    }

    fn check_valid(
        &self,
        function: &str,
        identity: &str,
        override_boundary: u64,
        visited: &mut std::collections::HashSet<String>,
    ) -> Result<bool> {
        if !visited.insert(identity.to_string()) {
            return Ok(true);
        }
        if !self.ready_path(function, identity).exists() {
            return Ok(false);
        }
        let Some(meta) = self.read_meta(function, identity)? else {
            return Ok(false);
        };
        if meta.stamp < override_boundary {
            return Ok(false);
        }
        for dep in &meta.dependencies {
            // A dependency with no persisted record counts as infinitely
            // new, so the referencing entry is stale.
            let Some(dep_meta) = self.read_meta(&dep.function, &dep.identity)? else {
                return Ok(false);
            };
            if dep_meta.stamp > meta.stamp {
                return Ok(false);
            }
            if !self.check_valid(&dep.function, &dep.identity, override_boundary, visited)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // Merge the execution's dependency names into the per-function record,
    // under the function lock.
    fn merge_function_dependencies(&self, execution: &Execution) -> Result<()> {
        let function = execution.function().name().to_string();
        let observed: Vec<String> = execution
            .dependencies()
            .iter()
            .map(|dep| dep.function().name().to_string())
            .filter(|name| *name != function)
            .collect();

        let _guard = self.locker.lock(Some(&format!("fn.{function}")))?;
        let path = self.function_dir(&function).join(FUNCTION_FILE);
        let mut info: FunctionInfo = self.read_json(&path)?.unwrap_or_default();
        for name in observed {
            if !info.dependencies.contains(&name) {
                info.dependencies.push(name);
            }
        }
        self.write_json(&path, &info)
    }
}

impl Storage for FileStorage {
    fn read_value(&self, execution: &Execution) -> Result<Option<Value>> {
        let path = self.value_path(execution.function().name(), &execution.identity());
        self.read_json(&path)
    }

    fn read_meta(&self, function: &str, identity: &str) -> Result<Option<ExecutionMeta>> {
        self.read_json(&self.meta_path(function, identity))
    }

    fn is_valid(&self, execution: &Execution, override_boundary: u64) -> Result<bool> {
        self.check_valid(
            execution.function().name(),
            &execution.identity(),
            override_boundary,
            &mut std::collections::HashSet::new(),
        )
    }

    fn persist(&self, execution: &Execution, value: &Value, stamp: u64) -> Result<()> {
        let function = execution.function().name().to_string();
        let identity = execution.identity();

        let dependencies = execution
            .dependencies()
            .iter()
            .map(|dep| {
                let dep_function = dep.function().name().to_string();
                let dep_identity = dep.identity();
                let dep_stamp = self
                    .read_meta(&dep_function, &dep_identity)?
                    .map(|meta| meta.stamp);
                Ok(DependencyRef {
                    function: dep_function,
                    identity: dep_identity,
                    stamp: dep_stamp,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let hits = self
            .read_meta(&function, &identity)?
            .map(|meta| meta.hits)
            .unwrap_or(0);
        let meta = ExecutionMeta {
            function: function.clone(),
            stamp,
            created_at: Utc::now(),
            duration_ms: execution
                .duration()
                .map(|duration| duration.as_millis() as u64),
            hits,
            dependencies,
            record: execution.to_record(),
        };

        self.write_json(&self.value_path(&function, &identity), value)?;
        self.write_json(&self.meta_path(&function, &identity), &meta)?;
        // The marker goes last: its presence implies payload and metadata
        // are both in place.
        fs::write(self.ready_path(&function, &identity), b"")?;
        self.merge_function_dependencies(execution)?;
        debug!(operation = "persist", identity = %identity, stamp, "entry written");
        Ok(())
    }

    fn record_hit(&self, execution: &Execution) -> Result<()> {
        let function = execution.function().name();
        let identity = execution.identity();
        if let Some(mut meta) = self.read_meta(function, &identity)? {
            meta.hits += 1;
            self.write_json(&self.meta_path(function, &identity), &meta)?;
        }
        Ok(())
    }

    fn allocate_stamp(&self) -> Result<u64> {
        let _guard = self.locker.lock(None)?;
        let mut info = self.read_info()?;
        let stamp = info.next_stamp;
        info.next_stamp += 1;
        self.write_info(&info)?;
        Ok(stamp)
    }

    fn activate_override(&self) -> Result<u64> {
        let _guard = self.locker.lock(None)?;
        let mut info = self.read_info()?;
        info.override_boundary = info.next_stamp;
        self.write_info(&info)?;
        debug!(
            operation = "override",
            boundary = info.override_boundary,
            "existing entries marked stale"
        );
        Ok(info.override_boundary)
    }

    fn info(&self) -> Result<StoreInfo> {
        let _guard = self.locker.lock(None)?;
        self.read_info()
    }

    fn load_function_dependencies(&self, registry: &Registry, function: &str) -> Result<()> {
        let path = self.function_dir(function).join(FUNCTION_FILE);
        let Some(info) = self.read_json::<FunctionInfo>(&path)? else {
            return Ok(());
        };
        for dependency in info.dependencies {
            registry.add_edge(function, &dependency);
        }
        Ok(())
    }

    fn functions(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() || entry.file_name() == LOCKS_DIR {
                continue;
            }
            if path.join(FUNCTION_FILE).exists() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn executions(&self, function: &str) -> Result<Vec<ExecutionMeta>> {
        let mut metas = Vec::new();
        let dir = self.function_dir(function);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(metas),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if !name.ends_with(".meta.json") {
                continue;
            }
            match self.read_json::<ExecutionMeta>(&path)? {
                Some(meta) => metas.push(meta),
                None => warn!(path = %path.display(), "metadata file vanished mid-scan"),
            }
        }
        metas.sort_by_key(|meta| meta.stamp);
        Ok(metas)
    }

    fn size(&self) -> Result<usize> {
        let mut count = 0;
        for function in self.functions()? {
            for entry in fs::read_dir(self.function_dir(&function))? {
                let path = entry?.path();
                if path
                    .extension()
                    .is_some_and(|extension| extension == "ready")
                {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    fn clear(&self) -> Result<()> {
        for function in self.functions()? {
            fs::remove_dir_all(self.function_dir(&function))?;
        }
        let info_path = self.root.join(INFO_FILE);
        if info_path.exists() {
            fs::remove_file(info_path)?;
        }
        Ok(())
    }
}
