//! Layered scalar configuration.
//!
//! Global configuration values act as implicit arguments: any function
//! parameter (or transitively dependent argument) with a matching key is
//! resolved from here when neither the caller nor an active ancestor
//! supplies it. Lookup order is innermost scope first, then outer scopes,
//! then the session globals, then the process environment (key uppercased,
//! value coerced).
//!
//! Only scalar values are accepted; collection-valued overrides are
//! rejected so configuration stays printable and identity-hash friendly.

use crate::error::{Error, Result};
use crate::{Kwargs, Value};
use std::sync::{Arc, PoisonError, RwLock};

pub struct Configuration {
    // Layer 0 holds the session globals; scopes push and pop above it.
    layers: RwLock<Vec<Kwargs>>,
}

impl Configuration {
    pub fn new(globals: Kwargs) -> Result<Self> {
        ensure_scalars(&globals)?;
        Ok(Self {
            layers: RwLock::new(vec![globals]),
        })
    }

    pub fn empty() -> Self {
        Self {
            layers: RwLock::new(vec![Kwargs::new()]),
        }
    }

    /// Resolve a key, innermost scope first, falling back to the
    /// environment.
    pub fn get(&self, key: &str) -> Option<Value> {
        let layers = self.layers.read().unwrap_or_else(PoisonError::into_inner);
        for layer in layers.iter().rev() {
            if let Some(value) = layer.get(key) {
                return Some(value.clone());
            }
        }
        drop(layers);
        std::env::var(key.to_uppercase())
            .ok()
            .map(|raw| coerce(&raw))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Push a nested override scope. The returned guard pops the scope when
    /// dropped, restoring the previous configuration.
    pub fn push(self: &Arc<Self>, overrides: Kwargs) -> Result<ConfigScope> {
        ensure_scalars(&overrides)?;
        self.layers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(overrides);
        Ok(ConfigScope {
            configuration: Arc::clone(self),
        })
    }

    fn pop(&self) {
        let mut layers = self.layers.write().unwrap_or_else(PoisonError::into_inner);
        if layers.len() > 1 {
            layers.pop();
        }
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::empty()
    }
}

/// Guard for a nested configuration scope.
pub struct ConfigScope {
    configuration: Arc<Configuration>,
}

impl Drop for ConfigScope {
    fn drop(&mut self) {
        self.configuration.pop();
    }
}

/// Coerce a raw environment string the way command-line values are read:
/// booleans, then integers, then floats, else the string itself.
pub fn coerce(raw: &str) -> Value {
    match raw {
        "True" | "true" => return Value::Bool(true),
        "False" | "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(int) = raw.parse::<i64>() {
        return Value::from(int);
    }
    if let Ok(float) = raw.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(float) {
            return Value::Number(number);
        }
    }
    Value::String(raw.to_string())
}

fn ensure_scalars(kwargs: &Kwargs) -> Result<()> {
    for (key, value) in kwargs {
        if matches!(value, Value::Array(_) | Value::Object(_)) {
            return Err(Error::InvalidConfiguration(format!(
                "configuration value for `{key}` must be a scalar"
            )));
        }
    }
    Ok(())
}
