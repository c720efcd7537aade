//! Error taxonomy for the execution engine.
//!
//! Engine failures are local and synchronous: nothing is retried
//! automatically, and a failing execution leaves no cached trace. Errors
//! raised by a wrapped function body propagate unchanged through the
//! [`Error::Execution`] variant.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The same parameter was supplied both positionally and by keyword.
    /// Rejected before any execution is built.
    #[error("function `{function}`: argument `{name}` passed both positionally and by keyword")]
    ArgumentConflict { function: String, name: String },

    /// More positional arguments than the function declares parameters.
    #[error("function `{function}` accepts {expected} positional arguments, {given} given")]
    TooManyPositional {
        function: String,
        expected: usize,
        given: usize,
    },

    /// An execution reappeared in the active call chain of the current
    /// thread. Carries the full chain for diagnosis.
    #[error("execution cycle detected at `{head}`; active chain: {}", chain.join(" -> "))]
    CyclicExecution { head: String, chain: Vec<String> },

    /// An engine entry point was used before session setup.
    #[error("the execution engine has not been initialized")]
    NotInitialized,

    /// A function name could not be resolved in the registry.
    #[error("no function registered under `{0}`")]
    NotFound(String),

    /// A configuration value was rejected (e.g. a collection-valued
    /// global override).
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    /// A failure raised by a wrapped function body. Never cached; the next
    /// call for the same identity retries from scratch.
    #[error(transparent)]
    Execution(anyhow::Error),
}
