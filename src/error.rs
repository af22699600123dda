//! Error types for loading, entering, and configuring a module.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::bootstrap::BootState;

/// Failure while fetching, validating, linking, or instantiating a module.
///
/// A `LoadError` always means no handle was produced.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to fetch module from '{location}': {source}")]
    Fetch {
        location: String,
        #[source]
        source: io::Error,
    },

    #[error("'{location}' is not a valid module: {reason}")]
    Malformed { location: String, reason: String },

    #[error("module '{location}' imports {module}.{name}, which the host does not provide")]
    UnresolvedImport {
        location: String,
        module: String,
        name: String,
    },

    #[error(
        "module '{location}' needs {requested} bytes of initial memory, limit is {limit} bytes"
    )]
    OutOfMemory {
        location: String,
        requested: u64,
        limit: u64,
    },

    #[error("failed to instantiate '{location}': {source:#}")]
    Instantiate {
        location: String,
        #[source]
        source: wasmtime::Error,
    },

    #[error("loading '{location}' timed out after {after:?}")]
    TimedOut { location: String, after: Duration },

    #[error("loading '{location}' was cancelled")]
    Cancelled { location: String },

    #[error("failed to register host bindings: {source:#}")]
    Host {
        #[source]
        source: wasmtime::Error,
    },
}

/// Failure while entering a loaded module.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("module has no exported function named '{name}'")]
    NotFound { name: String },

    #[error("entry point '{name}' must take no parameters, it takes {params}")]
    BadSignature { name: String, params: usize },

    #[error("entry point '{name}' failed: {source:#}")]
    EntryFailed {
        name: String,
        #[source]
        source: wasmtime::Error,
    },
}

impl InvokeError {
    /// The wasm trap behind an `EntryFailed`, if the fault was a trap.
    pub fn trap_code(&self) -> Option<wasmtime::Trap> {
        match self {
            InvokeError::EntryFailed { source, .. } => source.downcast_ref::<wasmtime::Trap>().copied(),
            _ => None,
        }
    }
}

/// Failure while reading or applying the build configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading config file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("rule pattern '{pattern}' does not compile: {source}")]
    InvalidRule {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("copy pattern #{index} has an empty 'from'")]
    EmptyCopySource { index: usize },

    #[error("error copying '{}' to '{}': {source}", from.display(), to.display())]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Top-level error of a bootstrap run.
#[derive(Debug, Error)]
pub enum BootError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("bootstrap already ran (state: {state})")]
    AlreadyStarted { state: BootState },
}
