//! Unified Error Handling System
//!
//! Every fallible operation in the crate returns [`AdapterResult`]. The variants
//! mirror the failure classes of the adapter engine: structural configuration
//! problems surfaced at construction or add time, unresolved identifiers, name
//! collisions, merge-state violations and composition arity violations found
//! during a forward pass. None of them are transient; nothing is retried.

use std::fmt;
use thiserror::Error;

/// Unified error type for all adapter operations
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Invalid or incompatible configuration, or a nesting rule violation
    #[error("Configuration error in '{operation}': {reason}{}", context_suffix(.context))]
    Configuration {
        operation: String,
        reason: String,
        context: Option<String>,
    },

    /// A config identifier that is neither registered, a preset nor a known hash
    #[error("Unknown adapter config identifier '{identifier}'")]
    UnknownConfig { identifier: String },

    /// An adapter name that is not registered on the model
    #[error("No adapter with name '{name}' found{}", context_suffix(.context))]
    UnknownAdapter {
        name: String,
        context: Option<String>,
    },

    /// A head name that is not registered on the model
    #[error("Unknown head_name '{name}'")]
    UnknownHead { name: String },

    /// Name collision without explicit overwrite permission
    #[error("Conflict for '{name}': {reason}")]
    Conflict { name: String, reason: String },

    /// A prediction head with this name already exists
    #[error("Model already contains a head with name '{name}'. Use overwrite_ok=true to force overwrite")]
    DuplicateHead { name: String },

    /// Merge requested while a different adapter is merged at the same point
    #[error("Injection point '{location}' already has merged adapter '{merged}'; reset it before merging '{requested}'")]
    AlreadyMerged {
        location: String,
        merged: String,
        requested: String,
    },

    /// Arity or nesting violation discovered during a forward pass
    #[error("Invalid adapter setup at '{location}': {reason}")]
    Composition { location: String, reason: String },

    /// Device, dtype or invertibility precondition violated
    #[error("Precondition failed in '{operation}': {reason}")]
    Precondition { operation: String, reason: String },

    /// I/O errors while reading or writing bundles
    #[error("I/O error in '{operation}': {source}{}", path_suffix(.path))]
    IO {
        operation: String,
        path: Option<String>,
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialization errors
    #[error("Serialization error in '{operation}': {reason}")]
    Serialization { operation: String, reason: String },

    /// External library errors (candle)
    #[error("External error in {library} during '{operation}': {error}")]
    External {
        library: String,
        operation: String,
        error: String,
    },
}

fn context_suffix(context: &Option<String>) -> String {
    match context {
        Some(ctx) => format!(" (context: {})", ctx),
        None => String::new(),
    }
}

fn path_suffix(path: &Option<String>) -> String {
    match path {
        Some(p) => format!(" (path: {})", p),
        None => String::new(),
    }
}

/// Result type alias for unified error handling
pub type AdapterResult<T> = Result<T, AdapterError>;

impl AdapterError {
    /// Short, stable name of the error class
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterError::Configuration { .. } => "ConfigurationError",
            AdapterError::UnknownConfig { .. } => "UnknownConfigError",
            AdapterError::UnknownAdapter { .. } => "UnknownAdapterError",
            AdapterError::UnknownHead { .. } => "UnknownHeadError",
            AdapterError::Conflict { .. } => "ConflictError",
            AdapterError::DuplicateHead { .. } => "DuplicateHeadError",
            AdapterError::AlreadyMerged { .. } => "AlreadyMergedError",
            AdapterError::Composition { .. } => "CompositionError",
            AdapterError::Precondition { .. } => "PreconditionError",
            AdapterError::IO { .. } => "IOError",
            AdapterError::Serialization { .. } => "SerializationError",
            AdapterError::External { .. } => "ExternalError",
        }
    }
}

/// Trait for converting foreign errors with additional context
pub trait ErrorUnification<T> {
    fn with_config_context(self, operation: &str, context: Option<&str>) -> AdapterResult<T>;
    fn with_io_context(self, operation: &str, path: Option<&str>) -> AdapterResult<T>;
    fn with_tensor_context(self, operation: &str) -> AdapterResult<T>;
}

impl<T, E> ErrorUnification<T> for Result<T, E>
where
    E: fmt::Display,
{
    fn with_config_context(self, operation: &str, context: Option<&str>) -> AdapterResult<T> {
        self.map_err(|e| AdapterError::Configuration {
            operation: operation.to_string(),
            reason: e.to_string(),
            context: context.map(|s| s.to_string()),
        })
    }

    fn with_io_context(self, operation: &str, path: Option<&str>) -> AdapterResult<T> {
        self.map_err(|e| AdapterError::IO {
            operation: operation.to_string(),
            path: path.map(|s| s.to_string()),
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        })
    }

    fn with_tensor_context(self, operation: &str) -> AdapterResult<T> {
        self.map_err(|e| AdapterError::External {
            library: "candle-core".to_string(),
            operation: operation.to_string(),
            error: e.to_string(),
        })
    }
}

/// Convert AdapterError to candle_core::Error so adapters can run inside candle `Module`s
impl From<AdapterError> for candle_core::Error {
    fn from(err: AdapterError) -> Self {
        candle_core::Error::Msg(err.to_string())
    }
}

impl From<candle_core::Error> for AdapterError {
    fn from(err: candle_core::Error) -> Self {
        AdapterError::External {
            library: "candle-core".to_string(),
            operation: "tensor operation".to_string(),
            error: err.to_string(),
        }
    }
}

impl From<std::io::Error> for AdapterError {
    fn from(err: std::io::Error) -> Self {
        AdapterError::IO {
            operation: "I/O operation".to_string(),
            path: None,
            source: err,
        }
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        AdapterError::Serialization {
            operation: "JSON parsing".to_string(),
            reason: err.to_string(),
        }
    }
}

/// Create a configuration error
#[macro_export]
macro_rules! config_error {
    ($operation:expr, $msg:expr) => {
        $crate::core::AdapterError::Configuration {
            operation: $operation.to_string(),
            reason: $msg.to_string(),
            context: None,
        }
    };
    ($operation:expr, $msg:expr, $context:expr) => {
        $crate::core::AdapterError::Configuration {
            operation: $operation.to_string(),
            reason: $msg.to_string(),
            context: Some($context.to_string()),
        }
    };
}

/// Create a composition error
#[macro_export]
macro_rules! composition_error {
    ($location:expr, $msg:expr) => {
        $crate::core::AdapterError::Composition {
            location: $location.to_string(),
            reason: $msg.to_string(),
        }
    };
}

/// Create a precondition error
#[macro_export]
macro_rules! precondition_error {
    ($operation:expr, $msg:expr) => {
        $crate::core::AdapterError::Precondition {
            operation: $operation.to_string(),
            reason: $msg.to_string(),
        }
    };
}

/// Predefined error builders for lookup failures
pub mod lookup_errors {
    use super::*;

    pub fn unknown_adapter(name: &str) -> AdapterError {
        AdapterError::UnknownAdapter {
            name: name.to_string(),
            context: None,
        }
    }

    pub fn unknown_adapter_in(name: &str, context: &str) -> AdapterError {
        AdapterError::UnknownAdapter {
            name: name.to_string(),
            context: Some(context.to_string()),
        }
    }

    pub fn unknown_head(name: &str) -> AdapterError {
        AdapterError::UnknownHead {
            name: name.to_string(),
        }
    }

    pub fn unknown_config(identifier: &str) -> AdapterError {
        AdapterError::UnknownConfig {
            identifier: identifier.to_string(),
        }
    }
}

/// Predefined error builders for bundle files
pub mod bundle_errors {
    use super::*;

    pub fn file_not_found(path: &str, source: std::io::Error) -> AdapterError {
        AdapterError::IO {
            operation: "bundle loading".to_string(),
            path: Some(path.to_string()),
            source,
        }
    }

    pub fn invalid_json(file: &str, error: &str) -> AdapterError {
        AdapterError::Serialization {
            operation: format!("JSON parsing of {}", file),
            reason: error.to_string(),
        }
    }

    pub fn missing_tensor(key: &str, file: &str) -> AdapterError {
        AdapterError::Configuration {
            operation: "bundle weight loading".to_string(),
            reason: format!("missing tensor '{}'", key),
            context: Some(format!("file: {}", file)),
        }
    }
}

/// Ensures two tensors live on the same device with the same dtype
pub fn ensure_compatible(
    operation: &str,
    base: &candle_core::Tensor,
    adapter: &candle_core::Tensor,
) -> AdapterResult<()> {
    if !base.device().same_device(adapter.device()) {
        return Err(AdapterError::Precondition {
            operation: operation.to_string(),
            reason: format!(
                "adapter parameters on {:?} but base weight on {:?}",
                adapter.device().location(),
                base.device().location()
            ),
        });
    }
    if base.dtype() != adapter.dtype() {
        return Err(AdapterError::Precondition {
            operation: operation.to_string(),
            reason: format!(
                "adapter parameters are {:?} but base weight is {:?}",
                adapter.dtype(),
                base.dtype()
            ),
        });
    }
    Ok(())
}
