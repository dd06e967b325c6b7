//! Core Business Logic Layer
//!
//! Error handling and bundle I/O shared by every other module.

pub mod config_loader;
pub mod unified_error;

pub use config_loader::{rename_adapter_keys, BundleLoader};
pub use unified_error::{
    bundle_errors, ensure_compatible, lookup_errors, AdapterError, AdapterResult,
    ErrorUnification,
};

#[cfg(test)]
pub mod unified_error_test;
