//! Error types for the Leakforge harness
//!
//! This module provides structured error definitions using thiserror, with
//! anyhow used for the bodies of submitted tasks.

use crate::memory::MemoryFault;
use thiserror::Error;

/// Main error type for Leakforge operations
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Work was submitted to a pool that has already been shut down
    #[error("Worker pool is shut down; task rejected")]
    PoolShutdown,

    /// A worker thread could not be started
    #[error("Failed to spawn worker: {0}")]
    WorkerSpawn(String),

    /// Configuration values are out of range or inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration source could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML rendering error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// A buffer was misused outside of a deliberately injected fault
    #[error("Memory fault: {0}")]
    Memory(#[from] MemoryFault),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Leakforge operations
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Convert anyhow::Error to HarnessError
impl From<anyhow::Error> for HarnessError {
    fn from(err: anyhow::Error) -> Self {
        HarnessError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BufferHandle;

    #[test]
    fn test_error_display() {
        let err = HarnessError::PoolShutdown;
        assert_eq!(err.to_string(), "Worker pool is shut down; task rejected");

        let err = HarnessError::InvalidConfig("workers must be at least 1".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid configuration: workers must be at least 1"
        );
    }

    #[test]
    fn test_error_conversion() {
        let fault = MemoryFault::DoubleRelease {
            handle: BufferHandle::new(3, 1),
        };
        let err: HarnessError = fault.into();
        assert!(matches!(err, HarnessError::Memory(MemoryFault::DoubleRelease { .. })));

        let err: HarnessError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, HarnessError::Other(ref msg) if msg == "boom"));
    }
}
