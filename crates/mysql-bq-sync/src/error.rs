//! Error types for the sync library.

use thiserror::Error;

/// Exit code for configuration errors.
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code when the run finished but some tables or chunks did not load.
pub const EXIT_PARTIAL_FAILURE: u8 = 2;
/// Exit code for source database hard failures.
pub const EXIT_SOURCE_ERROR: u8 = 3;
/// Exit code for destination warehouse hard failures.
pub const EXIT_DESTINATION_ERROR: u8 = 4;
/// Exit code when the run was cancelled.
pub const EXIT_CANCELLED: u8 = 5;
/// Exit code for file system errors.
pub const EXIT_IO_ERROR: u8 = 7;

/// Main error type for sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source failure worth retrying (connection loss, timeout).
    #[error("Transient source error on {system}: {message}")]
    TransientSource { system: String, message: String },

    /// The source connection dropped mid-operation. Retried on a new connection.
    #[error("Lost connection to {system}: {message}")]
    ConnectionLost { system: String, message: String },

    /// Source failure that retrying will not fix (syntax, permission, missing table).
    #[error("Source error on {system}: {message}")]
    PermanentSource { system: String, message: String },

    /// No connection could be acquired from a source pool.
    #[error("Connection pool exhausted for {system}: {message}")]
    PoolExhausted { system: String, message: String },

    /// Writing a chunk into the destination failed.
    #[error("Destination write failed for table {table}: {message}")]
    DestinationWrite { table: String, message: String },

    /// Any other destination call failed (DDL, delete, schema lookup).
    #[error("Destination error: {0}")]
    Destination(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run was cancelled (SIGINT, etc.)
    #[error("Sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Create a transient source error.
    pub fn transient(system: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::TransientSource {
            system: system.into(),
            message: message.into(),
        }
    }

    /// Create a lost-connection error.
    pub fn connection_lost(system: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::ConnectionLost {
            system: system.into(),
            message: message.into(),
        }
    }

    /// Create a permanent source error.
    pub fn permanent(system: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::PermanentSource {
            system: system.into(),
            message: message.into(),
        }
    }

    /// Create a destination write error.
    pub fn write(table: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::DestinationWrite {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Whether the failed operation may succeed if attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::TransientSource { .. } | SyncError::ConnectionLost { .. }
        )
    }

    /// Whether this error must stop the whole run rather than one table.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, SyncError::Config(_) | SyncError::PoolExhausted { .. })
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            SyncError::Config(_) | SyncError::Yaml(_) | SyncError::Json(_) => EXIT_CONFIG_ERROR,
            SyncError::TransientSource { .. }
            | SyncError::ConnectionLost { .. }
            | SyncError::PermanentSource { .. }
            | SyncError::PoolExhausted { .. } => EXIT_SOURCE_ERROR,
            SyncError::DestinationWrite { .. } | SyncError::Destination(_) => {
                EXIT_DESTINATION_ERROR
            }
            SyncError::Cancelled => EXIT_CANCELLED,
            SyncError::Io(_) => EXIT_IO_ERROR,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
