//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
///
/// Write-write conflicts are not errors: `DataTable::update` reports them as
/// `false`. Unsupported attribute widths reaching the byte dispatch are
/// layout defects and panic instead of surfacing here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Configuration value rejected by validation
    #[error("Invalid configuration for '{field}': {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    /// Block layout cannot be constructed for the given schema
    #[error("Invalid block layout: {0}")]
    InvalidLayout(String),

    /// Block store has no block left to hand out
    #[error("Block store exhausted: {capacity} blocks outstanding")]
    BlockStoreExhausted { capacity: usize },

    /// Global allocator could not provide an aligned block
    #[error("Failed to allocate {size} bytes aligned to {align}")]
    AllocationFailed { size: usize, align: usize },

    /// Table block directory is full
    #[error("Table is full: block directory holds at most {max_blocks} blocks")]
    TableFull { max_blocks: usize },

    /// Projection list names a column the layout does not expose
    #[error("Column {column} out of range (layout has {num_columns} columns, column 0 is reserved)")]
    ColumnOutOfRange { column: u16, num_columns: u16 },

    /// Projected row buffer is smaller than its header requires
    #[error("Buffer too small: required {required} bytes, got {actual}")]
    BufferTooSmall { required: usize, actual: usize },

    /// Projected row bytes do not describe a valid row
    #[error("Malformed projected row: {0}")]
    MalformedRow(String),

    /// Configuration could not be parsed
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationError(err.to_string())
    }
}
