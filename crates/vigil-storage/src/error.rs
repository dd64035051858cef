/// Errors that can occur within the storage layer.
///
/// Only [`StorageError::Sqlite`] can be transient; everything else describes a
/// request the backend will keep rejecting, so callers should report it rather
/// than retry. A conditional update whose expectation does not hold is not an
/// error at all, it returns `Ok(false)`.
///
/// # Examples
///
/// ```rust
/// use vigil_storage::error::StorageError;
///
/// let err = StorageError::UnknownField {
///     entity: "alarm",
///     field: "colour".to_string(),
/// };
/// assert!(err.to_string().contains("colour"));
/// assert!(!err.is_retryable());
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A filter, ordering or update referenced a field the entity does not have.
    #[error("Storage: unknown field '{field}' on {entity}")]
    UnknownField { entity: &'static str, field: String },

    /// The filter tree is structurally invalid (bad operator, wrong arity, ...).
    #[error("Storage: malformed filter: {0}")]
    MalformedFilter(String),

    /// A filter or update value cannot be used with the field it targets.
    #[error("Storage: invalid value for field '{field}': {reason}")]
    InvalidFilterValue { field: String, reason: String },

    /// The backend does not declare the capability the request needs.
    #[error("Storage: unsupported capability: {0}")]
    UnsupportedCapability(String),

    /// The pagination marker no longer resolves; pagination must restart.
    #[error("Storage: marker '{marker}' not found for {entity}")]
    MarkerNotFound { entity: &'static str, marker: String },

    #[error("Storage: alarm {0} not found")]
    AlarmNotFound(String),

    #[error("Storage: alarm {0} already exists")]
    AlarmExists(String),

    #[error("Storage: invalid quota limit {limit} for resource '{resource}'")]
    InvalidQuota { resource: String, limit: i64 },

    /// An underlying SQLite error.
    #[error("Storage: SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Storage: I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization failure (rule and action columns).
    #[error("Storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored column could not be decoded back into the data model.
    #[error("Storage: corrupt value in column '{column}': {reason}")]
    Corrupt { column: &'static str, reason: String },

    #[error("Storage: {0}")]
    Other(String),
}

impl StorageError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
