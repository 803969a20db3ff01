use std::fmt;

use thiserror::Error;

use crate::model::EntityKind;

/// Convenient alias for fallible results returned throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Error type covering the different failure cases that can occur while the
/// engine fetches, maps, links, or persists records.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A remote fetch or write failed (transport, authentication, rate
    /// limiting, or a response that could not be decoded).
    #[error("remote API error: {0}")]
    RemoteApi(String),

    /// A remote field could not be coerced into the local attribute, or a
    /// required field was absent.
    #[error("cannot map {attribute} of {kind} row {external_id}: {message}")]
    Mapping {
        kind: EntityKind,
        external_id: String,
        attribute: String,
        message: String,
    },

    /// A relation pointed at an entity kind that has not been reconciled yet
    /// in the current run.
    #[error("{kind} depends on {depends_on}, which has not been reconciled in this run")]
    DependencyOrder {
        kind: EntityKind,
        depends_on: EntityKind,
    },

    /// A relation referenced an external identifier that does not exist
    /// locally and may not be created lazily.
    #[error("{kind} row {external_id} references missing {target} {missing} via {relation}")]
    ReferentialIntegrity {
        kind: EntityKind,
        external_id: String,
        relation: String,
        target: EntityKind,
        missing: String,
    },

    /// Errors bubbled up from the SQLite store.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Raised when a stored record cannot be decoded.
    #[error("corrupt store: {0}")]
    Corrupt(String),

    /// Wrapper for IO failures such as reading configuration files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Raised when JSON parsing or serialization fails.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Raised when the configuration file is not valid TOML.
    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Raised when the configuration is well-formed but inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Errors bubbled up from the Excel reader implementation.
    #[error("workbook read error: {0}")]
    Workbook(#[from] calamine::XlsxError),

    /// Errors bubbled up from the Excel writer implementation.
    #[error("workbook write error: {0}")]
    WorkbookWrite(#[from] rust_xlsxwriter::XlsxError),

    /// Raised when the tracing subscriber fails to initialise.
    #[error("failed to initialise logging: {0}")]
    Logging(String),
}

impl SyncError {
    /// Classifies the error for run summaries.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::RemoteApi(_) => ErrorKind::RemoteApi,
            SyncError::Mapping { .. } => ErrorKind::Mapping,
            SyncError::DependencyOrder { .. } => ErrorKind::DependencyOrder,
            SyncError::ReferentialIntegrity { .. } => ErrorKind::ReferentialIntegrity,
            SyncError::InvalidConfig(_) | SyncError::Config(_) => ErrorKind::Config,
            _ => ErrorKind::Internal,
        }
    }

    /// Fatal errors abort a run regardless of the active failure policy.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::DependencyOrder | ErrorKind::Config)
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(error: reqwest::Error) -> Self {
        SyncError::RemoteApi(error.to_string())
    }
}

/// Coarse classification of [`SyncError`] used in failure summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    RemoteApi,
    Mapping,
    DependencyOrder,
    ReferentialIntegrity,
    Config,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::RemoteApi => "RemoteApiError",
            ErrorKind::Mapping => "MappingError",
            ErrorKind::DependencyOrder => "DependencyOrderError",
            ErrorKind::ReferentialIntegrity => "ReferentialIntegrityError",
            ErrorKind::Config => "ConfigError",
            ErrorKind::Internal => "InternalError",
        };
        f.write_str(label)
    }
}
