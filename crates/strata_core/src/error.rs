//! Error types for StrataDB core.

use strata_engine::EngineError;
use thiserror::Error;

/// Result type for core operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors surfaced by the migration and query layer.
///
/// "Record not found" is never an error here: lookups return `None`.
/// Likewise a scan ended early by an `Abort` decision completes
/// normally; an involuntary engine abort surfaces as [`DbError::Engine`].
#[derive(Debug, Error)]
pub enum DbError {
    /// The storage engine failed.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// A schema spec failed validation before any engine work began.
    #[error("invalid schema spec: {message}")]
    InvalidSpec {
        /// Description of the problem.
        message: String,
    },

    /// An upgrade-step transformer failed or returned malformed data.
    ///
    /// Raised before the destructive reopen, so the database is still at
    /// its pre-migration version when this surfaces.
    #[error("upgrade transformer for store {store} (before version {before_version}) failed: {message}")]
    TransformerFailed {
        /// The store being migrated.
        store: String,
        /// The step's version gate.
        before_version: u64,
        /// Description of the failure.
        message: String,
    },

    /// A store was requested that the schema spec does not declare.
    #[error("store not declared in schema spec: {name}")]
    UndeclaredStore {
        /// The requested store name.
        name: String,
    },

    /// An index was requested that the schema spec does not declare.
    #[error("index not declared in schema spec: {index} on store {store}")]
    UndeclaredIndex {
        /// The store the index was looked up on.
        store: String,
        /// The requested index name.
        index: String,
    },
}

impl DbError {
    /// Creates an invalid-spec error.
    pub fn invalid_spec(message: impl Into<String>) -> Self {
        Self::InvalidSpec {
            message: message.into(),
        }
    }

    /// Creates a transformer-failed error.
    pub fn transformer_failed(
        store: impl Into<String>,
        before_version: u64,
        message: impl Into<String>,
    ) -> Self {
        Self::TransformerFailed {
            store: store.into(),
            before_version,
            message: message.into(),
        }
    }
}
