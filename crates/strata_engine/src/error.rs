//! Error types for engine operations.

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur inside a storage engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine could not open the database at all.
    #[error("engine unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },

    /// The connection has been closed.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The named object store does not exist.
    #[error("store not found: {name}")]
    StoreNotFound {
        /// Name of the store.
        name: String,
    },

    /// The named index does not exist on the store.
    #[error("index not found: {index} on store {store}")]
    IndexNotFound {
        /// Store the index was looked up on.
        store: String,
        /// Name of the index.
        index: String,
    },

    /// A store with this name already exists.
    #[error("store already exists: {name}")]
    StoreExists {
        /// Name of the store.
        name: String,
    },

    /// An index with this name already exists on the store.
    #[error("index already exists: {index} on store {store}")]
    IndexExists {
        /// Store the index was created on.
        store: String,
        /// Name of the index.
        index: String,
    },

    /// An open requested a version below the database's current version.
    ///
    /// Database versions are monotonically non-decreasing; downgrades are
    /// never performed.
    #[error("requested version {requested} is below current version {current}")]
    VersionBelowCurrent {
        /// The version passed to open.
        requested: u64,
        /// The database's live version.
        current: u64,
    },

    /// A key was missing, underivable, or supplied where it must not be.
    #[error("invalid key: {message}")]
    InvalidKey {
        /// Description of the problem.
        message: String,
    },

    /// A primary-key or unique-index constraint was violated.
    #[error("constraint violation: {message}")]
    ConstraintViolation {
        /// Description of the violated constraint.
        message: String,
    },

    /// A write was attempted inside a read-only transaction.
    #[error("write attempted in read-only transaction")]
    ReadOnlyTransaction,

    /// An operation named a store outside the transaction's scope.
    #[error("store {store} is outside the transaction scope")]
    OutOfScope {
        /// The out-of-scope store.
        store: String,
    },

    /// A cursor operation was issued with no current record.
    #[error("cursor is not positioned on a record")]
    CursorNotPositioned,

    /// Internal engine invariant violation.
    #[error("internal engine error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

impl EngineError {
    /// Creates an engine-unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a store-not-found error.
    pub fn store_not_found(name: impl Into<String>) -> Self {
        Self::StoreNotFound { name: name.into() }
    }

    /// Creates an index-not-found error.
    pub fn index_not_found(store: impl Into<String>, index: impl Into<String>) -> Self {
        Self::IndexNotFound {
            store: store.into(),
            index: index.into(),
        }
    }

    /// Creates an invalid-key error.
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey {
            message: message.into(),
        }
    }

    /// Creates a constraint-violation error.
    pub fn constraint(message: impl Into<String>) -> Self {
        Self::ConstraintViolation {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
