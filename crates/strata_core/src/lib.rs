//! # Strata Core
//!
//! Schema migration and query layer for StrataDB.
//!
//! A caller declares the desired shape of a database as a versioned
//! [`SchemaSpec`]; [`open`] reconciles it against whatever is live in
//! the engine, migrating data through the spec's upgrade steps where a
//! store's shape changed, and hands back a [`Connection`] whose store
//! and index handles carry the query surface.
//!
//! ## Example
//!
//! ```rust
//! use serde_json::json;
//! use strata_core::{open, SchemaSpec};
//! use strata_engine::MemoryEngine;
//!
//! # fn main() -> strata_core::DbResult<()> {
//! let engine = MemoryEngine::new();
//! let spec = SchemaSpec::builder("app", 1)
//!     .store("users", |s| s.key_path("id").index("by_email", "email"))
//!     .build()?;
//!
//! let db = open(&engine, spec)?;
//! let users = db.store("users")?;
//! users.add(&json!({ "id": 1, "email": "ada@example.com" }))?;
//! assert_eq!(users.count(None)?, 1);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cursor;
mod database;
mod error;
mod pipeline;
mod query;
mod reconcile;
mod schema;

pub use cursor::{Decision, ScanEntry};
pub use database::{Connection, IndexHandle, StoreHandle};
pub use error::{DbError, DbResult};
pub use query::{Matcher, Patch};
pub use reconcile::{reconcile, SchemaDelta};
pub use schema::{
    Record, SchemaBuilder, SchemaSpec, StoreBuilder, StoreSpec, Transformer, UpgradeStep,
};

use strata_engine::Engine;

/// Opens (creating or migrating as needed) the database the spec
/// describes, returning a connection at the spec's version.
///
/// This runs the whole migration pipeline: probing the live version,
/// diffing the live schema against the spec, capturing and transforming
/// the data of stores whose shape changed, applying the schema delta
/// inside the engine's upgrade transaction, and rewriting the captured
/// data.
///
/// # Errors
///
/// - [`DbError::Engine`] when the engine rejects an open or a
///   transaction, including a live version above the spec's
/// - [`DbError::TransformerFailed`] when an upgrade step errors; this
///   surfaces before anything destructive, leaving the database at its
///   pre-migration version
pub fn open(engine: &dyn Engine, spec: SchemaSpec) -> DbResult<Connection> {
    pipeline::MigrationPipeline::new(engine, spec).run()
}
