//! # Strata Engine
//!
//! Storage engine interface and reference implementation for StrataDB.
//!
//! This crate defines the contract StrataDB's schema-migration and query
//! layer is written against:
//!
//! - Versioned named databases of keyed record stores, with schema
//!   mutation confined to the exclusive upgrade transaction an open runs
//!   when it raises the version
//! - Scoped read-only/read-write transactions with commit/abort
//! - Secondary indexes (unique, multi-entry) over derived keys
//! - Strictly sequential cursors with in-place update and delete
//!
//! ## Available Engines
//!
//! - [`MemoryEngine`] - in-process maps, for testing and ephemeral use
//!
//! Engines backed by durable storage implement the same traits; this
//! crate owns no file format.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod key;
mod memory;
mod shape;

pub use backend::{
    Connection, Cursor, CursorRow, Direction, Engine, Mode, Source, Transaction, UpgradeHook,
    UpgradeTransaction,
};
pub use error::{EngineError, EngineResult};
pub use key::{Key, KeyPath, KeyRange};
pub use memory::MemoryEngine;
pub use shape::{DatabaseShape, IndexShape, StoreDescriptor, StoreShape};
