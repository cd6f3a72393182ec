//! Live-schema descriptors.
//!
//! These structs describe the shape of a database as the engine actually
//! holds it: which stores exist, how each derives its keys, and which
//! indexes sit on top. They serve double duty as the parameters to the
//! schema operations on an upgrade transaction and as the input the
//! schema reconciler diffs a desired spec against.

use crate::key::KeyPath;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a store derives primary keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreShape {
    /// Field path keys are derived from, if any.
    pub key_path: Option<KeyPath>,
    /// Whether the store generates integer keys for records without one.
    pub auto_increment: bool,
}

impl StoreShape {
    /// A store with explicit caller-supplied keys.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the key path.
    #[must_use]
    pub fn with_key_path(mut self, key_path: impl Into<KeyPath>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    /// Enables the key generator.
    #[must_use]
    pub fn with_auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }
}

/// The definition of a secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexShape {
    /// Field path the index key is derived from.
    pub key_path: KeyPath,
    /// Whether two records may share one index key.
    pub unique: bool,
    /// Whether an array value fans out to one entry per element.
    pub multi_entry: bool,
}

impl IndexShape {
    /// A plain (non-unique, single-entry) index over the given path.
    pub fn new(key_path: impl Into<KeyPath>) -> Self {
        Self {
            key_path: key_path.into(),
            unique: false,
            multi_entry: false,
        }
    }

    /// Makes the index unique.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Makes the index multi-entry.
    #[must_use]
    pub fn multi_entry(mut self) -> Self {
        self.multi_entry = true;
        self
    }
}

/// A store as the engine holds it: shape plus live indexes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDescriptor {
    /// Key derivation shape.
    pub shape: StoreShape,
    /// Live indexes by name.
    pub indexes: BTreeMap<String, IndexShape>,
}

/// The full live schema of one database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseShape {
    /// Live stores by name.
    pub stores: BTreeMap<String, StoreDescriptor>,
}
