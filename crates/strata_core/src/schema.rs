//! Schema declaration: specs, upgrade steps, and the fluent builder.
//!
//! A [`SchemaSpec`] is the desired shape of a database: its version, its
//! stores, their indexes, and the ordered upgrade steps that carry
//! existing records across destructive shape changes. Specs are plain
//! validated data; all type-level cleverness of declaration lives in the
//! caller's hands, not here.

use crate::database::Connection;
use crate::error::{DbError, DbResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use strata_engine::{IndexShape, Key, KeyPath, StoreShape};

/// A captured record: its primary key and its value.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// The record's primary key.
    pub key: Key,
    /// The record value.
    pub value: Value,
}

impl Record {
    /// Creates a record.
    pub fn new(key: impl Into<Key>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// A data-transforming upgrade function.
///
/// Receives every captured record of the store being recreated, plus a
/// connection over the pre-upgrade database, and produces the records
/// the next step (or the rewrite phase) consumes.
pub type Transformer = Box<dyn Fn(Vec<Record>, &Connection) -> DbResult<Vec<Record>> + Send + Sync>;

/// A version-gated data transform.
///
/// The step applies when a migration crosses its `before_version`: that
/// is, when `actual_version < before_version <= desired_version`.
pub struct UpgradeStep {
    /// The version boundary this step migrates records up to.
    pub before_version: u64,
    /// The transform itself.
    pub transformer: Transformer,
}

impl fmt::Debug for UpgradeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeStep")
            .field("before_version", &self.before_version)
            .finish_non_exhaustive()
    }
}

/// The desired definition of one store.
#[derive(Debug, Default)]
pub struct StoreSpec {
    /// Key derivation shape.
    pub shape: StoreShape,
    /// Declared indexes by name.
    pub indexes: BTreeMap<String, IndexShape>,
    /// Ordered upgrade steps.
    pub upgrades: Vec<UpgradeStep>,
}

impl StoreSpec {
    /// The upgrade steps covering a migration from `actual` to
    /// `desired`, in ascending `before_version` order.
    pub fn covering_upgrades(&self, actual: u64, desired: u64) -> Vec<&UpgradeStep> {
        let mut steps: Vec<&UpgradeStep> = self
            .upgrades
            .iter()
            .filter(|step| actual < step.before_version && step.before_version <= desired)
            .collect();
        steps.sort_by_key(|step| step.before_version);
        steps
    }
}

/// The desired schema of a whole database.
///
/// Immutable once passed to [`crate::open`].
#[derive(Debug)]
pub struct SchemaSpec {
    /// The database name.
    pub name: String,
    /// The desired version.
    pub version: u64,
    /// Declared stores by name.
    pub stores: BTreeMap<String, StoreSpec>,
    /// Whether opening drops live stores the spec does not declare.
    pub delete_unused_stores: bool,
}

impl SchemaSpec {
    /// Starts a fluent builder for a database at the given version.
    pub fn builder(name: impl Into<String>, version: u64) -> SchemaBuilder {
        SchemaBuilder {
            name: name.into(),
            version,
            stores: BTreeMap::new(),
            delete_unused_stores: false,
        }
    }
}

/// Fluent builder for [`SchemaSpec`].
pub struct SchemaBuilder {
    name: String,
    version: u64,
    stores: BTreeMap<String, StoreSpec>,
    delete_unused_stores: bool,
}

impl SchemaBuilder {
    /// Declares a store, configured through the given closure.
    #[must_use]
    pub fn store(
        mut self,
        name: impl Into<String>,
        configure: impl FnOnce(StoreBuilder) -> StoreBuilder,
    ) -> Self {
        let builder = configure(StoreBuilder {
            spec: StoreSpec::default(),
        });
        self.stores.insert(name.into(), builder.spec);
        self
    }

    /// Sets whether undeclared live stores are dropped on open.
    #[must_use]
    pub fn delete_unused_stores(mut self, enable: bool) -> Self {
        self.delete_unused_stores = enable;
        self
    }

    /// Validates and produces the spec.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidSpec`] when the version is 0, a store
    /// name is empty, an auto-increment store declares a compound key
    /// path, a multi-entry index declares a compound key path, or a
    /// store declares two upgrade steps with the same `before_version`.
    pub fn build(self) -> DbResult<SchemaSpec> {
        if self.version == 0 {
            return Err(DbError::invalid_spec("schema version must be at least 1"));
        }
        for (name, store) in &self.stores {
            if name.is_empty() {
                return Err(DbError::invalid_spec("store name must not be empty"));
            }
            if store.shape.auto_increment
                && matches!(store.shape.key_path, Some(KeyPath::Compound(_)))
            {
                return Err(DbError::invalid_spec(format!(
                    "store {name}: auto-increment cannot combine with a compound key path"
                )));
            }
            for (index_name, index) in &store.indexes {
                if index.multi_entry && matches!(index.key_path, KeyPath::Compound(_)) {
                    return Err(DbError::invalid_spec(format!(
                        "index {index_name} on store {name}: multi-entry cannot use a compound key path"
                    )));
                }
            }
            let mut seen = Vec::new();
            for step in &store.upgrades {
                if seen.contains(&step.before_version) {
                    return Err(DbError::invalid_spec(format!(
                        "store {name}: duplicate upgrade step before version {}",
                        step.before_version
                    )));
                }
                seen.push(step.before_version);
            }
        }
        Ok(SchemaSpec {
            name: self.name,
            version: self.version,
            stores: self.stores,
            delete_unused_stores: self.delete_unused_stores,
        })
    }
}

/// Fluent builder for one store's spec.
pub struct StoreBuilder {
    spec: StoreSpec,
}

impl StoreBuilder {
    /// Sets the key path records derive their primary key from.
    #[must_use]
    pub fn key_path(mut self, key_path: impl Into<KeyPath>) -> Self {
        self.spec.shape.key_path = Some(key_path.into());
        self
    }

    /// Enables the store's integer key generator.
    #[must_use]
    pub fn auto_increment(mut self, enable: bool) -> Self {
        self.spec.shape.auto_increment = enable;
        self
    }

    /// Declares a plain index over the given key path.
    #[must_use]
    pub fn index(self, name: impl Into<String>, key_path: impl Into<KeyPath>) -> Self {
        self.index_with(name, IndexShape::new(key_path))
    }

    /// Declares an index with full control over its shape.
    #[must_use]
    pub fn index_with(mut self, name: impl Into<String>, shape: IndexShape) -> Self {
        self.spec.indexes.insert(name.into(), shape);
        self
    }

    /// Registers a data transform applied when a migration crosses
    /// `before_version`.
    #[must_use]
    pub fn upgrade(
        mut self,
        before_version: u64,
        transformer: impl Fn(Vec<Record>, &Connection) -> DbResult<Vec<Record>> + Send + Sync + 'static,
    ) -> Self {
        self.spec.upgrades.push(UpgradeStep {
            before_version,
            transformer: Box::new(transformer),
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_engine::IndexShape;

    #[test]
    fn builder_assembles_spec() {
        let spec = SchemaSpec::builder("app", 2)
            .store("users", |s| {
                s.key_path("id")
                    .index_with("by_name", IndexShape::new("name").unique())
                    .upgrade(2, |records, _| Ok(records))
            })
            .store("logs", |s| s.auto_increment(true))
            .delete_unused_stores(true)
            .build()
            .unwrap();

        assert_eq!(spec.version, 2);
        assert!(spec.delete_unused_stores);
        let users = spec.stores.get("users").unwrap();
        assert_eq!(users.shape.key_path, Some(KeyPath::single("id")));
        assert!(users.indexes.get("by_name").unwrap().unique);
        assert_eq!(users.upgrades.len(), 1);
        assert!(spec.stores.get("logs").unwrap().shape.auto_increment);
    }

    #[test]
    fn version_zero_is_rejected() {
        let err = SchemaSpec::builder("app", 0).build().unwrap_err();
        assert!(matches!(err, DbError::InvalidSpec { .. }));
    }

    #[test]
    fn compound_key_path_with_auto_increment_is_rejected() {
        let err = SchemaSpec::builder("app", 1)
            .store("bad", |s| {
                s.key_path(KeyPath::compound(["a", "b"])).auto_increment(true)
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidSpec { .. }));
    }

    #[test]
    fn duplicate_upgrade_steps_are_rejected() {
        let err = SchemaSpec::builder("app", 3)
            .store("users", |s| {
                s.key_path("id")
                    .upgrade(2, |records, _| Ok(records))
                    .upgrade(2, |records, _| Ok(records))
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidSpec { .. }));
    }

    #[test]
    fn covering_upgrades_filter_and_sort() {
        let spec = SchemaSpec::builder("app", 5)
            .store("users", |s| {
                s.key_path("id")
                    .upgrade(5, |records, _| Ok(records))
                    .upgrade(2, |records, _| Ok(records))
                    .upgrade(4, |records, _| Ok(records))
            })
            .build()
            .unwrap();

        let store = spec.stores.get("users").unwrap();
        let covering: Vec<u64> = store
            .covering_upgrades(2, 5)
            .iter()
            .map(|s| s.before_version)
            .collect();
        assert_eq!(covering, vec![4, 5]);
        assert!(store.covering_upgrades(5, 5).is_empty());
    }
}
