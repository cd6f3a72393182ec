//! Schema reconciliation: diffing a desired spec against the live schema.
//!
//! The reconciler is pure: it never touches the engine. It reads the
//! desired [`SchemaSpec`], the live [`DatabaseShape`], and the live
//! version, and produces the change sets the migration pipeline applies
//! inside the upgrade transaction.

use crate::schema::SchemaSpec;
use std::collections::BTreeMap;
use strata_engine::{DatabaseShape, KeyPath};

/// The change sets reconciliation produces.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SchemaDelta {
    /// Stores to create (absent from the live schema).
    pub create: Vec<String>,
    /// Stores to drop and re-create, replaying captured data.
    pub recreate: Vec<String>,
    /// Live stores absent from the spec; dropped only when the spec
    /// sets `delete_unused_stores`.
    pub drop: Vec<String>,
    /// Per store, the indexes to create or replace.
    pub indexes: BTreeMap<String, Vec<String>>,
}

impl SchemaDelta {
    /// Whether all four change sets are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.create.is_empty()
            && self.recreate.is_empty()
            && self.drop.is_empty()
            && self.indexes.is_empty()
    }

    fn flag_index(&mut self, store: &str, index: &str) {
        self.indexes
            .entry(store.to_string())
            .or_default()
            .push(index.to_string());
    }
}

fn serialized(key_path: &Option<KeyPath>) -> String {
    key_path.as_ref().map(KeyPath::serialize).unwrap_or_default()
}

/// Diffs the desired spec against the live schema at `actual_version`.
///
/// The rules, store by store:
///
/// - Missing from the live schema: create, with every declared index
///   flagged unconditionally.
/// - Present: recreate only when the spec declares a shape, an upgrade
///   step covers the version span, and the live shape differs. A shape
///   mismatch with no covering upgrade step never recreates; silently
///   destroying data on a bare version bump is exactly what this
///   guards against.
/// - Indexes on kept stores are flagged when missing or when any of
///   `multi_entry`, serialized key path, or `unique` differ; flagged
///   indexes are dropped and re-created by the pipeline.
/// - Live stores the spec does not declare become drop candidates.
pub fn reconcile(spec: &SchemaSpec, live: &DatabaseShape, actual_version: u64) -> SchemaDelta {
    let mut delta = SchemaDelta::default();

    for (name, store_spec) in &spec.stores {
        let Some(live_store) = live.stores.get(name) else {
            delta.create.push(name.clone());
            for index in store_spec.indexes.keys() {
                delta.flag_index(name, index);
            }
            continue;
        };

        let no_declared_shape = store_spec.shape.key_path.is_none()
            && live_store.shape.key_path.is_none()
            && !live_store.shape.auto_increment;
        let has_covering_upgrade = !store_spec
            .covering_upgrades(actual_version, spec.version)
            .is_empty();
        let shape_matches = serialized(&live_store.shape.key_path)
            == serialized(&store_spec.shape.key_path)
            && live_store.shape.auto_increment == store_spec.shape.auto_increment;

        if !no_declared_shape && has_covering_upgrade && !shape_matches {
            delta.recreate.push(name.clone());
            for index in store_spec.indexes.keys() {
                delta.flag_index(name, index);
            }
            continue;
        }

        for (index_name, index_spec) in &store_spec.indexes {
            match live_store.indexes.get(index_name) {
                None => delta.flag_index(name, index_name),
                Some(live_index) => {
                    let matches = live_index.multi_entry == index_spec.multi_entry
                        && live_index.key_path.serialize() == index_spec.key_path.serialize()
                        && live_index.unique == index_spec.unique;
                    if !matches {
                        delta.flag_index(name, index_name);
                    }
                }
            }
        }
    }

    for name in live.stores.keys() {
        if !spec.stores.contains_key(name) {
            delta.drop.push(name.clone());
        }
    }

    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use strata_engine::{IndexShape, StoreDescriptor, StoreShape};

    fn live_with(stores: Vec<(&str, StoreDescriptor)>) -> DatabaseShape {
        DatabaseShape {
            stores: stores
                .into_iter()
                .map(|(name, desc)| (name.to_string(), desc))
                .collect(),
        }
    }

    fn users_descriptor() -> StoreDescriptor {
        StoreDescriptor {
            shape: StoreShape::new().with_key_path("id"),
            indexes: BTreeMap::from([("by_name".to_string(), IndexShape::new("name"))]),
        }
    }

    fn users_spec(version: u64) -> SchemaSpec {
        SchemaSpec::builder("app", version)
            .store("users", |s| s.key_path("id").index("by_name", "name"))
            .build()
            .unwrap()
    }

    #[test]
    fn missing_store_is_created_with_all_indexes() {
        let delta = reconcile(&users_spec(1), &DatabaseShape::default(), 0);
        assert_eq!(delta.create, vec!["users"]);
        assert!(delta.recreate.is_empty());
        assert_eq!(delta.indexes.get("users").unwrap(), &vec!["by_name"]);
    }

    #[test]
    fn unchanged_schema_yields_empty_delta() {
        let live = live_with(vec![("users", users_descriptor())]);
        let delta = reconcile(&users_spec(1), &live, 1);
        assert!(delta.is_empty());
    }

    #[test]
    fn shape_mismatch_without_covering_upgrade_never_recreates() {
        let live = live_with(vec![("users", users_descriptor())]);
        let spec = SchemaSpec::builder("app", 2)
            .store("users", |s| s.key_path("uuid").index("by_name", "name"))
            .build()
            .unwrap();
        let delta = reconcile(&spec, &live, 1);
        assert!(delta.recreate.is_empty());
        assert!(delta.create.is_empty());
    }

    #[test]
    fn shape_mismatch_with_covering_upgrade_recreates() {
        let live = live_with(vec![("users", users_descriptor())]);
        let spec = SchemaSpec::builder("app", 2)
            .store("users", |s| {
                s.key_path("uuid")
                    .index("by_name", "name")
                    .upgrade(2, |records, _| Ok(records))
            })
            .build()
            .unwrap();
        let delta = reconcile(&spec, &live, 1);
        assert_eq!(delta.recreate, vec!["users"]);
        assert_eq!(delta.indexes.get("users").unwrap(), &vec!["by_name"]);
    }

    #[test]
    fn matching_shape_with_covering_upgrade_does_not_recreate() {
        let live = live_with(vec![("users", users_descriptor())]);
        let spec = SchemaSpec::builder("app", 2)
            .store("users", |s| {
                s.key_path("id")
                    .index("by_name", "name")
                    .upgrade(2, |records, _| Ok(records))
            })
            .build()
            .unwrap();
        let delta = reconcile(&spec, &live, 1);
        assert!(delta.recreate.is_empty());
    }

    #[test]
    fn index_change_flags_the_index_not_the_store() {
        let live = live_with(vec![("users", users_descriptor())]);
        let spec = SchemaSpec::builder("app", 2)
            .store("users", |s| {
                s.key_path("id")
                    .index_with("by_name", IndexShape::new("name").unique())
            })
            .build()
            .unwrap();
        let delta = reconcile(&spec, &live, 1);
        assert!(delta.recreate.is_empty());
        assert!(delta.create.is_empty());
        assert_eq!(delta.indexes.get("users").unwrap(), &vec!["by_name"]);
    }

    #[test]
    fn compound_key_paths_compare_by_serialized_form() {
        let live = live_with(vec![(
            "events",
            StoreDescriptor {
                shape: StoreShape::new().with_key_path(vec!["a", "b"]),
                indexes: BTreeMap::new(),
            },
        )]);
        let spec = SchemaSpec::builder("app", 2)
            .store("events", |s| {
                s.key_path(vec!["a", "b"]).upgrade(2, |records, _| Ok(records))
            })
            .build()
            .unwrap();
        assert!(reconcile(&spec, &live, 1).recreate.is_empty());
    }

    #[test]
    fn undeclared_live_stores_are_drop_candidates() {
        let live = live_with(vec![
            ("users", users_descriptor()),
            ("legacy", StoreDescriptor::default()),
        ]);
        let delta = reconcile(&users_spec(2), &live, 1);
        assert_eq!(delta.drop, vec!["legacy"]);
    }

    #[test]
    fn keyless_store_with_keyless_spec_is_left_alone() {
        // no declared shape on either side: never recreated, even with
        // a covering upgrade step
        let live = live_with(vec![("blobs", StoreDescriptor::default())]);
        let spec = SchemaSpec::builder("app", 2)
            .store("blobs", |s| s.upgrade(2, |records, _| Ok(records)))
            .build()
            .unwrap();
        assert!(reconcile(&spec, &live, 1).recreate.is_empty());
    }
}
