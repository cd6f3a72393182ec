//! The migration pipeline behind [`crate::open`].
//!
//! Opening a database is a fixed sequence of phases: probe the live
//! version, diff the live schema against the spec, capture and
//! transform the data of stores about to be recreated, reopen at the
//! desired version applying the schema delta inside the upgrade
//! transaction, then rewrite the captured data. Each phase runs to
//! completion before the next starts; capture buffers whole stores in
//! memory, which is the accepted scaling limit of recreation.
//!
//! Capture and rewrite use separate connections with no atomicity
//! between them: a crash after the upgrade commit can leave a recreated
//! store schema-correct but empty.

use crate::database::Connection;
use crate::cursor::{scan, Decision};
use crate::error::{DbError, DbResult};
use crate::reconcile::{reconcile, SchemaDelta};
use crate::schema::{Record, SchemaSpec, StoreSpec};
use std::collections::BTreeMap;
use std::sync::Arc;
use strata_engine as engine;
use strata_engine::{
    Direction, Engine, EngineError, EngineResult, Mode, UpgradeTransaction,
};
use tracing::{debug, info, warn};

pub(crate) struct MigrationPipeline<'e> {
    engine: &'e dyn Engine,
    spec: Arc<SchemaSpec>,
}

impl<'e> MigrationPipeline<'e> {
    pub(crate) fn new(engine: &'e dyn Engine, spec: SchemaSpec) -> Self {
        Self {
            engine,
            spec: Arc::new(spec),
        }
    }

    /// Runs every phase and produces the final connection.
    pub(crate) fn run(self) -> DbResult<Connection> {
        let desired = self.spec.version;
        info!("Opening database {} at version {desired}", self.spec.name);

        // Probe: open at the current version. The hook only fires for a
        // fresh database, which the engine creates at its default
        // version.
        let mut fresh = false;
        let mut built = false;
        let probe = {
            let spec = &self.spec;
            self.engine.open(&spec.name, None, &mut |up| {
                fresh = true;
                if up.new_version() == desired {
                    apply_full_schema(up, spec)?;
                    built = true;
                }
                Ok(())
            })?
        };

        if fresh {
            if built {
                debug!("Created {} fresh at version {desired}", self.spec.name);
                return Ok(self.finish(probe));
            }
            // Default version differs from the desired one; reopen to
            // get a genuine upgrade phase and build the schema there.
            probe.close();
            let spec = &self.spec;
            let conn = self
                .engine
                .open(&spec.name, Some(desired), &mut |up| {
                    apply_full_schema(up, spec)
                })?;
            debug!("Created {} fresh at version {desired}", self.spec.name);
            return Ok(self.finish(conn));
        }

        // Diff. Matching versions resolve immediately; live shape is
        // deliberately not verified on this path.
        let live_version = probe.version();
        if live_version == desired {
            debug!("Database {} already at version {desired}", self.spec.name);
            return Ok(self.finish(probe));
        }
        let delta = reconcile(&self.spec, &probe.schema(), live_version);
        debug!(
            "Migrating {} from version {live_version}: create {:?}, recreate {:?}, drop {:?}",
            self.spec.name, delta.create, delta.recreate, delta.drop
        );

        // Capture, against the still-open probe connection. A failing
        // transformer surfaces here, before anything destructive.
        let captured = self.capture(&probe, &delta, live_version)?;

        // Reopen at the desired version; the hook applies the delta
        // inside the upgrade transaction. A live version above the
        // desired one fails here with VersionBelowCurrent.
        probe.close();
        let upgraded = {
            let spec = &self.spec;
            self.engine.open(&spec.name, Some(desired), &mut |up| {
                apply_delta(up, spec, &delta)
            })?
        };

        // Rewrite, one transaction per captured store. Commits are
        // independent: a failure fails the open, but stores already
        // rewritten stay rewritten.
        for (store, records) in &captured {
            if let Err(err) = self.rewrite_store(upgraded.as_ref(), store, records) {
                warn!("Rewrite of store {store} failed: {err}");
                return Err(err.into());
            }
        }

        info!(
            "Database {} migrated from version {live_version} to {desired}",
            self.spec.name
        );
        Ok(self.finish(upgraded))
    }

    fn finish(&self, inner: Arc<dyn engine::Connection>) -> Connection {
        Connection {
            inner,
            spec: Arc::clone(&self.spec),
        }
    }

    /// Buffers each store about to be recreated and runs its covering
    /// upgrade steps, ascending by version gate, each step feeding the
    /// next.
    fn capture(
        &self,
        probe: &Arc<dyn engine::Connection>,
        delta: &SchemaDelta,
        live_version: u64,
    ) -> DbResult<BTreeMap<String, Vec<Record>>> {
        let pre = Connection {
            inner: Arc::clone(probe),
            spec: Arc::clone(&self.spec),
        };
        let mut captured = BTreeMap::new();
        for name in &delta.recreate {
            let mut buffer = Vec::new();
            scan(
                probe.as_ref(),
                name,
                None,
                Mode::ReadOnly,
                None,
                Direction::Forward,
                |entry| {
                    buffer.push(Record::new(
                        entry.primary_key().clone(),
                        entry.value().clone(),
                    ));
                    Ok(Decision::Continue)
                },
            )?;
            let spec = self.store_spec(name)?;
            for step in spec.covering_upgrades(live_version, self.spec.version) {
                buffer = (step.transformer)(buffer, &pre).map_err(|err| {
                    DbError::transformer_failed(name, step.before_version, err.to_string())
                })?;
            }
            captured.insert(name.clone(), buffer);
        }
        Ok(captured)
    }

    fn rewrite_store(
        &self,
        conn: &dyn engine::Connection,
        store: &str,
        records: &[Record],
    ) -> DbResult<()> {
        let spec = self.store_spec(store)?;
        let derives_keys = spec.shape.key_path.is_some() || spec.shape.auto_increment;
        let mut tx = conn.transaction(&[store], Mode::ReadWrite)?;
        for record in records {
            if derives_keys {
                tx.add(store, None, &record.value)?;
            } else {
                tx.add(store, Some(&record.key), &record.value)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn store_spec(&self, name: &str) -> DbResult<&StoreSpec> {
        self.spec
            .stores
            .get(name)
            .ok_or_else(|| DbError::UndeclaredStore {
                name: name.to_string(),
            })
    }
}

fn apply_full_schema(up: &mut dyn UpgradeTransaction, spec: &SchemaSpec) -> EngineResult<()> {
    for (name, store) in &spec.stores {
        up.create_store(name, &store.shape)?;
        for (index_name, shape) in &store.indexes {
            up.create_index(name, index_name, shape)?;
        }
    }
    Ok(())
}

fn apply_delta(
    up: &mut dyn UpgradeTransaction,
    spec: &SchemaSpec,
    delta: &SchemaDelta,
) -> EngineResult<()> {
    let store_spec = |name: &str| {
        spec.stores
            .get(name)
            .ok_or_else(|| EngineError::internal(format!("delta names unknown store {name}")))
    };
    for name in &delta.create {
        up.create_store(name, &store_spec(name)?.shape)?;
    }
    for name in &delta.recreate {
        up.delete_store(name)?;
        up.create_store(name, &store_spec(name)?.shape)?;
    }
    for (store, indexes) in &delta.indexes {
        let declared = &store_spec(store)?.indexes;
        for index in indexes {
            match up.delete_index(store, index) {
                Ok(()) | Err(EngineError::IndexNotFound { .. }) => {}
                Err(err) => return Err(err),
            }
            let shape = declared.get(index).ok_or_else(|| {
                EngineError::internal(format!("delta names unknown index {index} on {store}"))
            })?;
            up.create_index(store, index, shape)?;
        }
    }
    if spec.delete_unused_stores {
        for name in &delta.drop {
            up.delete_store(name)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Matcher, Patch};
    use serde_json::{json, Value};
    use strata_engine::{IndexShape, Key, MemoryEngine};

    fn open_with(engine: &MemoryEngine, spec: SchemaSpec) -> DbResult<Connection> {
        MigrationPipeline::new(engine, spec).run()
    }

    fn v1_keyless_users() -> SchemaSpec {
        SchemaSpec::builder("app", 1)
            .store("users", |s| s)
            .build()
            .unwrap()
    }

    fn with_migrated_flag(records: Vec<Record>) -> Vec<Record> {
        records
            .into_iter()
            .map(|r| {
                let mut value = r.value;
                value["migrated"] = json!(true);
                Record::new(r.key, value)
            })
            .collect()
    }

    #[test]
    fn fresh_open_materializes_declared_schema() {
        let engine = MemoryEngine::new();
        let spec = SchemaSpec::builder("app", 3)
            .store("users", |s| s.key_path("id").index("by_name", "name"))
            .store("logs", |s| s.auto_increment(true))
            .build()
            .unwrap();
        let conn = open_with(&engine, spec).unwrap();
        assert_eq!(conn.version(), 3);

        let live = conn.inner.schema();
        assert_eq!(live.stores.len(), 2);
        let users = live.stores.get("users").unwrap();
        assert!(users.indexes.contains_key("by_name"));
        assert!(live.stores.get("logs").unwrap().shape.auto_increment);
    }

    #[test]
    fn fresh_open_at_version_one_builds_in_the_probe_transaction() {
        let engine = MemoryEngine::new();
        let spec = SchemaSpec::builder("app", 1)
            .store("users", |s| s.key_path("id"))
            .build()
            .unwrap();
        let conn = open_with(&engine, spec).unwrap();
        assert_eq!(conn.version(), 1);
        assert!(conn.inner.schema().stores.contains_key("users"));
    }

    #[test]
    fn reopening_unchanged_spec_preserves_data() {
        let engine = MemoryEngine::new();
        let spec = || {
            SchemaSpec::builder("app", 1)
                .store("users", |s| s.key_path("id"))
                .build()
                .unwrap()
        };
        let conn = open_with(&engine, spec()).unwrap();
        conn.store("users")
            .unwrap()
            .add(&json!({ "id": 1, "name": "a" }))
            .unwrap();
        conn.close();

        let again = open_with(&engine, spec()).unwrap();
        assert_eq!(again.version(), 1);
        let records = again.store("users").unwrap().get_array(None, None).unwrap();
        assert_eq!(records, vec![json!({ "id": 1, "name": "a" })]);
    }

    #[test]
    fn version_bump_without_shape_change_carries_data_forward() {
        let engine = MemoryEngine::new();
        let at = |version| {
            SchemaSpec::builder("app", version)
                .store("users", |s| s.key_path("id"))
                .build()
                .unwrap()
        };
        let conn = open_with(&engine, at(1)).unwrap();
        conn.store("users")
            .unwrap()
            .add(&json!({ "id": 1, "name": "a" }))
            .unwrap();
        conn.close();

        let bumped = open_with(&engine, at(2)).unwrap();
        assert_eq!(bumped.version(), 2);
        assert_eq!(bumped.store("users").unwrap().count(None).unwrap(), 1);
    }

    #[test]
    fn shape_mismatch_without_covering_step_leaves_the_store_alone() {
        let engine = MemoryEngine::new();
        let conn = open_with(&engine, v1_keyless_users()).unwrap();
        conn.store("users")
            .unwrap()
            .add_with_key(1, &json!({ "id": 1, "name": "a" }))
            .unwrap();
        conn.close();

        // Declares a key path but no upgrade step: the mismatch is
        // silently accepted, data intact.
        let spec = SchemaSpec::builder("app", 2)
            .store("users", |s| s.key_path("id"))
            .build()
            .unwrap();
        let conn = open_with(&engine, spec).unwrap();
        assert_eq!(conn.version(), 2);
        assert!(conn
            .inner
            .schema()
            .stores
            .get("users")
            .unwrap()
            .shape
            .key_path
            .is_none());
        assert_eq!(conn.store("users").unwrap().count(None).unwrap(), 1);
    }

    #[test]
    fn migration_transforms_and_preserves_keys() {
        let engine = MemoryEngine::new();
        let conn = open_with(&engine, v1_keyless_users()).unwrap();
        let users = conn.store("users").unwrap();
        users.add_with_key(1, &json!({ "id": 1, "name": "a" })).unwrap();
        users.add_with_key(2, &json!({ "id": 2, "name": "b" })).unwrap();
        conn.close();

        let spec = SchemaSpec::builder("app", 2)
            .store("users", |s| {
                s.key_path("id")
                    .upgrade(2, |records, _| Ok(with_migrated_flag(records)))
            })
            .build()
            .unwrap();
        let conn = open_with(&engine, spec).unwrap();
        assert_eq!(conn.version(), 2);

        let records = conn.store("users").unwrap().get_array(None, None).unwrap();
        assert_eq!(
            records,
            vec![
                json!({ "id": 1, "name": "a", "migrated": true }),
                json!({ "id": 2, "name": "b", "migrated": true }),
            ]
        );
    }

    #[test]
    fn migration_renames_a_field() {
        let engine = MemoryEngine::new();
        let conn = open_with(&engine, v1_keyless_users()).unwrap();
        let users = conn.store("users").unwrap();
        users.add_with_key(1, &json!({ "id": 1, "name": "a" })).unwrap();
        users.add_with_key(2, &json!({ "id": 2, "name": "b" })).unwrap();
        conn.close();

        let spec = SchemaSpec::builder("app", 2)
            .store("users", |s| {
                s.key_path("id").upgrade(2, |records, _| {
                    Ok(records
                        .into_iter()
                        .map(|r| {
                            let mut value = r.value;
                            let name = value
                                .as_object_mut()
                                .and_then(|obj| obj.remove("name"))
                                .unwrap_or(Value::Null);
                            value["fullName"] = name;
                            Record::new(r.key, value)
                        })
                        .collect())
                })
            })
            .build()
            .unwrap();
        let conn = open_with(&engine, spec).unwrap();

        let records = conn.store("users").unwrap().get_array(None, None).unwrap();
        for record in &records {
            assert!(record.get("name").is_none());
            assert!(record.get("fullName").is_some());
        }
        assert_eq!(records[0]["fullName"], json!("a"));
    }

    #[test]
    fn upgrade_steps_chain_in_ascending_order() {
        let engine = MemoryEngine::new();
        let conn = open_with(&engine, v1_keyless_users()).unwrap();
        conn.store("users")
            .unwrap()
            .add_with_key(1, &json!({ "id": 1, "steps": [] }))
            .unwrap();
        conn.close();

        let append = |tag: &'static str| {
            move |records: Vec<Record>, _: &Connection| {
                Ok(records
                    .into_iter()
                    .map(|r| {
                        let mut value = r.value;
                        if let Some(steps) = value["steps"].as_array_mut() {
                            steps.push(json!(tag));
                        }
                        Record::new(r.key, value)
                    })
                    .collect::<Vec<_>>())
            }
        };
        let spec = SchemaSpec::builder("app", 3)
            .store("users", |s| {
                s.key_path("id")
                    .upgrade(3, append("three"))
                    .upgrade(2, append("two"))
            })
            .build()
            .unwrap();
        let conn = open_with(&engine, spec).unwrap();
        let record = conn
            .store("users")
            .unwrap()
            .get(Key::from(1))
            .unwrap()
            .unwrap();
        assert_eq!(record["steps"], json!(["two", "three"]));
    }

    #[test]
    fn covering_steps_run_exactly_once_and_only_when_covering() {
        let engine = MemoryEngine::new();
        let conn = open_with(&engine, v1_keyless_users()).unwrap();
        conn.store("users")
            .unwrap()
            .add_with_key(1, &json!({ "id": 1 }))
            .unwrap();
        conn.close();

        let fired = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let record = |gate: u64| {
            let fired = Arc::clone(&fired);
            move |records, _: &Connection| {
                fired.lock().push(gate);
                Ok(records)
            }
        };
        // Gate 1 is already behind the live version and must not fire.
        let spec = SchemaSpec::builder("app", 3)
            .store("users", |s| {
                s.key_path("id")
                    .upgrade(1, record(1))
                    .upgrade(2, record(2))
                    .upgrade(3, record(3))
            })
            .build()
            .unwrap();
        open_with(&engine, spec).unwrap();
        assert_eq!(*fired.lock(), vec![2, 3]);
    }

    #[test]
    fn transformer_failure_leaves_the_database_untouched() {
        let engine = MemoryEngine::new();
        let conn = open_with(&engine, v1_keyless_users()).unwrap();
        conn.store("users")
            .unwrap()
            .add_with_key(1, &json!({ "id": 1, "name": "a" }))
            .unwrap();
        conn.close();

        let spec = SchemaSpec::builder("app", 2)
            .store("users", |s| {
                s.key_path("id")
                    .upgrade(2, |_, _| Err(DbError::invalid_spec("bad data")))
            })
            .build()
            .unwrap();
        let err = open_with(&engine, spec).unwrap_err();
        assert!(matches!(err, DbError::TransformerFailed { .. }));

        // Still at version 1 with the original record and shape.
        let conn = open_with(&engine, v1_keyless_users()).unwrap();
        assert_eq!(conn.version(), 1);
        assert_eq!(conn.store("users").unwrap().count(None).unwrap(), 1);
    }

    #[test]
    fn index_only_change_replaces_the_index_not_the_store() {
        let engine = MemoryEngine::new();
        let v1 = SchemaSpec::builder("app", 1)
            .store("users", |s| s.key_path("id").index("by_name", "name"))
            .build()
            .unwrap();
        let conn = open_with(&engine, v1).unwrap();
        conn.store("users")
            .unwrap()
            .add(&json!({ "id": 1, "name": "a" }))
            .unwrap();
        conn.close();

        let v2 = SchemaSpec::builder("app", 2)
            .store("users", |s| {
                s.key_path("id")
                    .index_with("by_name", IndexShape::new("name").unique())
            })
            .build()
            .unwrap();
        let conn = open_with(&engine, v2).unwrap();
        // Data survived (no recreate) and the index now enforces
        // uniqueness.
        assert_eq!(conn.store("users").unwrap().count(None).unwrap(), 1);
        let dup = conn
            .store("users")
            .unwrap()
            .add(&json!({ "id": 2, "name": "a" }));
        assert!(dup.is_err());
    }

    #[test]
    fn unused_stores_drop_only_when_requested() {
        let engine = MemoryEngine::new();
        let v1 = SchemaSpec::builder("app", 1)
            .store("users", |s| s.key_path("id"))
            .store("legacy", |s| s.key_path("id"))
            .build()
            .unwrap();
        open_with(&engine, v1).unwrap().close();

        let keep = SchemaSpec::builder("app", 2)
            .store("users", |s| s.key_path("id"))
            .build()
            .unwrap();
        let conn = open_with(&engine, keep).unwrap();
        assert!(conn.inner.schema().stores.contains_key("legacy"));
        conn.close();

        let drop = SchemaSpec::builder("app", 3)
            .store("users", |s| s.key_path("id"))
            .delete_unused_stores(true)
            .build()
            .unwrap();
        let conn = open_with(&engine, drop).unwrap();
        assert!(!conn.inner.schema().stores.contains_key("legacy"));
    }

    #[test]
    fn opening_below_the_live_version_fails() {
        let engine = MemoryEngine::new();
        let v3 = SchemaSpec::builder("app", 3)
            .store("users", |s| s.key_path("id"))
            .build()
            .unwrap();
        open_with(&engine, v3).unwrap().close();

        let v2 = SchemaSpec::builder("app", 2)
            .store("users", |s| s.key_path("uuid").upgrade(2, |r, _| Ok(r)))
            .build()
            .unwrap();
        let err = open_with(&engine, v2).unwrap_err();
        assert!(matches!(
            err,
            DbError::Engine(EngineError::VersionBelowCurrent { .. })
        ));
    }

    #[test]
    fn transformer_sees_the_pre_upgrade_database() {
        let engine = MemoryEngine::new();
        let v1 = SchemaSpec::builder("app", 1)
            .store("users", |s| s)
            .store("titles", |s| s.key_path("id"))
            .build()
            .unwrap();
        let conn = open_with(&engine, v1).unwrap();
        conn.store("users")
            .unwrap()
            .add_with_key(1, &json!({ "id": 1, "title_id": 5 }))
            .unwrap();
        conn.store("titles")
            .unwrap()
            .add(&json!({ "id": 5, "label": "admin" }))
            .unwrap();
        conn.close();

        let v2 = SchemaSpec::builder("app", 2)
            .store("users", |s| {
                s.key_path("id").upgrade(2, |records, pre| {
                    let titles = pre.store("titles")?;
                    records
                        .into_iter()
                        .map(|r| {
                            let title_id = r.value["title_id"].as_i64().unwrap_or(0);
                            let title = titles.get(Key::from(title_id))?;
                            let mut value = r.value;
                            value["title"] = title.map_or(Value::Null, |t| t["label"].clone());
                            Ok(Record::new(r.key, value))
                        })
                        .collect()
                })
            })
            .store("titles", |s| s.key_path("id"))
            .build()
            .unwrap();
        let conn = open_with(&engine, v2).unwrap();
        let user = conn
            .store("users")
            .unwrap()
            .get(Key::from(1))
            .unwrap()
            .unwrap();
        assert_eq!(user["title"], json!("admin"));
    }

    #[test]
    fn update_after_migration_touches_one_record() {
        let engine = MemoryEngine::new();
        let spec = SchemaSpec::builder("app", 1)
            .store("users", |s| s.key_path("id"))
            .build()
            .unwrap();
        let conn = open_with(&engine, spec).unwrap();
        let users = conn.store("users").unwrap();
        for id in 1..=3 {
            users.add(&json!({ "id": id, "active": true })).unwrap();
        }
        let updated = users
            .update(
                Matcher::predicate(|v| v["active"] == json!(true)),
                Patch::merge(json!({ "active": false })),
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated["id"], json!(1));
        let still_active = users
            .count(Some(Matcher::predicate(|v| v["active"] == json!(true))))
            .unwrap();
        assert_eq!(still_active, 2);
    }
}
