//! Connection and store facades.
//!
//! A [`Connection`] pairs a live engine handle with the schema spec it
//! was opened against. Stores and indexes are reached through handles,
//! and only stores and indexes the spec declares are reachable; the
//! engine may briefly hold more (mid-migration), but the public surface
//! never shows them.

use crate::cursor::{scan, Decision, ScanEntry};
use crate::error::{DbError, DbResult};
use crate::query::{Matcher, Patch, QueryTarget};
use crate::schema::{SchemaSpec, StoreSpec};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use strata_engine as engine;
use strata_engine::{Direction, Key, KeyRange, Mode};

/// A live handle to a migrated database.
///
/// Cheap to clone; all clones share the one underlying engine
/// connection.
#[derive(Clone, Debug)]
pub struct Connection {
    pub(crate) inner: Arc<dyn engine::Connection>,
    pub(crate) spec: Arc<SchemaSpec>,
}

impl Connection {
    /// The database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// The version the database was opened at.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.version()
    }

    /// The schema spec this connection was opened against.
    #[must_use]
    pub fn spec(&self) -> &SchemaSpec {
        &self.spec
    }

    /// A handle to a declared store.
    ///
    /// # Errors
    ///
    /// [`DbError::UndeclaredStore`] when the spec does not declare it,
    /// even if the engine happens to hold a store of that name.
    pub fn store(&self, name: &str) -> DbResult<StoreHandle<'_>> {
        let (name, spec) =
            self.spec
                .stores
                .get_key_value(name)
                .ok_or_else(|| DbError::UndeclaredStore {
                    name: name.to_string(),
                })?;
        Ok(StoreHandle {
            conn: self,
            name,
            spec,
        })
    }

    /// Closes the underlying engine connection. Handles created from
    /// this connection fail afterwards.
    pub fn close(&self) {
        self.inner.close();
    }
}

/// Read and write access to one declared store.
#[derive(Debug)]
pub struct StoreHandle<'a> {
    conn: &'a Connection,
    name: &'a str,
    spec: &'a StoreSpec,
}

impl<'a> StoreHandle<'a> {
    /// The store name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name
    }

    fn target(&self) -> QueryTarget<'_> {
        QueryTarget::store(self.conn.inner.as_ref(), self.name)
    }

    /// The first record matching, or `None`.
    pub fn get(&self, matcher: impl Into<Matcher>) -> DbResult<Option<Value>> {
        self.target().get(&matcher.into())
    }

    /// Matching records in primary key order, up to `limit`.
    pub fn get_array(
        &self,
        matcher: Option<Matcher>,
        limit: Option<usize>,
    ) -> DbResult<Vec<Value>> {
        self.target().get_array(matcher.as_ref(), limit)
    }

    /// Matching records keyed by primary key.
    pub fn get_map(
        &self,
        matcher: Option<Matcher>,
        limit: Option<usize>,
    ) -> DbResult<BTreeMap<Key, Value>> {
        self.target().get_map(matcher.as_ref(), limit)
    }

    /// The number of matching records.
    pub fn count(&self, matcher: Option<Matcher>) -> DbResult<usize> {
        self.target().count(matcher.as_ref())
    }

    /// Merges the patch into the first matching record, returning the
    /// record as written, or `None` when nothing matched.
    pub fn update(&self, matcher: impl Into<Matcher>, patch: Patch) -> DbResult<Option<Value>> {
        self.target().update(&matcher.into(), &patch)
    }

    /// Deletes every matching record.
    pub fn delete(&self, matcher: impl Into<Matcher>) -> DbResult<()> {
        self.target().delete(&matcher.into())
    }

    /// Deletes every record, or those satisfying the predicate.
    pub fn delete_all(&self, predicate: Option<&dyn Fn(&Value) -> bool>) -> DbResult<()> {
        self.target().delete_all(predicate)
    }

    /// Inserts a record, deriving its key from the store shape.
    /// Fails on an existing key.
    pub fn add(&self, value: &Value) -> DbResult<Key> {
        self.target().add(None, value)
    }

    /// Inserts a record under an explicit key. Only legal on stores
    /// without a key path.
    pub fn add_with_key(&self, key: impl Into<Key>, value: &Value) -> DbResult<Key> {
        self.target().add(Some(&key.into()), value)
    }

    /// Upserts a record, deriving its key from the store shape.
    pub fn put(&self, value: &Value) -> DbResult<Key> {
        self.target().put(None, value)
    }

    /// Upserts a record under an explicit key.
    pub fn put_with_key(&self, key: impl Into<Key>, value: &Value) -> DbResult<Key> {
        self.target().put(Some(&key.into()), value)
    }

    /// Upserts a batch in one transaction, returning keys in input
    /// order.
    pub fn put_all(&self, values: &[Value]) -> DbResult<Vec<Key>> {
        self.target().put_all(values)
    }

    /// Walks the store record by record, driven by the closure's
    /// [`Decision`]s.
    pub fn scan(
        &self,
        mode: Mode,
        range: Option<KeyRange>,
        direction: Direction,
        per_entry: impl FnMut(&mut ScanEntry<'_>) -> DbResult<Decision>,
    ) -> DbResult<()> {
        scan(
            self.conn.inner.as_ref(),
            self.name,
            None,
            mode,
            range,
            direction,
            per_entry,
        )
    }

    /// A handle to a declared index on this store.
    ///
    /// # Errors
    ///
    /// [`DbError::UndeclaredIndex`] when the spec does not declare it.
    pub fn index(&self, name: &str) -> DbResult<IndexHandle<'a>> {
        let (name, _) =
            self.spec
                .indexes
                .get_key_value(name)
                .ok_or_else(|| DbError::UndeclaredIndex {
                    store: self.name.to_string(),
                    index: name.to_string(),
                })?;
        Ok(IndexHandle {
            conn: self.conn,
            store: self.name,
            name,
        })
    }
}

/// Read-only access to one declared index.
#[derive(Debug)]
pub struct IndexHandle<'a> {
    conn: &'a Connection,
    store: &'a str,
    name: &'a str,
}

impl IndexHandle<'_> {
    /// The index name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name
    }

    fn target(&self) -> QueryTarget<'_> {
        QueryTarget::index(self.conn.inner.as_ref(), self.store, self.name)
    }

    /// The first record matching by index key, or `None`.
    pub fn get(&self, matcher: impl Into<Matcher>) -> DbResult<Option<Value>> {
        self.target().get(&matcher.into())
    }

    /// Matching records in index key order, up to `limit`.
    pub fn get_array(
        &self,
        matcher: Option<Matcher>,
        limit: Option<usize>,
    ) -> DbResult<Vec<Value>> {
        self.target().get_array(matcher.as_ref(), limit)
    }

    /// Matching records keyed by primary key.
    pub fn get_map(
        &self,
        matcher: Option<Matcher>,
        limit: Option<usize>,
    ) -> DbResult<BTreeMap<Key, Value>> {
        self.target().get_map(matcher.as_ref(), limit)
    }

    /// The number of matching records.
    pub fn count(&self, matcher: Option<Matcher>) -> DbResult<usize> {
        self.target().count(matcher.as_ref())
    }

    /// Walks the index in key order. Index scans are read-only;
    /// [`ScanEntry::update`] and [`ScanEntry::delete`] fail.
    pub fn scan(
        &self,
        range: Option<KeyRange>,
        direction: Direction,
        per_entry: impl FnMut(&mut ScanEntry<'_>) -> DbResult<Decision>,
    ) -> DbResult<()> {
        scan(
            self.conn.inner.as_ref(),
            self.store,
            Some(self.name),
            Mode::ReadOnly,
            range,
            direction,
            per_entry,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_engine::{Engine as _, IndexShape, MemoryEngine, StoreShape};

    fn connected() -> Connection {
        let engine = MemoryEngine::new();
        let inner = engine
            .open("app", Some(1), &mut |up| {
                up.create_store("users", &StoreShape::new().with_key_path("id"))?;
                up.create_index("users", "by_email", &IndexShape::new("email").unique())?;
                up.create_store("sessions", &StoreShape::new().with_auto_increment())?;
                Ok(())
            })
            .unwrap();
        let spec = SchemaSpec::builder("app", 1)
            .store("users", |s| s.key_path("id").index_with("by_email", IndexShape::new("email").unique()))
            .store("sessions", |s| s.auto_increment(true))
            .build()
            .unwrap();
        Connection {
            inner,
            spec: Arc::new(spec),
        }
    }

    #[test]
    fn undeclared_store_is_rejected() {
        let conn = connected();
        let err = conn.store("ghosts").unwrap_err();
        assert!(matches!(err, DbError::UndeclaredStore { .. }));
    }

    #[test]
    fn undeclared_index_is_rejected() {
        let conn = connected();
        let users = conn.store("users").unwrap();
        let err = users.index("by_name").unwrap_err();
        assert!(matches!(err, DbError::UndeclaredIndex { .. }));
    }

    #[test]
    fn store_round_trip_through_handles() {
        let conn = connected();
        let users = conn.store("users").unwrap();
        let key = users
            .add(&json!({ "id": 7, "email": "k@example.com" }))
            .unwrap();
        assert_eq!(key, Key::from(7));

        let by_email = users.index("by_email").unwrap();
        let hit = by_email.get(Key::from("k@example.com")).unwrap().unwrap();
        assert_eq!(hit["id"], json!(7));

        let updated = users
            .update(Key::from(7), Patch::merge(json!({ "verified": true })))
            .unwrap()
            .unwrap();
        assert_eq!(updated["verified"], json!(true));

        users.delete(Key::from(7)).unwrap();
        assert_eq!(users.count(None).unwrap(), 0);
    }

    #[test]
    fn auto_increment_store_assigns_keys() {
        let conn = connected();
        let sessions = conn.store("sessions").unwrap();
        let first = sessions.add(&json!({ "token": "a" })).unwrap();
        let second = sessions.add(&json!({ "token": "b" })).unwrap();
        assert_eq!(first, Key::from(1));
        assert_eq!(second, Key::from(2));
    }

    #[test]
    fn store_scan_can_mutate() {
        let conn = connected();
        let users = conn.store("users").unwrap();
        for id in 1..=3 {
            users.add(&json!({ "id": id, "email": format!("u{id}@x") })).unwrap();
        }
        users
            .scan(Mode::ReadWrite, None, Direction::Forward, |entry| {
                if entry.value()["id"] == json!(2) {
                    entry.delete()?;
                }
                Ok(Decision::Continue)
            })
            .unwrap();
        assert_eq!(users.count(None).unwrap(), 2);
    }

    #[test]
    fn index_scan_rejects_writes() {
        let conn = connected();
        let users = conn.store("users").unwrap();
        users.add(&json!({ "id": 1, "email": "a@x" })).unwrap();
        let by_email = users.index("by_email").unwrap();
        let err = by_email
            .scan(None, Direction::Forward, |entry| {
                entry.delete()?;
                Ok(Decision::Continue)
            })
            .unwrap_err();
        assert!(matches!(err, DbError::Engine(_)));
    }

    #[test]
    fn closed_connection_fails_handle_operations() {
        let conn = connected();
        conn.close();
        let users = conn.store("users").unwrap();
        assert!(users.count(None).is_err());
    }
}
