//! In-memory reference engine.
//!
//! `MemoryEngine` implements the full engine contract against plain
//! in-process maps. It exists for tests and ephemeral databases; there
//! is no durability. Transactions take a clone of every store in their
//! scope, operate on the clone, and swap it back on commit, which gives
//! real abort-rollback semantics. Scope exclusivity is the caller's
//! contract, as it is for every engine.

use crate::backend::{
    Connection, Cursor, CursorRow, Direction, Engine, Mode, Source, Transaction,
    UpgradeHook, UpgradeTransaction,
};
use crate::error::{EngineError, EngineResult};
use crate::key::{Key, KeyPath, KeyRange};
use crate::shape::{DatabaseShape, IndexShape, StoreDescriptor, StoreShape};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

/// An in-memory storage engine.
///
/// Databases live for as long as the engine does; every connection
/// opened through it shares the same databases.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    databases: RwLock<HashMap<String, Arc<RwLock<DatabaseState>>>>,
}

impl MemoryEngine {
    /// Creates an engine with no databases.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn database_slot(&self, name: &str) -> Arc<RwLock<DatabaseState>> {
        let mut databases = self.databases.write();
        Arc::clone(
            databases
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(DatabaseState::default()))),
        )
    }
}

impl Engine for MemoryEngine {
    fn open(
        &self,
        name: &str,
        version: Option<u64>,
        on_upgrade: UpgradeHook<'_>,
    ) -> EngineResult<Arc<dyn Connection>> {
        let db = self.database_slot(name);
        // Version 0 is "absent": the slot exists but no upgrade has
        // ever committed.
        let current = db.read().version;
        let target = match version {
            Some(v) => v,
            None if current == 0 => 1,
            None => current,
        };
        if target < current {
            return Err(EngineError::VersionBelowCurrent {
                requested: target,
                current,
            });
        }
        if target > current {
            let stores = db.read().stores.clone();
            let mut tx = MemoryUpgradeTransaction {
                core: TxCore {
                    stores,
                    mode: Mode::ReadWrite,
                    scope: None,
                },
                old_version: current,
                new_version: target,
            };
            on_upgrade(&mut tx)?;
            *db.write() = DatabaseState {
                version: target,
                stores: tx.core.stores,
            };
        }
        Ok(Arc::new(MemoryConnection {
            db,
            name: name.to_string(),
            version: target,
            closed: AtomicBool::new(false),
        }))
    }

    fn delete_database(&self, name: &str) -> EngineResult<()> {
        self.databases.write().remove(name);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct DatabaseState {
    version: u64,
    stores: BTreeMap<String, StoreState>,
}

#[derive(Debug, Clone)]
struct StoreState {
    shape: StoreShape,
    records: BTreeMap<Key, Value>,
    indexes: BTreeMap<String, IndexState>,
    next_key: i64,
}

impl StoreState {
    fn new(shape: StoreShape) -> Self {
        Self {
            shape,
            records: BTreeMap::new(),
            indexes: BTreeMap::new(),
            next_key: 1,
        }
    }

    fn descriptor(&self) -> StoreDescriptor {
        StoreDescriptor {
            shape: self.shape.clone(),
            indexes: self
                .indexes
                .iter()
                .map(|(name, idx)| (name.clone(), idx.shape.clone()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
struct IndexState {
    shape: IndexShape,
    // (index key, primary key), ordered by index key then primary key.
    entries: BTreeSet<(Key, Key)>,
}

/// The index keys a record contributes to one index.
fn index_keys(shape: &IndexShape, value: &Value) -> Vec<Key> {
    if shape.multi_entry {
        match shape.key_path.resolve(value) {
            Some(Value::Array(items)) => {
                let mut keys: Vec<Key> = items.iter().filter_map(Key::from_json).collect();
                keys.sort();
                keys.dedup();
                keys
            }
            Some(other) => Key::from_json(other).into_iter().collect(),
            None => Vec::new(),
        }
    } else {
        shape.key_path.extract(value).into_iter().collect()
    }
}

/// Working state shared by normal and upgrade transactions: cloned
/// stores, the access mode, and the scope (`None` means every store).
#[derive(Debug)]
struct TxCore {
    stores: BTreeMap<String, StoreState>,
    mode: Mode,
    scope: Option<Vec<String>>,
}

impl TxCore {
    fn check_scope(&self, store: &str) -> EngineResult<()> {
        if let Some(scope) = &self.scope {
            if !scope.iter().any(|s| s == store) {
                return Err(EngineError::OutOfScope {
                    store: store.to_string(),
                });
            }
        }
        Ok(())
    }

    fn check_writable(&self, store: &str) -> EngineResult<()> {
        self.check_scope(store)?;
        if self.mode != Mode::ReadWrite {
            return Err(EngineError::ReadOnlyTransaction);
        }
        Ok(())
    }

    fn store_ref(&self, name: &str) -> EngineResult<&StoreState> {
        self.check_scope(name)?;
        self.stores
            .get(name)
            .ok_or_else(|| EngineError::store_not_found(name))
    }

    fn store_mut(&mut self, name: &str) -> EngineResult<&mut StoreState> {
        self.check_scope(name)?;
        self.stores
            .get_mut(name)
            .ok_or_else(|| EngineError::store_not_found(name))
    }

    /// Records in source order, paired with primary keys.
    fn scan_range(
        &self,
        source: Source<'_>,
        range: &KeyRange,
        limit: Option<usize>,
    ) -> EngineResult<Vec<(Key, Value)>> {
        let limit = limit.unwrap_or(usize::MAX);
        match source {
            Source::Store(name) => {
                let state = self.store_ref(name)?;
                Ok(state
                    .records
                    .iter()
                    .filter(|(k, _)| range.contains(k))
                    .take(limit)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect())
            }
            Source::Index { store, index } => {
                let state = self.store_ref(store)?;
                let idx = state
                    .indexes
                    .get(index)
                    .ok_or_else(|| EngineError::index_not_found(store, index))?;
                Ok(idx
                    .entries
                    .iter()
                    .filter(|(ik, _)| range.contains(ik))
                    .filter_map(|(_, pk)| state.records.get(pk).map(|v| (pk.clone(), v.clone())))
                    .take(limit)
                    .collect())
            }
        }
    }

    fn count_range(&self, source: Source<'_>, range: &KeyRange) -> EngineResult<usize> {
        match source {
            Source::Store(name) => {
                let state = self.store_ref(name)?;
                Ok(state.records.keys().filter(|k| range.contains(k)).count())
            }
            Source::Index { store, index } => {
                let state = self.store_ref(store)?;
                let idx = state
                    .indexes
                    .get(index)
                    .ok_or_else(|| EngineError::index_not_found(store, index))?;
                Ok(idx.entries.iter().filter(|(ik, _)| range.contains(ik)).count())
            }
        }
    }

    /// Resolves the primary key per the store shape, generating and
    /// injecting one when the store is auto-increment and the key path
    /// does not resolve.
    fn resolve_primary(
        state: &mut StoreState,
        key: Option<&Key>,
        value: &mut Value,
    ) -> EngineResult<Key> {
        let primary = match (&state.shape.key_path, key) {
            (Some(_), Some(_)) => {
                return Err(EngineError::invalid_key(
                    "explicit key not allowed on a store with a key path",
                ))
            }
            (Some(key_path), None) => match key_path.extract(value) {
                Some(k) => k,
                None if state.shape.auto_increment => {
                    let generated = Key::Number(state.next_key as f64);
                    state.next_key += 1;
                    if !key_path.inject(value, &generated) {
                        return Err(EngineError::invalid_key(
                            "cannot inject generated key into record",
                        ));
                    }
                    generated
                }
                None => {
                    return Err(EngineError::invalid_key(
                        "key path did not resolve to a key on the record",
                    ))
                }
            },
            (None, Some(k)) => k.clone(),
            (None, None) if state.shape.auto_increment => {
                let generated = Key::Number(state.next_key as f64);
                state.next_key += 1;
                generated
            }
            (None, None) => {
                return Err(EngineError::invalid_key(
                    "store has no key path and no key was supplied",
                ))
            }
        };
        // Keep the generator ahead of any explicit numeric key.
        if state.shape.auto_increment {
            if let Key::Number(n) = &primary {
                if *n >= state.next_key as f64 {
                    state.next_key = n.floor() as i64 + 1;
                }
            }
        }
        Ok(primary)
    }

    fn insert(
        &mut self,
        store: &str,
        key: Option<&Key>,
        value: &Value,
        overwrite: bool,
    ) -> EngineResult<Key> {
        self.check_writable(store)?;
        let state = self.store_mut(store)?;
        let mut value = value.clone();
        let primary = Self::resolve_primary(state, key, &mut value)?;

        if !overwrite && state.records.contains_key(&primary) {
            return Err(EngineError::constraint(format!(
                "key {primary} already exists in store {store}"
            )));
        }

        // Validate every unique index before mutating anything.
        let mut planned: Vec<(String, Vec<Key>)> = Vec::new();
        for (index_name, idx) in &state.indexes {
            let keys = index_keys(&idx.shape, &value);
            if idx.shape.unique {
                for k in &keys {
                    if idx.entries.iter().any(|(ik, pk)| ik == k && *pk != primary) {
                        return Err(EngineError::constraint(format!(
                            "unique index {index_name} on store {store} already contains key {k}"
                        )));
                    }
                }
            }
            planned.push((index_name.clone(), keys));
        }

        for (index_name, keys) in planned {
            if let Some(idx) = state.indexes.get_mut(&index_name) {
                idx.entries.retain(|(_, pk)| *pk != primary);
                for k in keys {
                    idx.entries.insert((k, primary.clone()));
                }
            }
        }
        state.records.insert(primary.clone(), value);
        Ok(primary)
    }

    fn delete_key(&mut self, store: &str, primary: &Key) -> EngineResult<()> {
        self.check_writable(store)?;
        let state = self.store_mut(store)?;
        if state.records.remove(primary).is_some() {
            for idx in state.indexes.values_mut() {
                idx.entries.retain(|(_, pk)| pk != primary);
            }
        }
        Ok(())
    }

    fn delete_range(&mut self, store: &str, range: &KeyRange) -> EngineResult<()> {
        self.check_writable(store)?;
        let keys: Vec<Key> = {
            let state = self.store_ref(store)?;
            state
                .records
                .keys()
                .filter(|k| range.contains(k))
                .cloned()
                .collect()
        };
        for key in keys {
            self.delete_key(store, &key)?;
        }
        Ok(())
    }

    fn clear_store(&mut self, store: &str) -> EngineResult<()> {
        self.check_writable(store)?;
        let state = self.store_mut(store)?;
        state.records.clear();
        for idx in state.indexes.values_mut() {
            idx.entries.clear();
        }
        Ok(())
    }

    fn open_cursor_impl<'c>(
        &'c mut self,
        source: Source<'_>,
        range: Option<KeyRange>,
        direction: Direction,
    ) -> EngineResult<Box<dyn Cursor + 'c>> {
        // Validate the source up front so the first step cannot fail on
        // a missing store.
        let store = source.store().to_string();
        let index = match source {
            Source::Store(_) => None,
            Source::Index { index, .. } => {
                let state = self.store_ref(&store)?;
                if !state.indexes.contains_key(index) {
                    return Err(EngineError::index_not_found(&store, index));
                }
                Some(index.to_string())
            }
        };
        if index.is_none() {
            self.store_ref(&store)?;
        }
        Ok(Box::new(MemoryCursor {
            core: self,
            store,
            index,
            range: range.unwrap_or_default(),
            direction,
            position: None,
        }))
    }
}

/// A normal read-only or read-write transaction.
#[derive(Debug)]
struct MemoryTransaction {
    db: Arc<RwLock<DatabaseState>>,
    core: TxCore,
}

impl Transaction for MemoryTransaction {
    fn get(
        &mut self,
        source: Source<'_>,
        range: &KeyRange,
    ) -> EngineResult<Option<(Key, Value)>> {
        Ok(self.core.scan_range(source, range, Some(1))?.into_iter().next())
    }

    fn get_range(
        &mut self,
        source: Source<'_>,
        range: &KeyRange,
        limit: Option<usize>,
    ) -> EngineResult<Vec<(Key, Value)>> {
        self.core.scan_range(source, range, limit)
    }

    fn count(&mut self, source: Source<'_>, range: &KeyRange) -> EngineResult<usize> {
        self.core.count_range(source, range)
    }

    fn add(&mut self, store: &str, key: Option<&Key>, value: &Value) -> EngineResult<Key> {
        self.core.insert(store, key, value, false)
    }

    fn put(&mut self, store: &str, key: Option<&Key>, value: &Value) -> EngineResult<Key> {
        self.core.insert(store, key, value, true)
    }

    fn delete(&mut self, store: &str, range: &KeyRange) -> EngineResult<()> {
        self.core.delete_range(store, range)
    }

    fn clear(&mut self, store: &str) -> EngineResult<()> {
        self.core.clear_store(store)
    }

    fn open_cursor<'c>(
        &'c mut self,
        source: Source<'_>,
        range: Option<KeyRange>,
        direction: Direction,
    ) -> EngineResult<Box<dyn Cursor + 'c>> {
        self.core.open_cursor_impl(source, range, direction)
    }

    fn commit(self: Box<Self>) -> EngineResult<()> {
        let MemoryTransaction { db, core } = *self;
        // A read-only working copy may be stale; writing it back would
        // erase writes committed since this transaction began.
        if core.mode == Mode::ReadWrite {
            let mut db = db.write();
            for (name, state) in core.stores {
                db.stores.insert(name, state);
            }
        }
        Ok(())
    }

    fn abort(self: Box<Self>) -> EngineResult<()> {
        // The working copy is simply dropped.
        Ok(())
    }
}

/// The exclusive upgrade transaction. Committed by the engine after the
/// upgrade hook returns `Ok`; the hook itself never commits.
#[derive(Debug)]
struct MemoryUpgradeTransaction {
    core: TxCore,
    old_version: u64,
    new_version: u64,
}

impl Transaction for MemoryUpgradeTransaction {
    fn get(
        &mut self,
        source: Source<'_>,
        range: &KeyRange,
    ) -> EngineResult<Option<(Key, Value)>> {
        Ok(self.core.scan_range(source, range, Some(1))?.into_iter().next())
    }

    fn get_range(
        &mut self,
        source: Source<'_>,
        range: &KeyRange,
        limit: Option<usize>,
    ) -> EngineResult<Vec<(Key, Value)>> {
        self.core.scan_range(source, range, limit)
    }

    fn count(&mut self, source: Source<'_>, range: &KeyRange) -> EngineResult<usize> {
        self.core.count_range(source, range)
    }

    fn add(&mut self, store: &str, key: Option<&Key>, value: &Value) -> EngineResult<Key> {
        self.core.insert(store, key, value, false)
    }

    fn put(&mut self, store: &str, key: Option<&Key>, value: &Value) -> EngineResult<Key> {
        self.core.insert(store, key, value, true)
    }

    fn delete(&mut self, store: &str, range: &KeyRange) -> EngineResult<()> {
        self.core.delete_range(store, range)
    }

    fn clear(&mut self, store: &str) -> EngineResult<()> {
        self.core.clear_store(store)
    }

    fn open_cursor<'c>(
        &'c mut self,
        source: Source<'_>,
        range: Option<KeyRange>,
        direction: Direction,
    ) -> EngineResult<Box<dyn Cursor + 'c>> {
        self.core.open_cursor_impl(source, range, direction)
    }

    fn commit(self: Box<Self>) -> EngineResult<()> {
        Err(EngineError::internal(
            "upgrade transactions commit when the open completes",
        ))
    }

    fn abort(self: Box<Self>) -> EngineResult<()> {
        Ok(())
    }
}

impl UpgradeTransaction for MemoryUpgradeTransaction {
    fn old_version(&self) -> u64 {
        self.old_version
    }

    fn new_version(&self) -> u64 {
        self.new_version
    }

    fn create_store(&mut self, name: &str, shape: &StoreShape) -> EngineResult<()> {
        if self.core.stores.contains_key(name) {
            return Err(EngineError::StoreExists {
                name: name.to_string(),
            });
        }
        if shape.auto_increment && matches!(shape.key_path, Some(KeyPath::Compound(_))) {
            return Err(EngineError::invalid_key(
                "auto-increment store cannot use a compound key path",
            ));
        }
        self.core
            .stores
            .insert(name.to_string(), StoreState::new(shape.clone()));
        Ok(())
    }

    fn delete_store(&mut self, name: &str) -> EngineResult<()> {
        self.core
            .stores
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::store_not_found(name))
    }

    fn create_index(&mut self, store: &str, name: &str, shape: &IndexShape) -> EngineResult<()> {
        if shape.multi_entry && matches!(shape.key_path, KeyPath::Compound(_)) {
            return Err(EngineError::invalid_key(
                "multi-entry index cannot use a compound key path",
            ));
        }
        let state = self
            .core
            .stores
            .get_mut(store)
            .ok_or_else(|| EngineError::store_not_found(store))?;
        if state.indexes.contains_key(name) {
            return Err(EngineError::IndexExists {
                store: store.to_string(),
                index: name.to_string(),
            });
        }
        // Backfill from existing records, enforcing uniqueness as we go.
        let mut entries = BTreeSet::new();
        for (primary, value) in &state.records {
            for k in index_keys(shape, value) {
                if shape.unique && entries.iter().any(|entry: &(Key, Key)| entry.0 == k) {
                    return Err(EngineError::constraint(format!(
                        "unique index {name} on store {store} has duplicate key {k} in existing records"
                    )));
                }
                entries.insert((k, primary.clone()));
            }
        }
        state.indexes.insert(
            name.to_string(),
            IndexState {
                shape: shape.clone(),
                entries,
            },
        );
        Ok(())
    }

    fn delete_index(&mut self, store: &str, name: &str) -> EngineResult<()> {
        let state = self
            .core
            .stores
            .get_mut(store)
            .ok_or_else(|| EngineError::store_not_found(store))?;
        state
            .indexes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::index_not_found(store, name))
    }
}

/// Cursor over the transaction's working copy.
///
/// The position is a remembered key, not a map iterator, so deleting
/// the current record never invalidates the scan.
struct MemoryCursor<'a> {
    core: &'a mut TxCore,
    store: String,
    index: Option<String>,
    range: KeyRange,
    direction: Direction,
    // (source key, primary key) of the last record returned.
    position: Option<(Key, Key)>,
}

impl MemoryCursor<'_> {
    /// The next record past the remembered position in traversal order.
    /// Seeking additionally requires the record to be at or past the
    /// target key; it never rewinds or revisits the current record.
    fn find_next(&self, seek_to: Option<&Key>) -> EngineResult<Option<CursorRow>> {
        let state = self.core.store_ref(&self.store)?;
        let beyond = |key: &Key, primary: &Key| -> bool {
            let past_position = match &self.position {
                Some((pos_key, pos_primary)) => match self.direction {
                    Direction::Forward => (key, primary) > (pos_key, pos_primary),
                    Direction::Reverse => (key, primary) < (pos_key, pos_primary),
                },
                None => true,
            };
            let past_target = match seek_to {
                Some(target) => match self.direction {
                    Direction::Forward => key >= target,
                    Direction::Reverse => key <= target,
                },
                None => true,
            };
            past_position && past_target
        };
        match &self.index {
            None => {
                let mut iter: Box<dyn Iterator<Item = (&Key, &Value)>> = match self.direction {
                    Direction::Forward => Box::new(state.records.iter()),
                    Direction::Reverse => Box::new(state.records.iter().rev()),
                };
                Ok(iter
                    .find(|(k, _)| self.range.contains(k) && beyond(k, k))
                    .map(|(k, v)| CursorRow {
                        key: k.clone(),
                        primary_key: k.clone(),
                        value: v.clone(),
                    }))
            }
            Some(index) => {
                let idx = state
                    .indexes
                    .get(index)
                    .ok_or_else(|| EngineError::index_not_found(&self.store, index))?;
                let mut iter: Box<dyn Iterator<Item = &(Key, Key)>> = match self.direction {
                    Direction::Forward => Box::new(idx.entries.iter()),
                    Direction::Reverse => Box::new(idx.entries.iter().rev()),
                };
                for (ik, pk) in iter.by_ref() {
                    if !self.range.contains(ik) || !beyond(ik, pk) {
                        continue;
                    }
                    if let Some(value) = state.records.get(pk) {
                        return Ok(Some(CursorRow {
                            key: ik.clone(),
                            primary_key: pk.clone(),
                            value: value.clone(),
                        }));
                    }
                }
                Ok(None)
            }
        }
    }

    fn move_to(&mut self, row: Option<CursorRow>) -> Option<CursorRow> {
        if let Some(row) = &row {
            self.position = Some((row.key.clone(), row.primary_key.clone()));
        }
        row
    }

    fn current_primary(&self) -> EngineResult<Key> {
        self.position
            .as_ref()
            .map(|(_, pk)| pk.clone())
            .ok_or(EngineError::CursorNotPositioned)
    }
}

impl Cursor for MemoryCursor<'_> {
    fn step(&mut self) -> EngineResult<Option<CursorRow>> {
        let row = self.find_next(None)?;
        Ok(self.move_to(row))
    }

    fn seek(&mut self, key: &Key) -> EngineResult<Option<CursorRow>> {
        let row = self.find_next(Some(key))?;
        Ok(self.move_to(row))
    }

    fn advance(&mut self, count: u32) -> EngineResult<Option<CursorRow>> {
        let mut row = None;
        for _ in 0..count.max(1) {
            row = self.step()?;
            if row.is_none() {
                break;
            }
        }
        Ok(row)
    }

    fn update(&mut self, value: &Value) -> EngineResult<()> {
        let primary = self.current_primary()?;
        let explicit = {
            let state = self.core.store_ref(&self.store)?;
            match &state.shape.key_path {
                Some(key_path) => match key_path.extract(value) {
                    Some(k) if k == primary => None,
                    Some(_) => {
                        return Err(EngineError::constraint(
                            "cursor update may not change the primary key",
                        ))
                    }
                    None => {
                        return Err(EngineError::invalid_key(
                            "key path did not resolve on the updated value",
                        ))
                    }
                },
                None => Some(primary.clone()),
            }
        };
        self.core
            .insert(&self.store, explicit.as_ref(), value, true)?;
        Ok(())
    }

    fn delete(&mut self) -> EngineResult<()> {
        let primary = self.current_primary()?;
        self.core.delete_key(&self.store, &primary)
    }
}

/// A connection to one in-memory database.
#[derive(Debug)]
struct MemoryConnection {
    db: Arc<RwLock<DatabaseState>>,
    name: String,
    version: u64,
    closed: AtomicBool,
}

impl Connection for MemoryConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn schema(&self) -> DatabaseShape {
        let db = self.db.read();
        DatabaseShape {
            stores: db
                .stores
                .iter()
                .map(|(name, state)| (name.clone(), state.descriptor()))
                .collect(),
        }
    }

    fn transaction<'a>(
        &'a self,
        stores: &[&str],
        mode: Mode,
    ) -> EngineResult<Box<dyn Transaction + 'a>> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return Err(EngineError::ConnectionClosed);
        }
        let db = self.db.read();
        let mut working = BTreeMap::new();
        for store in stores {
            let state = db
                .stores
                .get(*store)
                .ok_or_else(|| EngineError::store_not_found(*store))?;
            working.insert((*store).to_string(), state.clone());
        }
        Ok(Box::new(MemoryTransaction {
            db: Arc::clone(&self.db),
            core: TxCore {
                stores: working,
                mode,
                scope: Some(stores.iter().map(|s| (*s).to_string()).collect()),
            },
        }))
    }

    fn close(&self) {
        self.closed.store(true, AtomicOrdering::SeqCst);
    }
}
