//! Storage engine trait definitions.
//!
//! An [`Engine`] hosts named, versioned databases of keyed record stores.
//! Everything above this crate (schema reconciliation, migration, the
//! query layer) is written against these traits, never against a
//! concrete engine.
//!
//! # Model
//!
//! - A database carries a version, starting at 0 when absent. Versions
//!   only move upward, and schema mutation is legal only inside the
//!   exclusive upgrade transaction an [`Engine::open`] runs when it
//!   raises the version.
//! - Transactions are scoped to named stores and are exclusive over that
//!   scope by contract; this crate does not arbitrate overlapping scopes.
//! - Calls block until the engine completes them; nothing here spawns
//!   parallel work.

use crate::error::EngineResult;
use crate::key::{Key, KeyRange};
use crate::shape::{DatabaseShape, IndexShape, StoreShape};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Transaction access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Reads only; writes fail.
    ReadOnly,
    /// Reads and writes.
    ReadWrite,
}

/// Cursor traversal order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    /// Ascending key order.
    #[default]
    Forward,
    /// Descending key order.
    Reverse,
}

/// What a read or cursor runs over: a store's primary order, or one of
/// its indexes.
#[derive(Debug, Clone, Copy)]
pub enum Source<'a> {
    /// The store itself, ordered by primary key.
    Store(&'a str),
    /// A secondary index, ordered by index key then primary key.
    Index {
        /// The store the index belongs to.
        store: &'a str,
        /// The index name.
        index: &'a str,
    },
}

impl Source<'_> {
    /// The store this source reads from.
    #[must_use]
    pub fn store(&self) -> &str {
        match self {
            Source::Store(store) | Source::Index { store, .. } => store,
        }
    }
}

/// The record a cursor is currently positioned on.
///
/// For store cursors `key` and `primary_key` are the same; for index
/// cursors `key` is the index key.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorRow {
    /// The key in the source's ordering.
    pub key: Key,
    /// The record's primary key.
    pub primary_key: Key,
    /// The record value.
    pub value: Value,
}

/// The upgrade hook an [`Engine::open`] invokes inside the exclusive
/// upgrade transaction when it raises the database version.
///
/// The transaction commits only if the hook returns `Ok`; on error the
/// open fails and the database keeps its previous version and schema.
pub type UpgradeHook<'a> = &'a mut dyn FnMut(&mut dyn UpgradeTransaction) -> EngineResult<()>;

/// A storage engine hosting named versioned databases.
pub trait Engine: Send + Sync {
    /// Opens (creating if absent) the named database.
    ///
    /// With `version: None` the database opens at its current version;
    /// an absent database is created at the engine's implicit default
    /// version 1, firing `on_upgrade` with old version 0. With
    /// `Some(v)`, `v` above the current version fires `on_upgrade`
    /// inside the upgrade transaction, `v` equal opens plainly, and `v`
    /// below fails with `VersionBelowCurrent`.
    fn open(
        &self,
        name: &str,
        version: Option<u64>,
        on_upgrade: UpgradeHook<'_>,
    ) -> EngineResult<Arc<dyn Connection>>;

    /// Deletes the named database entirely.
    fn delete_database(&self, name: &str) -> EngineResult<()>;
}

/// A live handle to one opened database.
pub trait Connection: Send + Sync + fmt::Debug {
    /// The database name.
    fn name(&self) -> &str;

    /// The version this connection was opened at.
    fn version(&self) -> u64;

    /// A snapshot of the live schema.
    fn schema(&self) -> DatabaseShape;

    /// Begins a transaction scoped to the named stores.
    ///
    /// # Errors
    ///
    /// Fails with `ConnectionClosed` after [`Connection::close`], or
    /// `StoreNotFound` if a scoped store does not exist.
    fn transaction<'a>(&'a self, stores: &[&str], mode: Mode)
        -> EngineResult<Box<dyn Transaction + 'a>>;

    /// Closes the connection; subsequent transactions fail.
    fn close(&self);
}

/// A transaction over a fixed scope of stores.
///
/// Dropping a transaction without calling [`Transaction::commit`]
/// discards its writes, exactly like [`Transaction::abort`].
pub trait Transaction: fmt::Debug {
    /// The first record in the range, in source key order.
    fn get(&mut self, source: Source<'_>, range: &KeyRange)
        -> EngineResult<Option<(Key, Value)>>;

    /// Every record in the range, in source key order, paired with its
    /// primary key, optionally truncated to `limit`.
    fn get_range(
        &mut self,
        source: Source<'_>,
        range: &KeyRange,
        limit: Option<usize>,
    ) -> EngineResult<Vec<(Key, Value)>>;

    /// The number of records in the range.
    fn count(&mut self, source: Source<'_>, range: &KeyRange) -> EngineResult<usize>;

    /// Inserts a record; fails on an existing primary key.
    ///
    /// The primary key comes from `key`, the store's key path, or its
    /// generator, per the store shape; supplying both an explicit key
    /// and a key path is `InvalidKey`. Returns the effective key.
    fn add(&mut self, store: &str, key: Option<&Key>, value: &Value) -> EngineResult<Key>;

    /// Upserts a record by primary key. Unique-index collisions against
    /// other records still fail.
    fn put(&mut self, store: &str, key: Option<&Key>, value: &Value) -> EngineResult<Key>;

    /// Deletes every record whose primary key falls in the range.
    fn delete(&mut self, store: &str, range: &KeyRange) -> EngineResult<()>;

    /// Deletes every record in the store. The key generator is not reset.
    fn clear(&mut self, store: &str) -> EngineResult<()>;

    /// Opens a cursor over the source, positioned before the first
    /// record of the range.
    ///
    /// Cursors are strictly sequential: the engine must not read ahead
    /// of the current record. One cursor at a time per transaction.
    fn open_cursor<'c>(
        &'c mut self,
        source: Source<'_>,
        range: Option<KeyRange>,
        direction: Direction,
    ) -> EngineResult<Box<dyn Cursor + 'c>>;

    /// Commits the transaction's writes.
    fn commit(self: Box<Self>) -> EngineResult<()>;

    /// Discards the transaction's writes.
    ///
    /// A caller-forced abort is not an engine fault; it completes
    /// normally.
    fn abort(self: Box<Self>) -> EngineResult<()>;
}

/// The exclusive transaction an upgrade runs in. Scope is every store,
/// and schema operations are legal only here.
pub trait UpgradeTransaction: Transaction {
    /// The version the database is upgrading from.
    fn old_version(&self) -> u64;

    /// The version the database is upgrading to.
    fn new_version(&self) -> u64;

    /// Creates a store.
    fn create_store(&mut self, name: &str, shape: &StoreShape) -> EngineResult<()>;

    /// Deletes a store and everything in it.
    fn delete_store(&mut self, name: &str) -> EngineResult<()>;

    /// Creates an index, backfilling it from existing records.
    ///
    /// A unique index whose backfill finds duplicate keys fails with
    /// `ConstraintViolation`.
    fn create_index(&mut self, store: &str, name: &str, shape: &IndexShape) -> EngineResult<()>;

    /// Deletes an index.
    fn delete_index(&mut self, store: &str, name: &str) -> EngineResult<()>;
}

/// A sequential cursor over one source.
///
/// A freshly opened cursor has no current record; the first
/// [`Cursor::step`] moves onto the first record in range.
pub trait Cursor {
    /// Moves to the next record, returning it, or `None` at the end.
    fn step(&mut self) -> EngineResult<Option<CursorRow>>;

    /// Moves to the first record at or beyond `key` in traversal order.
    ///
    /// On a positioned cursor the target record must also lie past the
    /// current one; seeking never revisits or rewinds.
    fn seek(&mut self, key: &Key) -> EngineResult<Option<CursorRow>>;

    /// Steps `count` records forward, returning the record landed on.
    fn advance(&mut self, count: u32) -> EngineResult<Option<CursorRow>>;

    /// Replaces the current record's value in place.
    ///
    /// The primary key must not change: if the store's key path derives
    /// a different key from the new value this is `ConstraintViolation`.
    /// Secondary indexes are updated.
    fn update(&mut self, value: &Value) -> EngineResult<()>;

    /// Deletes the current record (and its index entries). The cursor
    /// position is preserved, so the next step continues past it.
    fn delete(&mut self) -> EngineResult<()>;
}
