//! Record selection and mutation over one store or index.
//!
//! A [`Matcher`] names what to select; a [`Patch`] names how to change
//! it. [`QueryTarget`] executes both: key and range matchers go straight
//! to the engine, key lists and predicates go through a cursor scan.

use crate::cursor::{scan, Decision};
use crate::error::DbResult;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use strata_engine::{Connection, Direction, Key, KeyRange, Mode, Source};

/// What a query selects.
pub enum Matcher {
    /// The record with exactly this key.
    Key(Key),
    /// Every record whose key falls in the range.
    Range(KeyRange),
    /// Every record whose key appears in the list.
    ///
    /// Selection stops once as many records as listed keys have been
    /// found, so a non-unique index may leave later duplicates unseen.
    Keys(Vec<Key>),
    /// Every record whose value satisfies the predicate.
    Predicate(Box<dyn Fn(&Value) -> bool + Send + Sync>),
}

impl Matcher {
    /// A predicate matcher.
    pub fn predicate(f: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Box::new(f))
    }

    /// A key-list matcher.
    pub fn keys(keys: impl IntoIterator<Item = impl Into<Key>>) -> Self {
        Self::Keys(keys.into_iter().map(Into::into).collect())
    }

    /// Whether a record matches, given its key in the target's ordering
    /// and its value.
    fn matches(&self, key: &Key, value: &Value) -> bool {
        match self {
            Self::Key(k) => key == k,
            Self::Range(range) => range.contains(key),
            Self::Keys(keys) => keys.contains(key),
            Self::Predicate(pred) => pred(value),
        }
    }

    /// The key range a scan for this matcher can be narrowed to.
    fn range_hint(&self) -> Option<KeyRange> {
        match self {
            Self::Key(k) => Some(KeyRange::only(k.clone())),
            Self::Range(range) => Some(range.clone()),
            Self::Keys(_) | Self::Predicate(_) => None,
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(k) => f.debug_tuple("Key").field(k).finish(),
            Self::Range(r) => f.debug_tuple("Range").field(r).finish(),
            Self::Keys(keys) => f.debug_tuple("Keys").field(keys).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl From<Key> for Matcher {
    fn from(key: Key) -> Self {
        Self::Key(key)
    }
}

impl From<KeyRange> for Matcher {
    fn from(range: KeyRange) -> Self {
        Self::Range(range)
    }
}

impl From<Vec<Key>> for Matcher {
    fn from(keys: Vec<Key>) -> Self {
        Self::Keys(keys)
    }
}

/// How an update changes a matched record.
///
/// Either way the result is a shallow merge: top-level fields of the
/// partial overwrite the record's, everything else is kept. A
/// non-object partial replaces the record outright.
pub enum Patch {
    /// A fixed partial value merged over the record.
    Merge(Value),
    /// A function of the current record producing the partial to merge.
    With(Box<dyn Fn(&Value) -> Value + Send + Sync>),
}

impl Patch {
    /// A fixed-partial patch.
    #[must_use]
    pub fn merge(partial: Value) -> Self {
        Self::Merge(partial)
    }

    /// A computed-partial patch.
    pub fn with(f: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        Self::With(Box::new(f))
    }

    pub(crate) fn apply(&self, current: &Value) -> Value {
        let partial = match self {
            Self::Merge(partial) => partial.clone(),
            Self::With(f) => f(current),
        };
        match (current, partial) {
            (Value::Object(base), Value::Object(overlay)) => {
                let mut merged = base.clone();
                for (field, value) in overlay {
                    merged.insert(field, value);
                }
                Value::Object(merged)
            }
            (_, partial) => partial,
        }
    }
}

impl fmt::Debug for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Merge(partial) => f.debug_tuple("Merge").field(partial).finish(),
            Self::With(_) => f.write_str("With(..)"),
        }
    }
}

/// Executes queries against one store or one of its indexes.
///
/// Write operations assume a store target; the facades only expose them
/// there.
pub(crate) struct QueryTarget<'a> {
    conn: &'a dyn Connection,
    store: &'a str,
    index: Option<&'a str>,
}

impl<'a> QueryTarget<'a> {
    pub(crate) fn store(conn: &'a dyn Connection, store: &'a str) -> Self {
        Self {
            conn,
            store,
            index: None,
        }
    }

    pub(crate) fn index(conn: &'a dyn Connection, store: &'a str, index: &'a str) -> Self {
        Self {
            conn,
            store,
            index: Some(index),
        }
    }

    fn source(&self) -> Source<'_> {
        match self.index {
            Some(index) => Source::Index {
                store: self.store,
                index,
            },
            None => Source::Store(self.store),
        }
    }

    /// The first matching record, or `None`.
    pub(crate) fn get(&self, matcher: &Matcher) -> DbResult<Option<Value>> {
        match matcher {
            Matcher::Key(k) => self.first_in(&KeyRange::only(k.clone())),
            Matcher::Range(range) => self.first_in(range),
            Matcher::Keys(_) | Matcher::Predicate(_) => {
                let mut found = None;
                scan(
                    self.conn,
                    self.store,
                    self.index,
                    Mode::ReadOnly,
                    None,
                    Direction::Forward,
                    |entry| {
                        if matcher.matches(entry.key(), entry.value()) {
                            found = Some(entry.value().clone());
                            Ok(Decision::Abort)
                        } else {
                            Ok(Decision::Continue)
                        }
                    },
                )?;
                Ok(found)
            }
        }
    }

    fn first_in(&self, range: &KeyRange) -> DbResult<Option<Value>> {
        let mut tx = self.conn.transaction(&[self.store], Mode::ReadOnly)?;
        let hit = tx.get(self.source(), range)?;
        tx.commit()?;
        Ok(hit.map(|(_, value)| value))
    }

    /// Every matching record in source key order, up to `limit`.
    pub(crate) fn get_array(
        &self,
        matcher: Option<&Matcher>,
        limit: Option<usize>,
    ) -> DbResult<Vec<Value>> {
        let rows = self.collect(matcher, limit)?;
        Ok(rows.into_iter().map(|(_, value)| value).collect())
    }

    /// Every matching record keyed by primary key, up to `limit`.
    pub(crate) fn get_map(
        &self,
        matcher: Option<&Matcher>,
        limit: Option<usize>,
    ) -> DbResult<BTreeMap<Key, Value>> {
        let rows = self.collect(matcher, limit)?;
        Ok(rows.into_iter().collect())
    }

    /// The number of matching records.
    pub(crate) fn count(&self, matcher: Option<&Matcher>) -> DbResult<usize> {
        match matcher {
            None => self.count_in(&KeyRange::all()),
            Some(Matcher::Key(k)) => self.count_in(&KeyRange::only(k.clone())),
            Some(Matcher::Range(range)) => self.count_in(range),
            Some(matcher) => {
                let mut total = 0;
                scan(
                    self.conn,
                    self.store,
                    self.index,
                    Mode::ReadOnly,
                    None,
                    Direction::Forward,
                    |entry| {
                        if matcher.matches(entry.key(), entry.value()) {
                            total += 1;
                        }
                        Ok(Decision::Continue)
                    },
                )?;
                Ok(total)
            }
        }
    }

    fn count_in(&self, range: &KeyRange) -> DbResult<usize> {
        let mut tx = self.conn.transaction(&[self.store], Mode::ReadOnly)?;
        let total = tx.count(self.source(), range)?;
        tx.commit()?;
        Ok(total)
    }

    fn collect(
        &self,
        matcher: Option<&Matcher>,
        limit: Option<usize>,
    ) -> DbResult<Vec<(Key, Value)>> {
        if limit == Some(0) {
            return Ok(Vec::new());
        }
        let range = match matcher {
            None => KeyRange::all(),
            Some(Matcher::Key(k)) => KeyRange::only(k.clone()),
            Some(Matcher::Range(range)) => range.clone(),
            Some(matcher) => {
                // Keys stops once as many records as listed keys have
                // been collected; a predicate runs to the limit or the
                // end.
                let target = match (matcher, limit) {
                    (Matcher::Keys(keys), Some(limit)) => Some(keys.len().min(limit)),
                    (Matcher::Keys(keys), None) => Some(keys.len()),
                    (_, limit) => limit,
                };
                if target == Some(0) {
                    return Ok(Vec::new());
                }
                let mut rows = Vec::new();
                scan(
                    self.conn,
                    self.store,
                    self.index,
                    Mode::ReadOnly,
                    None,
                    Direction::Forward,
                    |entry| {
                        if matcher.matches(entry.key(), entry.value()) {
                            rows.push((entry.primary_key().clone(), entry.value().clone()));
                            if Some(rows.len()) == target {
                                return Ok(Decision::Done);
                            }
                        }
                        Ok(Decision::Continue)
                    },
                )?;
                return Ok(rows);
            }
        };
        let mut tx = self.conn.transaction(&[self.store], Mode::ReadOnly)?;
        let rows = tx.get_range(self.source(), &range, limit)?;
        tx.commit()?;
        Ok(rows)
    }

    /// Merges the patch into the first matching record, in scan order.
    ///
    /// Returns the record as written, or `None` when nothing matched.
    pub(crate) fn update(&self, matcher: &Matcher, patch: &Patch) -> DbResult<Option<Value>> {
        let mut updated = None;
        scan(
            self.conn,
            self.store,
            self.index,
            Mode::ReadWrite,
            matcher.range_hint(),
            Direction::Forward,
            |entry| {
                if matcher.matches(entry.key(), entry.value()) {
                    let merged = patch.apply(entry.value());
                    entry.update(&merged)?;
                    updated = Some(merged);
                    Ok(Decision::Done)
                } else {
                    Ok(Decision::Continue)
                }
            },
        )?;
        Ok(updated)
    }

    /// Deletes every matching record.
    pub(crate) fn delete(&self, matcher: &Matcher) -> DbResult<()> {
        match matcher {
            Matcher::Key(k) => self.delete_in(&KeyRange::only(k.clone())),
            Matcher::Range(range) => self.delete_in(range),
            Matcher::Keys(_) | Matcher::Predicate(_) => {
                scan(
                    self.conn,
                    self.store,
                    self.index,
                    Mode::ReadWrite,
                    None,
                    Direction::Forward,
                    |entry| {
                        if matcher.matches(entry.key(), entry.value()) {
                            entry.delete()?;
                        }
                        Ok(Decision::Continue)
                    },
                )
            }
        }
    }

    fn delete_in(&self, range: &KeyRange) -> DbResult<()> {
        let mut tx = self.conn.transaction(&[self.store], Mode::ReadWrite)?;
        tx.delete(self.store, range)?;
        tx.commit()?;
        Ok(())
    }

    /// Deletes every record, or every record satisfying the predicate.
    pub(crate) fn delete_all(
        &self,
        predicate: Option<&dyn Fn(&Value) -> bool>,
    ) -> DbResult<()> {
        match predicate {
            None => {
                let mut tx = self.conn.transaction(&[self.store], Mode::ReadWrite)?;
                tx.clear(self.store)?;
                tx.commit()?;
                Ok(())
            }
            Some(pred) => scan(
                self.conn,
                self.store,
                self.index,
                Mode::ReadWrite,
                None,
                Direction::Forward,
                |entry| {
                    if pred(entry.value()) {
                        entry.delete()?;
                    }
                    Ok(Decision::Continue)
                },
            ),
        }
    }

    /// Inserts a record, deriving its key from the store shape.
    pub(crate) fn add(&self, key: Option<&Key>, value: &Value) -> DbResult<Key> {
        let mut tx = self.conn.transaction(&[self.store], Mode::ReadWrite)?;
        let key = tx.add(self.store, key, value)?;
        tx.commit()?;
        Ok(key)
    }

    /// Upserts a record.
    pub(crate) fn put(&self, key: Option<&Key>, value: &Value) -> DbResult<Key> {
        let mut tx = self.conn.transaction(&[self.store], Mode::ReadWrite)?;
        let key = tx.put(self.store, key, value)?;
        tx.commit()?;
        Ok(key)
    }

    /// Upserts a batch in one transaction.
    pub(crate) fn put_all(&self, values: &[Value]) -> DbResult<Vec<Key>> {
        let mut tx = self.conn.transaction(&[self.store], Mode::ReadWrite)?;
        let mut keys = Vec::with_capacity(values.len());
        for value in values {
            keys.push(tx.put(self.store, None, value)?);
        }
        tx.commit()?;
        Ok(keys)
    }
}
