//! Decision-driven cursor scans.
//!
//! [`scan`] owns the whole lifecycle of a cursor walk: it opens the
//! transaction, drives the cursor, and commits or aborts based on what
//! the per-entry closure returns. Callers never hold a raw cursor; they
//! see one [`ScanEntry`] at a time and answer with a [`Decision`].

use crate::error::DbResult;
use serde_json::Value;
use strata_engine::{
    Connection, Cursor, CursorRow, Direction, Key, KeyRange, Mode, Source,
};

/// What a scan does after visiting an entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Step to the next record.
    Continue,
    /// Jump to the first record at or beyond the key in traversal order.
    SkipTo(Key),
    /// Step the given number of records forward. Zero steps once.
    Advance(u32),
    /// Stop and abort the transaction, discarding in-scan writes.
    ///
    /// An abort is a normal outcome, not an error; the scan returns
    /// `Ok`.
    Abort,
    /// Stop and commit the transaction, keeping in-scan writes.
    Done,
}

/// The record a scan is currently visiting, with in-place write access.
pub struct ScanEntry<'c> {
    row: &'c CursorRow,
    cursor: &'c mut dyn Cursor,
}

impl ScanEntry<'_> {
    /// The key in the source's ordering (the index key on index scans).
    #[must_use]
    pub fn key(&self) -> &Key {
        &self.row.key
    }

    /// The record's primary key.
    #[must_use]
    pub fn primary_key(&self) -> &Key {
        &self.row.primary_key
    }

    /// The record value.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.row.value
    }

    /// Replaces the current record's value. The primary key must not
    /// change. Persists only if the scan ends in [`Decision::Done`] or
    /// runs to exhaustion.
    pub fn update(&mut self, value: &Value) -> DbResult<()> {
        self.cursor.update(value)?;
        Ok(())
    }

    /// Deletes the current record. The scan continues past it.
    pub fn delete(&mut self) -> DbResult<()> {
        self.cursor.delete()?;
        Ok(())
    }
}

enum Outcome {
    Commit,
    Abort,
}

/// Scans a store (or one of its indexes) under its own transaction.
///
/// Visits records in `direction` order within `range`, handing each to
/// `per_entry`. Exhaustion and [`Decision::Done`] commit; a
/// [`Decision::Abort`] aborts and still returns `Ok`. An error from
/// `per_entry` or the engine aborts and propagates.
pub fn scan(
    conn: &dyn Connection,
    store: &str,
    index: Option<&str>,
    mode: Mode,
    range: Option<KeyRange>,
    direction: Direction,
    mut per_entry: impl FnMut(&mut ScanEntry<'_>) -> DbResult<Decision>,
) -> DbResult<()> {
    let source = match index {
        Some(index) => Source::Index { store, index },
        None => Source::Store(store),
    };
    let mut tx = conn.transaction(&[store], mode)?;
    let outcome = {
        let mut cursor = tx.open_cursor(source, range, direction)?;
        drive(cursor.as_mut(), &mut per_entry)
    };
    match outcome {
        Ok(Outcome::Commit) => tx.commit()?,
        Ok(Outcome::Abort) => tx.abort()?,
        Err(err) => {
            // The closure's error is the one to report, even if the
            // abort itself fails.
            let _ = tx.abort();
            return Err(err);
        }
    }
    Ok(())
}

fn drive(
    cursor: &mut dyn Cursor,
    per_entry: &mut dyn FnMut(&mut ScanEntry<'_>) -> DbResult<Decision>,
) -> DbResult<Outcome> {
    let mut current = cursor.step()?;
    while let Some(row) = current {
        let decision = {
            let mut entry = ScanEntry {
                row: &row,
                cursor: &mut *cursor,
            };
            per_entry(&mut entry)?
        };
        current = match decision {
            Decision::Continue => cursor.step()?,
            Decision::SkipTo(key) => cursor.seek(&key)?,
            Decision::Advance(count) => cursor.advance(count.max(1))?,
            Decision::Abort => return Ok(Outcome::Abort),
            Decision::Done => return Ok(Outcome::Commit),
        };
    }
    Ok(Outcome::Commit)
}
