//! The three row-accumulation strategies feeding the metadata tables.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use crate::tables::{ColumnLayout, MetadataTable, Row, TableId, Token};
use crate::Result;

/// Accumulates rows in insertion order.
///
/// Row ids are 1-based, final and stable the moment [`UnsortedTableBuffer::add`] returns;
/// flushing copies the rows verbatim.
#[derive(Debug, Clone)]
pub struct UnsortedTableBuffer {
    id: TableId,
    rows: Vec<Row>,
}

impl UnsortedTableBuffer {
    /// Creates an empty buffer for `id`.
    #[must_use]
    pub fn new(id: TableId) -> Self {
        UnsortedTableBuffer {
            id,
            rows: Vec::new(),
        }
    }

    /// The table this buffer accumulates rows for.
    #[must_use]
    pub fn id(&self) -> TableId {
        self.id
    }

    /// Appends a row, returning its final 1-based row id.
    pub fn add(&mut self, row: Row) -> u32 {
        self.rows.push(row);
        self.rows.len() as u32
    }

    /// The row stored at `rid`, if present.
    #[must_use]
    pub fn row(&self, rid: u32) -> Option<&Row> {
        self.rows.get(rid.checked_sub(1)? as usize)
    }

    /// Replaces the row stored at `rid`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Consistency`] if `rid` was never assigned.
    pub fn update(&mut self, rid: u32, row: Row) -> Result<()> {
        let slot = rid
            .checked_sub(1)
            .and_then(|i| self.rows.get_mut(i as usize))
            .ok_or_else(|| consistency_error!("table {} has no row id {rid}", self.id))?;
        *slot = row;
        Ok(())
    }

    /// Number of rows accumulated so far.
    #[must_use]
    pub fn row_count(&self) -> u32 {
        self.rows.len() as u32
    }

    /// The token for an assigned row id.
    ///
    /// # Errors
    /// Returns [`crate::Error::FormatLimit`] if the row id overflows the token field.
    pub fn token(&self, rid: u32) -> Result<Token> {
        Token::from_parts(self.id, rid)
    }

    /// Flushes into a physically serializable table.
    ///
    /// # Errors
    /// Returns [`crate::Error::Config`] if the rows do not match the layout.
    pub fn flush(self, layout: ColumnLayout) -> Result<MetadataTable> {
        MetadataTable::new(self.id, layout, self.rows)
    }
}

/// Accumulates rows, collapsing value-equal insertions to a single row.
///
/// Wraps [`UnsortedTableBuffer`] with a value-equality index: inserting a row equal to an
/// existing one returns the existing row id without growing the table. Updating a stored
/// row to a value that collides with a different slot is rejected, because it would make
/// two logical identities share one physical row unintentionally.
#[derive(Debug, Clone)]
pub struct DistinctTableBuffer {
    inner: UnsortedTableBuffer,
    index: HashMap<Row, u32>,
}

impl DistinctTableBuffer {
    /// Creates an empty deduplicating buffer for `id`.
    #[must_use]
    pub fn new(id: TableId) -> Self {
        DistinctTableBuffer {
            inner: UnsortedTableBuffer::new(id),
            index: HashMap::new(),
        }
    }

    /// The table this buffer accumulates rows for.
    #[must_use]
    pub fn id(&self) -> TableId {
        self.inner.id()
    }

    /// Inserts a row, returning the row id of the first value-equal insertion.
    pub fn add(&mut self, row: Row) -> u32 {
        if let Some(&existing) = self.index.get(&row) {
            return existing;
        }
        let rid = self.inner.add(row.clone());
        self.index.insert(row, rid);
        rid
    }

    /// Replaces the row stored at `rid`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Consistency`] if `rid` was never assigned, or if the new
    /// value collides with a different slot's value.
    pub fn update(&mut self, rid: u32, row: Row) -> Result<()> {
        if let Some(&existing) = self.index.get(&row) {
            if existing != rid {
                return Err(consistency_error!(
                    "table {} row id {rid} update collides with row id {existing}",
                    self.id()
                ));
            }
            return Ok(());
        }

        let old = self
            .inner
            .row(rid)
            .cloned()
            .ok_or_else(|| consistency_error!("table {} has no row id {rid}", self.id()))?;
        self.index.remove(&old);
        self.index.insert(row.clone(), rid);
        self.inner.update(rid, row)
    }

    /// Number of distinct rows accumulated so far.
    #[must_use]
    pub fn row_count(&self) -> u32 {
        self.inner.row_count()
    }

    /// The token for an assigned row id.
    ///
    /// # Errors
    /// Returns [`crate::Error::FormatLimit`] if the row id overflows the token field.
    pub fn token(&self, rid: u32) -> Result<Token> {
        self.inner.token(rid)
    }

    /// Flushes into a physically serializable table.
    ///
    /// # Errors
    /// Returns [`crate::Error::Config`] if the rows do not match the layout.
    pub fn flush(self, layout: ColumnLayout) -> Result<MetadataTable> {
        self.inner.flush(layout)
    }
}

/// Accumulates keyed rows and renumbers them in sorted order at finalization.
///
/// The format requires several tables to be physically sorted by a specific column so its
/// readers can binary search, but producers only know the logical member a row belongs to.
/// Rows are therefore buffered with a caller-supplied key; [`SortedTableBuffer::finalize`]
/// stable-sorts by the (primary, secondary) column projection, ties broken by insertion
/// order, assigns row ids 1..N in that order, and only then makes
/// [`SortedTableBuffer::token_for`] valid.
#[derive(Debug, Clone)]
pub struct SortedTableBuffer<K> {
    id: TableId,
    primary: usize,
    secondary: Option<usize>,
    pending: Vec<(K, Row)>,
    finalized: Option<Finalized<K>>,
}

#[derive(Debug, Clone)]
struct Finalized<K> {
    rows: Vec<Row>,
    rids: HashMap<K, u32>,
}

impl<K: Eq + Hash + Clone + Debug> SortedTableBuffer<K> {
    /// Creates a buffer sorting by `primary`, ties broken by `secondary`.
    #[must_use]
    pub fn new(id: TableId, primary: usize, secondary: Option<usize>) -> Self {
        SortedTableBuffer {
            id,
            primary,
            secondary,
            pending: Vec::new(),
            finalized: None,
        }
    }

    /// Creates a buffer using the sort key the format mandates for `id`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Config`] if `id` is not one of the format's sorted tables.
    pub fn for_table(id: TableId) -> Result<Self> {
        let (primary, secondary) = id.sort_key().ok_or_else(|| crate::Error::Config {
            message: format!("table {id} is not a sorted table"),
        })?;
        Ok(SortedTableBuffer::new(id, primary, secondary))
    }

    /// The table this buffer accumulates rows for.
    #[must_use]
    pub fn id(&self) -> TableId {
        self.id
    }

    /// Buffers a row under `key`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Consistency`] if the buffer has already been finalized or if
    /// `key` was already used; row identity must be unique per caller key.
    pub fn add(&mut self, key: K, row: Row) -> Result<()> {
        if self.finalized.is_some() {
            return Err(consistency_error!(
                "table {} received a row after finalization",
                self.id
            ));
        }
        if self.pending.iter().any(|(k, _)| *k == key) {
            return Err(consistency_error!(
                "table {} already buffers a row for key {key:?}",
                self.id
            ));
        }
        self.pending.push((key, row));
        Ok(())
    }

    /// Number of rows buffered so far.
    #[must_use]
    pub fn row_count(&self) -> u32 {
        match &self.finalized {
            Some(finalized) => finalized.rows.len() as u32,
            None => self.pending.len() as u32,
        }
    }

    /// Sorts the buffered rows and assigns final row ids 1..N.
    ///
    /// The sort is stable: rows with equal (primary, secondary) values keep their insertion
    /// order, since the resulting layout is observable by downstream consumers.
    pub fn finalize(&mut self) {
        if self.finalized.is_some() {
            return;
        }

        let mut pending = std::mem::take(&mut self.pending);
        let primary = self.primary;
        let secondary = self.secondary;
        pending.sort_by_key(|(_, row)| {
            (
                row.column(primary),
                secondary.map_or(0, |column| row.column(column)),
            )
        });

        let mut rows = Vec::with_capacity(pending.len());
        let mut rids = HashMap::with_capacity(pending.len());
        for (index, (key, row)) in pending.into_iter().enumerate() {
            rows.push(row);
            rids.insert(key, index as u32 + 1);
        }

        self.finalized = Some(Finalized { rows, rids });
    }

    /// The final token assigned to the row buffered under `key`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Consistency`] if the buffer has not been finalized yet, or
    /// if no row was buffered under `key`.
    pub fn token_for(&self, key: &K) -> Result<Token> {
        let finalized = self.finalized.as_ref().ok_or_else(|| {
            consistency_error!("table {} token queried before finalization", self.id)
        })?;
        let rid = finalized.rids.get(key).ok_or_else(|| {
            consistency_error!("table {} holds no row for key {key:?}", self.id)
        })?;
        Token::from_parts(self.id, *rid)
    }

    /// The finalized rows in physical order.
    ///
    /// # Errors
    /// Returns [`crate::Error::Consistency`] if the buffer has not been finalized yet.
    pub fn rows(&self) -> Result<&[Row]> {
        self.finalized
            .as_ref()
            .map(|f| f.rows.as_slice())
            .ok_or_else(|| consistency_error!("table {} read before finalization", self.id))
    }

    /// Flushes the finalized rows into a physically serializable table.
    ///
    /// # Errors
    /// Returns [`crate::Error::Consistency`] if the buffer has not been finalized, or
    /// [`crate::Error::Config`] if the rows do not match the layout.
    pub fn flush(self, layout: ColumnLayout) -> Result<MetadataTable> {
        let finalized = self.finalized.ok_or_else(|| {
            consistency_error!("table {} flushed before finalization", self.id)
        })?;
        MetadataTable::new(self.id, layout, finalized.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_unsorted_rids_are_stable_immediately() {
        let mut buffer = UnsortedTableBuffer::new(TableId::TypeRef);
        assert_eq!(buffer.add(Row::new(vec![1, 2, 3])), 1);
        assert_eq!(buffer.add(Row::new(vec![4, 5, 6])), 2);
        assert_eq!(buffer.row_count(), 2);
        assert_eq!(buffer.token(2).unwrap().value(), 0x0100_0002);
    }

    #[test]
    fn test_distinct_dedups_equal_rows() {
        let mut buffer = DistinctTableBuffer::new(TableId::AssemblyRef);

        let first = buffer.add(Row::new(vec![1, 0, 0, 0, 0x100]));
        let second = buffer.add(Row::new(vec![1, 0, 0, 0, 0x100]));
        assert_eq!(first, second);
        assert_eq!(buffer.row_count(), 1);

        let third = buffer.add(Row::new(vec![2, 0, 0, 0, 0x100]));
        assert_ne!(first, third);
        assert_eq!(buffer.row_count(), 2);
    }

    #[test]
    fn test_distinct_update_collision_is_rejected() {
        let mut buffer = DistinctTableBuffer::new(TableId::ModuleRef);
        let a = buffer.add(Row::new(vec![0x10]));
        let b = buffer.add(Row::new(vec![0x20]));

        // Updating b to a's value would alias two identities.
        assert!(matches!(
            buffer.update(b, Row::new(vec![0x10])),
            Err(Error::Consistency { .. })
        ));

        // Updating a row to its own value is a no-op.
        buffer.update(a, Row::new(vec![0x10])).unwrap();

        // A genuinely new value re-indexes the slot.
        buffer.update(b, Row::new(vec![0x30])).unwrap();
        assert_eq!(buffer.add(Row::new(vec![0x30])), b);
        assert_eq!(buffer.add(Row::new(vec![0x20])), 3);
    }

    #[test]
    fn test_sorted_token_before_finalize_fails_fast() {
        let mut buffer = SortedTableBuffer::for_table(TableId::CustomAttribute).unwrap();
        buffer.add("attr", Row::new(vec![0x40, 0x0A, 0])).unwrap();

        assert!(matches!(
            buffer.token_for(&"attr"),
            Err(Error::Consistency { .. })
        ));

        buffer.finalize();
        assert_eq!(buffer.token_for(&"attr").unwrap().rid(), 1);
    }

    #[test]
    fn test_sorted_renumbers_by_primary_column() {
        let mut buffer = SortedTableBuffer::for_table(TableId::CustomAttribute).unwrap();
        buffer.add("late", Row::new(vec![0x90, 1, 0])).unwrap();
        buffer.add("early", Row::new(vec![0x10, 2, 0])).unwrap();
        buffer.add("middle", Row::new(vec![0x50, 3, 0])).unwrap();
        buffer.finalize();

        assert_eq!(buffer.token_for(&"early").unwrap().rid(), 1);
        assert_eq!(buffer.token_for(&"middle").unwrap().rid(), 2);
        assert_eq!(buffer.token_for(&"late").unwrap().rid(), 3);

        let rows = buffer.rows().unwrap();
        assert_eq!(rows[0].column(1), 2);
        assert_eq!(rows[2].column(1), 1);
    }

    #[test]
    fn test_sorted_two_column_key_and_stable_ties() {
        // GenericParam sorts by (Owner, Number).
        let mut buffer = SortedTableBuffer::for_table(TableId::GenericParam).unwrap();
        buffer.add("b0", Row::new(vec![0, 0, 2, 0])).unwrap();
        buffer.add("a1", Row::new(vec![1, 0, 1, 0])).unwrap();
        buffer.add("a0", Row::new(vec![0, 0, 1, 0])).unwrap();
        // Identical sort key as "b0": insertion order must win.
        buffer.add("b0bis", Row::new(vec![0, 7, 2, 0])).unwrap();
        buffer.finalize();

        assert_eq!(buffer.token_for(&"a0").unwrap().rid(), 1);
        assert_eq!(buffer.token_for(&"a1").unwrap().rid(), 2);
        assert_eq!(buffer.token_for(&"b0").unwrap().rid(), 3);
        assert_eq!(buffer.token_for(&"b0bis").unwrap().rid(), 4);
    }

    #[test]
    fn test_sorted_determinism_across_fresh_buffers() {
        let build = || {
            let mut buffer = SortedTableBuffer::for_table(TableId::InterfaceImpl).unwrap();
            buffer.add("x", Row::new(vec![3, 1])).unwrap();
            buffer.add("y", Row::new(vec![1, 2])).unwrap();
            buffer.add("z", Row::new(vec![3, 0])).unwrap();
            buffer.finalize();
            (
                buffer.token_for(&"x").unwrap(),
                buffer.token_for(&"y").unwrap(),
                buffer.token_for(&"z").unwrap(),
            )
        };

        assert_eq!(build(), build());

        let (x, y, z) = build();
        assert_eq!(y.rid(), 1);
        assert_eq!(z.rid(), 2); // (3, 0) sorts before (3, 1)
        assert_eq!(x.rid(), 3);
    }

    #[test]
    fn test_sorted_add_after_finalize_is_rejected() {
        let mut buffer = SortedTableBuffer::for_table(TableId::NestedClass).unwrap();
        buffer.finalize();
        assert!(matches!(
            buffer.add("k", Row::new(vec![1, 2])),
            Err(Error::Consistency { .. })
        ));
    }
}
