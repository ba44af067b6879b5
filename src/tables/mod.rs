//! Metadata table buffering and physical serialization.
//!
//! The managed-metadata tables stream consists of fixed-column row arrays, several of which
//! the format requires to be physically sorted by a specific column so readers can binary
//! search them. Logical producers only know the member a row was generated for, not its
//! eventual position, so rows are accumulated in one of three buffer strategies and flushed
//! to their final physical form at the end:
//!
//! - [`UnsortedTableBuffer`] - insertion order is final; row ids are stable immediately
//! - [`DistinctTableBuffer`] - value-equal rows are deduplicated to a single row id
//! - [`SortedTableBuffer`] - rows are buffered with a caller key, stable-sorted by a 1-2
//!   column projection at finalization, and renumbered 1..N
//!
//! Finalized buffers report [`Token`] values (table index + 1-based RID) and can be flushed
//! into a [`MetadataTable`] segment for placement in the output image.

mod buffer;
mod token;

pub use buffer::{DistinctTableBuffer, SortedTableBuffer, UnsortedTableBuffer};
pub use token::Token;

use crate::segment::{LayoutParameters, Segment, SymbolTable};
use crate::{Error, Result};

/// All metadata tables defined by ECMA-335, with their table stream indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display, strum::FromRepr)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum TableId {
    Module = 0x00,
    TypeRef = 0x01,
    TypeDef = 0x02,
    FieldPtr = 0x03,
    Field = 0x04,
    MethodPtr = 0x05,
    MethodDef = 0x06,
    ParamPtr = 0x07,
    Param = 0x08,
    InterfaceImpl = 0x09,
    MemberRef = 0x0A,
    Constant = 0x0B,
    CustomAttribute = 0x0C,
    FieldMarshal = 0x0D,
    DeclSecurity = 0x0E,
    ClassLayout = 0x0F,
    FieldLayout = 0x10,
    StandAloneSig = 0x11,
    EventMap = 0x12,
    EventPtr = 0x13,
    Event = 0x14,
    PropertyMap = 0x15,
    PropertyPtr = 0x16,
    Property = 0x17,
    MethodSemantics = 0x18,
    MethodImpl = 0x19,
    ModuleRef = 0x1A,
    TypeSpec = 0x1B,
    ImplMap = 0x1C,
    FieldRva = 0x1D,
    Assembly = 0x20,
    AssemblyProcessor = 0x21,
    AssemblyOS = 0x22,
    AssemblyRef = 0x23,
    AssemblyRefProcessor = 0x24,
    AssemblyRefOS = 0x25,
    File = 0x26,
    ExportedType = 0x27,
    ManifestResource = 0x28,
    NestedClass = 0x29,
    GenericParam = 0x2A,
    MethodSpec = 0x2B,
    GenericParamConstraint = 0x2C,
}

impl TableId {
    /// The sort-key columns the format mandates for this table, if it must be sorted.
    ///
    /// Returns `(primary, secondary)` column indices into the table's canonical column
    /// order. Tables not listed by ECMA-335 §II.22 as sorted return `None`.
    #[must_use]
    pub fn sort_key(&self) -> Option<(usize, Option<usize>)> {
        match self {
            TableId::ClassLayout => Some((2, None)),
            TableId::Constant => Some((1, None)),
            TableId::CustomAttribute => Some((0, None)),
            TableId::DeclSecurity => Some((1, None)),
            TableId::FieldLayout => Some((1, None)),
            TableId::FieldMarshal => Some((0, None)),
            TableId::FieldRva => Some((1, None)),
            TableId::GenericParam => Some((2, Some(0))),
            TableId::GenericParamConstraint => Some((0, None)),
            TableId::ImplMap => Some((1, None)),
            TableId::InterfaceImpl => Some((0, Some(1))),
            TableId::MethodImpl => Some((0, None)),
            TableId::MethodSemantics => Some((2, None)),
            TableId::NestedClass => Some((0, None)),
            _ => None,
        }
    }

    /// Whether the format requires this table to be physically sorted.
    #[must_use]
    pub fn is_sorted(&self) -> bool {
        self.sort_key().is_some()
    }
}

/// A fixed-column tuple of table-relative values.
///
/// Columns are held as `u32`; the physical width of each column (1, 2 or 4 bytes) is only
/// decided when the finished table is serialized with a [`ColumnLayout`]. Row identity for
/// deduplication is full value equality over all columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Row {
    columns: Vec<u32>,
}

impl Row {
    /// Creates a row from its column values.
    #[must_use]
    pub fn new(columns: Vec<u32>) -> Self {
        Row { columns }
    }

    /// The value of column `index`.
    ///
    /// Returns 0 for columns beyond the row's width, which keeps short rows comparable
    /// under any projection.
    #[must_use]
    pub fn column(&self, index: usize) -> u32 {
        self.columns.get(index).copied().unwrap_or(0)
    }

    /// Number of columns.
    #[must_use]
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// All column values in order.
    #[must_use]
    pub fn columns(&self) -> &[u32] {
        &self.columns
    }
}

impl From<Vec<u32>> for Row {
    fn from(columns: Vec<u32>) -> Self {
        Row::new(columns)
    }
}

/// The physical byte width of each column of one table.
///
/// Widths are 1, 2 or 4 bytes; index columns widen from 2 to 4 bytes when the referenced
/// table or heap outgrows 16 bits, which is decided by the caller that owns the full stream
/// picture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLayout {
    widths: Vec<u8>,
}

impl ColumnLayout {
    /// Creates a layout from per-column byte widths.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if any width is not 1, 2 or 4.
    pub fn new(widths: Vec<u8>) -> Result<Self> {
        if let Some(&bad) = widths.iter().find(|w| !matches!(w, 1 | 2 | 4)) {
            return Err(Error::Config {
                message: format!("column width {bad} is not 1, 2 or 4 bytes"),
            });
        }
        Ok(ColumnLayout { widths })
    }

    /// The serialized size of one row.
    #[must_use]
    pub fn row_size(&self) -> u32 {
        self.widths.iter().map(|w| u32::from(*w)).sum()
    }

    /// Number of columns.
    #[must_use]
    pub fn width(&self) -> usize {
        self.widths.len()
    }
}

/// A finished, physically serializable metadata table.
///
/// Produced by flushing one of the buffer strategies; rows are final and in their physical
/// order.
pub struct MetadataTable {
    id: TableId,
    layout: ColumnLayout,
    rows: Vec<Row>,
}

impl MetadataTable {
    /// Creates a table from finalized rows.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if a row's column count does not match the layout.
    pub fn new(id: TableId, layout: ColumnLayout, rows: Vec<Row>) -> Result<Self> {
        if let Some(row) = rows.iter().find(|r| r.width() != layout.width()) {
            return Err(Error::Config {
                message: format!(
                    "table {id} row has {} columns, layout expects {}",
                    row.width(),
                    layout.width()
                ),
            });
        }
        Ok(MetadataTable { id, layout, rows })
    }

    /// The table this segment serializes.
    #[must_use]
    pub fn id(&self) -> TableId {
        self.id
    }

    /// Number of rows.
    #[must_use]
    pub fn row_count(&self) -> u32 {
        self.rows.len() as u32
    }

    /// The finalized rows in physical order.
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }
}

impl Segment for MetadataTable {
    fn physical_size(&self) -> u32 {
        self.layout.row_size() * self.row_count()
    }

    fn update_offsets(&mut self, _params: LayoutParameters, _symbols: &mut SymbolTable) {}

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        for row in &self.rows {
            for (index, &width) in self.layout.widths.iter().enumerate() {
                let value = row.column(index);
                let limit = match width {
                    1 => 0xFF,
                    2 => 0xFFFF,
                    _ => u32::MAX,
                };
                if value > limit {
                    return Err(Error::FormatLimit {
                        message: format!(
                            "table {} column {index} value {value:#x} exceeds its {width}-byte field",
                            self.id
                        ),
                    });
                }
                buf.extend_from_slice(&value.to_le_bytes()[..width as usize]);
            }
        }
        Ok(())
    }
}
