//! Deferred address handles and the resolution arena backing them.
//!
//! A [`Symbol`] is a many-to-one weak reference to "the address of some segment". Consumers
//! hold the symbol before layout; the referenced segment records its address into the
//! [`SymbolTable`] during phase 2 (`update_offsets`), and consumers read it back during
//! phase 3 (`update_references`). Resolving a symbol that was never defined is a consistency
//! error: it means the referenced segment was never added to the tree.

use std::fmt;

use crate::Result;

/// The final location of a placed segment: its file offset and RVA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAddress {
    /// File offset of the segment's first byte
    pub offset: u64,
    /// Relative virtual address of the segment's first byte
    pub rva: u32,
}

impl SegmentAddress {
    /// The virtual address of this location for an image loaded at `image_base`.
    #[must_use]
    pub fn va(&self, image_base: u64) -> u64 {
        image_base + u64::from(self.rva)
    }
}

/// A deferred handle to the address of a segment.
///
/// Symbols are plain indices into a [`SymbolTable`]; they are cheap to copy and carry no
/// address of their own until layout has run.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Symbol(u32);

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol(#{})", self.0)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The address-resolution arena shared by one build.
///
/// Symbols are reserved up front while the logical model is being translated into segments,
/// defined once during offset assignment, and read during reference resolution. The table
/// holds no segment ownership; it is purely an index-to-address map.
#[derive(Debug, Default)]
pub struct SymbolTable {
    entries: Vec<Option<SegmentAddress>>,
}

impl SymbolTable {
    /// Creates an empty symbol table.
    #[must_use]
    pub fn new() -> Self {
        SymbolTable::default()
    }

    /// Reserves a new, not yet resolvable symbol.
    pub fn reserve(&mut self) -> Symbol {
        self.entries.push(None);
        Symbol((self.entries.len() - 1) as u32)
    }

    /// Records the final address of `symbol`.
    ///
    /// Called by the owning segment during phase 2. Each symbol is defined exactly once per
    /// build.
    pub fn define(&mut self, symbol: Symbol, address: SegmentAddress) {
        self.entries[symbol.0 as usize] = Some(address);
    }

    /// Resolves `symbol` to its final address.
    ///
    /// # Errors
    /// Returns [`crate::Error::Consistency`] if the symbol has not been assigned an address,
    /// which means the segment exporting it was never placed into the tree before this
    /// resolution was attempted.
    pub fn resolve(&self, symbol: Symbol) -> Result<SegmentAddress> {
        self.entries
            .get(symbol.0 as usize)
            .copied()
            .flatten()
            .ok_or_else(|| {
                consistency_error!("symbol {} resolved before its segment was placed", symbol)
            })
    }

    /// Whether `symbol` has been assigned an address.
    #[must_use]
    pub fn is_defined(&self, symbol: Symbol) -> bool {
        matches!(self.entries.get(symbol.0 as usize), Some(Some(_)))
    }

    /// Number of symbols reserved so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no symbols have been reserved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
