//! Import directory construction.
//!
//! The PE/COFF import machinery is three interlocking structures: a table of per-module
//! directory entries, one import lookup table and one import address table (IAT) per module,
//! and a shared hint-name blob holding the symbol and module names both thunk tables point
//! into. This module builds all of them from a flat list of [`ImportedModule`] declarations
//! and serializes them in the fixed order the loader expects: entry headers, lookup tables,
//! address tables, hint-name table.

mod directory;
mod hint_name;
mod thunk;

pub use directory::ImportDirectoryBuffer;
pub use hint_name::HintNameTable;
pub use thunk::{Thunk, ThunkTable};

/// A single symbol imported from a module, referenced either by ordinal or by hint + name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportedSymbol {
    /// Import by 16-bit export ordinal.
    Ordinal(u16),
    /// Import by name, with the hint used by the loader to shortcut the export lookup.
    Named {
        /// Index the loader tries first in the target's export name table
        hint: u16,
        /// The exported symbol name
        name: String,
    },
}

impl ImportedSymbol {
    /// Declares an import resolved by hint and name.
    #[must_use]
    pub fn by_name(hint: u16, name: &str) -> Self {
        ImportedSymbol::Named {
            hint,
            name: name.to_string(),
        }
    }

    /// Declares an import resolved by export ordinal.
    #[must_use]
    pub fn by_ordinal(ordinal: u16) -> Self {
        ImportedSymbol::Ordinal(ordinal)
    }

    /// The symbol name, if this is a named import.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            ImportedSymbol::Named { name, .. } => Some(name),
            ImportedSymbol::Ordinal(_) => None,
        }
    }
}

/// A module to import from, with the ordered list of symbols resolved against it.
#[derive(Debug, Clone, Default)]
pub struct ImportedModule {
    name: String,
    symbols: Vec<ImportedSymbol>,
}

impl ImportedModule {
    /// Declares an imported module by file name (e.g. `"KERNEL32.DLL"`).
    #[must_use]
    pub fn new(name: &str) -> Self {
        ImportedModule {
            name: name.to_string(),
            symbols: Vec::new(),
        }
    }

    /// Appends a symbol; thunk slot order follows insertion order.
    pub fn add_symbol(&mut self, symbol: ImportedSymbol) {
        self.symbols.push(symbol);
    }

    /// The module file name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared symbols in insertion order.
    #[must_use]
    pub fn symbols(&self) -> &[ImportedSymbol] {
        &self.symbols
    }
}
