//! The shared hint-name blob referenced by import thunk tables.

use std::collections::HashMap;

use crate::segment::{LayoutParameters, Segment, Symbol, SymbolTable};
use crate::Result;

enum HintNameItem {
    /// u16 hint + NUL-terminated ASCII name, padded to even length.
    Entry { hint: u16, name: String },
    /// NUL-terminated ASCII module name, padded to even length.
    ModuleName { name: String },
}

impl HintNameItem {
    fn size(&self) -> u32 {
        let raw = match self {
            HintNameItem::Entry { name, .. } => 2 + name.len() + 1,
            HintNameItem::ModuleName { name } => name.len() + 1,
        };
        (raw as u32 + 1) & !1
    }

    fn write(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        match self {
            HintNameItem::Entry { hint, name } => {
                buf.extend_from_slice(&hint.to_le_bytes());
                buf.extend_from_slice(name.as_bytes());
                buf.push(0);
            }
            HintNameItem::ModuleName { name } => {
                buf.extend_from_slice(name.as_bytes());
                buf.push(0);
            }
        }
        if (buf.len() - start) % 2 != 0 {
            buf.push(0);
        }
    }
}

/// An append-only table of hint-name entries and module name strings.
///
/// Both kinds of content are deduplicated: adding the same (hint, name) pair or the same
/// module name twice returns the symbol of the first insertion. Every item exports one
/// [`Symbol`] for its own start address, defined once the table is placed. Item offsets
/// depend only on the content added before them, so symbols stay valid across later
/// insertions.
#[derive(Default)]
pub struct HintNameTable {
    items: Vec<(HintNameItem, Symbol)>,
    entry_index: HashMap<(u16, String), Symbol>,
    module_index: HashMap<String, Symbol>,
}

impl HintNameTable {
    /// Creates an empty hint-name table.
    #[must_use]
    pub fn new() -> Self {
        HintNameTable::default()
    }

    /// Adds a hint-name entry, returning the symbol of its start address.
    ///
    /// A pair equal to an earlier insertion returns the existing symbol.
    pub fn add_entry(&mut self, hint: u16, name: &str, symbols: &mut SymbolTable) -> Symbol {
        let key = (hint, name.to_string());
        if let Some(&existing) = self.entry_index.get(&key) {
            return existing;
        }
        let symbol = symbols.reserve();
        self.items.push((
            HintNameItem::Entry {
                hint,
                name: name.to_string(),
            },
            symbol,
        ));
        self.entry_index.insert(key, symbol);
        symbol
    }

    /// Adds a module name string, returning the symbol of its start address.
    pub fn add_module_name(&mut self, name: &str, symbols: &mut SymbolTable) -> Symbol {
        if let Some(&existing) = self.module_index.get(name) {
            return existing;
        }
        let symbol = symbols.reserve();
        self.items
            .push((HintNameItem::ModuleName { name: name.to_string() }, symbol));
        self.module_index.insert(name.to_string(), symbol);
        symbol
    }

    /// Number of items (entries plus module names) stored so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the table holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Segment for HintNameTable {
    fn physical_size(&self) -> u32 {
        self.items.iter().map(|(item, _)| item.size()).sum()
    }

    fn update_offsets(&mut self, params: LayoutParameters, symbols: &mut SymbolTable) {
        let mut current = params;
        for (item, symbol) in &self.items {
            symbols.define(*symbol, current.address());
            current = current.advance(item.size(), item.size());
        }
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        for (item, _) in &self.items {
            item.write(buf);
        }
        Ok(())
    }
}
