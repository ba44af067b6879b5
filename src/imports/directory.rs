//! The top-level import directory buffer.

use crate::imports::{HintNameTable, ImportedModule, ImportedSymbol, Thunk, ThunkTable};
use crate::segment::{LayoutParameters, Segment, Symbol, SymbolTable};
use crate::Result;

/// Size of one import directory entry header in bytes.
const ENTRY_SIZE: u32 = 20;

struct BuiltModule {
    name: String,
    name_symbol: Symbol,
    lookup: ThunkTable,
    lookup_symbol: Symbol,
    addresses: ThunkTable,
    addresses_symbol: Symbol,
    iat_slots: Vec<Symbol>,
    header: [u32; 5],
}

/// Builds the complete import directory for a set of module declarations.
///
/// Construction happens in [`ImportDirectoryBuffer::build`] (phase 1): each declared module
/// gets one import lookup table and one import address table with identical slot content,
/// while symbol and module names are interned into a single shared [`HintNameTable`].
/// Serialized order is fixed: the directory entry headers (five `u32` fields each, plus an
/// all-zero terminator entry), then all lookup tables, then all address tables, then the
/// hint-name table.
///
/// Every address-table slot exports a symbol, retrievable through
/// [`ImportDirectoryBuffer::iat_slots`], so generated code can jump through the IAT.
pub struct ImportDirectoryBuffer {
    is_64bit: bool,
    modules: Vec<ImportedModule>,
    hint_names: HintNameTable,
    built: Vec<BuiltModule>,
    is_built: bool,
}

impl ImportDirectoryBuffer {
    /// Creates an empty buffer emitting 4-byte (`false`) or 8-byte (`true`) thunk slots.
    #[must_use]
    pub fn new(is_64bit: bool) -> Self {
        ImportDirectoryBuffer {
            is_64bit,
            modules: Vec::new(),
            hint_names: HintNameTable::new(),
            built: Vec::new(),
            is_built: false,
        }
    }

    /// Declares a module to import from.
    ///
    /// Must be called before [`ImportDirectoryBuffer::build`]; later additions are ignored
    /// by an already-built buffer.
    pub fn add_module(&mut self, module: ImportedModule) {
        self.modules.push(module);
    }

    /// Phase 1: materializes the thunk tables and hint-name blob.
    ///
    /// Idempotent; repeated calls after the first are no-ops, so the buffer can be driven
    /// both directly and through the segment tree walk.
    pub fn build(&mut self, symbols: &mut SymbolTable) {
        if self.is_built {
            return;
        }
        self.is_built = true;

        for module in &self.modules {
            let name_symbol = self.hint_names.add_module_name(module.name(), symbols);

            let mut lookup = ThunkTable::new(self.is_64bit);
            let mut addresses = ThunkTable::new(self.is_64bit);
            let mut iat_slots = Vec::with_capacity(module.symbols().len());

            for symbol in module.symbols() {
                let thunk = match symbol {
                    ImportedSymbol::Ordinal(ordinal) => Thunk::Ordinal(*ordinal),
                    ImportedSymbol::Named { hint, name } => {
                        Thunk::HintName(self.hint_names.add_entry(*hint, name, symbols))
                    }
                };
                lookup.add(thunk);
                let slot = addresses.add(thunk);
                // Freshly added slot index is always valid.
                if let Ok(slot_symbol) = addresses.export_slot(slot, symbols) {
                    iat_slots.push(slot_symbol);
                }
            }
            lookup.terminate();
            addresses.terminate();

            let lookup_symbol = lookup.export(symbols);
            let addresses_symbol = addresses.export(symbols);

            self.built.push(BuiltModule {
                name: module.name().to_string(),
                name_symbol,
                lookup,
                lookup_symbol,
                addresses,
                addresses_symbol,
                iat_slots,
                header: [0; 5],
            });
        }
    }

    /// The IAT slot symbols of `module`, in declaration order.
    ///
    /// Available once [`ImportDirectoryBuffer::build`] has run.
    #[must_use]
    pub fn iat_slots(&self, module: &str) -> Option<&[Symbol]> {
        self.built
            .iter()
            .find(|built| built.name == module)
            .map(|built| built.iat_slots.as_slice())
    }

    /// Whether the buffer holds no module declarations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    fn headers_size(&self) -> u32 {
        (self.built.len() as u32 + 1) * ENTRY_SIZE
    }
}

impl Segment for ImportDirectoryBuffer {
    fn physical_size(&self) -> u32 {
        let mut size = self.headers_size();
        for module in &self.built {
            size += module.lookup.physical_size();
        }
        for module in &self.built {
            size += module.addresses.physical_size();
        }
        size + self.hint_names.physical_size()
    }

    fn build(&mut self, symbols: &mut SymbolTable) {
        ImportDirectoryBuffer::build(self, symbols);
    }

    fn update_offsets(&mut self, params: LayoutParameters, symbols: &mut SymbolTable) {
        let mut current = params.advance(self.headers_size(), self.headers_size());
        for module in &mut self.built {
            module.lookup.update_offsets(current, symbols);
            let size = module.lookup.physical_size();
            current = current.advance(size, size);
        }
        for module in &mut self.built {
            module.addresses.update_offsets(current, symbols);
            let size = module.addresses.physical_size();
            current = current.advance(size, size);
        }
        self.hint_names.update_offsets(current, symbols);
    }

    fn update_references(&mut self, symbols: &SymbolTable) -> Result<()> {
        for module in &mut self.built {
            module.lookup.update_references(symbols)?;
            module.addresses.update_references(symbols)?;

            module.header = [
                symbols.resolve(module.lookup_symbol)?.rva,
                0, // time/date stamp
                0, // forwarder chain
                symbols.resolve(module.name_symbol)?.rva,
                symbols.resolve(module.addresses_symbol)?.rva,
            ];
        }
        Ok(())
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        for module in &self.built {
            for field in module.header {
                buf.extend_from_slice(&field.to_le_bytes());
            }
        }
        buf.resize(buf.len() + ENTRY_SIZE as usize, 0);

        for module in &self.built {
            module.lookup.write(buf)?;
        }
        for module in &self.built {
            module.addresses.write(buf)?;
        }
        self.hint_names.write(buf)
    }
}
