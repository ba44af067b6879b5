//! Import lookup and address thunk tables.

use crate::segment::{LayoutParameters, Segment, Symbol, SymbolTable};
use crate::Result;

/// The logical content of one thunk slot before reference resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Thunk {
    /// Import by ordinal; the slot's high bit will be set.
    Ordinal(u16),
    /// Import by name; the slot holds the RVA of the referenced hint-name entry.
    HintName(Symbol),
    /// The all-zero terminator slot ending the table.
    Zero,
}

struct ThunkSlot {
    thunk: Thunk,
    export: Option<Symbol>,
    resolved: u64,
}

/// One import lookup table or import address table: a run of thunk slots plus a zero
/// terminator.
///
/// Slot width is 4 bytes for PE32 images and 8 for PE32+. Ordinal slots set the width's
/// top bit; name slots hold the RVA of a hint-name entry and must leave that bit clear.
/// Individual slots can export symbols for their own addresses, which is how IAT slots
/// become targets for thunk stubs and trampolines.
pub struct ThunkTable {
    is_64bit: bool,
    slots: Vec<ThunkSlot>,
    table_symbol: Option<Symbol>,
}

impl ThunkTable {
    /// Creates an empty thunk table with 4-byte (`false`) or 8-byte (`true`) slots.
    #[must_use]
    pub fn new(is_64bit: bool) -> Self {
        ThunkTable {
            is_64bit,
            slots: Vec::new(),
            table_symbol: None,
        }
    }

    /// Width of one slot in bytes.
    #[must_use]
    pub fn slot_size(&self) -> u32 {
        if self.is_64bit {
            8
        } else {
            4
        }
    }

    /// Appends a slot, returning its index.
    pub fn add(&mut self, thunk: Thunk) -> usize {
        self.slots.push(ThunkSlot {
            thunk,
            export: None,
            resolved: 0,
        });
        self.slots.len() - 1
    }

    /// Appends the zero terminator slot.
    pub fn terminate(&mut self) {
        self.add(Thunk::Zero);
    }

    /// Reserves and attaches a symbol for the address of slot `index`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Consistency`] if no slot with that index exists.
    pub fn export_slot(&mut self, index: usize, symbols: &mut SymbolTable) -> Result<Symbol> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| consistency_error!("thunk table has no slot {index}"))?;
        let symbol = *slot.export.get_or_insert_with(|| symbols.reserve());
        Ok(symbol)
    }

    /// Reserves and attaches a symbol for the table's own start address.
    pub fn export(&mut self, symbols: &mut SymbolTable) -> Symbol {
        *self
            .table_symbol
            .get_or_insert_with(|| symbols.reserve())
    }

    /// Number of slots including the terminator, if already added.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table holds no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn ordinal_bit(&self) -> u64 {
        if self.is_64bit {
            1 << 63
        } else {
            1 << 31
        }
    }
}

impl Segment for ThunkTable {
    fn physical_size(&self) -> u32 {
        self.slots.len() as u32 * self.slot_size()
    }

    fn update_offsets(&mut self, params: LayoutParameters, symbols: &mut SymbolTable) {
        if let Some(symbol) = self.table_symbol {
            symbols.define(symbol, params.address());
        }

        let mut current = params;
        for slot in &self.slots {
            if let Some(symbol) = slot.export {
                symbols.define(symbol, current.address());
            }
            current = current.advance(self.slot_size(), self.slot_size());
        }
    }

    fn update_references(&mut self, symbols: &SymbolTable) -> Result<()> {
        let ordinal_bit = self.ordinal_bit();
        for slot in &mut self.slots {
            slot.resolved = match slot.thunk {
                Thunk::Zero => 0,
                Thunk::Ordinal(ordinal) => ordinal_bit | u64::from(ordinal),
                Thunk::HintName(symbol) => {
                    let rva = u64::from(symbols.resolve(symbol)?.rva);
                    if rva & ordinal_bit != 0 {
                        return Err(crate::Error::FormatLimit {
                            message: format!(
                                "hint-name RVA {rva:#x} collides with the ordinal flag bit"
                            ),
                        });
                    }
                    rva
                }
            };
        }
        Ok(())
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        for slot in &self.slots {
            if self.is_64bit {
                buf.extend_from_slice(&slot.resolved.to_le_bytes());
            } else {
                buf.extend_from_slice(&(slot.resolved as u32).to_le_bytes());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentAddress;

    #[test]
    fn test_slot_width_and_size() {
        let mut table = ThunkTable::new(false);
        table.add(Thunk::Ordinal(7));
        table.terminate();
        assert_eq!(table.physical_size(), 8);

        let mut wide = ThunkTable::new(true);
        wide.add(Thunk::Ordinal(7));
        wide.terminate();
        assert_eq!(wide.physical_size(), 16);
    }

    #[test]
    fn test_ordinal_bit_placement() {
        let mut symbols = SymbolTable::new();

        let mut table = ThunkTable::new(false);
        table.add(Thunk::Ordinal(7));
        table.terminate();
        table.update_references(&symbols).unwrap();
        let mut buf = Vec::new();
        table.write(&mut buf).unwrap();
        assert_eq!(&buf[0..4], &0x8000_0007u32.to_le_bytes());
        assert_eq!(&buf[4..8], &[0; 4]);

        let mut wide = ThunkTable::new(true);
        wide.add(Thunk::Ordinal(7));
        wide.terminate();
        wide.update_references(&mut symbols).unwrap();
        let mut buf = Vec::new();
        wide.write(&mut buf).unwrap();
        assert_eq!(&buf[0..8], &0x8000_0000_0000_0007u64.to_le_bytes());
    }

    #[test]
    fn test_name_slot_holds_entry_rva() {
        let mut symbols = SymbolTable::new();
        let entry = symbols.reserve();
        symbols.define(
            entry,
            SegmentAddress {
                offset: 0x800,
                rva: 0x3044,
            },
        );

        let mut table = ThunkTable::new(false);
        table.add(Thunk::HintName(entry));
        table.terminate();
        table.update_references(&symbols).unwrap();

        let mut buf = Vec::new();
        table.write(&mut buf).unwrap();
        assert_eq!(&buf[0..4], &0x3044u32.to_le_bytes());
    }

    #[test]
    fn test_exported_slot_addresses() {
        let mut symbols = SymbolTable::new();
        let mut table = ThunkTable::new(true);
        table.add(Thunk::Ordinal(1));
        table.add(Thunk::Ordinal(2));
        table.terminate();

        let start = table.export(&mut symbols);
        let second = table.export_slot(1, &mut symbols).unwrap();
        assert!(table.export_slot(9, &mut symbols).is_err());

        table.update_offsets(
            LayoutParameters {
                offset: 0x600,
                rva: 0x4000,
                image_base: 0x1_4000_0000,
            },
            &mut symbols,
        );

        assert_eq!(symbols.resolve(start).unwrap().rva, 0x4000);
        assert_eq!(symbols.resolve(second).unwrap().rva, 0x4008);
    }

    #[test]
    fn test_unplaced_entry_reference_fails() {
        let mut symbols = SymbolTable::new();
        let dangling = symbols.reserve();

        let mut table = ThunkTable::new(false);
        table.add(Thunk::HintName(dangling));
        assert!(table.update_references(&symbols).is_err());
    }
}
