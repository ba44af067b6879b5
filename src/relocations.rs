//! Base relocation bookkeeping and `.reloc` directory serialization.
//!
//! Base relocations are instructions applied at load time to patch absolute addresses when
//! the image does not load at its preferred base. They are stored as blocks, each covering
//! one 4 KiB page of virtual memory:
//!
//! - **Block header**: page RVA (u32) and total block size (u32)
//! - **Relocation entries**: 2 bytes each, a 4-bit type and a 12-bit offset within the page
//!
//! Fixups are collected as ([`RelocationType`], target [`Symbol`]) pairs while code is being
//! generated, long before any address exists. Once layout has resolved the targets,
//! [`RelocationsDirectoryBuffer::finalize`] groups them into page blocks and produces the
//! serialized directory.

use std::collections::BTreeMap;

use crate::segment::{DataSegment, Symbol, SymbolTable};
use crate::{Error, Result};

/// All relocation types the engine can emit.
///
/// Discriminants match the `IMAGE_REL_BASED_*` constants of the PE/COFF specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RelocationType {
    /// No operation; used to pad blocks to a 4-byte boundary.
    Absolute = 0,
    /// Adds the high 16 bits of the base difference to the 16-bit field at offset.
    High = 1,
    /// Adds the low 16 bits of the base difference to the 16-bit field at offset.
    Low = 2,
    /// Applies all 32 bits of the base difference to the 32-bit field at offset.
    HighLow = 3,
    /// High 16 bits of a 32-bit address, adjusted for sign extension of the low half.
    HighAdj = 4,
    /// Applies the base difference to the 64-bit field at offset.
    Dir64 = 10,
}

/// A single fixup: a relocation type applied at the address a symbol resolves to.
///
/// The target is symbolic because relocations are declared while thunk stubs and address
/// slots are generated, before layout has assigned anything an address.
#[derive(Debug, Clone, Copy)]
pub struct BaseRelocation {
    /// How the loader must patch the target location
    pub relocation_type: RelocationType,
    /// The location to patch
    pub target: Symbol,
}

impl BaseRelocation {
    /// Creates a new fixup for the location `target` resolves to.
    #[must_use]
    pub fn new(relocation_type: RelocationType, target: Symbol) -> Self {
        BaseRelocation {
            relocation_type,
            target,
        }
    }
}

/// A serialized relocation entry: 4-bit type plus 12-bit in-page offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationEntry {
    relocation_type: RelocationType,
    offset: u16,
}

impl RelocationEntry {
    /// Creates an entry for a fixup at `offset` bytes into its 4 KiB page.
    ///
    /// # Errors
    /// Returns [`Error::FormatLimit`] if `offset` does not fit the 12-bit field.
    pub fn new(relocation_type: RelocationType, offset: u16) -> Result<Self> {
        if offset > 0xFFF {
            return Err(Error::FormatLimit {
                message: format!(
                    "relocation offset {offset:#x} exceeds the 12-bit page offset field"
                ),
            });
        }
        Ok(RelocationEntry {
            relocation_type,
            offset,
        })
    }

    /// The packed 16-bit on-disk representation.
    #[must_use]
    pub fn to_raw(self) -> u16 {
        ((self.relocation_type as u16) << 12) | self.offset
    }

    /// The fixup's offset within its page.
    #[must_use]
    pub fn offset(self) -> u16 {
        self.offset
    }

    /// The fixup's relocation type.
    #[must_use]
    pub fn relocation_type(self) -> RelocationType {
        self.relocation_type
    }
}

/// One block of relocations covering a single 4 KiB page.
#[derive(Debug, Clone)]
pub struct RelocationBlock {
    /// RVA of the page all entries in this block apply to
    pub page_rva: u32,
    /// The fixups within the page
    pub entries: Vec<RelocationEntry>,
}

impl RelocationBlock {
    /// Total on-disk size of the block: 8-byte header plus 2 bytes per entry.
    #[must_use]
    pub fn size(&self) -> u32 {
        8 + 2 * self.entries.len() as u32
    }

    fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.page_rva.to_le_bytes());
        buf.extend_from_slice(&self.size().to_le_bytes());
        for entry in &self.entries {
            buf.extend_from_slice(&entry.to_raw().to_le_bytes());
        }
    }
}

/// Accumulates base relocations and serializes them as a `.reloc` directory.
///
/// Because the grouping into pages depends on resolved addresses, finalization happens
/// after layout of the fixup targets: the assembler lays out the code sections first, then
/// materializes this directory from the now-resolved symbol table.
#[derive(Debug, Default)]
pub struct RelocationsDirectoryBuffer {
    relocations: Vec<BaseRelocation>,
}

impl RelocationsDirectoryBuffer {
    /// Creates an empty relocation buffer.
    #[must_use]
    pub fn new() -> Self {
        RelocationsDirectoryBuffer::default()
    }

    /// Adds one fixup.
    pub fn add(&mut self, relocation: BaseRelocation) {
        self.relocations.push(relocation);
    }

    /// Adds a batch of fixups, typically the ones required by a generated code stub.
    pub fn add_all(&mut self, relocations: impl IntoIterator<Item = BaseRelocation>) {
        self.relocations.extend(relocations);
    }

    /// Whether any fixups have been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.relocations.is_empty()
    }

    /// Groups all fixups into page blocks, resolved against `symbols`.
    ///
    /// Blocks are emitted in ascending page order; entries within one block in ascending
    /// offset order. Blocks followed by another block are padded with `Absolute` entries so
    /// the next header stays 4-byte aligned; the final block is left unpadded.
    ///
    /// # Errors
    /// Returns [`crate::Error::Consistency`] if a fixup targets a symbol that was never
    /// placed.
    pub fn to_blocks(&self, symbols: &SymbolTable) -> Result<Vec<RelocationBlock>> {
        let mut pages: BTreeMap<u32, Vec<RelocationEntry>> = BTreeMap::new();

        for relocation in &self.relocations {
            let address = symbols.resolve(relocation.target)?;
            let page_rva = address.rva & !0xFFF;
            let offset = (address.rva & 0xFFF) as u16;
            pages
                .entry(page_rva)
                .or_default()
                .push(RelocationEntry::new(relocation.relocation_type, offset)?);
        }

        let mut blocks: Vec<RelocationBlock> = pages
            .into_iter()
            .map(|(page_rva, mut entries)| {
                entries.sort_by_key(|e| e.offset());
                RelocationBlock { page_rva, entries }
            })
            .collect();

        let block_count = blocks.len();
        for block in blocks.iter_mut().take(block_count.saturating_sub(1)) {
            if block.entries.len() % 2 != 0 {
                block
                    .entries
                    .push(RelocationEntry::new(RelocationType::Absolute, 0)?);
            }
        }

        Ok(blocks)
    }

    /// Serializes the whole directory into a segment ready for placement in `.reloc`.
    ///
    /// # Errors
    /// Propagates resolution failures from [`RelocationsDirectoryBuffer::to_blocks`].
    pub fn finalize(&self, symbols: &SymbolTable) -> Result<DataSegment> {
        let mut buf = Vec::new();
        for block in self.to_blocks(symbols)? {
            block.write(&mut buf);
        }
        Ok(DataSegment::new(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentAddress;

    fn defined(symbols: &mut SymbolTable, rva: u32) -> Symbol {
        let symbol = symbols.reserve();
        symbols.define(
            symbol,
            SegmentAddress {
                offset: u64::from(rva),
                rva,
            },
        );
        symbol
    }

    #[test]
    fn test_entry_rejects_oversized_offset() {
        assert!(matches!(
            RelocationEntry::new(RelocationType::HighLow, 0x1000),
            Err(Error::FormatLimit { .. })
        ));
        assert!(RelocationEntry::new(RelocationType::HighLow, 0xFFF).is_ok());
    }

    #[test]
    fn test_entry_raw_packing() {
        let entry = RelocationEntry::new(RelocationType::HighLow, 0x123).unwrap();
        assert_eq!(entry.to_raw(), 0x3123);

        let entry = RelocationEntry::new(RelocationType::Dir64, 0xFFF).unwrap();
        assert_eq!(entry.to_raw(), 0xAFFF);
    }

    #[test]
    fn test_three_fixups_share_one_block() {
        let mut symbols = SymbolTable::new();
        let mut buffer = RelocationsDirectoryBuffer::new();

        for rva in [0x1010, 0x1020, 0x1030] {
            let target = defined(&mut symbols, rva);
            buffer.add(BaseRelocation::new(RelocationType::HighLow, target));
        }

        let blocks = buffer.to_blocks(&symbols).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].page_rva, 0x1000);
        assert_eq!(blocks[0].size(), 8 + 3 * 2);

        let segment = buffer.finalize(&symbols).unwrap();
        let bytes = segment.data();
        assert_eq!(&bytes[0..4], &0x1000u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &14u32.to_le_bytes());
    }

    #[test]
    fn test_blocks_split_per_page_and_pad_between() {
        let mut symbols = SymbolTable::new();
        let mut buffer = RelocationsDirectoryBuffer::new();

        // One fixup on the first page, two on the second.
        for rva in [0x1010, 0x2010, 0x2020] {
            let target = defined(&mut symbols, rva);
            buffer.add(BaseRelocation::new(RelocationType::Dir64, target));
        }

        let blocks = buffer.to_blocks(&symbols).unwrap();
        assert_eq!(blocks.len(), 2);

        // First block padded to keep the second header 4-aligned.
        assert_eq!(blocks[0].page_rva, 0x1000);
        assert_eq!(blocks[0].entries.len(), 2);
        assert_eq!(
            blocks[0].entries[1].relocation_type(),
            RelocationType::Absolute
        );
        assert_eq!(blocks[0].size() % 4, 0);

        // Last block left unpadded.
        assert_eq!(blocks[1].page_rva, 0x2000);
        assert_eq!(blocks[1].entries.len(), 2);
    }

    #[test]
    fn test_unplaced_target_is_a_consistency_error() {
        let mut symbols = SymbolTable::new();
        let dangling = symbols.reserve();

        let mut buffer = RelocationsDirectoryBuffer::new();
        buffer.add(BaseRelocation::new(RelocationType::HighLow, dangling));

        assert!(matches!(
            buffer.to_blocks(&symbols),
            Err(Error::Consistency { .. })
        ));
    }
}
