//! Trampoline generation over an import address table.

use crate::platform::{InitializerSlot, Platform, ThunkStub};
use crate::relocations::BaseRelocation;
use crate::segment::{
    LayoutParameters, Segment, SegmentBuilder, Symbol, SymbolTable,
};
use crate::Result;

/// Builds the code needed to redirect address-table slots: per-slot function trampolines
/// plus one shared process-attach initializer for data slots.
///
/// Function slots (slots only ever called through) get a [`ThunkStub`] that jumps through
/// the slot; callers are repointed at the stub's symbol. Data slots (slots whose value is
/// read as data, so a jump stub cannot stand in for them) are instead patched in place at
/// process attach by the initializer the platform generates, which needs an imported
/// `VirtualProtect` slot to lift write protection.
///
/// The buffer is itself a segment; after [`TrampolineTableBuffer::finalize`] it lays out
/// all trampolines (4-byte aligned) followed by the initializer (16-byte aligned), and
/// [`TrampolineTableBuffer::relocations`] lists every base relocation the generated code
/// requires.
pub struct TrampolineTableBuffer {
    platform: &'static dyn Platform,
    contents: SegmentBuilder,
    relocations: Vec<BaseRelocation>,
    data_slots: Vec<InitializerSlot>,
    virtual_protect: Option<Symbol>,
    initializer_symbol: Option<Symbol>,
    is_finalized: bool,
}

impl TrampolineTableBuffer {
    /// Creates an empty buffer generating code for `platform`.
    #[must_use]
    pub fn new(platform: &'static dyn Platform) -> Self {
        TrampolineTableBuffer {
            platform,
            contents: SegmentBuilder::new(),
            relocations: Vec::new(),
            data_slots: Vec::new(),
            virtual_protect: None,
            initializer_symbol: None,
            is_finalized: false,
        }
    }

    /// Provides the imported `VirtualProtect` slot the initializer calls through.
    ///
    /// Required before finalization if any data slot was registered.
    pub fn set_virtual_protect(&mut self, slot: Symbol) {
        self.virtual_protect = Some(slot);
    }

    /// Adds a function trampoline jumping through `slot`, returning the trampoline's own
    /// entry symbol.
    ///
    /// # Errors
    /// Returns [`crate::Error::NotSupported`] if the platform has no thunk stub encoding.
    pub fn add_function_trampoline(
        &mut self,
        symbols: &mut SymbolTable,
        slot: Symbol,
    ) -> Result<Symbol> {
        if self.platform.thunk_size() == 0 {
            return Err(crate::Error::NotSupported {
                machine: self.platform.machine(),
                operation: "Thunk stub generation",
            });
        }

        let (stub, relocations) = ThunkStub::new(self.platform, symbols, slot);
        let entry = stub.symbol();
        self.relocations.extend(relocations);
        self.contents.add_aligned(stub, 4);
        Ok(entry)
    }

    /// Registers a data slot to be rewritten to `value`'s virtual address at process
    /// attach.
    pub fn add_data_slot_initializer(&mut self, slot: Symbol, value: Symbol) {
        self.data_slots.push(InitializerSlot { slot, value });
    }

    /// Materializes the shared initializer for all registered data slots.
    ///
    /// Must run before the buffer is laid out. Idempotent.
    ///
    /// # Errors
    /// Returns [`crate::Error::Config`] if data slots were registered without a
    /// `VirtualProtect` slot, or [`crate::Error::NotSupported`] if the platform cannot
    /// generate initializers.
    pub fn finalize(&mut self, symbols: &mut SymbolTable) -> Result<()> {
        if self.is_finalized {
            return Ok(());
        }

        if !self.data_slots.is_empty() {
            let virtual_protect = self.virtual_protect.ok_or_else(|| crate::Error::Config {
                message: "data slot initializers need an imported VirtualProtect slot"
                    .to_string(),
            })?;

            let initializer = self.platform.create_address_table_initializer(
                symbols,
                virtual_protect,
                &self.data_slots,
            )?;

            let symbol = symbols.reserve();
            let (segment, relocations) = initializer.into_parts();
            self.relocations.extend(relocations);
            self.contents.add_aligned(
                ExportedSegment {
                    inner: segment,
                    symbol,
                },
                16,
            );
            self.initializer_symbol = Some(symbol);
        }

        self.is_finalized = true;
        Ok(())
    }

    /// Every base relocation the generated code requires.
    #[must_use]
    pub fn relocations(&self) -> &[BaseRelocation] {
        &self.relocations
    }

    /// Entry point of the process-attach initializer, if one was generated.
    #[must_use]
    pub fn initializer_symbol(&self) -> Option<Symbol> {
        self.initializer_symbol
    }

    /// Whether any code has been generated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }
}

impl Segment for TrampolineTableBuffer {
    fn physical_size(&self) -> u32 {
        self.contents.physical_size()
    }

    fn virtual_size(&self) -> u32 {
        self.contents.virtual_size()
    }

    fn build(&mut self, symbols: &mut SymbolTable) {
        self.contents.build(symbols);
    }

    fn update_offsets(&mut self, params: LayoutParameters, symbols: &mut SymbolTable) {
        self.contents.update_offsets(params, symbols);
    }

    fn update_references(&mut self, symbols: &SymbolTable) -> Result<()> {
        self.contents.update_references(symbols)
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        self.contents.write(buf)
    }
}

/// Delegating wrapper exporting a symbol for the wrapped segment's start address.
struct ExportedSegment {
    inner: Box<dyn Segment>,
    symbol: Symbol,
}

impl Segment for ExportedSegment {
    fn physical_size(&self) -> u32 {
        self.inner.physical_size()
    }

    fn virtual_size(&self) -> u32 {
        self.inner.virtual_size()
    }

    fn build(&mut self, symbols: &mut SymbolTable) {
        self.inner.build(symbols);
    }

    fn update_offsets(&mut self, params: LayoutParameters, symbols: &mut SymbolTable) {
        symbols.define(self.symbol, params.address());
        self.inner.update_offsets(params, symbols);
    }

    fn update_references(&mut self, symbols: &SymbolTable) -> Result<()> {
        self.inner.update_references(symbols)
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        self.inner.write(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{for_machine, MachineType};
    use crate::segment::SegmentAddress;
    use crate::Error;

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
    fn test_x64_trampolines_and_initializer() {
        let platform = for_machine(MachineType::Amd64);
        let mut symbols = SymbolTable::new();

        let function_slot = defined(&mut symbols, 0x2000);
        let data_slot = defined(&mut symbols, 0x2008);
        let value = defined(&mut symbols, 0x6000);
        let vp_slot = defined(&mut symbols, 0x2010);

        let mut buffer = TrampolineTableBuffer::new(platform);
        buffer.set_virtual_protect(vp_slot);
        let entry = buffer
            .add_function_trampoline(&mut symbols, function_slot)
            .unwrap();
        buffer.add_data_slot_initializer(data_slot, value);
        buffer.finalize(&mut symbols).unwrap();

        // RIP-relative platform: no relocations at all.
        assert!(buffer.relocations().is_empty());
        assert!(buffer.initializer_symbol().is_some());

        buffer.build(&mut symbols);
        buffer.update_offsets(
            LayoutParameters {
                offset: 0x800,
                rva: 0x5000,
                image_base: 0x1_4000_0000,
            },
            &mut symbols,
        );
        buffer.update_references(&symbols).unwrap();

        // One 6-byte stub at the start, initializer at the next 16-byte boundary.
        assert_eq!(symbols.resolve(entry).unwrap().rva, 0x5000);
        let initializer = symbols.resolve(buffer.initializer_symbol().unwrap()).unwrap();
        assert_eq!(initializer.rva, 0x5010);

        let mut buf = Vec::new();
        buffer.write(&mut buf).unwrap();
        assert_eq!(buf.len() as u32, buffer.physical_size());

        // The stub decodes back to the function slot's VA.
        let va = platform
            .extract_thunk_address(&buf[0..6], 0x5000, 0x1_4000_0000)
            .unwrap();
        assert_eq!(va, 0x1_4000_0000 + 0x2000);
    }

    #[test]
    fn test_x86_trampolines_carry_relocations() {
        let platform = for_machine(MachineType::I386);
        let mut symbols = SymbolTable::new();
        let slot = defined(&mut symbols, 0x2000);

        let mut buffer = TrampolineTableBuffer::new(platform);
        buffer.add_function_trampoline(&mut symbols, slot).unwrap();
        buffer.add_function_trampoline(&mut symbols, slot).unwrap();
        buffer.finalize(&mut symbols).unwrap();

        assert_eq!(buffer.relocations().len(), 2);
    }

    #[test]
    fn test_data_slots_without_virtual_protect() {
        let platform = for_machine(MachineType::Amd64);
        let mut symbols = SymbolTable::new();
        let slot = defined(&mut symbols, 0x2000);
        let value = defined(&mut symbols, 0x6000);

        let mut buffer = TrampolineTableBuffer::new(platform);
        buffer.add_data_slot_initializer(slot, value);
        assert!(matches!(
            buffer.finalize(&mut symbols),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_arm64_data_slots_are_a_capability_error() {
        let platform = for_machine(MachineType::Arm64);
        let mut symbols = SymbolTable::new();
        let slot = defined(&mut symbols, 0x2000);
        let value = defined(&mut symbols, 0x6000);
        let vp = defined(&mut symbols, 0x2010);

        let mut buffer = TrampolineTableBuffer::new(platform);
        buffer.set_virtual_protect(vp);
        buffer.add_data_slot_initializer(slot, value);
        assert!(matches!(
            buffer.finalize(&mut symbols),
            Err(Error::NotSupported {
                machine: MachineType::Arm64,
                ..
            })
        ));
    }

    #[test]
    fn test_unknown_machine_rejects_trampolines() {
        let platform = for_machine(MachineType::Unknown);
        let mut symbols = SymbolTable::new();
        let slot = symbols.reserve();

        let mut buffer = TrampolineTableBuffer::new(platform);
        assert!(matches!(
            buffer.add_function_trampoline(&mut symbols, slot),
            Err(Error::NotSupported { .. })
        ));
    }
}
