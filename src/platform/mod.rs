//! Per-architecture code generation strategies.
//!
//! Every target architecture implements the [`Platform`] capability set: emitting a short
//! indirect-jump thunk stub that transfers control through a pointer-sized address slot,
//! decoding such a stub back into the address it targets, and (where the architecture
//! supports it) emitting an address-table initializer that patches import slots in place at
//! process attach. Strategies are stateless values handed out by [`for_machine`]; an
//! architecture this crate cannot generate code for yields a null-object platform whose
//! code-generation operations fail with [`crate::Error::NotSupported`] instead of emitting
//! wrong bytes.

mod arm;
mod arm64;
mod trampoline;
mod unsupported;
mod x64;
mod x86;

pub use trampoline::TrampolineTableBuffer;

use strum::Display;

use crate::relocations::{BaseRelocation, RelocationType};
use crate::segment::{
    LayoutParameters, RelocatableSegment, Segment, SegmentAddress, Symbol, SymbolTable,
};
use crate::Result;

/// PE/COFF machine identifiers for the architectures this crate knows about.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MachineType {
    /// Unknown or unhandled machine; maps to the null-object platform.
    Unknown = 0,
    /// 32-bit x86.
    I386 = 0x14C,
    /// 64-bit x86.
    Amd64 = 0x8664,
    /// 32-bit ARM (Thumb-2 capable, classic encoding used for stubs).
    Arm = 0x1C0,
    /// 64-bit ARM.
    Arm64 = 0xAA64,
}

impl MachineType {
    /// Interprets a raw COFF machine field.
    #[must_use]
    pub fn from_raw(value: u16) -> Self {
        match value {
            0x14C => MachineType::I386,
            0x8664 => MachineType::Amd64,
            0x1C0 => MachineType::Arm,
            0xAA64 => MachineType::Arm64,
            _ => MachineType::Unknown,
        }
    }
}

/// A (slot, value) pair for the address-table initializer: at process attach the generated
/// code writes `value`'s virtual address into `slot`.
#[derive(Debug, Clone, Copy)]
pub struct InitializerSlot {
    /// The address-table slot to overwrite
    pub slot: Symbol,
    /// The segment whose virtual address the slot receives
    pub value: Symbol,
}

/// The capability set implemented once per target architecture.
///
/// Implementations are stateless and shared; obtain one through [`for_machine`].
pub trait Platform: Sync {
    /// The machine this strategy generates code for.
    fn machine(&self) -> MachineType;

    /// Whether pointers on this machine are 64 bits wide.
    fn is_64bit(&self) -> bool;

    /// Size in bytes of one thunk stub.
    fn thunk_size(&self) -> u32;

    /// Encodes a thunk stub placed at `stub` that jumps through the address held in
    /// `slot`.
    ///
    /// # Errors
    /// Returns [`crate::Error::FormatLimit`] if an address does not fit the encoding
    /// (e.g. a 64-bit virtual address in a 32-bit absolute operand, or a misaligned
    /// ARM64 load target).
    fn encode_thunk(
        &self,
        stub: SegmentAddress,
        image_base: u64,
        slot: SegmentAddress,
    ) -> Result<Vec<u8>>;

    /// The base relocations one thunk stub requires, as (type, byte offset) pairs
    /// relative to the stub's start.
    fn thunk_relocations(&self) -> &'static [(RelocationType, u32)];

    /// Decodes a thunk stub back into the virtual address of the slot it jumps through.
    ///
    /// # Errors
    /// Returns [`crate::Error::Consistency`] if `code` does not match this platform's
    /// stub byte pattern.
    fn extract_thunk_address(&self, code: &[u8], stub_rva: u32, image_base: u64)
        -> Result<u64>;

    /// Whether [`Platform::create_address_table_initializer`] is available.
    fn supports_address_table_initializer(&self) -> bool {
        false
    }

    /// Emits the process-attach initializer that overwrites the given address-table
    /// slots in place, bracketed by memory-protection changes through the imported
    /// `VirtualProtect` slot.
    ///
    /// # Errors
    /// Returns [`crate::Error::NotSupported`] on architectures without initializer
    /// support.
    fn create_address_table_initializer(
        &self,
        symbols: &mut SymbolTable,
        virtual_protect: Symbol,
        slots: &[InitializerSlot],
    ) -> Result<RelocatableSegment> {
        let _ = (symbols, virtual_protect, slots);
        Err(crate::Error::NotSupported {
            machine: self.machine(),
            operation: "Address table initializer generation",
        })
    }
}

/// Looks up the strategy for `machine`.
///
/// Machines without a code generator map to a null-object platform that reports sizes of
/// zero and fails all code-generation operations with capability errors.
#[must_use]
pub fn for_machine(machine: MachineType) -> &'static dyn Platform {
    match machine {
        MachineType::I386 => &x86::X86Platform,
        MachineType::Amd64 => &x64::X64Platform,
        MachineType::Arm => &arm::ArmPlatform,
        MachineType::Arm64 => &arm64::Arm64Platform,
        MachineType::Unknown => &unsupported::UnsupportedPlatform,
    }
}

/// A placed thunk stub: machine code that jumps through one address-table slot.
///
/// The stub's bytes depend on its own final address (RIP- or page-relative encodings) and
/// on the slot's, so they are produced during reference resolution. Created through
/// [`ThunkStub::new`], which also reports the base relocations the chosen platform
/// requires for the stub.
pub struct ThunkStub {
    platform: &'static dyn Platform,
    slot: Symbol,
    stub_symbol: Symbol,
    address: Option<SegmentAddress>,
    image_base: u64,
    code: Vec<u8>,
    site_symbols: Vec<Symbol>,
}

impl ThunkStub {
    /// Creates a stub jumping through `slot`, together with the base relocations its
    /// encoding needs.
    pub fn new(
        platform: &'static dyn Platform,
        symbols: &mut SymbolTable,
        slot: Symbol,
    ) -> (Self, Vec<BaseRelocation>) {
        let stub_symbol = symbols.reserve();

        let mut relocations = Vec::new();
        let mut site_symbols = Vec::new();
        for &(relocation_type, _) in platform.thunk_relocations() {
            let site = symbols.reserve();
            site_symbols.push(site);
            relocations.push(BaseRelocation::new(relocation_type, site));
        }

        (
            ThunkStub {
                platform,
                slot,
                stub_symbol,
                address: None,
                image_base: 0,
                code: Vec::new(),
                site_symbols,
            },
            relocations,
        )
    }

    /// The symbol of the stub's own entry point.
    #[must_use]
    pub fn symbol(&self) -> Symbol {
        self.stub_symbol
    }
}

impl Segment for ThunkStub {
    fn physical_size(&self) -> u32 {
        self.platform.thunk_size()
    }

    fn update_offsets(&mut self, params: LayoutParameters, symbols: &mut SymbolTable) {
        self.address = Some(params.address());
        self.image_base = params.image_base;
        symbols.define(self.stub_symbol, params.address());
        for (site, &(_, offset)) in self
            .site_symbols
            .iter()
            .zip(self.platform.thunk_relocations())
        {
            symbols.define(*site, params.advance(offset, offset).address());
        }
    }

    fn update_references(&mut self, symbols: &SymbolTable) -> Result<()> {
        let stub = self
            .address
            .ok_or_else(|| consistency_error!("thunk stub referenced before placement"))?;
        let slot = symbols.resolve(self.slot)?;
        self.code = self.platform.encode_thunk(stub, self.image_base, slot)?;
        Ok(())
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        if self.code.len() as u32 != self.platform.thunk_size() {
            return Err(consistency_error!(
                "thunk stub written before reference resolution"
            ));
        }
        buf.extend_from_slice(&self.code);
        Ok(())
    }
}
