//! Code generation for 32-bit x86.

use crate::platform::{InitializerSlot, MachineType, Platform};
use crate::relocations::{BaseRelocation, RelocationType};
use crate::segment::{
    LayoutParameters, RelocatableSegment, Segment, SegmentAddress, Symbol, SymbolTable,
};
use crate::Result;

/// `jmp dword [abs32]`: opcode FF /4 with an absolute memory operand.
const THUNK_OPCODE: [u8; 2] = [0xFF, 0x25];
const THUNK_SIZE: u32 = 6;

/// Offsets of the absolute-address literals within one initializer entry (see
/// [`InitializerCode`] for the instruction listing).
const ENTRY_RELOC_OFFSETS: [u32; 6] = [9, 15, 21, 25, 39, 45];

const PROLOGUE: [u8; 6] = [0x55, 0x8B, 0xEC, 0x83, 0xEC, 0x04]; // push ebp; mov ebp, esp; sub esp, 4
const EPILOGUE: [u8; 4] = [0x8B, 0xE5, 0x5D, 0xC3]; // mov esp, ebp; pop ebp; ret
const ENTRY_SIZE: u32 = 49;

/// The x86 strategy: absolute-addressed stubs, so every generated instruction that embeds
/// a virtual address carries a `HighLow` base relocation.
pub struct X86Platform;

impl Platform for X86Platform {
    fn machine(&self) -> MachineType {
        MachineType::I386
    }

    fn is_64bit(&self) -> bool {
        false
    }

    fn thunk_size(&self) -> u32 {
        THUNK_SIZE
    }

    fn encode_thunk(
        &self,
        _stub: SegmentAddress,
        image_base: u64,
        slot: SegmentAddress,
    ) -> Result<Vec<u8>> {
        let va = absolute32(image_base, slot)?;
        let mut code = Vec::with_capacity(THUNK_SIZE as usize);
        code.extend_from_slice(&THUNK_OPCODE);
        code.extend_from_slice(&va.to_le_bytes());
        Ok(code)
    }

    fn thunk_relocations(&self) -> &'static [(RelocationType, u32)] {
        &[(RelocationType::HighLow, 2)]
    }

    fn extract_thunk_address(
        &self,
        code: &[u8],
        _stub_rva: u32,
        _image_base: u64,
    ) -> Result<u64> {
        if code.len() < THUNK_SIZE as usize || code[0..2] != THUNK_OPCODE {
            return Err(consistency_error!("byte pattern is not an x86 thunk stub"));
        }
        let va = u32::from_le_bytes([code[2], code[3], code[4], code[5]]);
        Ok(u64::from(va))
    }

    fn supports_address_table_initializer(&self) -> bool {
        true
    }

    fn create_address_table_initializer(
        &self,
        symbols: &mut SymbolTable,
        virtual_protect: Symbol,
        slots: &[InitializerSlot],
    ) -> Result<RelocatableSegment> {
        let mut relocations = Vec::with_capacity(slots.len() * ENTRY_RELOC_OFFSETS.len());
        let mut sites = Vec::new();
        for index in 0..slots.len() {
            for offset in ENTRY_RELOC_OFFSETS {
                let site = symbols.reserve();
                sites.push((site, PROLOGUE.len() as u32 + index as u32 * ENTRY_SIZE + offset));
                relocations.push(BaseRelocation::new(RelocationType::HighLow, site));
            }
        }

        let code = InitializerCode {
            virtual_protect,
            slots: slots.to_vec(),
            sites,
            address: None,
            image_base: 0,
            code: Vec::new(),
        };
        Ok(RelocatableSegment::new(Box::new(code), relocations))
    }
}

pub(crate) fn absolute32(image_base: u64, target: SegmentAddress) -> Result<u32> {
    let va = target.va(image_base);
    u32::try_from(va).map_err(|_| crate::Error::FormatLimit {
        message: format!("virtual address {va:#x} does not fit a 32-bit absolute operand"),
    })
}

/// The process-attach initializer: a `void()` function that, per slot, unprotects the slot
/// with `VirtualProtect`, stores the target's virtual address, and restores the previous
/// protection. One 49-byte entry per slot:
///
/// ```text
///  +0  8D 45 FC        lea  eax, [ebp-4]
///  +3  50              push eax                  ; &old
///  +4  6A 40           push 0x40                 ; PAGE_EXECUTE_READWRITE
///  +6  6A 04           push 4
///  +8  68 <slot>       push slot                 ; literal at +9
/// +13  FF 15 <vp>      call [VirtualProtect]     ; literal at +15
/// +19  C7 05 <slot> <value>  mov [slot], value   ; literals at +21 and +25
/// +29  8D 45 FC        lea  eax, [ebp-4]
/// +32  50              push eax
/// +33  FF 75 FC        push dword [ebp-4]        ; old protection
/// +36  6A 04           push 4
/// +38  68 <slot>       push slot                 ; literal at +39
/// +43  FF 15 <vp>      call [VirtualProtect]     ; literal at +45
/// ```
struct InitializerCode {
    virtual_protect: Symbol,
    slots: Vec<InitializerSlot>,
    sites: Vec<(Symbol, u32)>,
    address: Option<SegmentAddress>,
    image_base: u64,
    code: Vec<u8>,
}

impl Segment for InitializerCode {
    fn physical_size(&self) -> u32 {
        PROLOGUE.len() as u32 + self.slots.len() as u32 * ENTRY_SIZE + EPILOGUE.len() as u32
    }

    fn update_offsets(&mut self, params: LayoutParameters, symbols: &mut SymbolTable) {
        self.address = Some(params.address());
        self.image_base = params.image_base;
        for &(site, offset) in &self.sites {
            symbols.define(site, params.advance(offset, offset).address());
        }
    }

    fn update_references(&mut self, symbols: &SymbolTable) -> Result<()> {
        if self.address.is_none() {
            return Err(consistency_error!(
                "x86 initializer referenced before placement"
            ));
        }
        let vp = absolute32(self.image_base, symbols.resolve(self.virtual_protect)?)?;

        let mut code = Vec::with_capacity(self.physical_size() as usize);
        code.extend_from_slice(&PROLOGUE);
        for entry in &self.slots {
            let slot = absolute32(self.image_base, symbols.resolve(entry.slot)?)?;
            let value = absolute32(self.image_base, symbols.resolve(entry.value)?)?;

            code.extend_from_slice(&[0x8D, 0x45, 0xFC]);
            code.push(0x50);
            code.extend_from_slice(&[0x6A, 0x40]);
            code.extend_from_slice(&[0x6A, 0x04]);
            code.push(0x68);
            code.extend_from_slice(&slot.to_le_bytes());
            code.extend_from_slice(&[0xFF, 0x15]);
            code.extend_from_slice(&vp.to_le_bytes());
            code.extend_from_slice(&[0xC7, 0x05]);
            code.extend_from_slice(&slot.to_le_bytes());
            code.extend_from_slice(&value.to_le_bytes());
            code.extend_from_slice(&[0x8D, 0x45, 0xFC]);
            code.push(0x50);
            code.extend_from_slice(&[0xFF, 0x75, 0xFC]);
            code.extend_from_slice(&[0x6A, 0x04]);
            code.push(0x68);
            code.extend_from_slice(&slot.to_le_bytes());
            code.extend_from_slice(&[0xFF, 0x15]);
            code.extend_from_slice(&vp.to_le_bytes());
        }
        code.extend_from_slice(&EPILOGUE);

        self.code = code;
        Ok(())
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        if self.code.len() as u32 != self.physical_size() {
            return Err(consistency_error!(
                "x86 initializer written before reference resolution"
            ));
        }
        buf.extend_from_slice(&self.code);
        Ok(())
    }
}
