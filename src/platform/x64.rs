//! Code generation for x86-64.

use crate::platform::{InitializerSlot, MachineType, Platform};
use crate::relocations::RelocationType;
use crate::segment::{
    LayoutParameters, RelocatableSegment, Segment, SegmentAddress, Symbol, SymbolTable,
};
use crate::Result;

/// `jmp qword [rip+rel32]`: same FF /4 opcode as x86, but the ModRM selects RIP-relative
/// addressing, so the stub is position independent and needs no base relocations.
const THUNK_OPCODE: [u8; 2] = [0xFF, 0x25];
const THUNK_SIZE: u32 = 6;

const PROLOGUE: [u8; 4] = [0x48, 0x83, 0xEC, 0x38]; // sub rsp, 0x38
const EPILOGUE: [u8; 5] = [0x48, 0x83, 0xC4, 0x38, 0xC3]; // add rsp, 0x38; ret
const ENTRY_SIZE: u32 = 71;

/// The x64 strategy: RIP-relative stubs carrying no relocations at all.
pub struct X64Platform;

impl Platform for X64Platform {
    fn machine(&self) -> MachineType {
        MachineType::Amd64
    }

    fn is_64bit(&self) -> bool {
        true
    }

    fn thunk_size(&self) -> u32 {
        THUNK_SIZE
    }

    fn encode_thunk(
        &self,
        stub: SegmentAddress,
        _image_base: u64,
        slot: SegmentAddress,
    ) -> Result<Vec<u8>> {
        let rel = rip_relative(stub.rva + THUNK_SIZE, slot.rva);
        let mut code = Vec::with_capacity(THUNK_SIZE as usize);
        code.extend_from_slice(&THUNK_OPCODE);
        code.extend_from_slice(&rel.to_le_bytes());
        Ok(code)
    }

    fn thunk_relocations(&self) -> &'static [(RelocationType, u32)] {
        &[]
    }

    fn extract_thunk_address(
        &self,
        code: &[u8],
        stub_rva: u32,
        image_base: u64,
    ) -> Result<u64> {
        if code.len() < THUNK_SIZE as usize || code[0..2] != THUNK_OPCODE {
            return Err(consistency_error!("byte pattern is not an x64 thunk stub"));
        }
        let rel = i32::from_le_bytes([code[2], code[3], code[4], code[5]]);
        let slot_rva = (i64::from(stub_rva) + i64::from(THUNK_SIZE) + i64::from(rel)) as u64;
        Ok(image_base + slot_rva)
    }

    fn supports_address_table_initializer(&self) -> bool {
        true
    }

    fn create_address_table_initializer(
        &self,
        _symbols: &mut SymbolTable,
        virtual_protect: Symbol,
        slots: &[InitializerSlot],
    ) -> Result<RelocatableSegment> {
        let code = InitializerCode {
            virtual_protect,
            slots: slots.to_vec(),
            address: None,
            code: Vec::new(),
        };
        // Fully RIP-relative; the loader never has to patch it.
        Ok(RelocatableSegment::new(Box::new(code), Vec::new()))
    }
}

fn rip_relative(next_instruction_rva: u32, target_rva: u32) -> i32 {
    target_rva.wrapping_sub(next_instruction_rva) as i32
}

/// The process-attach initializer, built entirely from RIP-relative addressing. One
/// 71-byte entry per slot:
///
/// ```text
///  +0  48 8D 0D <rel>  lea  rcx, [rip+slot]      ; rel32 at +3
///  +7  BA 08 00 00 00  mov  edx, 8
/// +12  41 B8 40 00 00 00  mov r8d, 0x40          ; PAGE_EXECUTE_READWRITE
/// +18  4C 8D 4C 24 20  lea  r9, [rsp+0x20]       ; &old
/// +23  FF 15 <rel>     call [rip+VirtualProtect] ; rel32 at +25
/// +29  48 8D 05 <rel>  lea  rax, [rip+value]     ; rel32 at +32
/// +36  48 89 05 <rel>  mov  [rip+slot], rax      ; rel32 at +39
/// +43  48 8D 0D <rel>  lea  rcx, [rip+slot]
/// +50  BA 08 00 00 00  mov  edx, 8
/// +55  44 8B 44 24 20  mov  r8d, [rsp+0x20]      ; old protection
/// +60  4C 8D 4C 24 20  lea  r9, [rsp+0x20]
/// +65  FF 15 <rel>     call [rip+VirtualProtect]
/// ```
struct InitializerCode {
    virtual_protect: Symbol,
    slots: Vec<InitializerSlot>,
    address: Option<SegmentAddress>,
    code: Vec<u8>,
}

impl Segment for InitializerCode {
    fn physical_size(&self) -> u32 {
        PROLOGUE.len() as u32 + self.slots.len() as u32 * ENTRY_SIZE + EPILOGUE.len() as u32
    }

    fn update_offsets(&mut self, params: LayoutParameters, _symbols: &mut SymbolTable) {
        self.address = Some(params.address());
    }

    fn update_references(&mut self, symbols: &SymbolTable) -> Result<()> {
        let base = self
            .address
            .ok_or_else(|| consistency_error!("x64 initializer referenced before placement"))?;
        let vp = symbols.resolve(self.virtual_protect)?.rva;

        let mut code = Vec::with_capacity(self.physical_size() as usize);
        code.extend_from_slice(&PROLOGUE);
        for (index, entry) in self.slots.iter().enumerate() {
            let entry_rva = base.rva + PROLOGUE.len() as u32 + index as u32 * ENTRY_SIZE;
            let slot = symbols.resolve(entry.slot)?.rva;
            let value = symbols.resolve(entry.value)?.rva;

            code.extend_from_slice(&[0x48, 0x8D, 0x0D]);
            code.extend_from_slice(&rip_relative(entry_rva + 7, slot).to_le_bytes());
            code.extend_from_slice(&[0xBA, 0x08, 0x00, 0x00, 0x00]);
            code.extend_from_slice(&[0x41, 0xB8, 0x40, 0x00, 0x00, 0x00]);
            code.extend_from_slice(&[0x4C, 0x8D, 0x4C, 0x24, 0x20]);
            code.extend_from_slice(&[0xFF, 0x15]);
            code.extend_from_slice(&rip_relative(entry_rva + 29, vp).to_le_bytes());
            code.extend_from_slice(&[0x48, 0x8D, 0x05]);
            code.extend_from_slice(&rip_relative(entry_rva + 36, value).to_le_bytes());
            code.extend_from_slice(&[0x48, 0x89, 0x05]);
            code.extend_from_slice(&rip_relative(entry_rva + 43, slot).to_le_bytes());
            code.extend_from_slice(&[0x48, 0x8D, 0x0D]);
            code.extend_from_slice(&rip_relative(entry_rva + 50, slot).to_le_bytes());
            code.extend_from_slice(&[0xBA, 0x08, 0x00, 0x00, 0x00]);
            code.extend_from_slice(&[0x44, 0x8B, 0x44, 0x24, 0x20]);
            code.extend_from_slice(&[0x4C, 0x8D, 0x4C, 0x24, 0x20]);
            code.extend_from_slice(&[0xFF, 0x15]);
            code.extend_from_slice(&rip_relative(entry_rva + 71, vp).to_le_bytes());
        }
        code.extend_from_slice(&EPILOGUE);

        self.code = code;
        Ok(())
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        if self.code.len() as u32 != self.physical_size() {
            return Err(consistency_error!(
                "x64 initializer written before reference resolution"
            ));
        }
        buf.extend_from_slice(&self.code);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::for_machine;

    fn address(rva: u32) -> SegmentAddress {
        SegmentAddress {
            offset: u64::from(rva),
            rva,
        }
    }

    #[test]
    fn test_thunk_is_rip_relative() {
        let platform = for_machine(MachineType::Amd64);

        // Slot above the stub.
        let code = platform
            .encode_thunk(address(0x3000), 0x1_4000_0000, address(0x2000))
            .unwrap();
        assert_eq!(&code[0..2], &[0xFF, 0x25]);
        let rel = i32::from_le_bytes(code[2..6].try_into().unwrap());
        assert_eq!(rel, -(0x1006));

        let va = platform
            .extract_thunk_address(&code, 0x3000, 0x1_4000_0000)
            .unwrap();
        assert_eq!(va, 0x1_4000_0000 + 0x2000);
    }

    #[test]
    fn test_decode_rejects_foreign_bytes() {
        let platform = for_machine(MachineType::Amd64);
        assert!(platform
            .extract_thunk_address(&[0xE9, 0, 0, 0, 0, 0], 0, 0)
            .is_err());
        assert!(platform.extract_thunk_address(&[0xFF], 0, 0).is_err());
    }

    #[test]
    fn test_initializer_needs_no_relocations() {
        let platform = for_machine(MachineType::Amd64);
        let mut symbols = SymbolTable::new();

        let vp = symbols.reserve();
        symbols.define(vp, address(0x2000));
        let slot = symbols.reserve();
        symbols.define(slot, address(0x2010));
        let value = symbols.reserve();
        symbols.define(value, address(0x6000));

        let mut initializer = platform
            .create_address_table_initializer(
                &mut symbols,
                vp,
                &[InitializerSlot { slot, value }],
            )
            .unwrap();
        assert!(initializer.relocations().is_empty());
        assert_eq!(initializer.physical_size(), 4 + 71 + 5);

        initializer.update_offsets(
            LayoutParameters {
                offset: 0x1000,
                rva: 0x5000,
                image_base: 0x1_4000_0000,
            },
            &mut symbols,
        );
        initializer.update_references(&symbols).unwrap();

        let mut buf = Vec::new();
        initializer.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 80);
        assert_eq!(&buf[0..4], &PROLOGUE);

        // First instruction: lea rcx, [rip+rel] resolving to the slot RVA.
        let rel = i32::from_le_bytes(buf[4 + 3..4 + 7].try_into().unwrap());
        let entry_rva = 0x5000 + 4;
        assert_eq!((entry_rva + 7) as i64 + i64::from(rel), 0x2010);
    }
}
