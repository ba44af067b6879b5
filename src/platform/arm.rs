//! Code generation for 32-bit ARM.

use crate::platform::{MachineType, Platform};
use crate::relocations::RelocationType;
use crate::segment::SegmentAddress;
use crate::Result;

/// `ldr pc, [pc, #-4]`: loads the word immediately following the instruction into the
/// program counter. With the ARM pipeline, `pc` reads as the instruction address plus 8,
/// so the `#-4` displacement lands exactly on the trailing literal.
const THUNK_INSTRUCTION: u32 = 0xE51F_F004;
const THUNK_SIZE: u32 = 8;

/// The ARM32 strategy: a one-instruction literal-pool jump. The literal holds an absolute
/// virtual address and therefore carries a `HighLow` relocation; address-table
/// initializers are not generated for this machine.
pub struct ArmPlatform;

impl Platform for ArmPlatform {
    fn machine(&self) -> MachineType {
        MachineType::Arm
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
        let va = super::x86::absolute32(image_base, slot)?;
        let mut code = Vec::with_capacity(THUNK_SIZE as usize);
        code.extend_from_slice(&THUNK_INSTRUCTION.to_le_bytes());
        code.extend_from_slice(&va.to_le_bytes());
        Ok(code)
    }

    fn thunk_relocations(&self) -> &'static [(RelocationType, u32)] {
        &[(RelocationType::HighLow, 4)]
    }

    fn extract_thunk_address(
        &self,
        code: &[u8],
        _stub_rva: u32,
        _image_base: u64,
    ) -> Result<u64> {
        if code.len() < THUNK_SIZE as usize
            || u32::from_le_bytes([code[0], code[1], code[2], code[3]]) != THUNK_INSTRUCTION
        {
            return Err(consistency_error!("byte pattern is not an ARM thunk stub"));
        }
        let va = u32::from_le_bytes([code[4], code[5], code[6], code[7]]);
        Ok(u64::from(va))
    }
}
