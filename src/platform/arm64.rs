//! Code generation for ARM64.

use crate::platform::{MachineType, Platform};
use crate::relocations::RelocationType;
use crate::segment::SegmentAddress;
use crate::Result;

/// `adrp x16, <page>` with a zeroed page immediate; the immediate is split into the two
/// low bits at 29..30 and the remaining 19 bits at 5..23.
const ADRP_X16: u32 = 0x9000_0010;
const ADRP_MASK: u32 = 0x9F00_001F;
/// `ldr x16, [x16, #<pageoff>]` with a zeroed offset; the scaled 12-bit immediate sits at
/// bits 10..21.
const LDR_X16: u32 = 0xF940_0210;
const LDR_MASK: u32 = 0xFFC0_03FF;
/// `br x16`.
const BR_X16: u32 = 0xD61F_0200;

const THUNK_SIZE: u32 = 12;

/// The ARM64 strategy: an adrp/ldr/br sequence addressing the slot page-relative, so no
/// base relocations are required. Address-table initializers are not generated for this
/// machine.
pub struct Arm64Platform;

impl Platform for Arm64Platform {
    fn machine(&self) -> MachineType {
        MachineType::Arm64
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
        let page_offset = slot.rva & 0xFFF;
        if page_offset % 8 != 0 {
            return Err(crate::Error::FormatLimit {
                message: format!(
                    "ARM64 load target {:#x} is not 8-byte aligned within its page",
                    slot.rva
                ),
            });
        }

        let page_delta = (i64::from(slot.rva >> 12) - i64::from(stub.rva >> 12)) as u32;
        let immlo = page_delta & 0b11;
        let immhi = (page_delta >> 2) & 0x7_FFFF;
        let adrp = ADRP_X16 | (immlo << 29) | (immhi << 5);
        let ldr = LDR_X16 | ((page_offset >> 3) << 10);

        let mut code = Vec::with_capacity(THUNK_SIZE as usize);
        code.extend_from_slice(&adrp.to_le_bytes());
        code.extend_from_slice(&ldr.to_le_bytes());
        code.extend_from_slice(&BR_X16.to_le_bytes());
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
        if code.len() < THUNK_SIZE as usize {
            return Err(consistency_error!("byte pattern is not an ARM64 thunk stub"));
        }
        let adrp = u32::from_le_bytes([code[0], code[1], code[2], code[3]]);
        let ldr = u32::from_le_bytes([code[4], code[5], code[6], code[7]]);
        let br = u32::from_le_bytes([code[8], code[9], code[10], code[11]]);
        if adrp & ADRP_MASK != ADRP_X16 || ldr & LDR_MASK != LDR_X16 || br != BR_X16 {
            return Err(consistency_error!("byte pattern is not an ARM64 thunk stub"));
        }

        // Reassemble the signed 21-bit page delta from immhi:immlo.
        let immlo = (adrp >> 29) & 0b11;
        let immhi = (adrp >> 5) & 0x7_FFFF;
        let raw = (immhi << 2) | immlo;
        let page_delta = i64::from((raw << 11) as i32 >> 11);

        let page_offset = u64::from((ldr >> 10) & 0xFFF) << 3;
        let stub_page = i64::from(stub_rva >> 12);
        let slot_rva = ((stub_page + page_delta) << 12) as u64 + page_offset;
        Ok(image_base + slot_rva)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::for_machine;
    use crate::Error;

    fn address(rva: u32) -> SegmentAddress {
        SegmentAddress {
            offset: u64::from(rva),
            rva,
        }
    }

    #[test]
    fn test_thunk_round_trip_forward_page() {
        let platform = for_machine(MachineType::Arm64);
        let image_base = 0x1_8000_0000;

        let code = platform
            .encode_thunk(address(0x3004), image_base, address(0x7008))
            .unwrap();
        assert_eq!(code.len(), 12);
        assert_eq!(&code[8..12], &0xD61F_0200u32.to_le_bytes());

        let va = platform
            .extract_thunk_address(&code, 0x3004, image_base)
            .unwrap();
        assert_eq!(va, image_base + 0x7008);
    }

    #[test]
    fn test_thunk_round_trip_backward_page() {
        let platform = for_machine(MachineType::Arm64);
        let code = platform
            .encode_thunk(address(0x9000), 0, address(0x2010))
            .unwrap();
        let va = platform.extract_thunk_address(&code, 0x9000, 0).unwrap();
        assert_eq!(va, 0x2010);
    }

    #[test]
    fn test_same_page_slot() {
        let platform = for_machine(MachineType::Arm64);
        let code = platform
            .encode_thunk(address(0x4000), 0, address(0x4FF8))
            .unwrap();
        let va = platform.extract_thunk_address(&code, 0x4000, 0).unwrap();
        assert_eq!(va, 0x4FF8);
    }

    #[test]
    fn test_misaligned_slot_is_rejected() {
        let platform = for_machine(MachineType::Arm64);
        assert!(matches!(
            platform.encode_thunk(address(0x4000), 0, address(0x5004)),
            Err(Error::FormatLimit { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_foreign_bytes() {
        let platform = for_machine(MachineType::Arm64);
        assert!(platform.extract_thunk_address(&[0; 12], 0, 0).is_err());
        assert!(platform.extract_thunk_address(&[0; 4], 0, 0).is_err());
    }
}
