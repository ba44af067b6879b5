//! The null-object platform for machines without a code generator.

use crate::platform::{MachineType, Platform};
use crate::relocations::RelocationType;
use crate::segment::SegmentAddress;
use crate::Result;

/// Stands in for any machine this crate cannot generate code for.
///
/// Sizes report zero and every code-generation operation fails with
/// [`crate::Error::NotSupported`]; consumers that only need layout (no generated stubs)
/// keep working.
pub struct UnsupportedPlatform;

impl Platform for UnsupportedPlatform {
    fn machine(&self) -> MachineType {
        MachineType::Unknown
    }

    fn is_64bit(&self) -> bool {
        false
    }

    fn thunk_size(&self) -> u32 {
        0
    }

    fn encode_thunk(
        &self,
        _stub: SegmentAddress,
        _image_base: u64,
        _slot: SegmentAddress,
    ) -> Result<Vec<u8>> {
        Err(crate::Error::NotSupported {
            machine: self.machine(),
            operation: "Thunk stub generation",
        })
    }

    fn thunk_relocations(&self) -> &'static [(RelocationType, u32)] {
        &[]
    }

    fn extract_thunk_address(
        &self,
        _code: &[u8],
        _stub_rva: u32,
        _image_base: u64,
    ) -> Result<u64> {
        Err(crate::Error::NotSupported {
            machine: self.machine(),
            operation: "Thunk stub decoding",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::for_machine;
    use crate::Error;

    #[test]
    fn test_all_codegen_operations_fail() {
        let platform = for_machine(MachineType::Unknown);
        assert_eq!(platform.thunk_size(), 0);
        assert!(!platform.supports_address_table_initializer());

        let stub = SegmentAddress { offset: 0, rva: 0 };
        assert!(matches!(
            platform.encode_thunk(stub, 0, stub),
            Err(Error::NotSupported { .. })
        ));
        assert!(matches!(
            platform.extract_thunk_address(&[], 0, 0),
            Err(Error::NotSupported { .. })
        ));
    }
}
