//! A segment paired with the base relocations it requires.

use crate::relocations::BaseRelocation;
use crate::segment::{LayoutParameters, Segment, SymbolTable};
use crate::Result;

/// Pairs a segment with the base relocations its content needs if the image is loaded at a
/// different address than assumed at build time.
///
/// Position-independent code carries an empty relocation list; code embedding absolute
/// virtual addresses (e.g. the x86 thunk stub) lists one fixup per embedded address.
pub struct RelocatableSegment {
    segment: Box<dyn Segment>,
    relocations: Vec<BaseRelocation>,
}

impl RelocatableSegment {
    /// Pairs `segment` with the relocations it requires.
    #[must_use]
    pub fn new(segment: Box<dyn Segment>, relocations: Vec<BaseRelocation>) -> Self {
        RelocatableSegment {
            segment,
            relocations,
        }
    }

    /// The relocations the wrapped segment requires.
    #[must_use]
    pub fn relocations(&self) -> &[BaseRelocation] {
        &self.relocations
    }

    /// Unwraps into the segment and its relocation list.
    #[must_use]
    pub fn into_parts(self) -> (Box<dyn Segment>, Vec<BaseRelocation>) {
        (self.segment, self.relocations)
    }
}

impl Segment for RelocatableSegment {
    fn physical_size(&self) -> u32 {
        self.segment.physical_size()
    }

    fn virtual_size(&self) -> u32 {
        self.segment.virtual_size()
    }

    fn build(&mut self, symbols: &mut SymbolTable) {
        self.segment.build(symbols);
    }

    fn update_offsets(&mut self, params: LayoutParameters, symbols: &mut SymbolTable) {
        self.segment.update_offsets(params, symbols);
    }

    fn update_references(&mut self, symbols: &SymbolTable) -> Result<()> {
        self.segment.update_references(symbols)
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        self.segment.write(buf)
    }
}
