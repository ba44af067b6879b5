//! The composite segment laying out an ordered list of children.

use crate::segment::{align_up, LayoutParameters, Segment, SegmentAddress, SymbolTable};
use crate::Result;

struct AlignedChild {
    segment: Box<dyn Segment>,
    alignment: u32,
}

/// A composite segment: an ordered list of child segments, each with an alignment
/// requirement.
///
/// Insertion order is disk order and also the dependency order for offset propagation:
/// child *i*'s start is the end of child *i−1*, rounded up to child *i*'s declared
/// alignment. The builder's own padding therefore depends on where it starts, so its
/// physical size settles once [`Segment::update_offsets`] has assigned its base; before
/// that, sizes are computed relative to base 0.
#[derive(Default)]
pub struct SegmentBuilder {
    children: Vec<AlignedChild>,
    address: Option<SegmentAddress>,
}

impl SegmentBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        SegmentBuilder::default()
    }

    /// Appends a child with no alignment requirement.
    pub fn add(&mut self, segment: impl Segment + 'static) {
        self.add_aligned(segment, 1);
    }

    /// Appends a child that must start at a multiple of `alignment` bytes.
    pub fn add_aligned(&mut self, segment: impl Segment + 'static, alignment: u32) {
        self.children.push(AlignedChild {
            segment: Box::new(segment),
            alignment,
        });
    }

    /// Appends an already boxed child segment.
    pub fn add_boxed(&mut self, segment: Box<dyn Segment>, alignment: u32) {
        self.children.push(AlignedChild { segment, alignment });
    }

    /// Number of direct children.
    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Whether the builder has no children.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// The address assigned to this builder, if layout has run.
    #[must_use]
    pub fn address(&self) -> Option<SegmentAddress> {
        self.address
    }

    fn base_offset(&self) -> u64 {
        self.address.map_or(0, |a| a.offset)
    }

    fn base_rva(&self) -> u64 {
        self.address.map_or(0, |a| u64::from(a.rva))
    }
}

impl Segment for SegmentBuilder {
    fn physical_size(&self) -> u32 {
        let base = self.base_offset();
        let mut cursor = base;
        for child in &self.children {
            cursor = align_up(cursor, child.alignment);
            cursor += u64::from(child.segment.physical_size());
        }
        (cursor - base) as u32
    }

    fn virtual_size(&self) -> u32 {
        let base = self.base_rva();
        let mut cursor = base;
        for child in &self.children {
            cursor = align_up(cursor, child.alignment);
            cursor += u64::from(child.segment.virtual_size());
        }
        (cursor - base) as u32
    }

    fn build(&mut self, symbols: &mut SymbolTable) {
        for child in &mut self.children {
            child.segment.build(symbols);
        }
    }

    fn update_offsets(&mut self, params: LayoutParameters, symbols: &mut SymbolTable) {
        self.address = Some(params.address());

        let mut current = params;
        for child in &mut self.children {
            current = current.align_to(child.alignment);
            child.segment.update_offsets(current, symbols);
            current = current.advance(
                child.segment.physical_size(),
                child.segment.virtual_size(),
            );
        }
    }

    fn update_references(&mut self, symbols: &SymbolTable) -> Result<()> {
        for child in &mut self.children {
            child.segment.update_references(symbols)?;
        }
        Ok(())
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        let start = buf.len() as u64;
        let base = self.base_offset();

        let mut cursor = base;
        for child in &self.children {
            let child_start = align_up(cursor, child.alignment);
            let relative = child_start - base;

            // Zero padding up to the child's aligned start.
            let written = buf.len() as u64 - start;
            if written < relative {
                buf.resize(buf.len() + (relative - written) as usize, 0);
            }

            child.segment.write(buf)?;
            cursor = child_start + u64::from(child.segment.physical_size());
        }
        Ok(())
    }
}
