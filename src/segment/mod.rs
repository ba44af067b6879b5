//! The segment and layout abstraction underlying every emitted binary component.
//!
//! A [`Segment`] is the atomic unit of binary content: it knows its own physical size (bytes
//! on disk) and virtual size (bytes when mapped), and can serialize itself once given its
//! final file offset and RVA. Composites are built with [`SegmentBuilder`], which lays its
//! children out contiguously with per-child alignment. Cross-segment pointers are expressed
//! through [`Symbol`] handles resolved against a [`SymbolTable`] arena, so that no raw
//! address is ever stored before layout has completed.
//!
//! # The Three-Phase Protocol
//!
//! Every build walks the segment tree exactly three times, in this order:
//!
//! 1. [`Segment::build`] - composites materialize content that depends only on already-known
//!    logical inputs. No addresses are touched.
//! 2. [`Segment::update_offsets`] - depth-first, in child order: each segment is assigned its
//!    file offset and RVA, and records the addresses of any symbols it exports.
//! 3. [`Segment::update_references`] - depth-first: every segment whose content embeds a
//!    [`Symbol`] rewrites it into a concrete value. Runs strictly after phase 2 has finished
//!    for the *entire* tree, because references may cross sibling subtrees.
//!
//! Content must be frozen before [`Segment::physical_size`] is first queried; mutating a
//! segment afterwards invalidates the sizes previously computed for its ancestors.

mod builder;
mod relocatable;
mod symbol;

pub use builder::SegmentBuilder;
pub use relocatable::RelocatableSegment;
pub use symbol::{SegmentAddress, Symbol, SymbolTable};

use crate::Result;

/// Rounds `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two; an alignment of 0 or 1 leaves the value unchanged.
#[must_use]
pub fn align_up(value: u64, alignment: u32) -> u64 {
    if alignment <= 1 {
        return value;
    }
    let mask = u64::from(alignment) - 1;
    (value + mask) & !mask
}

/// Layout parameters handed to a segment when it is assigned its final location.
///
/// Carries the file offset and RVA at which the segment starts, plus the preferred image
/// base for segments that need to emit virtual addresses (e.g. absolute-addressed thunk
/// stubs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutParameters {
    /// File offset at which the segment starts
    pub offset: u64,
    /// Relative virtual address at which the segment starts
    pub rva: u32,
    /// Preferred load address of the image being assembled
    pub image_base: u64,
}

impl LayoutParameters {
    /// Returns the parameters advanced by `physical` bytes on disk and `virtual_` bytes in
    /// memory.
    #[must_use]
    pub fn advance(self, physical: u32, virtual_: u32) -> Self {
        LayoutParameters {
            offset: self.offset + u64::from(physical),
            rva: self.rva + virtual_,
            ..self
        }
    }

    /// Returns the parameters with both offset and RVA rounded up to `alignment`.
    #[must_use]
    pub fn align_to(self, alignment: u32) -> Self {
        LayoutParameters {
            offset: align_up(self.offset, alignment),
            rva: align_up(u64::from(self.rva), alignment) as u32,
            ..self
        }
    }

    /// The address pair carried by these parameters.
    #[must_use]
    pub fn address(&self) -> SegmentAddress {
        SegmentAddress {
            offset: self.offset,
            rva: self.rva,
        }
    }
}

/// The capability set shared by every unit of binary content.
///
/// Implementations must keep [`Segment::physical_size`] callable before any offset is known,
/// and must not change the reported size once it has been queried. The only exception is a
/// composite whose internal padding depends on where it starts; its size settles once
/// [`Segment::update_offsets`] has assigned its base.
pub trait Segment {
    /// Number of bytes this segment occupies on disk.
    fn physical_size(&self) -> u32;

    /// Number of bytes this segment occupies once mapped into memory.
    ///
    /// Defaults to the physical size; only segments with trailing uninitialized data differ.
    fn virtual_size(&self) -> u32 {
        self.physical_size()
    }

    /// Phase 1: materialize content that depends only on logical inputs.
    ///
    /// Implementations must be idempotent; the default does nothing.
    fn build(&mut self, symbols: &mut SymbolTable) {
        let _ = symbols;
    }

    /// Phase 2: assign this segment its final file offset and RVA.
    ///
    /// Composites recurse into their children here; segments exporting symbols record the
    /// symbol addresses in `symbols`.
    fn update_offsets(&mut self, params: LayoutParameters, symbols: &mut SymbolTable);

    /// Phase 3: rewrite embedded symbolic references into concrete values.
    ///
    /// Runs strictly after phase 2 has completed for the entire tree.
    ///
    /// # Errors
    /// Returns [`crate::Error::Consistency`] if a referenced symbol was never assigned an
    /// address, which indicates a missing dependency edge in the build.
    fn update_references(&mut self, symbols: &SymbolTable) -> Result<()> {
        let _ = symbols;
        Ok(())
    }

    /// Serializes the segment's content to `buf`.
    ///
    /// Must be called only after all three phases have completed.
    ///
    /// # Errors
    /// Returns an error if the segment still holds unresolved state.
    fn write(&self, buf: &mut Vec<u8>) -> Result<()>;
}

/// A leaf segment holding raw bytes.
///
/// Optionally exports a [`Symbol`] for its own start address so other segments can point at
/// it, and optionally reports a virtual size larger than its physical size for trailing
/// zero-initialized data.
#[derive(Debug, Clone, Default)]
pub struct DataSegment {
    data: Vec<u8>,
    extra_virtual: u32,
    symbol: Option<Symbol>,
}

impl DataSegment {
    /// Creates a data segment from raw bytes.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        DataSegment {
            data,
            extra_virtual: 0,
            symbol: None,
        }
    }

    /// Creates a data segment holding a NUL-terminated ASCII string.
    #[must_use]
    pub fn ascii_string(value: &str) -> Self {
        let mut data = Vec::with_capacity(value.len() + 1);
        data.extend_from_slice(value.as_bytes());
        data.push(0);
        DataSegment::new(data)
    }

    /// Reserves and attaches a symbol for this segment's start address.
    ///
    /// The symbol becomes resolvable once layout has assigned this segment its location.
    pub fn export(&mut self, symbols: &mut SymbolTable) -> Symbol {
        let symbol = symbols.reserve();
        self.symbol = Some(symbol);
        symbol
    }

    /// Extends the virtual size beyond the physical size by `extra` zero bytes.
    pub fn set_extra_virtual(&mut self, extra: u32) {
        self.extra_virtual = extra;
    }

    /// The raw content of this segment.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Segment for DataSegment {
    fn physical_size(&self) -> u32 {
        self.data.len() as u32
    }

    fn virtual_size(&self) -> u32 {
        self.physical_size() + self.extra_virtual
    }

    fn update_offsets(&mut self, params: LayoutParameters, symbols: &mut SymbolTable) {
        if let Some(symbol) = self.symbol {
            symbols.define(symbol, params.address());
        }
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&self.data);
        Ok(())
    }
}
