//! # peforge Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the peforge library. Import this module to get quick access to the essential
//! types for assembling PE/COFF images.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all peforge operations
pub use crate::Error;

/// The result type used throughout peforge
pub use crate::Result;

// ================================================================================================
// Segment and Layout Abstraction
// ================================================================================================

/// The capability set every unit of binary content implements
pub use crate::segment::Segment;

/// Composite segment laying out children contiguously with alignment
pub use crate::segment::SegmentBuilder;

/// Leaf segment holding raw bytes
pub use crate::segment::DataSegment;

/// A segment paired with the base relocations it requires
pub use crate::segment::RelocatableSegment;

/// Deferred address handles and the arena resolving them
pub use crate::segment::{SegmentAddress, Symbol, SymbolTable};

/// Layout position handed to segments during offset assignment
pub use crate::segment::LayoutParameters;

// ================================================================================================
// Metadata Tables
// ================================================================================================

/// Metadata token type referencing one table row
pub use crate::tables::Token;

/// ECMA-335 metadata table identifiers
pub use crate::tables::TableId;

/// A fixed-column metadata row
pub use crate::tables::Row;

/// The three row-accumulation strategies
pub use crate::tables::{DistinctTableBuffer, SortedTableBuffer, UnsortedTableBuffer};

/// Physical table serialization
pub use crate::tables::{ColumnLayout, MetadataTable};

// ================================================================================================
// Import Directory
// ================================================================================================

/// Logical import declarations
pub use crate::imports::{ImportedModule, ImportedSymbol};

/// The import directory builder and its constituent tables
pub use crate::imports::{HintNameTable, ImportDirectoryBuffer, ThunkTable};

// ================================================================================================
// Win32 Resources
// ================================================================================================

/// The logical resource tree
pub use crate::resources::{
    ResourceContent, ResourceData, ResourceDirectory, ResourceEntry, ResourceId,
};

/// Flattens the resource tree into its on-disk form
pub use crate::resources::ResourceDirectoryBuffer;

// ================================================================================================
// Base Relocations
// ================================================================================================

/// Relocation fixups and their serialized directory
pub use crate::relocations::{BaseRelocation, RelocationType, RelocationsDirectoryBuffer};

// ================================================================================================
// Platform Code Generation
// ================================================================================================

/// PE/COFF machine identifiers
pub use crate::platform::MachineType;

/// The per-architecture code generation capability set
pub use crate::platform::{for_machine, Platform};

/// Trampolines over address-table slots
pub use crate::platform::{ThunkStub, TrampolineTableBuffer};

// ================================================================================================
// Image Assembly
// ================================================================================================

/// Sections and the top-level assembler
pub use crate::image::{ImageAssembler, ImageParameters, Section, SectionFlags};
