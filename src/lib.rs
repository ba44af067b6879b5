// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]

//! # peforge
//!
//! A layout and linking engine for reassembling Windows PE/COFF executable images and their
//! embedded managed-metadata tables. `peforge` takes a tree of logical binary components
//! (import tables, resource trees, metadata tables, code stubs) whose mutual references are
//! symbolic, and produces a single contiguous byte stream in which every reference has been
//! rewritten into a concrete file offset or relative virtual address (RVA), honoring file and
//! section alignment rules and the format's ordering and uniqueness constraints.
//!
//! ## Features
//!
//! - **Composable segments** - Every binary component implements one [`segment::Segment`]
//!   capability, and composites lay their children out with per-child alignment
//! - **Deferred addressing** - Cross-segment pointers are wired up through a
//!   [`segment::SymbolTable`] arena before any address exists, and resolved in a single pass
//! - **Metadata table buffers** - Unsorted, deduplicating and sort-then-renumber strategies
//!   producing stable [`tables::Token`] assignments
//! - **Import directories** - Hint-name tables, lookup/address thunk tables and directory
//!   entries emitted bit-exact to the PE/COFF specification
//! - **Win32 resources** - Level-ordered flattening of hierarchical resource trees
//! - **Per-architecture code generation** - Indirect-jump thunk stubs, stub decoding and
//!   address-table initializers for x86, x64, ARM32 and ARM64
//!
//! ## Quick Start
//!
//! ```rust
//! use peforge::prelude::*;
//!
//! let mut symbols = SymbolTable::new();
//!
//! // Declare one imported module with one named and one ordinal symbol.
//! let mut module = ImportedModule::new("KERNEL32.DLL");
//! module.add_symbol(ImportedSymbol::by_name(0x130, "ExitProcess"));
//! module.add_symbol(ImportedSymbol::by_ordinal(7));
//!
//! let mut imports = ImportDirectoryBuffer::new(false);
//! imports.add_module(module);
//! imports.build(&mut symbols);
//!
//! // Assemble a minimal image with a single .idata-style section.
//! let mut section = Section::new(".idata", SectionFlags::CNT_INITIALIZED_DATA | SectionFlags::MEM_READ);
//! section.contents_mut().add(imports);
//!
//! let mut assembler = ImageAssembler::new(ImageParameters::default())?;
//! assembler.add_section(section);
//!
//! let mut sink = Vec::new();
//! assembler.assemble(&mut symbols, &mut sink)?;
//! assert!(!sink.is_empty());
//! # Ok::<(), peforge::Error>(())
//! ```
//!
//! ## Architecture
//!
//! `peforge` is organized into several key modules:
//!
//! - [`prelude`] - Convenient re-exports of commonly used types and traits
//! - [`segment`] - The segment/layout abstraction and its three-phase resolution protocol
//! - [`tables`] - Metadata table buffering strategies and token assignment
//! - [`imports`] - Import directory construction
//! - [`resources`] - Resource directory flattening
//! - [`relocations`] - Base relocation grouping and serialization
//! - [`platform`] - Per-architecture thunk and initializer code generation
//! - [`image`] - The top-level section assembler
//! - [`Error`] and [`Result`] - Comprehensive error handling
//!
//! ### The Three-Phase Protocol
//!
//! Nothing in a PE image can be referenced before it is placed, and nothing can be placed
//! before it is sized. The engine therefore walks the segment tree exactly three times:
//!
//! 1. **Build** - composites materialize content that depends only on logical inputs
//! 2. **UpdateOffsets** - depth-first, in child order: file offsets and RVAs are assigned,
//!    and every exported symbol is recorded in the [`segment::SymbolTable`]
//! 3. **UpdateReferences** - every segment that embeds a symbolic reference rewrites it into
//!    a concrete RVA, file offset or token
//!
//! The tree is then serialized to the output sink in tree order. A reference to a segment
//! that was never placed, or to a table token requested before that table's finalization, is
//! surfaced immediately as a [`Error::Consistency`] instead of silently producing wrong
//! bytes.
//!
//! ### Testing
//!
//! ```bash
//! cargo test
//! ```

#[macro_use]
pub(crate) mod error;

/// Convenient re-exports of the most commonly used types and traits.
///
/// This module provides a curated selection of the most frequently used types from across
/// the peforge library, allowing for convenient glob imports.
///
/// # Example
///
/// ```rust
/// use peforge::prelude::*;
///
/// let mut symbols = SymbolTable::new();
/// let symbol = symbols.reserve();
/// assert!(symbols.resolve(symbol).is_err());
/// ```
pub mod prelude;

/// Segment and layout abstraction based on the PE/COFF file format
///
/// This module provides the atomic unit of binary content ([`segment::Segment`]), the
/// composite [`segment::SegmentBuilder`] that lays children out contiguously with padding,
/// and the [`segment::SymbolTable`] address-resolution arena used to wire up cross-segment
/// pointers before those segments have final addresses.
pub mod segment;

/// Metadata table buffering strategies based on ECMA-335
///
/// This module provides the three interchangeable row-accumulation strategies (unsorted,
/// deduplicating, sort-then-renumber), the [`tables::Token`] type identifying one logical
/// metadata row, and the physical serialization of finished tables.
pub mod tables;

/// Import directory construction based on the PE/COFF specification
///
/// This module turns a set of module/symbol import declarations into the import lookup
/// table, import address table and the hint-name blob both of them reference.
pub mod imports;

/// Win32 resource directory construction
///
/// This module flattens a hierarchical resource tree into level-ordered directory tables
/// plus a data table, computing each entry's offset-to-data relative to the resource
/// directory's own base RVA.
pub mod resources;

/// Base relocation grouping and serialization
///
/// This module groups (type, target) fixups into 4 KiB page-aligned relocation blocks as
/// required by the PE/COFF `.reloc` format.
pub mod relocations;

/// Per-architecture code generation strategies
///
/// This module provides the [`platform::Platform`] capability set for generating and
/// decoding indirect-jump thunk stubs and address-table initializer stubs, with explicit
/// capability errors on architectures that do not support an operation.
pub mod platform;

/// Top-level image assembly
///
/// This module assembles all finished segments into sections, runs the three-phase
/// resolution protocol over the whole tree and serializes the result to an output sink.
pub mod image;

pub use crate::error::Error;

/// Result type alias for operations that can fail with a peforge [`crate::Error`]
pub type Result<T> = std::result::Result<T, Error>;
