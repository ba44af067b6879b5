//! Top-level image assembly.
//!
//! [`ImageAssembler`] takes a list of [`Section`]s, each holding a tree of segments, and
//! drives the three-phase resolution protocol over all of them: build, offset assignment
//! honoring file and section alignment, and reference resolution. The finished sections are
//! then serialized to a `std::io::Write` sink in declaration order, with zero padding
//! between them. A build either completes or fails with the first error raised; no partial
//! state is observable through the sink.

use std::io::Write;

use bitflags::bitflags;
use tracing::debug;

use crate::platform::MachineType;
use crate::segment::{align_up, LayoutParameters, Segment, SegmentAddress, SegmentBuilder, SymbolTable};
use crate::Result;

bitflags! {
    /// Section characteristics, matching the `IMAGE_SCN_*` flags of the PE/COFF header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u32 {
        /// The section contains executable code.
        const CNT_CODE = 0x0000_0020;
        /// The section contains initialized data.
        const CNT_INITIALIZED_DATA = 0x0000_0040;
        /// The section contains uninitialized data.
        const CNT_UNINITIALIZED_DATA = 0x0000_0080;
        /// The section can be discarded after load.
        const MEM_DISCARDABLE = 0x0200_0000;
        /// The section is shared between processes.
        const MEM_SHARED = 0x1000_0000;
        /// The section can be executed.
        const MEM_EXECUTE = 0x2000_0000;
        /// The section can be read.
        const MEM_READ = 0x4000_0000;
        /// The section can be written to.
        const MEM_WRITE = 0x8000_0000;
    }
}

/// One image section: a name, its characteristics, and the segment tree it contains.
pub struct Section {
    name: String,
    flags: SectionFlags,
    contents: SegmentBuilder,
    address: Option<SegmentAddress>,
}

impl Section {
    /// Creates an empty section.
    #[must_use]
    pub fn new(name: &str, flags: SectionFlags) -> Self {
        Section {
            name: name.to_string(),
            flags,
            contents: SegmentBuilder::new(),
            address: None,
        }
    }

    /// The section name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The section characteristics.
    #[must_use]
    pub fn flags(&self) -> SectionFlags {
        self.flags
    }

    /// The segment tree making up the section's content.
    pub fn contents_mut(&mut self) -> &mut SegmentBuilder {
        &mut self.contents
    }

    /// The section's assigned file offset and RVA, once layout has run.
    #[must_use]
    pub fn address(&self) -> Option<SegmentAddress> {
        self.address
    }

    /// Bytes the section occupies on disk.
    #[must_use]
    pub fn physical_size(&self) -> u32 {
        self.contents.physical_size()
    }

    /// Bytes the section occupies once mapped.
    #[must_use]
    pub fn virtual_size(&self) -> u32 {
        self.contents.virtual_size()
    }
}

/// Global layout parameters of the image being assembled.
#[derive(Debug, Clone, Copy)]
pub struct ImageParameters {
    /// Target machine; determines which platform strategy generated code used
    pub machine: MachineType,
    /// Preferred load address
    pub image_base: u64,
    /// Alignment of section starts within the file
    pub file_alignment: u32,
    /// Alignment of section starts in virtual memory
    pub section_alignment: u32,
    /// Bytes reserved at the start of the file for the PE headers, which are written by
    /// the surrounding system
    pub header_size: u32,
}

impl Default for ImageParameters {
    fn default() -> Self {
        ImageParameters {
            machine: MachineType::Amd64,
            image_base: 0x1_4000_0000,
            file_alignment: 0x200,
            section_alignment: 0x1000,
            header_size: 0x400,
        }
    }
}

/// Drives the three-phase protocol over all sections and serializes the result.
pub struct ImageAssembler {
    parameters: ImageParameters,
    sections: Vec<Section>,
}

impl ImageAssembler {
    /// Validates `parameters` and creates an assembler with no sections.
    ///
    /// # Errors
    /// Returns [`crate::Error::Config`] if an alignment is not a power of two, the file
    /// alignment exceeds the section alignment, or the image base is not 64 KiB aligned.
    pub fn new(parameters: ImageParameters) -> Result<Self> {
        if !parameters.file_alignment.is_power_of_two() {
            return Err(crate::Error::Config {
                message: format!(
                    "file alignment {:#x} is not a power of two",
                    parameters.file_alignment
                ),
            });
        }
        if !parameters.section_alignment.is_power_of_two() {
            return Err(crate::Error::Config {
                message: format!(
                    "section alignment {:#x} is not a power of two",
                    parameters.section_alignment
                ),
            });
        }
        if parameters.file_alignment > parameters.section_alignment {
            return Err(crate::Error::Config {
                message: format!(
                    "file alignment {:#x} exceeds section alignment {:#x}",
                    parameters.file_alignment, parameters.section_alignment
                ),
            });
        }
        if parameters.image_base % 0x10000 != 0 {
            return Err(crate::Error::Config {
                message: format!(
                    "image base {:#x} is not 64 KiB aligned",
                    parameters.image_base
                ),
            });
        }

        Ok(ImageAssembler {
            parameters,
            sections: Vec::new(),
        })
    }

    /// The parameters this assembler was created with.
    #[must_use]
    pub fn parameters(&self) -> &ImageParameters {
        &self.parameters
    }

    /// Appends a section; declaration order is both disk and RVA order.
    pub fn add_section(&mut self, section: Section) {
        self.sections.push(section);
    }

    /// The sections in declaration order, with their assigned addresses after assembly.
    #[must_use]
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Runs all three phases and serializes the image contents to `sink`.
    ///
    /// The region reserved for headers and all inter-section gaps are zero filled. Either
    /// the whole image is written or the first error is returned with nothing further
    /// emitted.
    ///
    /// # Errors
    /// Returns [`crate::Error::Config`] for an empty section list or an over-long section
    /// name, [`crate::Error::Consistency`] for unresolved references, and
    /// [`crate::Error::Io`] for sink failures.
    pub fn assemble(&mut self, symbols: &mut SymbolTable, sink: &mut impl Write) -> Result<()> {
        if self.sections.is_empty() {
            return Err(crate::Error::Config {
                message: "cannot assemble an image without sections".to_string(),
            });
        }
        for section in &self.sections {
            if section.name.len() > 8 {
                return Err(crate::Error::Config {
                    message: format!("section name {:?} exceeds 8 bytes", section.name),
                });
            }
        }

        debug!(sections = self.sections.len(), "building segment trees");
        for section in &mut self.sections {
            section.contents.build(symbols);
        }

        let mut offset = u64::from(self.parameters.header_size);
        let mut rva = self.parameters.header_size;
        for section in &mut self.sections {
            offset = align_up(offset, self.parameters.file_alignment);
            rva = align_up(u64::from(rva), self.parameters.section_alignment) as u32;

            let params = LayoutParameters {
                offset,
                rva,
                image_base: self.parameters.image_base,
            };
            section.contents.update_offsets(params, symbols);
            section.address = Some(params.address());
            debug!(
                name = %section.name,
                offset,
                rva,
                size = section.physical_size(),
                "placed section"
            );

            offset += u64::from(section.physical_size());
            rva += section.virtual_size();
        }

        debug!("resolving references");
        for section in &mut self.sections {
            section.contents.update_references(symbols)?;
        }

        let mut image = Vec::new();
        for section in &self.sections {
            let address = section
                .address
                .ok_or_else(|| consistency_error!("section serialized before placement"))?;
            if (image.len() as u64) < address.offset {
                image.resize(address.offset as usize, 0);
            }
            section.contents.write(&mut image)?;
        }
        let padded = align_up(image.len() as u64, self.parameters.file_alignment) as usize;
        image.resize(padded, 0);

        sink.write_all(&image)?;
        Ok(())
    }
}
