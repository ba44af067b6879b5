//! Level-ordered flattening of the resource tree.

use std::collections::HashMap;

use widestring::U16String;

use crate::resources::{ResourceContent, ResourceDirectory, ResourceId};
use crate::segment::{LayoutParameters, Segment, SegmentAddress, SymbolTable};
use crate::Result;

const DIRECTORY_HEADER_SIZE: u32 = 16;
const DIRECTORY_ENTRY_SIZE: u32 = 8;
const DATA_ENTRY_SIZE: u32 = 16;
const SUBDIRECTORY_BIT: u32 = 0x8000_0000;

enum EntryKey {
    Name(usize),
    Id(u32),
}

enum EntryTarget {
    Directory(usize),
    Data(usize),
}

struct FlatDirectory {
    characteristics: u32,
    timestamp: u32,
    major_version: u16,
    minor_version: u16,
    named_count: u16,
    id_count: u16,
    entries: Vec<(EntryKey, EntryTarget)>,
}

struct FlatData {
    codepage: u32,
    content: usize,
}

/// Flattens a [`ResourceDirectory`] tree into the on-disk `.rsrc` layout.
///
/// The serialized order is: all directory tables in breadth-first level order (so every
/// depth-D table precedes every depth-D+1 table, as the format requires), then the flat
/// data-entry table, the UTF-16 name strings, and finally the raw contents, each aligned
/// to 4 bytes. Directory entries store offsets relative to the buffer's own start, with
/// bit 31 marking subdirectory targets; data entries store the absolute RVA of their
/// content, which is why reference resolution must run after the buffer has been placed.
pub struct ResourceDirectoryBuffer {
    root: ResourceDirectory,
    directories: Vec<FlatDirectory>,
    directory_offsets: Vec<u32>,
    data_entries: Vec<FlatData>,
    data_entry_base: u32,
    names: Vec<U16String>,
    name_offsets: Vec<u32>,
    contents: Vec<Vec<u8>>,
    content_offsets: Vec<u32>,
    total_size: u32,
    address: Option<SegmentAddress>,
    data_rvas: Vec<u32>,
    is_built: bool,
}

impl ResourceDirectoryBuffer {
    /// Creates a buffer that will flatten `root` when built.
    #[must_use]
    pub fn new(root: ResourceDirectory) -> Self {
        ResourceDirectoryBuffer {
            root,
            directories: Vec::new(),
            directory_offsets: Vec::new(),
            data_entries: Vec::new(),
            data_entry_base: 0,
            names: Vec::new(),
            name_offsets: Vec::new(),
            contents: Vec::new(),
            content_offsets: Vec::new(),
            total_size: 0,
            address: None,
            data_rvas: Vec::new(),
            is_built: false,
        }
    }

    /// Phase 1: flattens the tree and fixes all buffer-relative offsets.
    ///
    /// Idempotent; repeated calls are no-ops.
    pub fn build(&mut self) {
        if self.is_built {
            return;
        }
        self.is_built = true;

        self.flatten();
        self.assign_offsets();
    }

    fn flatten(&mut self) {
        let mut name_index: HashMap<String, usize> = HashMap::new();
        // Worklist doubles as the level-order directory list: children are appended
        // behind all directories of the current depth.
        let mut worklist: Vec<ResourceDirectory> = vec![std::mem::take(&mut self.root)];

        let mut current = 0;
        while current < worklist.len() {
            let directory = std::mem::take(&mut worklist[current]);
            let (characteristics, timestamp, major_version, minor_version) =
                directory.header_fields();

            let mut entries = Vec::with_capacity(directory.entries().len());
            let mut named_count = 0u16;
            let mut id_count = 0u16;

            // Named entries first, then ID entries; model order within each partition.
            let (named, ids): (Vec<_>, Vec<_>) = directory
                .entries()
                .iter()
                .partition(|entry| entry.id().is_named());

            for entry in named.into_iter().chain(ids) {
                let key = match entry.id() {
                    ResourceId::Name(name) => {
                        let index = *name_index.entry(name.clone()).or_insert_with(|| {
                            self.names.push(U16String::from_str(name));
                            self.names.len() - 1
                        });
                        named_count += 1;
                        EntryKey::Name(index)
                    }
                    ResourceId::Id(id) => {
                        id_count += 1;
                        EntryKey::Id(*id)
                    }
                };

                let target = match entry.content() {
                    ResourceContent::Directory(child) => {
                        worklist.push(child.clone());
                        EntryTarget::Directory(worklist.len() - 1)
                    }
                    ResourceContent::Data(data) => {
                        self.contents.push(data.contents().to_vec());
                        self.data_entries.push(FlatData {
                            codepage: data.codepage(),
                            content: self.contents.len() - 1,
                        });
                        EntryTarget::Data(self.data_entries.len() - 1)
                    }
                };

                entries.push((key, target));
            }

            self.directories.push(FlatDirectory {
                characteristics,
                timestamp,
                major_version,
                minor_version,
                named_count,
                id_count,
                entries,
            });
            current += 1;
        }
    }

    fn assign_offsets(&mut self) {
        let mut cursor = 0u32;

        self.directory_offsets = Vec::with_capacity(self.directories.len());
        for directory in &self.directories {
            self.directory_offsets.push(cursor);
            cursor +=
                DIRECTORY_HEADER_SIZE + directory.entries.len() as u32 * DIRECTORY_ENTRY_SIZE;
        }

        self.data_entry_base = cursor;
        cursor += self.data_entries.len() as u32 * DATA_ENTRY_SIZE;

        self.name_offsets = Vec::with_capacity(self.names.len());
        for name in &self.names {
            self.name_offsets.push(cursor);
            cursor += 2 + name.len() as u32 * 2;
        }

        self.content_offsets = Vec::with_capacity(self.contents.len());
        for content in &self.contents {
            cursor = (cursor + 3) & !3;
            self.content_offsets.push(cursor);
            cursor += content.len() as u32;
        }

        self.total_size = cursor;
    }

    fn data_entry_offset(&self, index: usize) -> u32 {
        self.data_entry_base + index as u32 * DATA_ENTRY_SIZE
    }
}

impl Segment for ResourceDirectoryBuffer {
    fn physical_size(&self) -> u32 {
        self.total_size
    }

    fn build(&mut self, _symbols: &mut SymbolTable) {
        ResourceDirectoryBuffer::build(self);
    }

    fn update_offsets(&mut self, params: LayoutParameters, _symbols: &mut SymbolTable) {
        self.address = Some(params.address());
    }

    fn update_references(&mut self, _symbols: &SymbolTable) -> Result<()> {
        let base = self
            .address
            .ok_or_else(|| consistency_error!("resource directory referenced before placement"))?;

        self.data_rvas = self
            .data_entries
            .iter()
            .map(|data| base.rva + self.content_offsets[data.content])
            .collect();
        Ok(())
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        if !self.data_entries.is_empty() && self.data_rvas.len() != self.data_entries.len() {
            return Err(consistency_error!(
                "resource directory written before reference resolution"
            ));
        }

        let start = buf.len();
        for directory in &self.directories {
            buf.extend_from_slice(&directory.characteristics.to_le_bytes());
            buf.extend_from_slice(&directory.timestamp.to_le_bytes());
            buf.extend_from_slice(&directory.major_version.to_le_bytes());
            buf.extend_from_slice(&directory.minor_version.to_le_bytes());
            buf.extend_from_slice(&directory.named_count.to_le_bytes());
            buf.extend_from_slice(&directory.id_count.to_le_bytes());

            for (key, target) in &directory.entries {
                let id_field = match key {
                    EntryKey::Name(index) => self.name_offsets[*index] | SUBDIRECTORY_BIT,
                    EntryKey::Id(id) => *id,
                };
                let offset_field = match target {
                    EntryTarget::Directory(index) => {
                        self.directory_offsets[*index] | SUBDIRECTORY_BIT
                    }
                    EntryTarget::Data(index) => self.data_entry_offset(*index),
                };
                buf.extend_from_slice(&id_field.to_le_bytes());
                buf.extend_from_slice(&offset_field.to_le_bytes());
            }
        }

        for (index, data) in self.data_entries.iter().enumerate() {
            buf.extend_from_slice(&self.data_rvas[index].to_le_bytes());
            buf.extend_from_slice(
                &(self.contents[data.content].len() as u32).to_le_bytes(),
            );
            buf.extend_from_slice(&data.codepage.to_le_bytes());
            buf.extend_from_slice(&0u32.to_le_bytes());
        }

        for name in &self.names {
            buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
            for unit in name.as_slice() {
                buf.extend_from_slice(&unit.to_le_bytes());
            }
        }

        for (index, content) in self.contents.iter().enumerate() {
            let written = (buf.len() - start) as u32;
            let target = self.content_offsets[index];
            if written < target {
                buf.resize(buf.len() + (target - written) as usize, 0);
            }
            buf.extend_from_slice(content);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceData;

    fn read_u32(buf: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
    }

    fn place(buffer: &mut ResourceDirectoryBuffer, rva: u32) -> Vec<u8> {
        let mut symbols = SymbolTable::new();
        Segment::build(buffer, &mut symbols);
        buffer.update_offsets(
            LayoutParameters {
                offset: u64::from(rva),
                rva,
                image_base: 0x40_0000,
            },
            &mut symbols,
        );
        buffer.update_references(&symbols).unwrap();

        let mut buf = Vec::new();
        buffer.write(&mut buf).unwrap();
        assert_eq!(buf.len() as u32, buffer.physical_size());
        buf
    }

    #[test]
    fn test_two_level_tree_offsets() {
        let mut leaf_dir = ResourceDirectory::new();
        leaf_dir.add_data(ResourceId::Id(1), ResourceData::new(vec![0x5A; 10]));

        let mut root = ResourceDirectory::new();
        root.add_directory(ResourceId::Id(16), leaf_dir);

        let mut buffer = ResourceDirectoryBuffer::new(root);
        let base_rva = 0x4000;
        let buf = place(&mut buffer, base_rva);

        // Root table: header + one entry. Its entry points at the subdirectory with
        // bit 31 set; the subdirectory table starts right after the root's 24 bytes.
        assert_eq!(read_u32(&buf, 16), 16);
        assert_eq!(read_u32(&buf, 20), 24 | 0x8000_0000);

        // Subdirectory entry points at the data entry with bit 31 clear, at the
        // relative offset of the data-entry table (two tables of 24 bytes each).
        let data_offset = read_u32(&buf, 24 + 20);
        assert_eq!(data_offset & 0x8000_0000, 0);
        assert_eq!(data_offset, 48);

        // Data entry: absolute content RVA, size 10.
        assert_eq!(read_u32(&buf, 48), base_rva + 64);
        assert_eq!(read_u32(&buf, 52), 10);
        assert_eq!(&buf[64..74], &[0x5A; 10]);
    }

    #[test]
    fn test_level_ordering_keeps_depth_tables_contiguous() {
        // Two subdirectories under the root; each holds one data entry. Both depth-1
        // tables must precede every data entry.
        let mut first = ResourceDirectory::new();
        first.add_data(ResourceId::Id(1), ResourceData::new(vec![1]));
        let mut second = ResourceDirectory::new();
        second.add_data(ResourceId::Id(2), ResourceData::new(vec![2]));

        let mut root = ResourceDirectory::new();
        root.add_directory(ResourceId::Id(3), first);
        root.add_directory(ResourceId::Id(4), second);

        let mut buffer = ResourceDirectoryBuffer::new(root);
        let buf = place(&mut buffer, 0x7000);

        // Root: 16 + 2*8 = 32 bytes; depth-1 tables at 32 and 56.
        assert_eq!(read_u32(&buf, 20), 32 | 0x8000_0000);
        assert_eq!(read_u32(&buf, 28), 56 | 0x8000_0000);

        // Data entries follow both depth-1 tables.
        let first_data = read_u32(&buf, 32 + 20);
        let second_data = read_u32(&buf, 56 + 20);
        assert_eq!(first_data, 80);
        assert_eq!(second_data, 96);
    }

    #[test]
    fn test_named_entries_precede_id_entries() {
        let mut root = ResourceDirectory::new();
        root.add_data(ResourceId::Id(2), ResourceData::new(vec![1]));
        root.add_data(ResourceId::Name("BETA".into()), ResourceData::new(vec![2]));
        root.add_data(ResourceId::Name("ALPHA".into()), ResourceData::new(vec![3]));
        root.add_data(ResourceId::Id(1), ResourceData::new(vec![4]));

        let mut buffer = ResourceDirectoryBuffer::new(root);
        let buf = place(&mut buffer, 0x3000);

        // Header counts: 2 named, 2 ID.
        assert_eq!(u16::from_le_bytes([buf[12], buf[13]]), 2);
        assert_eq!(u16::from_le_bytes([buf[14], buf[15]]), 2);

        // Named entries first, insertion order preserved within each partition.
        let first_id = read_u32(&buf, 16);
        let second_id = read_u32(&buf, 24);
        assert_ne!(first_id & 0x8000_0000, 0);
        assert_ne!(second_id & 0x8000_0000, 0);
        assert_eq!(read_u32(&buf, 32), 2);
        assert_eq!(read_u32(&buf, 40), 1);

        // The first named entry's string is "BETA" (length-prefixed UTF-16).
        let name_offset = (first_id & 0x7FFF_FFFF) as usize;
        assert_eq!(u16::from_le_bytes([buf[name_offset], buf[name_offset + 1]]), 4);
        let b = u16::from_le_bytes([buf[name_offset + 2], buf[name_offset + 3]]);
        assert_eq!(b, u16::from(b'B'));
    }

    #[test]
    fn test_unplaced_buffer_rejects_resolution() {
        let mut root = ResourceDirectory::new();
        root.add_data(ResourceId::Id(1), ResourceData::new(vec![0]));

        let mut buffer = ResourceDirectoryBuffer::new(root);
        buffer.build();
        let symbols = SymbolTable::new();
        assert!(buffer.update_references(&symbols).is_err());
    }
}
