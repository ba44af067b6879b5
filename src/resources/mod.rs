//! Win32 resource directory construction.
//!
//! Resources in a PE image form a tree: interior directory nodes keyed by name or numeric
//! ID, and leaf data entries pointing at raw content. The on-disk form is flat and
//! level-ordered: all directory tables at nesting depth D are contiguous before any table at
//! depth D+1, followed by the data-entry table, the name strings and the raw contents. This
//! module provides the logical tree model and [`ResourceDirectoryBuffer`], which performs
//! that flattening.

mod buffer;

pub use buffer::ResourceDirectoryBuffer;

/// The key of one directory entry: a case-preserved UTF-16 name or a numeric ID.
///
/// The format stores named entries before ID entries within one directory table so readers
/// can binary search each partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceId {
    /// A named entry; stored as a length-prefixed UTF-16 string in the name table.
    Name(String),
    /// A numeric entry (resource type, language id, ...).
    Id(u32),
}

impl ResourceId {
    /// Whether this is a named entry.
    #[must_use]
    pub fn is_named(&self) -> bool {
        matches!(self, ResourceId::Name(_))
    }
}

/// A leaf resource: raw bytes plus the code page they were authored in.
#[derive(Debug, Clone, Default)]
pub struct ResourceData {
    codepage: u32,
    contents: Vec<u8>,
}

impl ResourceData {
    /// Creates a data leaf with code page 0.
    #[must_use]
    pub fn new(contents: Vec<u8>) -> Self {
        ResourceData {
            codepage: 0,
            contents,
        }
    }

    /// Creates a data leaf with an explicit code page.
    #[must_use]
    pub fn with_codepage(contents: Vec<u8>, codepage: u32) -> Self {
        ResourceData { codepage, contents }
    }

    /// The raw content bytes.
    #[must_use]
    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    /// The code page recorded in the data entry.
    #[must_use]
    pub fn codepage(&self) -> u32 {
        self.codepage
    }
}

/// What a directory entry points at: a nested directory or a data leaf.
#[derive(Debug, Clone)]
pub enum ResourceContent {
    /// A nested directory table one level deeper.
    Directory(ResourceDirectory),
    /// A leaf data entry.
    Data(ResourceData),
}

/// One keyed entry of a resource directory.
#[derive(Debug, Clone)]
pub struct ResourceEntry {
    id: ResourceId,
    content: ResourceContent,
}

impl ResourceEntry {
    /// Creates an entry binding `id` to `content`.
    #[must_use]
    pub fn new(id: ResourceId, content: ResourceContent) -> Self {
        ResourceEntry { id, content }
    }

    /// The entry's key.
    #[must_use]
    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    /// The entry's target.
    #[must_use]
    pub fn content(&self) -> &ResourceContent {
        &self.content
    }
}

/// An interior node of the resource tree.
#[derive(Debug, Clone, Default)]
pub struct ResourceDirectory {
    characteristics: u32,
    timestamp: u32,
    major_version: u16,
    minor_version: u16,
    entries: Vec<ResourceEntry>,
}

impl ResourceDirectory {
    /// Creates an empty directory with zeroed header fields.
    #[must_use]
    pub fn new() -> Self {
        ResourceDirectory::default()
    }

    /// Sets the directory's version fields.
    pub fn set_version(&mut self, major: u16, minor: u16) {
        self.major_version = major;
        self.minor_version = minor;
    }

    /// Appends an entry. Model order is preserved within the named/ID partitions.
    pub fn add_entry(&mut self, entry: ResourceEntry) {
        self.entries.push(entry);
    }

    /// Convenience for nesting a subdirectory under `id`.
    pub fn add_directory(&mut self, id: ResourceId, directory: ResourceDirectory) {
        self.add_entry(ResourceEntry::new(id, ResourceContent::Directory(directory)));
    }

    /// Convenience for attaching a data leaf under `id`.
    pub fn add_data(&mut self, id: ResourceId, data: ResourceData) {
        self.add_entry(ResourceEntry::new(id, ResourceContent::Data(data)));
    }

    /// The directory's entries in model order.
    #[must_use]
    pub fn entries(&self) -> &[ResourceEntry] {
        &self.entries
    }

    pub(crate) fn header_fields(&self) -> (u32, u32, u16, u16) {
        (
            self.characteristics,
            self.timestamp,
            self.major_version,
            self.minor_version,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_construction() {
        let mut icons = ResourceDirectory::new();
        icons.add_data(ResourceId::Id(1033), ResourceData::new(vec![0xAB; 4]));

        let mut root = ResourceDirectory::new();
        root.add_directory(ResourceId::Id(3), icons);
        root.add_data(ResourceId::Name("MANIFEST".into()), ResourceData::new(vec![1]));

        assert_eq!(root.entries().len(), 2);
        assert!(!root.entries()[0].id().is_named());
        assert!(root.entries()[1].id().is_named());
    }
}
