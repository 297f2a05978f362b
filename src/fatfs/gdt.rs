//! Global descriptor table
//!
//! One entry per open call, kernel-wide. Keys 0/1/2 are the standard
//! streams and are installed at mount. Every other key is handed out by
//! the slab and referenced from per-process FD tables; a child inherits
//! its parent's keys, so a key may be visible from several processes but
//! there is still exactly one entry per open.
//!
//! The `dirent_offset` of an entry is the file's stable identity: the
//! deferred-delete bookkeeping in unlink/close counts references by it.

use slab::Slab;

use super::layout::Perm;
use crate::errno::{Errno, Result};

/// Capacity of the descriptor table.
pub const MAX_OPEN_FILES: usize = 1024;

/// Access discipline of one descriptor. Exactly one of the three.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    Append,
}

impl OpenMode {
    /// Whether this mode may mutate the file.
    pub fn writes(&self) -> bool {
        matches!(self, OpenMode::Write | OpenMode::Append)
    }
}

/// One open-file entry.
#[derive(Debug, Clone)]
pub struct OpenFile {
    /// Cached file name (never re-read from disk while open).
    pub name: String,
    /// Cached size; grows with writes, may be raised by seek.
    pub size: u32,
    /// Cached permission bits.
    pub perm: Perm,
    /// First data block; 0 until the first write allocates one.
    pub first_block: u16,
    /// Byte offset of the directory entry; identity for deferred delete.
    pub dirent_offset: u64,
    /// Read/write cursor of this descriptor.
    pub offset: u64,
    pub mode: OpenMode,
}

impl OpenFile {
    /// Standard-stream placeholder entry (keys 0/1/2).
    pub fn standard(name: &str, mode: OpenMode) -> OpenFile {
        OpenFile {
            name: name.to_string(),
            size: 0,
            perm: Perm::empty(),
            first_block: 0,
            dirent_offset: 0,
            offset: 0,
            mode,
        }
    }
}

pub struct DescriptorTable {
    slots: Slab<OpenFile>,
}

impl DescriptorTable {
    /// Table with the three standard streams pre-installed, so the first
    /// real file always lands at key 3 or above.
    pub fn new() -> DescriptorTable {
        let mut slots = Slab::with_capacity(8);
        let k0 = slots.insert(OpenFile::standard("STDIN", OpenMode::Read));
        let k1 = slots.insert(OpenFile::standard("STDOUT", OpenMode::Write));
        let k2 = slots.insert(OpenFile::standard("STDERR", OpenMode::Write));
        debug_assert_eq!((k0, k1, k2), (0, 1, 2));
        DescriptorTable { slots }
    }

    pub fn insert(&mut self, of: OpenFile) -> Result<usize> {
        if self.slots.len() >= MAX_OPEN_FILES {
            return Err(Errno::TableFull);
        }
        Ok(self.slots.insert(of))
    }

    pub fn get(&self, key: usize) -> Option<&OpenFile> {
        self.slots.get(key)
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut OpenFile> {
        self.slots.get_mut(key)
    }

    pub fn remove(&mut self, key: usize) -> Option<OpenFile> {
        self.slots.try_remove(key)
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= MAX_OPEN_FILES
    }

    /// Single-writer rule: is some real descriptor already writing this
    /// name? Standard-stream keys never count.
    pub fn has_writer(&self, name: &str) -> bool {
        self.slots
            .iter()
            .any(|(key, of)| key >= 3 && of.name == name && of.mode.writes())
    }

    /// Does any descriptor still reference the directory entry at this
    /// offset? Used by unlink and close to drive the tombstone state.
    pub fn references(&self, dirent_offset: u64) -> bool {
        self.slots
            .iter()
            .any(|(key, of)| key >= 3 && of.dirent_offset == dirent_offset)
    }

    /// Drop every entry. Used at unmount.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_entry(name: &str, mode: OpenMode, dirent_offset: u64) -> OpenFile {
        OpenFile {
            name: name.to_string(),
            size: 0,
            perm: Perm::READ | Perm::WRITE,
            first_block: 0,
            dirent_offset,
            offset: 0,
            mode,
        }
    }

    #[test]
    fn test_standard_streams_reserved() {
        let gdt = DescriptorTable::new();
        assert_eq!(gdt.get(0).unwrap().name, "STDIN");
        assert_eq!(gdt.get(1).unwrap().name, "STDOUT");
        assert_eq!(gdt.get(2).unwrap().name, "STDERR");
    }

    #[test]
    fn test_insert_starts_after_streams() {
        let mut gdt = DescriptorTable::new();
        let key = gdt.insert(file_entry("a", OpenMode::Read, 256)).unwrap();
        assert!(key >= 3);
    }

    #[test]
    fn test_single_writer_query() {
        let mut gdt = DescriptorTable::new();
        gdt.insert(file_entry("a", OpenMode::Read, 256)).unwrap();
        assert!(!gdt.has_writer("a"));
        let w = gdt.insert(file_entry("a", OpenMode::Append, 256)).unwrap();
        assert!(gdt.has_writer("a"));
        gdt.remove(w);
        assert!(!gdt.has_writer("a"));
    }

    #[test]
    fn test_reference_counting_by_dirent_offset() {
        let mut gdt = DescriptorTable::new();
        let a = gdt.insert(file_entry("a", OpenMode::Read, 256)).unwrap();
        let b = gdt.insert(file_entry("a", OpenMode::Read, 256)).unwrap();
        assert!(gdt.references(256));
        gdt.remove(a);
        assert!(gdt.references(256));
        gdt.remove(b);
        assert!(!gdt.references(256));
    }

    #[test]
    fn test_table_full() {
        let mut gdt = DescriptorTable::new();
        for i in 0..MAX_OPEN_FILES - 3 {
            gdt.insert(file_entry("f", OpenMode::Read, i as u64)).unwrap();
        }
        assert_eq!(
            gdt.insert(file_entry("f", OpenMode::Read, 0)).unwrap_err(),
            Errno::TableFull
        );
    }
}
