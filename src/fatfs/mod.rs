//! The FAT-style filesystem
//!
//! A whole filesystem lives inside one host file. The image starts with
//! the FAT: a dense array of little-endian u16 entries, one per data
//! block. Entry 0 encodes the geometry, entry values chain blocks into
//! files, and block 1 is always the first block of the flat root
//! directory. The data region follows the FAT.
//!
//! Three layers:
//! - `layout`: the byte-level format (directory entries, permission bits)
//! - `volume`: the backing file, the in-memory FAT, and the root scan
//! - `gdt` + `ops`: open-file bookkeeping and the read/write/unlink
//!   state machine with its deferred-delete rule

pub mod gdt;
pub mod layout;
pub mod ops;
pub mod volume;

pub use gdt::{DescriptorTable, OpenFile, OpenMode, MAX_OPEN_FILES};
pub use layout::{DirEntry, FileKind, NameTag, Perm, BLOCK_SIZES, DIRENT_SIZE};
pub use ops::{FatFs, Whence};
pub use volume::{mkfs, Volume};

/// FAT entry value marking a free block.
pub const FAT_FREE: u16 = 0x0000;
/// FAT entry value marking the last block of a chain.
pub const FAT_EOC: u16 = 0xFFFF;
/// Block number of the root directory's first block.
pub const ROOT_BLOCK: u16 = 1;
