//! On-disk format
//!
//! Directory entries are fixed 64-byte records, little-endian:
//! name[32], size u32, first_block u16, kind u8, perm u8, mtime i64,
//! reserved[16]. The first byte of `name` doubles as a status tag; the
//! `NameTag` enum keeps the magic values out of the call sites.

use bitflags::bitflags;

use crate::errno::{Errno, Result};

/// Block sizes selectable at format time, indexed by the config byte.
pub const BLOCK_SIZES: [usize; 5] = [256, 512, 1024, 2048, 4096];

/// Size of one directory entry on disk.
pub const DIRENT_SIZE: usize = 64;

/// Bytes of a directory-entry name, including the NUL terminator slot.
pub const NAME_LEN: usize = 32;

bitflags! {
    /// Permission bits of a directory entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Perm: u8 {
        const READ = 0b100;
        const WRITE = 0b010;
        const EXEC = 0b001;
    }
}

impl Perm {
    /// Mode string in `ls -l` style (without the leading type char).
    pub fn mode_string(&self) -> String {
        let mut s = String::with_capacity(3);
        s.push(if self.contains(Perm::READ) { 'r' } else { '-' });
        s.push(if self.contains(Perm::WRITE) { 'w' } else { '-' });
        s.push(if self.contains(Perm::EXEC) { 'x' } else { '-' });
        s
    }
}

/// Chmod operation flags carried in the upper bits of the mode word.
pub const CHMOD_ADD: u8 = 0x80;
pub const CHMOD_REMOVE: u8 = 0x40;
pub const CHMOD_ASSIGN: u8 = 0x20;
/// Low bits of the mode word: the rwx mask itself.
pub const CHMOD_MASK: u8 = 0x07;

/// What kind of object a directory entry names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
}

impl FileKind {
    pub fn from_byte(b: u8) -> Option<FileKind> {
        match b {
            1 => Some(FileKind::Regular),
            2 => Some(FileKind::Directory),
            _ => None,
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            FileKind::Regular => 1,
            FileKind::Directory => 2,
        }
    }
}

/// Classification of a directory slot by the first byte of its name.
///
/// `Tombstone` is the deferred-delete state: the file was unlinked while
/// some descriptor still had it open. The slot must not be reused and
/// must not match lookups; it becomes `Free` when the last descriptor
/// closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameTag {
    /// First byte 0: no entry was ever written here; scanning stops.
    EndOfDir,
    /// First byte 1: deleted, the slot may be reused.
    Free,
    /// First byte 2: deleted but still referenced by an open descriptor.
    Tombstone,
    /// Anything else: a live entry.
    Active,
}

impl NameTag {
    pub fn of(name0: u8) -> NameTag {
        match name0 {
            0 => NameTag::EndOfDir,
            1 => NameTag::Free,
            2 => NameTag::Tombstone,
            _ => NameTag::Active,
        }
    }
}

/// One 64-byte directory record, decoded.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: [u8; NAME_LEN],
    pub size: u32,
    pub first_block: u16,
    pub kind: u8,
    pub perm: Perm,
    pub mtime: i64,
}

impl DirEntry {
    /// Fresh regular-file entry with the default read+write permissions.
    pub fn new_regular(name: &str, mtime: i64) -> Result<DirEntry> {
        let mut entry = DirEntry {
            name: [0u8; NAME_LEN],
            size: 0,
            first_block: 0,
            kind: FileKind::Regular.as_byte(),
            perm: Perm::READ | Perm::WRITE,
            mtime,
        };
        entry.set_name(name)?;
        Ok(entry)
    }

    pub fn tag(&self) -> NameTag {
        NameTag::of(self.name[0])
    }

    /// The entry name as UTF-8, up to the first NUL. Lossy on purpose:
    /// the disk may hold anything, the shell still wants to print it.
    pub fn name_str(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// Store `name` NUL-terminated; the last byte always stays NUL.
    pub fn set_name(&mut self, name: &str) -> Result<()> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > NAME_LEN - 1 {
            return Err(Errno::NameTooLong);
        }
        self.name = [0u8; NAME_LEN];
        self.name[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn is_regular(&self) -> bool {
        self.kind == FileKind::Regular.as_byte()
    }

    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory.as_byte()
    }

    pub fn encode(&self) -> [u8; DIRENT_SIZE] {
        let mut buf = [0u8; DIRENT_SIZE];
        buf[0..32].copy_from_slice(&self.name);
        buf[32..36].copy_from_slice(&self.size.to_le_bytes());
        buf[36..38].copy_from_slice(&self.first_block.to_le_bytes());
        buf[38] = self.kind;
        buf[39] = self.perm.bits();
        buf[40..48].copy_from_slice(&self.mtime.to_le_bytes());
        // bytes 48..64 reserved, left zero
        buf
    }

    pub fn decode(buf: &[u8; DIRENT_SIZE]) -> DirEntry {
        let mut name = [0u8; NAME_LEN];
        name.copy_from_slice(&buf[0..32]);
        DirEntry {
            name,
            size: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
            first_block: u16::from_le_bytes(buf[36..38].try_into().unwrap()),
            kind: buf[38],
            perm: Perm::from_bits_truncate(buf[39]),
            mtime: i64::from_le_bytes(buf[40..48].try_into().unwrap()),
        }
    }
}

/// Apply a chmod mode word to an existing permission set.
pub fn apply_chmod(current: Perm, mode_word: u8) -> Perm {
    let mask = Perm::from_bits_truncate(mode_word & CHMOD_MASK);
    if mode_word & CHMOD_ADD != 0 {
        current | mask
    } else if mode_word & CHMOD_REMOVE != 0 {
        current - mask
    } else {
        // CHMOD_ASSIGN and bare numeric modes both assign outright
        mask
    }
}

/// Seconds since the epoch, the timestamp stored in directory entries.
pub fn now_epoch() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
