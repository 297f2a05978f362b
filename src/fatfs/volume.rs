//! Backing file and FAT core
//!
//! A `Volume` is an open image file plus a cached copy of its FAT. FAT
//! mutations go through `fat_set`, which writes the entry back to the
//! image immediately, so the cache and the disk never diverge.
//!
//! Geometry, all derived from FAT entry 0 at mount:
//! - FAT region: `fat_blocks * block_size` bytes at offset 0
//! - data region: `num_entries - 1` blocks, block i (i >= 1) at byte
//!   offset `fat_size + (i - 1) * block_size`

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, info};

use super::layout::{DirEntry, NameTag, BLOCK_SIZES, DIRENT_SIZE};
use super::{FAT_EOC, FAT_FREE, ROOT_BLOCK};
use crate::errno::{Errno, Result};

/// Outcome of a root-directory lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// A live entry with the given name exists at this byte offset.
    Found(u64),
    /// Not found; this is the first reusable slot (free or end-of-dir).
    FreeSlot(u64),
    /// Not found and every root block is fully occupied.
    Full,
}

pub struct Volume {
    file: File,
    fat: Vec<u16>,
    block_size: usize,
    fat_blocks: usize,
    fat_size: u64,
    num_entries: usize,
    entries_per_block: usize,
}

/// Create and initialize a fresh filesystem image.
///
/// The FAT occupies `fat_blocks` blocks of the size selected by
/// `size_index`; entry 0 stores that configuration, entry 1 becomes the
/// root directory's single (terminal) block, and everything else is
/// free. The data region is zero-filled.
pub fn mkfs(path: &Path, fat_blocks: usize, size_index: usize) -> Result<()> {
    if !(1..=32).contains(&fat_blocks) || size_index >= BLOCK_SIZES.len() {
        return Err(Errno::InvalidArgument);
    }

    let block_size = BLOCK_SIZES[size_index];
    let fat_size = (block_size * fat_blocks) as u64;
    let mut num_entries = fat_size as usize / 2;
    if num_entries == 65536 {
        // Block numbers are u16 and 0xFFFF is the chain terminator.
        num_entries = 65535;
    }
    let total = fat_size + ((num_entries - 1) * block_size) as u64;

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    // Extending the file zero-fills the data region.
    file.set_len(total)?;

    let mut fat = vec![0u8; fat_size as usize];
    let config = ((fat_blocks as u16) << 8) | size_index as u16;
    fat[0..2].copy_from_slice(&config.to_le_bytes());
    fat[2..4].copy_from_slice(&FAT_EOC.to_le_bytes());
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&fat)?;
    file.flush()?;

    info!(
        "formatted {} ({} FAT blocks, {} byte blocks, {} bytes total)",
        path.display(),
        fat_blocks,
        block_size,
        total
    );
    Ok(())
}

impl Volume {
    /// Open an image and load its FAT. Validates the configuration entry
    /// before trusting anything else in the file.
    pub fn mount(path: &Path) -> Result<Volume> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header = [0u8; 2];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header).map_err(|_| Errno::Io)?;
        let config = u16::from_le_bytes(header);
        let fat_blocks = (config >> 8) as usize;
        let size_index = (config & 0xFF) as usize;
        if !(1..=32).contains(&fat_blocks) || size_index >= BLOCK_SIZES.len() {
            return Err(Errno::InvalidArgument);
        }

        let block_size = BLOCK_SIZES[size_index];
        let fat_size = (block_size * fat_blocks) as u64;
        let mut num_entries = fat_size as usize / 2;
        if num_entries == 65536 {
            num_entries = 65535;
        }

        let mut raw = vec![0u8; num_entries * 2];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut raw).map_err(|_| Errno::Io)?;
        let fat: Vec<u16> = raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();

        info!(
            "mounted {} ({} entries, {} byte blocks)",
            path.display(),
            num_entries,
            block_size
        );
        Ok(Volume {
            file,
            fat,
            block_size,
            fat_blocks,
            fat_size,
            num_entries,
            entries_per_block: block_size / DIRENT_SIZE,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn fat_blocks(&self) -> usize {
        self.fat_blocks
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    pub fn entries_per_block(&self) -> usize {
        self.entries_per_block
    }

    /// Byte offset of data block `blk` within the image.
    pub fn block_offset(&self, blk: u16) -> u64 {
        self.fat_size + (blk as u64 - 1) * self.block_size as u64
    }

    pub fn fat_get(&self, blk: u16) -> u16 {
        self.fat[blk as usize]
    }

    /// Update a FAT entry in memory and write it through to the image.
    pub fn fat_set(&mut self, blk: u16, value: u16) -> Result<()> {
        self.fat[blk as usize] = value;
        self.write_at(blk as u64 * 2, &value.to_le_bytes())
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(self.file.read(buf)?)
    }

    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    pub fn read_dirent(&mut self, offset: u64) -> Result<DirEntry> {
        let mut buf = [0u8; DIRENT_SIZE];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf).map_err(|_| Errno::Io)?;
        Ok(DirEntry::decode(&buf))
    }

    pub fn write_dirent(&mut self, offset: u64, entry: &DirEntry) -> Result<()> {
        self.write_at(offset, &entry.encode())
    }

    /// First free data block, scanning from block 1. Returns 0 if the
    /// disk is full (block 0 is never a valid data block).
    pub fn find_free_block(&self) -> u16 {
        for i in 1..self.num_entries {
            if self.fat[i] == FAT_FREE {
                return i as u16;
            }
        }
        0
    }

    /// Free a whole chain starting at `first`. A zero first block means
    /// the file never had data; nothing to do.
    pub fn free_chain(&mut self, first: u16) -> Result<()> {
        let mut blk = first;
        while blk != 0 && blk != FAT_EOC {
            let next = self.fat_get(blk);
            self.fat_set(blk, FAT_FREE)?;
            blk = next;
        }
        Ok(())
    }

    /// Walk the root directory looking for a live entry named `name`.
    ///
    /// Slots are classified by their name tag: end-of-directory stops the
    /// scan, free slots are remembered as creation candidates, tombstones
    /// are skipped without matching.
    pub fn find_file(&mut self, name: &str) -> Result<Lookup> {
        let mut first_free: Option<u64> = None;
        let mut blk = ROOT_BLOCK;

        while blk != FAT_EOC {
            for i in 0..self.entries_per_block {
                let off = self.block_offset(blk) + (i * DIRENT_SIZE) as u64;
                let entry = self.read_dirent(off)?;
                match entry.tag() {
                    NameTag::EndOfDir => {
                        return Ok(Lookup::FreeSlot(first_free.unwrap_or(off)));
                    }
                    NameTag::Free => {
                        if first_free.is_none() {
                            first_free = Some(off);
                        }
                    }
                    NameTag::Tombstone => {}
                    NameTag::Active => {
                        if entry.name_str() == name {
                            return Ok(Lookup::Found(off));
                        }
                    }
                }
            }
            blk = self.fat_get(blk);
        }

        // Every root block scanned without hitting end-of-directory.
        match first_free {
            Some(off) => Ok(Lookup::FreeSlot(off)),
            None => Ok(Lookup::Full),
        }
    }

    /// Append a freshly-zeroed block to the root directory chain and
    /// return the byte offset of its first entry slot.
    pub fn extend_root(&mut self) -> Result<u64> {
        let mut last = ROOT_BLOCK;
        while self.fat_get(last) != FAT_EOC {
            last = self.fat_get(last);
        }

        let new_blk = self.find_free_block();
        if new_blk == 0 {
            return Err(Errno::NoSpace);
        }
        self.fat_set(last, new_blk)?;
        self.fat_set(new_blk, FAT_EOC)?;

        let off = self.block_offset(new_blk);
        let zeros = vec![0u8; self.block_size];
        self.write_at(off, &zeros)?;
        debug!("root directory extended with block {}", new_blk);
        Ok(off)
    }

    /// Number of blocks in the chain starting at `first`.
    pub fn chain_len(&self, first: u16) -> usize {
        let mut blk = first;
        let mut n = 0;
        while blk != 0 && blk != FAT_EOC {
            n += 1;
            blk = self.fat_get(blk);
        }
        n
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn temp_image(tag: &str) -> std::path::PathBuf {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "rill-test-{}-{}-{}.img",
        tag,
        std::process::id(),
        n
    ))
}
