//! File operations over the FAT and the descriptor table
//!
//! `FatFs` owns a mounted `Volume` plus the global descriptor table and
//! implements the whole open/read/write/close/unlink/seek state machine,
//! including the deferred-delete rule: unlinking an open file tombstones
//! its directory entry, and the last close frees the chain.
//!
//! Cursor rules, settled after some care at block boundaries:
//! - writes follow the existing chain and only allocate at its end;
//! - a cursor sitting exactly on the boundary after the last block is an
//!   append position, anything further past the chain is an invalid
//!   offset;
//! - reads clamp to the cached size and treat a chain that ends before
//!   the cursor as EOF (seek may legally park the cursor out there).

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use log::warn;

use super::gdt::{DescriptorTable, OpenFile, OpenMode};
use super::layout::{apply_chmod, now_epoch, DirEntry, NameTag, Perm, NAME_LEN};
use super::volume::{Lookup, Volume};
use super::{FAT_EOC, FAT_FREE};
use crate::errno::{Errno, Result};

/// Stream-copy chunk size for cat/cp style operations.
pub const COPY_BUF: usize = 4096;

/// Seek origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

pub struct FatFs {
    vol: Volume,
    gdt: DescriptorTable,
}

impl FatFs {
    /// Wrap a mounted volume; installs the standard-stream descriptors.
    pub fn new(vol: Volume) -> FatFs {
        FatFs {
            vol,
            gdt: DescriptorTable::new(),
        }
    }

    pub fn volume(&self) -> &Volume {
        &self.vol
    }

    pub fn volume_mut(&mut self) -> &mut Volume {
        &mut self.vol
    }

    pub fn descriptor(&self, key: usize) -> Option<&OpenFile> {
        self.gdt.get(key)
    }

    /// Release every descriptor and flush the image. The backing file
    /// closes when the value drops.
    pub fn unmount(mut self) -> Result<()> {
        self.gdt.clear();
        self.vol.flush()
    }

    // ========== OPEN ==========

    /// Open `name` in the given mode and return its descriptor key.
    ///
    /// WRITE truncates or creates, APPEND creates or keeps, READ
    /// requires an existing readable regular file. The single-writer
    /// rule rejects a second writing descriptor for the same name.
    pub fn open(&mut self, name: &str, mode: OpenMode) -> Result<usize> {
        if name.is_empty() || name.len() > NAME_LEN - 1 {
            return Err(Errno::NameTooLong);
        }
        if self.gdt.is_full() {
            return Err(Errno::TableFull);
        }

        let (found, offset) = match self.vol.find_file(name)? {
            Lookup::Found(off) => (true, off),
            Lookup::FreeSlot(off) => (false, off),
            Lookup::Full => {
                if mode == OpenMode::Read {
                    return Err(Errno::NoSuchFile);
                }
                (false, self.vol.extend_root()?)
            }
        };

        if found && mode.writes() && self.gdt.has_writer(name) {
            return Err(Errno::FileInUse);
        }

        let of = match mode {
            OpenMode::Read => self.open_read(name, offset, found)?,
            OpenMode::Write => self.open_write(name, offset, found)?,
            OpenMode::Append => self.open_append(name, offset, found)?,
        };
        self.gdt.insert(of)
    }

    fn open_read(&mut self, name: &str, offset: u64, found: bool) -> Result<OpenFile> {
        if !found {
            return Err(Errno::NoSuchFile);
        }
        let entry = self.vol.read_dirent(offset)?;
        if !entry.is_regular() {
            return Err(Errno::IsDirectory);
        }
        if !entry.perm.contains(Perm::READ) {
            return Err(Errno::PermissionDenied);
        }
        Ok(OpenFile {
            name: name.to_string(),
            size: entry.size,
            perm: entry.perm,
            first_block: entry.first_block,
            dirent_offset: offset,
            offset: 0,
            mode: OpenMode::Read,
        })
    }

    fn open_write(&mut self, name: &str, offset: u64, found: bool) -> Result<OpenFile> {
        let entry = if !found {
            let entry = DirEntry::new_regular(name, now_epoch())?;
            self.vol.write_dirent(offset, &entry)?;
            entry
        } else {
            let mut entry = self.vol.read_dirent(offset)?;
            if !entry.is_regular() {
                return Err(Errno::IsDirectory);
            }
            if !entry.perm.contains(Perm::WRITE) {
                return Err(Errno::PermissionDenied);
            }
            if entry.size > 0 {
                // Truncate: give the chain back and persist the empty entry.
                self.vol.free_chain(entry.first_block)?;
                entry.size = 0;
                entry.first_block = 0;
                entry.mtime = now_epoch();
                self.vol.write_dirent(offset, &entry)?;
            }
            entry
        };
        Ok(OpenFile {
            name: name.to_string(),
            size: 0,
            perm: entry.perm,
            first_block: entry.first_block,
            dirent_offset: offset,
            offset: 0,
            mode: OpenMode::Write,
        })
    }

    fn open_append(&mut self, name: &str, offset: u64, found: bool) -> Result<OpenFile> {
        let entry = if !found {
            let entry = DirEntry::new_regular(name, now_epoch())?;
            self.vol.write_dirent(offset, &entry)?;
            entry
        } else {
            let entry = self.vol.read_dirent(offset)?;
            if !entry.is_regular() {
                return Err(Errno::IsDirectory);
            }
            if !entry.perm.contains(Perm::WRITE) {
                return Err(Errno::PermissionDenied);
            }
            entry
        };
        Ok(OpenFile {
            name: name.to_string(),
            size: entry.size,
            perm: entry.perm,
            first_block: entry.first_block,
            dirent_offset: offset,
            // Appending starts at the current end of the file.
            offset: entry.size as u64,
            mode: OpenMode::Append,
        })
    }

    // ========== READ / WRITE ==========

    /// Read up to `buf.len()` bytes at the descriptor's cursor.
    ///
    /// Key 0 delegates to host stdin (used by the standalone `rillfat`
    /// tool; the kernel routes its console reads elsewhere).
    pub fn read(&mut self, key: usize, buf: &mut [u8]) -> Result<usize> {
        if key == 0 {
            return Ok(std::io::stdin().read(buf)?);
        }
        let of = self.gdt.get(key).ok_or(Errno::BadFd)?;
        if of.mode != OpenMode::Read {
            return Err(Errno::PermissionDenied);
        }
        let (cursor, first_block, size) = (of.offset, of.first_block, of.size as u64);

        if buf.is_empty() || cursor >= size {
            return Ok(0);
        }
        let want = buf.len().min((size - cursor) as usize);

        let bs = self.vol.block_size() as u64;
        let mut byte_in_block = cursor % bs;
        let mut cur = first_block;
        if cur == 0 {
            // Size was raised by seek but nothing is allocated: EOF.
            return Ok(0);
        }
        for _ in 0..(cursor / bs) {
            cur = self.vol.fat_get(cur);
            if cur == FAT_EOC || cur == FAT_FREE {
                // The chain ends before the cursor; only reachable by
                // seeking past the data, so report EOF rather than fail.
                return Ok(0);
            }
        }

        let mut total = 0usize;
        while total < want {
            if cur == FAT_EOC {
                break;
            }
            let block_rem = (bs - byte_in_block) as usize;
            let n = block_rem.min(want - total);
            let off = self.vol.block_offset(cur) + byte_in_block;
            let got = self.vol.read_at(off, &mut buf[total..total + n])?;
            if got == 0 {
                break;
            }
            total += got;
            if total < want {
                cur = self.vol.fat_get(cur);
                byte_in_block = 0;
            }
        }

        self.gdt.get_mut(key).ok_or(Errno::BadFd)?.offset += total as u64;
        Ok(total)
    }

    /// Write `buf` at the descriptor's cursor, allocating blocks at the
    /// chain end as needed. On a full disk, stops and returns the short
    /// count. Keys 1/2 delegate to host stdout/stderr.
    pub fn write(&mut self, key: usize, buf: &[u8]) -> Result<usize> {
        if key == 1 {
            std::io::stdout().write_all(buf)?;
            std::io::stdout().flush().ok();
            return Ok(buf.len());
        }
        if key == 2 {
            std::io::stderr().write_all(buf)?;
            return Ok(buf.len());
        }

        let of = self.gdt.get(key).ok_or(Errno::BadFd)?;
        if !of.mode.writes() {
            return Err(Errno::PermissionDenied);
        }
        let (cursor, mut first_block, old_size) = (of.offset, of.first_block, of.size as u64);
        if buf.is_empty() {
            return Ok(0);
        }

        let bs = self.vol.block_size() as u64;
        let block_index = cursor / bs;
        let mut byte_in_block = cursor % bs;
        let mut cur = first_block;

        if cur == 0 {
            if cursor > 0 {
                // A chainless file with a nonzero cursor is a hole; the
                // format has no way to represent one.
                return Err(Errno::InvalidArgument);
            }
        } else {
            for i in 0..block_index {
                let next = self.vol.fat_get(cur);
                if next == FAT_EOC {
                    if i == block_index - 1 && byte_in_block == 0 {
                        // Cursor is exactly on the boundary after the
                        // last block: stay here, the loop below splices
                        // a fresh block on.
                        byte_in_block = bs;
                        break;
                    }
                    return Err(Errno::InvalidArgument);
                }
                if next == FAT_FREE {
                    return Err(Errno::InvalidArgument);
                }
                cur = next;
            }
        }

        let mut written = 0usize;
        while written < buf.len() {
            if cur == 0 || byte_in_block == bs {
                let next_existing = if cur == 0 { FAT_EOC } else { self.vol.fat_get(cur) };
                if cur != 0 && next_existing != FAT_EOC {
                    // Overwriting into an already-allocated block.
                    cur = next_existing;
                    byte_in_block = 0;
                } else {
                    let next = self.vol.find_free_block();
                    if next == 0 {
                        warn!("filesystem image is full, write truncated");
                        break;
                    }
                    if cur == 0 {
                        first_block = next;
                    } else {
                        self.vol.fat_set(cur, next)?;
                    }
                    self.vol.fat_set(next, FAT_EOC)?;
                    cur = next;
                    byte_in_block = 0;
                    if first_block == next {
                        // First block of the file: the directory entry
                        // must learn about it right away.
                        let slot = self.gdt.get_mut(key).ok_or(Errno::BadFd)?;
                        slot.first_block = next;
                        self.persist_metadata(key)?;
                    }
                }
            }

            let block_rem = (bs - byte_in_block) as usize;
            let n = block_rem.min(buf.len() - written);
            let off = self.vol.block_offset(cur) + byte_in_block;
            self.vol.write_at(off, &buf[written..written + n])?;
            written += n;
            byte_in_block += n as u64;
        }

        let new_cursor = cursor + written as u64;
        let slot = self.gdt.get_mut(key).ok_or(Errno::BadFd)?;
        slot.offset = new_cursor;
        if new_cursor > old_size {
            slot.size = new_cursor as u32;
            self.persist_metadata(key)?;
        }
        Ok(written)
    }

    /// Write the slot's first-block/size plus a fresh mtime back into
    /// the directory entry on disk.
    fn persist_metadata(&mut self, key: usize) -> Result<()> {
        let of = self.gdt.get(key).ok_or(Errno::BadFd)?;
        let (dirent_offset, first_block, size) = (of.dirent_offset, of.first_block, of.size);
        let mut entry = self.vol.read_dirent(dirent_offset)?;
        entry.first_block = first_block;
        entry.size = size;
        entry.mtime = now_epoch();
        self.vol.write_dirent(dirent_offset, &entry)
    }

    // ========== CLOSE / UNLINK / SEEK ==========

    /// Close a descriptor. For writing descriptors the size and mtime
    /// are written back; if the entry was tombstoned by unlink and this
    /// was the last reference, the chain is freed and the slot becomes
    /// reusable.
    pub fn close(&mut self, key: usize) -> Result<()> {
        if self.gdt.get(key).is_none() {
            return Err(Errno::BadFd);
        }
        if key <= 2 {
            self.gdt.remove(key);
            return Ok(());
        }

        // Remove first so the reference scan below does not count us.
        let of = self.gdt.remove(key).ok_or(Errno::BadFd)?;
        let mut entry = self.vol.read_dirent(of.dirent_offset)?;

        if of.mode.writes() {
            // Seek may have inflated the cached size past what the chain
            // can hold; never persist a size the blocks cannot back.
            let capacity =
                self.vol.chain_len(of.first_block) as u64 * self.vol.block_size() as u64;
            entry.size = (of.size as u64).min(capacity) as u32;
            if of.first_block == 0 {
                entry.size = 0;
            }
            entry.mtime = now_epoch();
        }

        if entry.tag() == NameTag::Tombstone && !self.gdt.references(of.dirent_offset) {
            self.vol.free_chain(entry.first_block)?;
            entry.name[0] = 1;
        }

        self.vol.write_dirent(of.dirent_offset, &entry)
    }

    /// Remove `name` from the namespace. If descriptors still reference
    /// the entry it is tombstoned instead; the data lives on until the
    /// last close.
    pub fn unlink(&mut self, name: &str) -> Result<()> {
        let offset = match self.vol.find_file(name)? {
            Lookup::Found(off) => off,
            _ => return Err(Errno::NoSuchFile),
        };
        let mut entry = self.vol.read_dirent(offset)?;
        if entry.is_directory() {
            return Err(Errno::IsDirectory);
        }

        if self.gdt.references(offset) {
            entry.name[0] = 2;
        } else {
            self.vol.free_chain(entry.first_block)?;
            entry.name[0] = 1;
        }
        self.vol.write_dirent(offset, &entry)
    }

    /// Move the cursor. A writable descriptor seeking past the cached
    /// size raises it (no allocation happens until the next write).
    pub fn seek(&mut self, key: usize, offset: i64, whence: Whence) -> Result<u64> {
        let of = self.gdt.get_mut(key).ok_or(Errno::BadFd)?;
        let new_pos = match whence {
            Whence::Set => offset,
            Whence::Cur => of.offset as i64 + offset,
            Whence::End => of.size as i64 + offset,
        };
        if new_pos < 0 {
            return Err(Errno::InvalidArgument);
        }
        let new_pos = new_pos as u64;
        if new_pos > of.size as u64 && of.mode.writes() {
            of.size = new_pos as u32;
        }
        of.offset = new_pos;
        Ok(new_pos)
    }

    // ========== METADATA ==========

    /// Apply a chmod mode word (add/remove/assign in the upper bits,
    /// rwx mask in the lower three) to the named file.
    pub fn chmod(&mut self, name: &str, mode_word: u8) -> Result<()> {
        let offset = match self.vol.find_file(name)? {
            Lookup::Found(off) => off,
            _ => return Err(Errno::NoSuchFile),
        };
        let mut entry = self.vol.read_dirent(offset)?;
        entry.perm = apply_chmod(entry.perm, mode_word);
        entry.mtime = now_epoch();
        self.vol.write_dirent(offset, &entry)
    }

    /// Rename `src` to `dst` in place: same entry slot, same chain, new
    /// name. An existing destination must be writable and is unlinked
    /// first.
    pub fn rename(&mut self, src: &str, dst: &str) -> Result<()> {
        let src_offset = match self.vol.find_file(src)? {
            Lookup::Found(off) => off,
            _ => return Err(Errno::NoSuchFile),
        };
        let mut entry = self.vol.read_dirent(src_offset)?;
        if !entry.perm.contains(Perm::READ) {
            return Err(Errno::PermissionDenied);
        }
        entry.set_name(dst)?;
        entry.mtime = now_epoch();

        if let Lookup::Found(dst_offset) = self.vol.find_file(dst)? {
            let dst_entry = self.vol.read_dirent(dst_offset)?;
            if !dst_entry.perm.contains(Perm::WRITE) {
                return Err(Errno::PermissionDenied);
            }
            self.unlink(dst)?;
        }

        self.vol.write_dirent(src_offset, &entry)
    }

    /// Does the named file exist, is it regular, and is it executable?
    pub fn check_executable(&mut self, name: &str) -> Result<()> {
        let offset = match self.vol.find_file(name)? {
            Lookup::Found(off) => off,
            _ => return Err(Errno::NoSuchFile),
        };
        let entry = self.vol.read_dirent(offset)?;
        if !entry.is_regular() {
            return Err(Errno::IsDirectory);
        }
        if !entry.perm.contains(Perm::EXEC) {
            return Err(Errno::PermissionDenied);
        }
        Ok(())
    }

    // ========== DIRECTORY LISTING ==========

    /// Visit directory entries: a single named file, or every live entry
    /// of the root when `filename` is `None`.
    pub fn scan_dir<F>(&mut self, filename: Option<&str>, mut callback: F) -> Result<()>
    where
        F: FnMut(&DirEntry),
    {
        if let Some(name) = filename {
            let offset = match self.vol.find_file(name)? {
                Lookup::Found(off) => off,
                _ => return Err(Errno::NoSuchFile),
            };
            let entry = self.vol.read_dirent(offset)?;
            callback(&entry);
            return Ok(());
        }

        let mut blk = super::ROOT_BLOCK;
        while blk != FAT_EOC {
            for i in 0..self.vol.entries_per_block() {
                let off = self.vol.block_offset(blk) + (i * super::layout::DIRENT_SIZE) as u64;
                let entry = self.vol.read_dirent(off)?;
                match entry.tag() {
                    NameTag::EndOfDir => return Ok(()),
                    NameTag::Free | NameTag::Tombstone => {}
                    NameTag::Active => callback(&entry),
                }
            }
            blk = self.vol.fat_get(blk);
        }
        Ok(())
    }

    // ========== HOST TRANSFER ==========

    /// Copy everything readable from one descriptor to another.
    pub fn copy_stream(&mut self, input: usize, output: usize) -> Result<()> {
        let mut buf = [0u8; COPY_BUF];
        loop {
            let n = self.read(input, &mut buf)?;
            if n == 0 {
                return Ok(());
            }
            let written = self.write(output, &buf[..n])?;
            if written != n {
                return Err(Errno::NoSpace);
            }
        }
    }

    /// Pull a host file into an image descriptor opened for writing.
    pub fn copy_from_host(&mut self, host_path: &Path, key: usize) -> Result<()> {
        let mut host = File::open(host_path)?;
        let mut buf = [0u8; COPY_BUF];
        loop {
            let n = host.read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            let written = self.write(key, &buf[..n])?;
            if written != n {
                return Err(Errno::NoSpace);
            }
        }
    }

    /// Push an image descriptor opened for reading out to a host file.
    pub fn copy_to_host(&mut self, key: usize, host_path: &Path) -> Result<()> {
        let mut host = File::create(host_path)?;
        let mut buf = [0u8; COPY_BUF];
        loop {
            let n = self.read(key, &mut buf)?;
            if n == 0 {
                host.flush()?;
                return Ok(());
            }
            host.write_all(&buf[..n])?;
        }
    }
}

/// `ls -l`-style line for one directory entry.
pub fn format_dirent(entry: &DirEntry) -> String {
    let block = if entry.first_block == 0 {
        "     ".to_string()
    } else {
        format!("{:5}", entry.first_block)
    };
    let kind = if entry.is_directory() { 'd' } else { '-' };
    format!(
        "{} {}{} {:10} {} {}",
        block,
        kind,
        entry.perm.mode_string(),
        entry.size,
        format_mtime(entry.mtime),
        entry.name_str()
    )
}

/// Render an epoch timestamp as `YYYY-MM-DD HH:MM:SS` (UTC).
fn format_mtime(epoch: i64) -> String {
    let secs_of_day = epoch.rem_euclid(86_400);
    let days = (epoch - secs_of_day) / 86_400;
    let (h, m, s) = (
        secs_of_day / 3600,
        (secs_of_day % 3600) / 60,
        secs_of_day % 60,
    );

    // Civil-from-days conversion (Gregorian calendar).
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { y + 1 } else { y };

    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        year, month, d, h, m, s
    )
}
