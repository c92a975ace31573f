//! Ties the allocator, the MFT, the directory engine, and the metadata
//! engine together into a single filesystem over one backing image.
//!
//! [`Filesystem`] holds the long-lived state (the registered MFTs, a
//! per-directory name-cache table, the metadata cache); the device is a
//! plain field, borrowed for just the duration of each call. Every method
//! that touches both the MFT and the bitmap acquires them in that order —
//! `MFTLck` then `BMLck` — which in this single-threaded API is simply the
//! order the helper functions below take their borrows in. A caller that
//! needs this filesystem from more than one thread wraps the whole
//! `Filesystem` in a `Mutex`; there is no finer-grained internal locking.

use std::collections::HashMap;

use rand::RngCore;

use crate::alloc::Allocator;
use crate::bitmap::BitmapRegion;
use crate::device::{BlockDevice, Section};
use crate::dir::{Directory, DirValue, SegmentedFile};
use crate::error::Error;
use crate::extent::{self, GrowOutcome};
use crate::metadata::{AccessControlVector, MetadataCache, Sid, SlotFile, TimeKind, Timestamp, ENTRY_SIZE};
use crate::mft::{FileType, MftTable, Mmft};
use crate::superblock::{Superblock, SUPERBLOCK_SIZE};

/// Reference count stamped on the root directory at `mkfs` time so it can
/// never reach zero through ordinary `unlink` traffic.
const ROOT_REF_COUNT: u32 = u32::MAX;

/// Identifies a file by the MFT table and slot of its head entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileId {
    pub table: u32,
    pub slot: u32,
}

/// Parameters for building a fresh image. `sbo` is almost always 0; a
/// nonzero value is supported for images that reserve a boot area.
pub struct FormatOptions {
    pub sbo: u64,
    pub block_size: u32,
    pub mft_blocks: u32,
    pub dir_seg_size: u32,
}

/// A mounted filesystem: a backing device plus everything needed to resolve
/// files and directories against it.
pub struct Filesystem<D> {
    device: D,
    sb: Superblock,
    mmft: Mmft,
    root: FileId,
    dirs: HashMap<FileId, Directory>,
    metadata: MetadataCache,
}

fn allocator<D: BlockDevice>(device: &mut D, sb: &Superblock) -> Allocator<'_, D> {
    let bs = sb.block_size as u64;
    let section = Section::new(device, sb.offset(sb.bitmap_block), sb.bitmap_blocks * bs);
    Allocator::new(BitmapRegion::new(section), sb.block_count)
}

/// Extends the chain headed at `head_slot` by `extra_blocks`, chaining new
/// MFT segments as needed. Operates purely on block counts; callers update
/// `file_size` themselves.
fn grow_blocks<D: BlockDevice>(
    device: &mut D,
    sb: &Superblock,
    table: &mut MftTable,
    head_slot: u32,
    extra_blocks: u64,
) -> Result<(), Error> {
    if extra_blocks == 0 {
        return Ok(());
    }
    let chain = table.build_chain(device, head_slot)?;
    let mut tail_slot = *chain.slots.last().expect("a chain always contains at least its head");
    let mut residual = extra_blocks;
    loop {
        let mut tail_entry = table.read(device, tail_slot)?;
        let (jobs, freed, outcome) = {
            let mut alloc = allocator(device, sb);
            extent::plan_grow(&mut alloc, &mut tail_entry, residual)?
        };
        table.write(device, &tail_entry)?;
        extent::run_jobs(device, sb.block_size, jobs)?;
        if let Some((fb, fe)) = freed {
            let mut alloc = allocator(device, sb);
            alloc.free_range(fb, fe)?;
        }
        match outcome {
            GrowOutcome::Done => break,
            GrowOutcome::MoreNeeded { residual_blocks } => {
                let mut new_seg = table.allocate(device)?;
                new_seg.first_idx = head_slot;
                table.write(device, &new_seg)?;
                tail_entry.next_idx = new_seg.slot_idx;
                table.write(device, &tail_entry)?;
                log::debug!("grow: chained segment {} onto head {}", new_seg.slot_idx, head_slot);
                tail_slot = new_seg.slot_idx;
                residual = residual_blocks;
            }
        }
    }
    table.reset_chain(head_slot);
    Ok(())
}

/// Walks the chain back to front, freeing whole segments beyond
/// `new_size`'s block count and trimming the one segment that straddles it.
fn shrink_chain<D: BlockDevice>(
    device: &mut D,
    sb: &Superblock,
    table: &mut MftTable,
    head_slot: u32,
    new_size: u64,
) -> Result<(), Error> {
    let needed_blocks = extent::blocks_needed(sb.block_size, new_size as i64);
    let chain = table.build_chain(device, head_slot)?;
    for i in (0..chain.slots.len()).rev() {
        let seg_slot = chain.slots[i];
        let seg_offset = chain.offsets[i];
        let mut entry = table.read(device, seg_slot)?;
        if seg_offset >= needed_blocks {
            if entry.end_blk > entry.begin_blk {
                let mut alloc = allocator(device, sb);
                alloc.free_range(entry.begin_blk, entry.end_blk)?;
            }
            if seg_slot == head_slot {
                entry.begin_blk = 0;
                entry.end_blk = 0;
                entry.next_idx = 0;
                table.write(device, &entry)?;
            } else {
                let prev_slot = chain.slots[i - 1];
                let mut prev = table.read(device, prev_slot)?;
                prev.next_idx = 0;
                table.write(device, &prev)?;
                table.free_slot(device, seg_slot)?;
            }
        } else {
            let local_needed = needed_blocks - seg_offset;
            let new_end = entry.begin_blk + local_needed;
            if new_end < entry.end_blk {
                let mut alloc = allocator(device, sb);
                alloc.free_range(new_end, entry.end_blk)?;
                entry.end_blk = new_end;
                table.write(device, &entry)?;
            }
            break;
        }
    }
    table.reset_chain(head_slot);
    Ok(())
}

fn resize_chain<D: BlockDevice>(
    device: &mut D,
    sb: &Superblock,
    table: &mut MftTable,
    id: FileId,
    new_size: u64,
) -> Result<(), Error> {
    let head = table.read(device, id.slot)?;
    if !head.is_head() {
        return Err(Error::InvalidFile);
    }
    let old_size = head.file_size.max(0) as u64;
    if new_size > old_size {
        let chain = table.build_chain(device, id.slot)?;
        let need = extent::blocks_needed(sb.block_size, new_size as i64);
        if need > chain.total_blocks {
            grow_blocks(device, sb, table, id.slot, need - chain.total_blocks)?;
        }
    } else if new_size < old_size {
        shrink_chain(device, sb, table, id.slot, new_size)?;
    } else {
        return Ok(());
    }
    let mut head = table.read(device, id.slot)?;
    head.file_size = new_size as i64;
    table.write(device, &head)?;
    table.reset_chain(id.slot);
    Ok(())
}

fn read_chain<D: BlockDevice>(
    device: &mut D,
    sb: &Superblock,
    table: &mut MftTable,
    id: FileId,
    pos: u64,
    buf: &mut [u8],
) -> Result<usize, Error> {
    let head = table.read(device, id.slot)?;
    let chain = table.build_chain(device, id.slot)?;
    let ranges = extent::translate(sb.block_size, &head, &chain, pos, buf.len() as u64);
    let mut written = 0usize;
    for r in ranges {
        let n = r.length as usize;
        device.read_at(r.offset, &mut buf[written..written + n])?;
        written += n;
    }
    Ok(written)
}

fn write_chain<D: BlockDevice>(
    device: &mut D,
    sb: &Superblock,
    table: &mut MftTable,
    id: FileId,
    pos: u64,
    data: &[u8],
) -> Result<usize, Error> {
    let head = table.read(device, id.slot)?;
    let chain = table.build_chain(device, id.slot)?;
    let ranges = extent::translate(sb.block_size, &head, &chain, pos, data.len() as u64);
    let mut written = 0usize;
    for r in ranges {
        let n = r.length as usize;
        device.write_at(r.offset, &data[written..written + n])?;
        written += n;
    }
    Ok(written)
}

/// Frees every segment's extent and returns every slot in the chain to the
/// free-slot state. The file ceases to exist once this returns.
fn free_chain<D: BlockDevice>(device: &mut D, sb: &Superblock, table: &mut MftTable, head_slot: u32) -> Result<(), Error> {
    let chain = table.build_chain(device, head_slot)?;
    for &slot in &chain.slots {
        let entry = table.read(device, slot)?;
        if entry.end_blk > entry.begin_blk {
            let mut alloc = allocator(device, sb);
            alloc.free_range(entry.begin_blk, entry.end_blk)?;
        }
        table.free_slot(device, slot)?;
    }
    table.reset_chain(head_slot);
    log::debug!("free_chain: released {} segment(s) headed at slot {}", chain.slots.len(), head_slot);
    Ok(())
}

/// A live view of one file's bytes, composing the extent engine with the
/// MFT and allocator. Implements [`SegmentedFile`] for directory bodies and
/// [`SlotFile`] for metadata-file bodies, so neither engine needs to know
/// about blocks or chains.
struct FileView<'a, D> {
    device: &'a mut D,
    sb: &'a Superblock,
    table: &'a mut MftTable,
    id: FileId,
    len: u64,
}

impl<'a, D: BlockDevice> FileView<'a, D> {
    fn new(device: &'a mut D, sb: &'a Superblock, table: &'a mut MftTable, id: FileId) -> Result<Self, Error> {
        let head = table.read(device, id.slot)?;
        if !head.is_head() {
            return Err(Error::InvalidFile);
        }
        Ok(Self { device, sb, table, id, len: head.file_size.max(0) as u64 })
    }
}

impl<'a, D: BlockDevice> SegmentedFile for FileView<'a, D> {
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<(), Error> {
        let n = read_chain(self.device, self.sb, self.table, self.id, pos, buf)?;
        if n < buf.len() {
            return Err(Error::EndOfRange { requested: pos + buf.len() as u64, length: pos + n as u64 });
        }
        Ok(())
    }

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<(), Error> {
        let need_end = pos + buf.len() as u64;
        if need_end > self.len {
            grow_blocks_to(self.device, self.sb, self.table, self.id, need_end)?;
            self.len = need_end;
        }
        let n = write_chain(self.device, self.sb, self.table, self.id, pos, buf)?;
        debug_assert_eq!(n, buf.len());
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn grow_to(&mut self, new_len: u64) -> Result<(), Error> {
        if new_len > self.len {
            grow_blocks_to(self.device, self.sb, self.table, self.id, new_len)?;
            self.len = new_len;
        }
        Ok(())
    }
}

/// `grow_blocks` plus the `file_size` bookkeeping `FileView` needs on every
/// write-past-the-end or explicit grow.
fn grow_blocks_to<D: BlockDevice>(
    device: &mut D,
    sb: &Superblock,
    table: &mut MftTable,
    id: FileId,
    new_size: u64,
) -> Result<(), Error> {
    let chain = table.build_chain(device, id.slot)?;
    let need = extent::blocks_needed(sb.block_size, new_size as i64);
    if need > chain.total_blocks {
        grow_blocks(device, sb, table, id.slot, need - chain.total_blocks)?;
    }
    let mut head = table.read(device, id.slot)?;
    head.file_size = new_size as i64;
    table.write(device, &head)?;
    table.reset_chain(id.slot);
    Ok(())
}

impl<'a, D: BlockDevice> SlotFile for FileView<'a, D> {
    fn read_slot(&mut self, index: u64, buf: &mut [u8; ENTRY_SIZE]) -> Result<(), Error> {
        SegmentedFile::read_at(self, index * ENTRY_SIZE as u64, buf)
    }

    fn write_slot(&mut self, index: u64, buf: &[u8; ENTRY_SIZE]) -> Result<(), Error> {
        SegmentedFile::write_at(self, index * ENTRY_SIZE as u64, buf)
    }

    fn slot_count(&self) -> u64 {
        SegmentedFile::len(self) / ENTRY_SIZE as u64
    }

    fn append_slot(&mut self) -> Result<u64, Error> {
        let idx = SegmentedFile::len(self) / ENTRY_SIZE as u64;
        SegmentedFile::grow_to(self, (idx + 1) * ENTRY_SIZE as u64)?;
        Ok(idx)
    }
}

/// Builds a fresh image: a zeroed bitmap, a zero-initialized MFT, a pinned
/// root directory, and a superblock tying it all together.
///
/// Layout: superblock at `opts.sbo`, bitmap immediately after it (rounded up
/// to a block boundary), the MFT immediately after the bitmap, then data.
/// The whole reserved prefix is marked allocated in the bitmap before
/// anything else can claim it.
pub fn mkfs<D: BlockDevice>(mut device: D, opts: FormatOptions) -> Result<Filesystem<D>, Error> {
    let bs = opts.block_size as u64;
    let block_count = device.len() / bs;
    let bitmap_block = (opts.sbo + SUPERBLOCK_SIZE as u64 + bs - 1) / bs;
    let bitmap_bytes = (block_count + 7) / 8;
    let bitmap_blocks = ((bitmap_bytes + bs - 1) / bs).max(1);
    let first_mft_block = bitmap_block + bitmap_blocks;
    let reserved_blocks = first_mft_block + opts.mft_blocks as u64;

    log::info!(
        "mkfs: {} blocks of {} bytes; bitmap at block {} ({} blocks); mft at block {} ({} blocks)",
        block_count, bs, bitmap_block, bitmap_blocks, first_mft_block, opts.mft_blocks
    );

    {
        let mut section = Section::new(&mut device, bitmap_block * bs, bitmap_blocks * bs);
        let zero = vec![0u8; bs as usize];
        for b in 0..bitmap_blocks {
            section.write_at(b * bs, &zero)?;
        }
    }

    let table_id = rand::thread_rng().next_u32().max(1);
    let mut table = MftTable::format(&mut device, first_mft_block * bs, opts.block_size, opts.mft_blocks, table_id)?;

    let sb_draft = Superblock::new(opts.block_size, 0, block_count, bitmap_block, bitmap_blocks, first_mft_block, opts.dir_seg_size);
    {
        let mut alloc = allocator(&mut device, &sb_draft);
        let got = alloc.alloc_append(0, reserved_blocks)?;
        if got < reserved_blocks {
            return Err(Error::NoSpace { requested: reserved_blocks });
        }
    }

    let mut root = table.allocate(&mut device)?;
    root.file_type = FileType::Dir as u8;
    root.ref_count = ROOT_REF_COUNT;
    table.write(&mut device, &root)?;
    let root_id = FileId { table: table_id, slot: root.slot_idx };

    let sb = Superblock::new(
        opts.block_size,
        rand::thread_rng().next_u64(),
        block_count,
        bitmap_block,
        bitmap_blocks,
        first_mft_block,
        opts.dir_seg_size,
    );
    device.write_at(opts.sbo, &sb.to_bytes())?;
    device.sync()?;

    log::info!("mkfs: wrote superblock at offset {}; root directory at ({}, {})", opts.sbo, table_id, root.slot_idx);

    let mut mmft = Mmft::new();
    mmft.insert(table);
    Ok(Filesystem { device, sb, mmft, root: root_id, dirs: HashMap::new(), metadata: MetadataCache::new() })
}

impl<D: BlockDevice> Filesystem<D> {
    /// Loads an existing image: validates the superblock (magic and CRC)
    /// then the MFT header. The root directory is always slot 1 of the
    /// registered table — the first slot `mkfs`'s bootstrap allocates.
    pub fn load(mut device: D, sbo: u64) -> Result<Self, Error> {
        let mut buf = [0u8; SUPERBLOCK_SIZE];
        device.read_at(sbo, &mut buf)?;
        let sb = Superblock::from_bytes(&buf)?;
        let table = MftTable::load(&mut device, sb.offset(sb.first_mft_block), sb.block_size)?;
        let table_id = table.table_id;
        let mut mmft = Mmft::new();
        mmft.insert(table);
        let root = FileId { table: table_id, slot: 1 };
        log::info!("load: {} blocks, root at ({}, {})", sb.block_count, root.table, root.slot);
        Ok(Self { device, sb, mmft, root, dirs: HashMap::new(), metadata: MetadataCache::new() })
    }

    pub fn root_dir(&self) -> FileId {
        self.root
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    /// Scans the bitmap and reports the number of free blocks, for
    /// reporting tools; not used on any hot path.
    pub fn free_blocks(&mut self) -> Result<u64, Error> {
        allocator(&mut self.device, &self.sb).count_free()
    }

    /// Flushes every resident metadata-file instance back to its own slot
    /// file and drains the cache. The normal path to disk is eviction (see
    /// `admit_metadata`), but a workload that never pushes the metadata
    /// cache past its capacity never evicts anything — closing (or
    /// syncing) the filesystem must still persist their dirty timestamps,
    /// the same as an eviction would.
    pub fn flush_metadata(&mut self) -> Result<(), Error> {
        for (key, mut entry) in self.metadata.drain() {
            let table = self.mmft.get_mut(key.0).ok_or(Error::InvalidFile)?;
            let mut view = FileView::new(&mut self.device, &self.sb, table, FileId { table: key.0, slot: key.1 })?;
            entry.serialize_time(&mut view)?;
        }
        Ok(())
    }

    /// Drains the metadata cache and syncs the device. Any code path that
    /// relies on `set_time`/`put_acl` surviving a reload must go through
    /// this (or [`Filesystem::close`]) first — the metadata LRU only
    /// flushes a dirty instance on eviction otherwise.
    pub fn sync(&mut self) -> Result<(), Error> {
        self.flush_metadata()?;
        self.device.sync()
    }

    /// Flushes metadata, syncs the device, and hands it back. The
    /// filesystem-closing counterpart to [`Filesystem::sync`] — draining
    /// the metadata LRU on close rather than leaving it to the caller.
    pub fn close(mut self) -> Result<D, Error> {
        self.sync()?;
        Ok(self.device)
    }

    /// Unwraps the filesystem back down to its backing device without
    /// flushing the metadata cache. Prefer [`Filesystem::close`] unless the
    /// caller has already synced (or never touched any metadata).
    pub fn into_device(self) -> D {
        self.device
    }

    /// Reads a file's head MFT entry's `file_type` and `file_size`, the two
    /// fields callers outside this module need without reaching into `mft`.
    pub fn stat(&mut self, id: FileId) -> Result<(Option<FileType>, u64), Error> {
        let table = self.mmft.get_mut(id.table).ok_or(Error::InvalidFile)?;
        let entry = table.read(&mut self.device, id.slot)?;
        if !entry.is_head() {
            return Err(Error::InvalidFile);
        }
        Ok((FileType::from_u8(entry.file_type), entry.file_size.max(0) as u64))
    }

    /// Allocates a fresh MFT entry for a new, unlinked file. The caller
    /// links it into a directory separately (see [`Filesystem::link`]);
    /// until then nothing references it and it has reference count 0.
    pub fn create_file(&mut self, file_type: FileType) -> Result<FileId, Error> {
        let (table_id, mut entry) = self.mmft.create_entry(&mut self.device)?;
        entry.file_type = file_type as u8;
        let table = self.mmft.get_mut(table_id).ok_or(Error::InvalidFile)?;
        table.write(&mut self.device, &entry)?;
        log::debug!("create_file: ({}, {}) as {:?}", table_id, entry.slot_idx, file_type);
        Ok(FileId { table: table_id, slot: entry.slot_idx })
    }

    /// Convenience wrapper: creates a file of `file_type` and immediately
    /// links it into `parent` under `name`.
    pub fn create(&mut self, parent: FileId, name: &str, file_type: FileType) -> Result<FileId, Error> {
        let id = self.create_file(file_type)?;
        self.link(parent, name, id)?;
        Ok(id)
    }

    pub fn read_at(&mut self, id: FileId, pos: u64, buf: &mut [u8]) -> Result<usize, Error> {
        let table = self.mmft.get_mut(id.table).ok_or(Error::InvalidFile)?;
        read_chain(&mut self.device, &self.sb, table, id, pos, buf)
    }

    /// Writes within the file's current `file_size`; bytes past it are
    /// silently dropped. Call [`Filesystem::grow`] or [`Filesystem::resize`]
    /// first to make room.
    pub fn write_at(&mut self, id: FileId, pos: u64, data: &[u8]) -> Result<usize, Error> {
        let table = self.mmft.get_mut(id.table).ok_or(Error::InvalidFile)?;
        write_chain(&mut self.device, &self.sb, table, id, pos, data)
    }

    /// Grows a file to at least `new_size` bytes; a no-op if it is already
    /// that large or larger.
    pub fn grow(&mut self, id: FileId, new_size: u64) -> Result<(), Error> {
        let table = self.mmft.get_mut(id.table).ok_or(Error::InvalidFile)?;
        let head = table.read(&mut self.device, id.slot)?;
        if new_size <= head.file_size.max(0) as u64 {
            return Ok(());
        }
        resize_chain(&mut self.device, &self.sb, table, id, new_size)
    }

    /// Grows or shrinks a file to exactly `new_size` bytes.
    pub fn resize(&mut self, id: FileId, new_size: u64) -> Result<(), Error> {
        let table = self.mmft.get_mut(id.table).ok_or(Error::InvalidFile)?;
        resize_chain(&mut self.device, &self.sb, table, id, new_size)
    }

    pub fn dir_search(&mut self, dir: FileId, name: &str) -> Result<DirValue, Error> {
        let seg_size = self.sb.dir_seg_size;
        let directory = self.dirs.entry(dir).or_insert_with(|| Directory::new(seg_size));
        let table = self.mmft.get_mut(dir.table).ok_or(Error::InvalidFile)?;
        let mut view = FileView::new(&mut self.device, &self.sb, table, dir)?;
        directory.search(&mut view, name)
    }

    pub fn dir_is_empty(&mut self, dir: FileId) -> Result<bool, Error> {
        let seg_size = self.sb.dir_seg_size;
        let directory = self.dirs.entry(dir).or_insert_with(|| Directory::new(seg_size));
        let table = self.mmft.get_mut(dir.table).ok_or(Error::InvalidFile)?;
        let mut view = FileView::new(&mut self.device, &self.sb, table, dir)?;
        directory.is_empty(&mut view)
    }

    pub fn dir_list(&mut self, dir: FileId, mut visit: impl FnMut(&str, DirValue) -> bool) -> Result<(), Error> {
        let seg_size = self.sb.dir_seg_size;
        let directory = self.dirs.entry(dir).or_insert_with(|| Directory::new(seg_size));
        let table = self.mmft.get_mut(dir.table).ok_or(Error::InvalidFile)?;
        let mut view = FileView::new(&mut self.device, &self.sb, table, dir)?;
        directory.list_up(&mut view, &mut visit)
    }

    /// Adds a directory entry for `target` under `name` and bumps its
    /// reference count. `target` must be a live head entry.
    pub fn link(&mut self, dir: FileId, name: &str, target: FileId) -> Result<(), Error> {
        let value = {
            let table = self.mmft.get_mut(target.table).ok_or(Error::InvalidFile)?;
            let entry = table.read(&mut self.device, target.slot)?;
            if !entry.is_head() {
                return Err(Error::InvalidFile);
            }
            DirValue { file_table: target.table, file_slot: target.slot, cookie: entry.cookie, file_type: entry.file_type }
        };
        {
            let seg_size = self.sb.dir_seg_size;
            let directory = self.dirs.entry(dir).or_insert_with(|| Directory::new(seg_size));
            let table = self.mmft.get_mut(dir.table).ok_or(Error::InvalidFile)?;
            let mut view = FileView::new(&mut self.device, &self.sb, table, dir)?;
            directory.add(&mut view, name, value)?;
        }
        let table = self.mmft.get_mut(target.table).ok_or(Error::InvalidFile)?;
        let mut entry = table.read(&mut self.device, target.slot)?;
        entry.ref_count += 1;
        table.write(&mut self.device, &entry)?;
        log::debug!("link: {:?} + {:?} -> ({}, {}), refcount now {}", dir, name, target.table, target.slot, entry.ref_count);
        Ok(())
    }

    /// Removes `name` from `dir`, decrements the target's reference count,
    /// and frees the target's chain if it drops to zero. A name whose entry
    /// points at a slot that no longer holds the same cookie (already freed
    /// and possibly reused) is removed from the directory without touching
    /// any live file's refcount.
    pub fn unlink(&mut self, dir: FileId, name: &str) -> Result<(), Error> {
        let removed = {
            let seg_size = self.sb.dir_seg_size;
            let directory = self.dirs.entry(dir).or_insert_with(|| Directory::new(seg_size));
            let table = self.mmft.get_mut(dir.table).ok_or(Error::InvalidFile)?;
            let mut view = FileView::new(&mut self.device, &self.sb, table, dir)?;
            directory.delete(&mut view, name)?
        };
        let target = FileId { table: removed.file_table, slot: removed.file_slot };
        let entry = {
            let table = match self.mmft.get_mut(target.table) {
                Some(t) => t,
                None => return Ok(()),
            };
            match table.read(&mut self.device, target.slot) {
                Ok(e) => e,
                Err(_) => return Ok(()),
            }
        };
        if entry.cookie != removed.cookie {
            log::warn!("unlink: {} named a stale cookie at ({}, {}); not touching the live file there", name, target.table, target.slot);
            return Ok(());
        }
        let mut entry = entry;
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count == 0 {
            if entry.mdf_slot != 0 {
                self.free_metadata_file(FileId { table: entry.mdf_table, slot: entry.mdf_slot })?;
            }
            let table = self.mmft.get_mut(target.table).ok_or(Error::InvalidFile)?;
            free_chain(&mut self.device, &self.sb, table, target.slot)?;
            self.dirs.remove(&target);
        } else {
            let table = self.mmft.get_mut(target.table).ok_or(Error::InvalidFile)?;
            table.write(&mut self.device, &entry)?;
        }
        Ok(())
    }

    fn free_metadata_file(&mut self, mdf_id: FileId) -> Result<(), Error> {
        let table = self.mmft.get_mut(mdf_id.table).ok_or(Error::InvalidFile)?;
        free_chain(&mut self.device, &self.sb, table, mdf_id.slot)
    }

    /// Finds (or lazily allocates, linking it into the head entry) the
    /// metadata file backing `id`.
    fn ensure_metadata_file(&mut self, id: FileId) -> Result<FileId, Error> {
        {
            let table = self.mmft.get_mut(id.table).ok_or(Error::InvalidFile)?;
            let entry = table.read(&mut self.device, id.slot)?;
            if entry.mdf_slot != 0 {
                return Ok(FileId { table: entry.mdf_table, slot: entry.mdf_slot });
            }
        }
        let (mdf_table, mut mdf_entry) = self.mmft.create_entry(&mut self.device)?;
        mdf_entry.file_type = FileType::Metadata as u8;
        mdf_entry.ref_count = 1;
        {
            let table = self.mmft.get_mut(mdf_table).ok_or(Error::InvalidFile)?;
            table.write(&mut self.device, &mdf_entry)?;
        }

        let table = self.mmft.get_mut(id.table).ok_or(Error::InvalidFile)?;
        let mut entry = table.read(&mut self.device, id.slot)?;
        entry.mdf_table = mdf_table;
        entry.mdf_slot = mdf_entry.slot_idx;
        entry.mdf_cookie16 = (mdf_entry.cookie & 0xFFFF) as u16;
        table.write(&mut self.device, &entry)?;
        Ok(FileId { table: mdf_table, slot: mdf_entry.slot_idx })
    }

    /// Admits `key`'s metadata file into the cache if it is not already
    /// resident, flushing whatever entry the admission evicted through its
    /// own file view.
    fn admit_metadata(&mut self, key: (u32, u32)) -> Result<(), Error> {
        let mut view = {
            let table = self.mmft.get_mut(key.0).ok_or(Error::InvalidFile)?;
            FileView::new(&mut self.device, &self.sb, table, FileId { table: key.0, slot: key.1 })?
        };
        if let Some((ev_key, mut evicted)) = self.metadata.ensure(key, &mut view)? {
            let table = self.mmft.get_mut(ev_key.0).ok_or(Error::InvalidFile)?;
            let mut ev_view = FileView::new(&mut self.device, &self.sb, table, FileId { table: ev_key.0, slot: ev_key.1 })?;
            evicted.serialize_time(&mut ev_view)?;
        }
        Ok(())
    }

    pub fn set_time(&mut self, id: FileId, kind: TimeKind, time: Timestamp) -> Result<(), Error> {
        let mdf = self.ensure_metadata_file(id)?;
        let key = (mdf.table, mdf.slot);
        self.admit_metadata(key)?;
        let mut view = {
            let table = self.mmft.get_mut(key.0).ok_or(Error::InvalidFile)?;
            FileView::new(&mut self.device, &self.sb, table, mdf)?
        };
        self.metadata
            .with_entry(key, |mf| mf.set_time(&mut view, kind, time))
            .expect("just admitted")
    }

    pub fn put_acl(&mut self, id: FileId, subject: Sid, acv: AccessControlVector) -> Result<(), Error> {
        let mdf = self.ensure_metadata_file(id)?;
        let key = (mdf.table, mdf.slot);
        self.admit_metadata(key)?;
        let mut view = {
            let table = self.mmft.get_mut(key.0).ok_or(Error::InvalidFile)?;
            FileView::new(&mut self.device, &self.sb, table, mdf)?
        };
        self.metadata
            .with_entry(key, |mf| mf.put_acl(&mut view, subject, acv))
            .expect("just admitted")
    }

    pub fn effective_acl(&mut self, id: FileId, subject: Sid) -> Result<u16, Error> {
        let mdf = self.ensure_metadata_file(id)?;
        let key = (mdf.table, mdf.slot);
        self.admit_metadata(key)?;
        Ok(self.metadata.with_entry(key, |mf| mf.effective_acl(subject)).expect("just admitted"))
    }

    pub fn times(&mut self, id: FileId) -> Result<(Timestamp, Timestamp, Timestamp), Error> {
        let mdf = self.ensure_metadata_file(id)?;
        let key = (mdf.table, mdf.slot);
        self.admit_metadata(key)?;
        Ok(self
            .metadata
            .with_entry(key, |mf| (mf.birth_time(), mf.write_time(), mf.access_time()))
            .expect("just admitted"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn fresh(block_count: u64) -> Filesystem<MemDevice> {
        let device = MemDevice::with_len(block_count * 512);
        mkfs(device, FormatOptions { sbo: 0, block_size: 512, mft_blocks: 1, dir_seg_size: 4096 }).unwrap()
    }

    #[test]
    fn mkfs_then_load_round_trips() {
        let fs = fresh(256);
        let block_count_before = fs.superblock().block_count;
        let root_before = fs.root_dir();
        let device = fs.into_device();

        let reloaded = Filesystem::load(device, 0).unwrap();
        assert_eq!(reloaded.superblock().block_count, block_count_before);
        assert_eq!(reloaded.root_dir(), root_before);
    }

    #[test]
    fn root_directory_starts_empty() {
        let mut fs = fresh(256);
        let root = fs.root_dir();
        assert!(fs.dir_is_empty(root).unwrap());
    }

    #[test]
    fn create_write_read_round_trips() {
        let mut fs = fresh(256);
        let root = fs.root_dir();
        let file = fs.create(root, "hello.txt", FileType::File).unwrap();
        fs.grow(file, 5).unwrap();
        fs.write_at(file, 0, b"HELLO").unwrap();
        let mut buf = [0u8; 5];
        let n = fs.read_at(file, 0, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"HELLO");
    }

    #[test]
    fn link_then_search_finds_the_file() {
        let mut fs = fresh(256);
        let root = fs.root_dir();
        let file = fs.create(root, "a.txt", FileType::File).unwrap();
        let found = fs.dir_search(root, "a.txt").unwrap();
        assert_eq!(found.file_table, file.table);
        assert_eq!(found.file_slot, file.slot);
    }

    #[test]
    fn unlink_drops_refcount_to_zero_and_frees_the_chain() {
        let mut fs = fresh(256);
        let root = fs.root_dir();
        let file = fs.create(root, "a.txt", FileType::File).unwrap();
        fs.grow(file, 4096).unwrap();
        fs.unlink(root, "a.txt").unwrap();
        assert!(matches!(fs.dir_search(root, "a.txt"), Err(Error::NotFound)));
        // The slot is free now; stat on it reports a corrupt/free entry.
        assert!(fs.stat(file).is_err());
    }

    #[test]
    fn grow_across_fragmented_free_space_chains_a_segment() {
        let mut fs = fresh(64);
        let root = fs.root_dir();
        let a = fs.create(root, "a", FileType::File).unwrap();
        let b = fs.create(root, "b", FileType::File).unwrap();
        fs.grow(a, 512 * 5).unwrap();
        fs.grow(b, 512 * 5).unwrap();
        // Freeing `a`'s extent then asking for more than either single gap
        // holds forces `b`'s next grow to chain an extra segment.
        fs.unlink(root, "a").unwrap();
        fs.grow(b, 512 * 12).unwrap();
        let (_, size) = fs.stat(b).unwrap();
        assert_eq!(size, 512 * 12);
        let mut buf = vec![0u8; 512 * 12];
        let n = fs.read_at(b, 0, &mut buf).unwrap();
        assert_eq!(n, buf.len());
    }

    #[test]
    fn grow_to_current_size_is_a_no_op() {
        let mut fs = fresh(64);
        let root = fs.root_dir();
        let file = fs.create(root, "a", FileType::File).unwrap();
        fs.grow(file, 512 * 3).unwrap();
        let free_before = fs.free_blocks().unwrap();
        fs.grow(file, 512 * 3).unwrap();
        let (_, size) = fs.stat(file).unwrap();
        assert_eq!(size, 512 * 3);
        assert_eq!(fs.free_blocks().unwrap(), free_before);
        // A request for less than the current size is also a no-op for `grow`.
        fs.grow(file, 512).unwrap();
        let (_, size) = fs.stat(file).unwrap();
        assert_eq!(size, 512 * 3);
    }

    #[test]
    fn shrink_to_zero_frees_every_extent() {
        let mut fs = fresh(64);
        let root = fs.root_dir();
        let file = fs.create(root, "a", FileType::File).unwrap();
        fs.resize(file, 512 * 4).unwrap();
        fs.resize(file, 0).unwrap();
        let (_, size) = fs.stat(file).unwrap();
        assert_eq!(size, 0);
        // The freed extent must be reusable by a second file.
        let other = fs.create(root, "b", FileType::File).unwrap();
        fs.resize(other, 512 * 4).unwrap();
        let (_, size) = fs.stat(other).unwrap();
        assert_eq!(size, 512 * 4);
    }

    #[test]
    fn shrink_then_grow_reuses_freed_blocks() {
        let mut fs = fresh(64);
        let root = fs.root_dir();
        let file = fs.create(root, "a", FileType::File).unwrap();
        fs.resize(file, 512 * 4).unwrap();
        fs.resize(file, 512).unwrap();
        let (_, size) = fs.stat(file).unwrap();
        assert_eq!(size, 512);
        fs.resize(file, 512 * 3).unwrap();
        let (_, size) = fs.stat(file).unwrap();
        assert_eq!(size, 512 * 3);
    }

    #[test]
    fn timestamps_and_acl_round_trip_through_the_metadata_cache() {
        let mut fs = fresh(64);
        let root = fs.root_dir();
        let file = fs.create(root, "a", FileType::File).unwrap();
        fs.set_time(file, TimeKind::Write, Timestamp { seconds: 42, nanos: 7 }).unwrap();
        let owner = Sid::new(1, 100);
        fs.put_acl(file, owner, AccessControlVector::new(0b001, 0)).unwrap();
        fs.put_acl(file, owner, AccessControlVector::new(0b010, 0)).unwrap();
        let (_, write_time, _) = fs.times(file).unwrap();
        assert_eq!(write_time, Timestamp { seconds: 42, nanos: 7 });
        assert_eq!(fs.effective_acl(file, owner).unwrap(), 0b011);
    }

    /// A timestamp set on a file that never falls out of the metadata
    /// cache (the common case, since the cache holds 1024 entries) must
    /// still be on disk after `close` — not just readable from the live
    /// in-memory cache within the same session.
    #[test]
    fn timestamps_survive_close_and_reload_without_an_eviction() {
        let mut fs = fresh(64);
        let root = fs.root_dir();
        let file = fs.create(root, "a", FileType::File).unwrap();
        fs.set_time(file, TimeKind::Birth, Timestamp { seconds: 123, nanos: 456 }).unwrap();

        let device = fs.close().unwrap();
        let mut reloaded = Filesystem::load(device, 0).unwrap();
        let (birth_time, _, _) = reloaded.times(file).unwrap();
        assert_eq!(birth_time, Timestamp { seconds: 123, nanos: 456 });
    }

    #[test]
    fn hard_link_keeps_file_alive_until_every_name_is_gone() {
        let mut fs = fresh(64);
        let root = fs.root_dir();
        let file = fs.create(root, "a", FileType::File).unwrap();
        fs.link(root, "b", file).unwrap();
        fs.unlink(root, "a").unwrap();
        // Still reachable via "b".
        assert!(fs.stat(file).is_ok());
        fs.unlink(root, "b").unwrap();
        assert!(fs.stat(file).is_err());
    }

    /// A device that stops landing writes after the very first one means
    /// `create`'s MFT-entry write never lands: the name must not be visible
    /// after a reload, regardless of what `create` itself returned.
    #[test]
    fn create_interrupted_at_the_first_write_leaves_no_trace_on_reload() {
        use crate::device::FaultDevice;

        let mut fs = fresh(64);
        let root = fs.root_dir();
        let inner = fs.into_device();

        let faulty = FaultDevice::new(inner, 0);
        let mut fs = Filesystem::load(faulty, 0).unwrap();
        let _ = fs.create(root, "ghost", FileType::File);
        let recovered = fs.into_device().into_inner();

        let mut reloaded = Filesystem::load(recovered, 0).unwrap();
        assert!(matches!(reloaded.dir_search(root, "ghost"), Err(Error::NotFound)));
    }

    /// Whatever point a dropped write lands at, the image must still be
    /// loadable afterward — no shape change may be left half-applied such
    /// that `load` itself fails.
    #[test]
    fn write_dropped_partway_through_create_still_reloads() {
        use crate::device::FaultDevice;

        let mut fs = fresh(64);
        let root = fs.root_dir();
        let inner = fs.into_device();

        let faulty = FaultDevice::new(inner, 1);
        let mut fs = Filesystem::load(faulty, 0).unwrap();
        let _ = fs.create(root, "maybe", FileType::File);
        let recovered = fs.into_device().into_inner();

        assert!(Filesystem::load(recovered, 0).is_ok());
    }
}
