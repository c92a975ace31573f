//! The Master File Table: a fixed slot array of file-extent records. Entry
//! 0 is the table header; entries `1..size` are file records, each either a
//! live segment or — when its integrity check fails — free.
//!
//! Following the `TreeOps`-style pattern of pairing long-lived metadata with
//! a short-lived borrowed device: [`MftTable`] owns the table's persistent
//! state (entry/chain caches, slot counters); callers reach it through
//! [`MftTable`]'s methods, each of which takes the device for just the
//! duration of that call.

use std::num::NonZeroUsize;

use lru::LruCache;
use rand::RngCore;

use crate::device::{BlockDevice, FixedRecordIo, Section};
use crate::error::Error;

pub const MFTE_SIZE: u64 = 64;
const HEADER_SIZE: u64 = 64;

/// File type tags stored in an MFT entry's head record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FileType {
    File = 0xF0,
    Dir = 0xF1,
    Fifo = 0xF2,
    Metadata = 0xF3,
}

impl FileType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0xF0 => Some(Self::File),
            0xF1 => Some(Self::Dir),
            0xF2 => Some(Self::Fifo),
            0xF3 => Some(Self::Metadata),
            _ => None,
        }
    }
}

/// The first record of an MFT: table identity, length, and a reserved link
/// to a following table (multi-MFT chaining is not exercised in practice).
#[derive(Clone, Copy, Debug)]
pub struct MftHeader {
    pub table_id: u32,
    pub num_blocks: u32,
    pub next_mft_block: u64,
}

impl MftHeader {
    fn to_bytes(self) -> [u8; HEADER_SIZE as usize] {
        let mut out = [0u8; HEADER_SIZE as usize];
        out[0..4].copy_from_slice(&self.table_id.to_be_bytes());
        out[4..8].copy_from_slice(&self.num_blocks.to_be_bytes());
        out[8..16].copy_from_slice(&self.next_mft_block.to_be_bytes());
        out
    }

    fn from_bytes(buf: &[u8; HEADER_SIZE as usize]) -> Self {
        Self {
            table_id: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            num_blocks: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            next_mft_block: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
        }
    }
}

/// One 64-byte MFT record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MftEntry {
    pub table_id: u32,
    pub slot_idx: u32,
    pub cookie: u64,
    pub begin_blk: u64,
    pub end_blk: u64,
    pub next_idx: u32,
    pub first_idx: u32,
    pub file_size: i64,
    pub file_type: u8,
    pub mdf_cookie16: u16,
    pub mdf_table: u32,
    pub mdf_slot: u32,
    /// Directory edges (plus one for a pinned system file) pointing at this
    /// head. Stored in the four bytes the wire layout otherwise reserves;
    /// meaningful only when `is_head()`.
    pub ref_count: u32,
}

impl MftEntry {
    pub fn zeroed() -> Self {
        Self {
            table_id: 0,
            slot_idx: 0,
            cookie: 0,
            begin_blk: 0,
            end_blk: 0,
            next_idx: 0,
            first_idx: 0,
            file_size: 0,
            file_type: 0,
            mdf_cookie16: 0,
            mdf_table: 0,
            mdf_slot: 0,
            ref_count: 0,
        }
    }

    pub fn is_head(&self) -> bool {
        self.first_idx == self.slot_idx
    }

    pub fn to_bytes(&self) -> [u8; MFTE_SIZE as usize] {
        let mut out = [0u8; MFTE_SIZE as usize];
        out[0..4].copy_from_slice(&self.table_id.to_be_bytes());
        out[4..8].copy_from_slice(&self.slot_idx.to_be_bytes());
        out[8..16].copy_from_slice(&self.cookie.to_be_bytes());
        out[16..24].copy_from_slice(&self.begin_blk.to_be_bytes());
        out[24..32].copy_from_slice(&self.end_blk.to_be_bytes());
        out[32..36].copy_from_slice(&self.next_idx.to_be_bytes());
        out[36..40].copy_from_slice(&self.first_idx.to_be_bytes());
        out[40..48].copy_from_slice(&self.file_size.to_be_bytes());
        out[48] = self.file_type;
        // out[49] = mdf_pad1, left zero.
        out[50..52].copy_from_slice(&self.mdf_cookie16.to_be_bytes());
        out[52..56].copy_from_slice(&self.mdf_table.to_be_bytes());
        out[56..60].copy_from_slice(&self.mdf_slot.to_be_bytes());
        out[60..64].copy_from_slice(&self.ref_count.to_be_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8; MFTE_SIZE as usize]) -> Self {
        Self {
            table_id: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            slot_idx: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            cookie: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
            begin_blk: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
            end_blk: u64::from_be_bytes(buf[24..32].try_into().unwrap()),
            next_idx: u32::from_be_bytes(buf[32..36].try_into().unwrap()),
            first_idx: u32::from_be_bytes(buf[36..40].try_into().unwrap()),
            file_size: i64::from_be_bytes(buf[40..48].try_into().unwrap()),
            file_type: buf[48],
            mdf_cookie16: u16::from_be_bytes(buf[50..52].try_into().unwrap()),
            mdf_table: u32::from_be_bytes(buf[52..56].try_into().unwrap()),
            mdf_slot: u32::from_be_bytes(buf[56..60].try_into().unwrap()),
            ref_count: u32::from_be_bytes(buf[60..64].try_into().unwrap()),
        }
    }
}

/// The accumulated segment list of one file's extent chain: parallel
/// vectors of slot index, the running virtual block offset at which that
/// segment's data begins, and the segment's physical starting block.
#[derive(Clone, Debug, Default)]
pub struct Chain {
    pub slots: Vec<u32>,
    pub offsets: Vec<u64>,
    pub begins: Vec<u64>,
    pub total_blocks: u64,
}

impl Chain {
    /// Binary-searches the ascending offset vector for the segment
    /// containing `virtual_block`. Returns `(slot, segment_index)`, or
    /// `None` if `virtual_block` is past the end of the chain.
    pub fn find_block_offset(&self, virtual_block: u64) -> Option<(u32, usize)> {
        if virtual_block >= self.total_blocks {
            return None;
        }
        let idx = match self.offsets.binary_search(&virtual_block) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        Some((self.slots[idx], idx))
    }
}

/// Persistent state for one Master File Table. Long-lived; the device
/// itself is supplied per-call.
pub struct MftTable {
    pub table_id: u32,
    pub num_blocks: u32,
    pub next_mft_block: u64,
    entries_per_block: u64,
    size: u64,
    base_offset: u64,
    rec_io: FixedRecordIo,
    entry_cache: LruCache<u32, MftEntry>,
    chain_cache: LruCache<u32, Chain>,
}

const ENTRY_CACHE_CAP: usize = 1024;
const CHAIN_CACHE_CAP: usize = 256;

impl MftTable {
    /// Loads the table header at `base_block` and prepares caches. The
    /// caller is expected to widen the backing section's length once
    /// `num_blocks` is known (the header is self-describing).
    pub fn load<D: BlockDevice>(device: &mut D, base_offset: u64, block_size: u32) -> Result<Self, Error> {
        let mut section = Section::new(device, base_offset, HEADER_SIZE);
        let rec_io = FixedRecordIo::new(HEADER_SIZE);
        let mut buf = [0u8; HEADER_SIZE as usize];
        rec_io.read_index(&mut section, 0, &mut buf)?;
        let header = MftHeader::from_bytes(&buf);
        let entries_per_block = block_size as u64 / MFTE_SIZE;
        let size = header.num_blocks as u64 * entries_per_block;
        Ok(Self {
            table_id: header.table_id,
            num_blocks: header.num_blocks,
            next_mft_block: header.next_mft_block,
            entries_per_block,
            size,
            base_offset,
            rec_io: FixedRecordIo::new(MFTE_SIZE),
            entry_cache: LruCache::new(NonZeroUsize::new(ENTRY_CACHE_CAP).unwrap()),
            chain_cache: LruCache::new(NonZeroUsize::new(CHAIN_CACHE_CAP).unwrap()),
        })
    }

    /// Writes a brand-new table: zeroes every slot (a zero record is, by
    /// construction, a corrupt/free slot) and stamps the header.
    pub fn format<D: BlockDevice>(
        device: &mut D,
        base_offset: u64,
        block_size: u32,
        num_blocks: u32,
        table_id: u32,
    ) -> Result<Self, Error> {
        let entries_per_block = block_size as u64 / MFTE_SIZE;
        let size = num_blocks as u64 * entries_per_block;
        let total_bytes = size * MFTE_SIZE;
        let mut section = Section::new(device, base_offset, total_bytes);
        let rec_io = FixedRecordIo::new(MFTE_SIZE);
        let zero = [0u8; MFTE_SIZE as usize];
        for i in 0..size {
            rec_io.write_index(&mut section, i, &zero)?;
        }
        let header = MftHeader {
            table_id,
            num_blocks,
            next_mft_block: 0,
        };
        rec_io.write_index(&mut section, 0, &header.to_bytes())?;
        Ok(Self {
            table_id,
            num_blocks,
            next_mft_block: 0,
            entries_per_block,
            size,
            base_offset,
            rec_io,
            entry_cache: LruCache::new(NonZeroUsize::new(ENTRY_CACHE_CAP).unwrap()),
            chain_cache: LruCache::new(NonZeroUsize::new(CHAIN_CACHE_CAP).unwrap()),
        })
    }

    fn section<'a, D: BlockDevice>(&self, device: &'a mut D) -> Section<'a, D> {
        Section::new(device, self.base_offset, self.size * MFTE_SIZE)
    }

    /// Loads entry `i`. Rejects `i == 0` (the header) and out-of-range
    /// indices; a decoded record whose `slot_idx` or `table_id` disagree
    /// with what was requested is reported as `CorruptEntry` — the on-disk
    /// representation of "this slot is free".
    pub fn read<D: BlockDevice>(&mut self, device: &mut D, i: u32) -> Result<MftEntry, Error> {
        if i == 0 || i as u64 >= self.size {
            return Err(Error::CorruptEntry { table_id: self.table_id, slot: i });
        }
        if let Some(e) = self.entry_cache.get(&i) {
            return Ok(*e);
        }
        let mut section = self.section(device);
        let mut buf = [0u8; MFTE_SIZE as usize];
        self.rec_io.read_index(&mut section, i as u64, &mut buf)?;
        let entry = MftEntry::from_bytes(&buf);
        if entry.slot_idx != i || entry.table_id != self.table_id {
            log::trace!("mft {}: slot {} reads as free/corrupt", self.table_id, i);
            return Err(Error::CorruptEntry { table_id: self.table_id, slot: i });
        }
        self.entry_cache.put(i, entry);
        Ok(entry)
    }

    /// Serializes `entry` at its own `slot_idx` and refreshes the cache.
    pub fn write<D: BlockDevice>(&mut self, device: &mut D, entry: &MftEntry) -> Result<(), Error> {
        let mut section = self.section(device);
        self.rec_io.write_index(&mut section, entry.slot_idx as u64, &entry.to_bytes())?;
        self.entry_cache.put(entry.slot_idx, *entry);
        Ok(())
    }

    /// Scans from slot 1 upward for the first free slot (one that reads as
    /// `CorruptEntry`), initializes and persists it, and returns it.
    pub fn allocate<D: BlockDevice>(&mut self, device: &mut D) -> Result<MftEntry, Error> {
        for i in 1..self.size as u32 {
            match self.read(device, i) {
                Err(Error::CorruptEntry { .. }) => {
                    let mut entry = MftEntry::zeroed();
                    entry.table_id = self.table_id;
                    entry.slot_idx = i;
                    entry.first_idx = i;
                    entry.cookie = rand::thread_rng().next_u64();
                    self.write(device, &entry)?;
                    log::debug!("mft {}: allocated slot {}", self.table_id, i);
                    return Ok(entry);
                }
                Ok(_) => continue,
                Err(other) => return Err(other),
            }
        }
        Err(Error::AllocFail { table_id: self.table_id })
    }

    /// Follows `next_idx` from `head`, validating that every segment's
    /// `first_idx` equals `head`. Cached per head slot.
    pub fn build_chain<D: BlockDevice>(&mut self, device: &mut D, head: u32) -> Result<Chain, Error> {
        if let Some(c) = self.chain_cache.get(&head) {
            return Ok(c.clone());
        }
        let mut chain = Chain::default();
        let mut cur = head;
        loop {
            let entry = self.read(device, cur)?;
            if entry.first_idx != head {
                return Err(Error::ChainCorrupt { head, at: cur });
            }
            let len = entry.end_blk.saturating_sub(entry.begin_blk);
            chain.offsets.push(chain.total_blocks);
            chain.slots.push(cur);
            chain.begins.push(entry.begin_blk);
            chain.total_blocks += len;
            if entry.next_idx == 0 {
                break;
            }
            cur = entry.next_idx;
        }
        self.chain_cache.put(head, chain.clone());
        Ok(chain)
    }

    /// Drops the cached chain for `head`. Every shape-changing operation on
    /// a chain (grow, shrink, resize, free) must call this so the next
    /// `build_chain` reads fresh state.
    pub fn reset_chain(&mut self, head: u32) {
        self.chain_cache.pop(&head);
    }

    /// Writes a zero record at slot `i`, returning it to the free state
    /// `read` reports as `CorruptEntry`, and drops any cached entry for it.
    pub fn free_slot<D: BlockDevice>(&mut self, device: &mut D, i: u32) -> Result<(), Error> {
        let mut section = self.section(device);
        let zero = [0u8; MFTE_SIZE as usize];
        self.rec_io.write_index(&mut section, i as u64, &zero)?;
        self.entry_cache.pop(&i);
        self.chain_cache.pop(&i);
        log::debug!("mft {}: freed slot {}", self.table_id, i);
        Ok(())
    }
}

/// Registry of MFTs keyed by table id. In this implementation exactly one
/// table is normally registered, but the structure supports more.
pub struct Mmft {
    tables: std::collections::HashMap<u32, MftTable>,
}

impl Mmft {
    pub fn new() -> Self {
        Self { tables: std::collections::HashMap::new() }
    }

    pub fn insert(&mut self, table: MftTable) {
        self.tables.insert(table.table_id, table);
    }

    pub fn get_mut(&mut self, table_id: u32) -> Option<&mut MftTable> {
        self.tables.get_mut(&table_id)
    }

    /// A uniform-ish pick among registered tables: argmax of `table_id XOR
    /// random_word`. With a single table this always returns it; treat it
    /// as a load-spreading hint, not a strong guarantee, once more than one
    /// table is registered.
    pub fn random_get(&self) -> Option<u32> {
        let r = rand::thread_rng().next_u32();
        self.tables.keys().copied().max_by_key(|id| id ^ r)
    }

    /// `RandomGet -> Allocate`, retried up to 32 times across tables before
    /// surfacing `OutOfResources`.
    pub fn create_entry<D: BlockDevice>(&mut self, device: &mut D) -> Result<(u32, MftEntry), Error> {
        for _ in 0..32 {
            let Some(table_id) = self.random_get() else {
                break;
            };
            let table = self.tables.get_mut(&table_id).expect("random_get returned a registered id");
            match table.allocate(device) {
                Ok(entry) => return Ok((table_id, entry)),
                Err(Error::AllocFail { .. }) => continue,
                Err(other) => return Err(other),
            }
        }
        Err(Error::OutOfResources)
    }
}

impl Default for Mmft {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn fresh_table(num_blocks: u32, block_size: u32) -> (MemDevice, MftTable) {
        let mut dev = MemDevice::with_len(num_blocks as u64 * block_size as u64);
        let table = MftTable::format(&mut dev, 0, block_size, num_blocks, 0xAB_CDEF01).unwrap();
        (dev, table)
    }

    #[test]
    fn fresh_slots_read_as_corrupt_i_e_free() {
        let (mut dev, mut table) = fresh_table(1, 4096);
        let err = table.read(&mut dev, 1).unwrap_err();
        assert!(matches!(err, Error::CorruptEntry { .. }));
    }

    #[test]
    fn allocate_then_read_round_trips() {
        let (mut dev, mut table) = fresh_table(1, 4096);
        let entry = table.allocate(&mut dev).unwrap();
        assert_eq!(entry.slot_idx, entry.first_idx);
        let reread = table.read(&mut dev, entry.slot_idx).unwrap();
        assert_eq!(reread, entry);
    }

    #[test]
    fn allocate_fails_when_table_full() {
        let (mut dev, mut table) = fresh_table(1, 4096);
        let entries_per_block = 4096 / MFTE_SIZE as u32;
        for _ in 1..entries_per_block {
            table.allocate(&mut dev).unwrap();
        }
        let err = table.allocate(&mut dev).unwrap_err();
        assert!(matches!(err, Error::AllocFail { .. }));
    }

    #[test]
    fn build_chain_accumulates_offsets() {
        let (mut dev, mut table) = fresh_table(1, 4096);
        let mut head = table.allocate(&mut dev).unwrap();
        head.begin_blk = 0;
        head.end_blk = 4;
        let mut seg2 = table.allocate(&mut dev).unwrap();
        seg2.first_idx = head.slot_idx;
        seg2.begin_blk = 10;
        seg2.end_blk = 13;
        head.next_idx = seg2.slot_idx;
        table.write(&mut dev, &head).unwrap();
        table.write(&mut dev, &seg2).unwrap();

        let chain = table.build_chain(&mut dev, head.slot_idx).unwrap();
        assert_eq!(chain.total_blocks, 7);
        assert_eq!(chain.offsets, vec![0, 4]);
        assert_eq!(chain.begins, vec![0, 10]);
        assert_eq!(chain.find_block_offset(5), Some((seg2.slot_idx, 1)));
        assert_eq!(chain.find_block_offset(7), None);
    }

    #[test]
    fn chain_corrupt_when_first_idx_mismatches() {
        let (mut dev, mut table) = fresh_table(1, 4096);
        let mut head = table.allocate(&mut dev).unwrap();
        let mut seg2 = table.allocate(&mut dev).unwrap();
        // Forget to stamp seg2.first_idx = head.slot_idx.
        head.next_idx = seg2.slot_idx;
        seg2.first_idx = seg2.slot_idx;
        table.write(&mut dev, &head).unwrap();
        table.write(&mut dev, &seg2).unwrap();
        let err = table.build_chain(&mut dev, head.slot_idx).unwrap_err();
        assert!(matches!(err, Error::ChainCorrupt { .. }));
    }
}
