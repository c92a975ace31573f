//! The metadata-file engine: timestamps and ACL entries for a file, stored
//! as a slot-indexed array of 16-byte records with a free list, cached
//! per-filesystem in a fixed-size LRU that flushes dirty instances on
//! eviction.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::error::Error;

pub(crate) const ENTRY_SIZE: usize = 16;

const TAG_FREE: u8 = 0xA0;
const TAG_BIRTH: u8 = 0xA1;
const TAG_WRITE: u8 = 0xA2;
const TAG_ACCESS: u8 = 0xA3;
const TAG_ACE: u8 = 0xA4;

/// Which timestamp kind an operation addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimeKind {
    Birth,
    Write,
    Access,
}

impl TimeKind {
    fn tag(self) -> u8 {
        match self {
            TimeKind::Birth => TAG_BIRTH,
            TimeKind::Write => TAG_WRITE,
            TimeKind::Access => TAG_ACCESS,
        }
    }
}

/// Seconds and nanoseconds since the epoch, the on-disk timestamp
/// resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub seconds: u64,
    pub nanos: u32,
}

/// A security identifier: a 32-bit namespace (UID/GID/TYPE) and a 32-bit
/// value, packed into one opaque 64-bit word. The core never interprets
/// namespace values beyond comparing them; a human-facing name table is out
/// of scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sid(u64);

impl Sid {
    pub fn new(namespace: u32, value: u32) -> Self {
        Self(((namespace as u64) << 32) | value as u64)
    }

    pub fn namespace(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn value(self) -> u32 {
        self.0 as u32
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// An access-control rights vector: low 16 bits allow, high 16 bits deny.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct AccessControlVector(u32);

impl AccessControlVector {
    pub fn new(allow: u16, deny: u16) -> Self {
        Self((allow as u32) | ((deny as u32) << 16))
    }

    pub fn allow(self) -> u16 {
        self.0 as u16
    }

    pub fn deny(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Rights actually granted: allowed and not denied.
    pub fn effective(self) -> u16 {
        self.allow() & !self.deny()
    }

    fn merged(self, other: AccessControlVector) -> AccessControlVector {
        AccessControlVector(self.0 | other.0)
    }

    fn raw(self) -> u32 {
        self.0
    }

    fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

struct RawEntry {
    tag: u8,
    data1: u8,
    data2: u16,
    data3: u32,
    data4: u64,
}

impl RawEntry {
    fn to_bytes(&self) -> [u8; ENTRY_SIZE] {
        let mut out = [0u8; ENTRY_SIZE];
        out[0] = self.tag;
        out[1] = self.data1;
        out[2..4].copy_from_slice(&self.data2.to_be_bytes());
        out[4..8].copy_from_slice(&self.data3.to_be_bytes());
        out[8..16].copy_from_slice(&self.data4.to_be_bytes());
        out
    }

    fn from_bytes(buf: &[u8; ENTRY_SIZE]) -> Self {
        Self {
            tag: buf[0],
            data1: buf[1],
            data2: u16::from_be_bytes(buf[2..4].try_into().unwrap()),
            data3: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            data4: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
        }
    }
}

/// A backing store for one metadata file's slot array, implemented by the
/// top-level filesystem in terms of the extent engine.
pub trait SlotFile {
    fn read_slot(&mut self, index: u64, buf: &mut [u8; ENTRY_SIZE]) -> Result<(), Error>;
    fn write_slot(&mut self, index: u64, buf: &[u8; ENTRY_SIZE]) -> Result<(), Error>;
    fn slot_count(&self) -> u64;
    fn append_slot(&mut self) -> Result<u64, Error>;
}

/// One file's in-memory metadata view: timestamps, ACL, and a free list,
/// loaded from a [`SlotFile`] and written back through it.
pub struct MetadataFile {
    birth: Timestamp,
    write: Timestamp,
    access: Timestamp,
    birth_slot: Option<u64>,
    write_slot: Option<u64>,
    access_slot: Option<u64>,
    acl: HashMap<Sid, (AccessControlVector, u64)>,
    free_list: Vec<u64>,
    dirty_times: bool,
}

impl MetadataFile {
    /// Loads every slot `0..slot_count`, routing each by its tag.
    pub fn load<F: SlotFile>(file: &mut F) -> Result<Self, Error> {
        let mut mf = Self {
            birth: Timestamp::default(),
            write: Timestamp::default(),
            access: Timestamp::default(),
            birth_slot: None,
            write_slot: None,
            access_slot: None,
            acl: HashMap::new(),
            free_list: Vec::new(),
            dirty_times: false,
        };
        let count = file.slot_count();
        for i in 0..count {
            let mut buf = [0u8; ENTRY_SIZE];
            file.read_slot(i, &mut buf)?;
            let raw = RawEntry::from_bytes(&buf);
            let ts = Timestamp { seconds: raw.data4, nanos: raw.data3 };
            match raw.tag {
                TAG_FREE => mf.free_list.push(i),
                TAG_BIRTH => {
                    mf.birth = ts;
                    mf.birth_slot = Some(i);
                }
                TAG_WRITE => {
                    mf.write = ts;
                    mf.write_slot = Some(i);
                }
                TAG_ACCESS => {
                    mf.access = ts;
                    mf.access_slot = Some(i);
                }
                TAG_ACE => {
                    let sid = Sid::from_raw(raw.data4);
                    let acv = AccessControlVector::from_raw(raw.data3);
                    mf.acl.insert(sid, (acv, i));
                }
                _ => mf.free_list.push(i),
            }
        }
        Ok(mf)
    }

    fn take_slot<F: SlotFile>(&mut self, file: &mut F) -> Result<u64, Error> {
        match self.free_list.pop() {
            Some(i) => Ok(i),
            None => file.append_slot(),
        }
    }

    /// Updates one timestamp, allocating its slot if none is recorded yet.
    /// The slot and the value are set together so a crash between the two
    /// cannot leave a zero-valued timestamp behind.
    pub fn set_time<F: SlotFile>(&mut self, file: &mut F, kind: TimeKind, time: Timestamp) -> Result<(), Error> {
        let slot_field = match kind {
            TimeKind::Birth => &mut self.birth_slot,
            TimeKind::Write => &mut self.write_slot,
            TimeKind::Access => &mut self.access_slot,
        };
        if slot_field.is_none() {
            let slot = self.take_slot(file)?;
            *slot_field = Some(slot);
        }
        match kind {
            TimeKind::Birth => self.birth = time,
            TimeKind::Write => self.write = time,
            TimeKind::Access => self.access = time,
        }
        self.dirty_times = true;
        Ok(())
    }

    /// Writes the three timestamp slots back, if dirty.
    pub fn serialize_time<F: SlotFile>(&mut self, file: &mut F) -> Result<(), Error> {
        if !self.dirty_times {
            return Ok(());
        }
        for (kind, ts, slot) in [
            (TimeKind::Birth, self.birth, self.birth_slot),
            (TimeKind::Write, self.write, self.write_slot),
            (TimeKind::Access, self.access, self.access_slot),
        ] {
            if let Some(slot) = slot {
                let raw = RawEntry { tag: kind.tag(), data1: 0, data2: 0, data3: ts.nanos, data4: ts.seconds };
                file.write_slot(slot, &raw.to_bytes())?;
            }
        }
        self.dirty_times = false;
        Ok(())
    }

    /// Merges `acv` into the subject's existing rights with a bitwise OR,
    /// allocating a slot for the subject if this is its first ACE.
    pub fn put_acl<F: SlotFile>(&mut self, file: &mut F, subject: Sid, acv: AccessControlVector) -> Result<(), Error> {
        let merged = match self.acl.get(&subject) {
            Some(&(existing, _)) => existing.merged(acv),
            None => acv,
        };
        let slot = match self.acl.get(&subject) {
            Some(&(_, slot)) => slot,
            None => self.take_slot(file)?,
        };
        self.acl.insert(subject, (merged, slot));
        let raw = RawEntry { tag: TAG_ACE, data1: 0, data2: 0, data3: merged.raw(), data4: subject.raw() };
        file.write_slot(slot, &raw.to_bytes())
    }

    pub fn effective_acl(&self, subject: Sid) -> u16 {
        self.acl.get(&subject).map(|(acv, _)| acv.effective()).unwrap_or(0)
    }

    pub fn birth_time(&self) -> Timestamp {
        self.birth
    }

    pub fn write_time(&self) -> Timestamp {
        self.write
    }

    pub fn access_time(&self) -> Timestamp {
        self.access
    }
}

/// Per-filesystem cache of open [`MetadataFile`] instances, keyed by
/// `(table_id, slot)`. Eviction flushes the dirty instance back to its own
/// backing slot file before it is dropped; `open` re-resolves that slot
/// file for whichever key needs one, since the evicted entry generally
/// belongs to a different file than the one just requested.
pub struct MetadataCache {
    inner: Mutex<LruCache<(u32, u32), MetadataFile>>,
}

const METADATA_CACHE_CAP: usize = 1024;

impl MetadataCache {
    pub fn new() -> Self {
        Self { inner: Mutex::new(LruCache::new(NonZeroUsize::new(METADATA_CACHE_CAP).unwrap())) }
    }

    /// Ensures `key` is present in the cache, loading it through `file` (the
    /// slot file for `key` itself) if it is missing. If loading evicts an
    /// older entry, that entry is handed back to the caller — still dirty —
    /// so it can be flushed through *its own* slot file, which is never the
    /// one passed in here.
    ///
    /// Splitting cache admission from use (see [`MetadataCache::with_entry`])
    /// is what lets the caller build each entry's `SlotFile` view one at a
    /// time instead of holding two live views into the same filesystem at
    /// once.
    pub fn ensure<F: SlotFile>(
        &self,
        key: (u32, u32),
        file: &mut F,
    ) -> Result<Option<((u32, u32), MetadataFile)>, Error> {
        let mut guard = self.inner.lock().expect("metadata cache mutex poisoned");
        if guard.contains(&key) {
            return Ok(None);
        }
        let loaded = MetadataFile::load(file)?;
        Ok(guard.push(key, loaded))
    }

    /// Runs `with` against the cached entry for `key`, which must already
    /// have been admitted via [`MetadataCache::ensure`].
    pub fn with_entry<R>(&self, key: (u32, u32), with: impl FnOnce(&mut MetadataFile) -> R) -> Option<R> {
        let mut guard = self.inner.lock().expect("metadata cache mutex poisoned");
        guard.get_mut(&key).map(with)
    }

    /// Empties the whole cache, handing every resident entry back to the
    /// caller still dirty. Used when the filesystem is closed (or
    /// explicitly flushed): every entry must be flushed through its own
    /// slot file, the same way a single evicted entry is in
    /// [`MetadataCache::ensure`] — draining just does it for all of them at
    /// once instead of one at a time on eviction.
    pub fn drain(&self) -> Vec<((u32, u32), MetadataFile)> {
        let mut guard = self.inner.lock().expect("metadata cache mutex poisoned");
        let mut out = Vec::new();
        while let Some(entry) = guard.pop_lru() {
            out.push(entry);
        }
        out
    }
}

impl Default for MetadataCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MemSlotFile {
        slots: Vec<[u8; ENTRY_SIZE]>,
    }

    impl SlotFile for MemSlotFile {
        fn read_slot(&mut self, index: u64, buf: &mut [u8; ENTRY_SIZE]) -> Result<(), Error> {
            *buf = self.slots[index as usize];
            Ok(())
        }

        fn write_slot(&mut self, index: u64, buf: &[u8; ENTRY_SIZE]) -> Result<(), Error> {
            self.slots[index as usize] = *buf;
            Ok(())
        }

        fn slot_count(&self) -> u64 {
            self.slots.len() as u64
        }

        fn append_slot(&mut self) -> Result<u64, Error> {
            self.slots.push([0u8; ENTRY_SIZE]);
            Ok(self.slots.len() as u64 - 1)
        }
    }

    #[test]
    fn set_time_allocates_and_sets_together() {
        let mut file = MemSlotFile::default();
        let mut mf = MetadataFile::load(&mut file).unwrap();
        mf.set_time(&mut file, TimeKind::Birth, Timestamp { seconds: 100, nanos: 5 }).unwrap();
        mf.serialize_time(&mut file).unwrap();
        assert_eq!(file.slots.len(), 1);
        let reloaded = MetadataFile::load(&mut file).unwrap();
        assert_eq!(reloaded.birth_time(), Timestamp { seconds: 100, nanos: 5 });
    }

    #[test]
    fn put_acl_merges_with_bitwise_or() {
        let mut file = MemSlotFile::default();
        let mut mf = MetadataFile::load(&mut file).unwrap();
        let subject = Sid::new(1, 42);
        mf.put_acl(&mut file, subject, AccessControlVector::new(0b0001, 0)).unwrap();
        mf.put_acl(&mut file, subject, AccessControlVector::new(0b0010, 0)).unwrap();
        assert_eq!(file.slots.len(), 1);
        let reloaded = MetadataFile::load(&mut file).unwrap();
        assert_eq!(reloaded.effective_acl(subject), 0b0011);
    }

    #[test]
    fn effective_rights_mask_out_denied_bits() {
        let acv = AccessControlVector::new(0b1111, 0b0101);
        assert_eq!(acv.effective(), 0b1010);
    }

    #[test]
    fn free_slots_are_reused_before_appending() {
        let mut file = MemSlotFile::default();
        file.append_slot().unwrap(); // slot 0, tag FREE (zeroed)
        let mut mf = MetadataFile::load(&mut file).unwrap();
        assert_eq!(mf.free_list, vec![0]);
        mf.set_time(&mut file, TimeKind::Write, Timestamp { seconds: 1, nanos: 0 }).unwrap();
        assert_eq!(mf.write_slot, Some(0));
        assert_eq!(file.slots.len(), 1);
    }

    #[test]
    fn sid_packs_namespace_and_value() {
        let sid = Sid::new(0xAABB_CCDD, 0x1122_3344);
        assert_eq!(sid.namespace(), 0xAABB_CCDD);
        assert_eq!(sid.value(), 0x1122_3344);
    }
}
