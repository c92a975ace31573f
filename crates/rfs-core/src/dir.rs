//! The directory engine: directories are files whose body is a sequence of
//! fixed-size segments holding packed, `name_len`-terminated entries, backed
//! by a two-tier name cache.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::error::Error;

/// The 17-byte payload of a directory entry: which file it names, a cookie
/// guarding against stale/reused slots, and the file's type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirValue {
    pub file_table: u32,
    pub file_slot: u32,
    pub cookie: u64,
    pub file_type: u8,
}

const VALUE_SIZE: usize = 4 + 4 + 8 + 1;

impl DirValue {
    fn to_bytes(self) -> [u8; VALUE_SIZE] {
        let mut out = [0u8; VALUE_SIZE];
        out[0..4].copy_from_slice(&self.file_table.to_be_bytes());
        out[4..8].copy_from_slice(&self.file_slot.to_be_bytes());
        out[8..16].copy_from_slice(&self.cookie.to_be_bytes());
        out[16] = self.file_type;
        out
    }

    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            file_table: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            file_slot: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            cookie: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
            file_type: buf[16],
        }
    }
}

/// A backing file a [`Directory`] reads and writes its segments against.
/// Implemented by the top-level filesystem by composing the extent engine,
/// the MFT, and the allocator; a directory itself knows nothing about
/// blocks or chains.
pub trait SegmentedFile {
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<(), Error>;
    fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<(), Error>;
    fn len(&self) -> u64;
    /// Grows the file to at least `new_len` bytes, zero-filling the
    /// extension.
    fn grow_to(&mut self, new_len: u64) -> Result<(), Error>;
}

const NAME_ENT_CAP: usize = 1024;
const NAME_POS_CAP: usize = 1024;

/// A segmented, cached directory view over a [`SegmentedFile`].
pub struct Directory {
    seg_size: u64,
    name_ent: LruCache<String, (u64, DirValue)>,
    name_pos: LruCache<String, u64>,
}

impl Directory {
    pub fn new(seg_size: u32) -> Self {
        Self {
            seg_size: seg_size as u64,
            name_ent: LruCache::new(NonZeroUsize::new(NAME_ENT_CAP).unwrap()),
            name_pos: LruCache::new(NonZeroUsize::new(NAME_POS_CAP).unwrap()),
        }
    }

    fn segment_count<F: SegmentedFile>(&self, file: &F) -> u64 {
        (file.len() + self.seg_size - 1) / self.seg_size
    }

    fn remember(&mut self, name: &str, seg_idx: u64, value: DirValue) {
        if let Some((evicted_name, _)) = self.name_ent.push(name.to_string(), (seg_idx, value)) {
            if evicted_name != name {
                self.name_pos.put(evicted_name, seg_idx);
            }
        }
    }

    /// Scans one segment, recording every entry it sees in `name_ent`.
    /// Returns the value for `name` if this segment holds it.
    fn scan_segment<F: SegmentedFile>(
        &mut self,
        file: &mut F,
        seg_idx: u64,
        name: &str,
    ) -> Result<Option<DirValue>, Error> {
        let mut buf = vec![0u8; self.seg_size as usize];
        file.read_at(seg_idx * self.seg_size, &mut buf)?;
        let mut found = None;
        let mut pos = 0usize;
        while pos < buf.len() {
            let name_len = buf[pos] as usize;
            if name_len == 0 {
                break;
            }
            let name_start = pos + 1;
            let name_end = name_start + name_len;
            let value_end = name_end + VALUE_SIZE;
            if value_end > buf.len() {
                break;
            }
            let entry_name = String::from_utf8_lossy(&buf[name_start..name_end]).into_owned();
            let value = DirValue::from_bytes(&buf[name_end..value_end]);
            if entry_name == name {
                found = Some(value);
            }
            self.remember(&entry_name, seg_idx, value);
            pos = value_end;
        }
        Ok(found)
    }

    /// Looks up `name`, consulting the cache before falling back to a
    /// linear scan of the directory's segments.
    pub fn search<F: SegmentedFile>(&mut self, file: &mut F, name: &str) -> Result<DirValue, Error> {
        if let Some(&(_, value)) = self.name_ent.get(name) {
            return Ok(value);
        }
        if let Some(&seg_idx) = self.name_pos.get(name) {
            if let Some(value) = self.scan_segment(file, seg_idx, name)? {
                return Ok(value);
            }
        }
        let segments = self.segment_count(file);
        for seg_idx in 0..segments {
            if let Some(value) = self.scan_segment(file, seg_idx, name)? {
                return Ok(value);
            }
        }
        Err(Error::NotFound)
    }

    /// Appends `(name, value)` to the first segment with room, growing the
    /// directory file by one segment if none has space.
    pub fn add<F: SegmentedFile>(&mut self, file: &mut F, name: &str, value: DirValue) -> Result<(), Error> {
        if name.is_empty() || name.len() > 255 {
            return Err(Error::NameTooLong(name.len()));
        }
        let record_len = 1 + name.len() + VALUE_SIZE;
        if record_len > self.seg_size as usize {
            return Err(Error::NameTooLong(name.len()));
        }

        let mut record = Vec::with_capacity(record_len);
        record.push(name.len() as u8);
        record.extend_from_slice(name.as_bytes());
        record.extend_from_slice(&value.to_bytes());

        let segments = self.segment_count(file);
        for seg_idx in 0..segments {
            let mut buf = vec![0u8; self.seg_size as usize];
            file.read_at(seg_idx * self.seg_size, &mut buf)?;
            let insert_at = Self::first_free_offset(&buf);
            if insert_at + record_len <= buf.len() {
                buf[insert_at..insert_at + record_len].copy_from_slice(&record);
                file.write_at(seg_idx * self.seg_size, &buf)?;
                self.remember(name, seg_idx, value);
                return Ok(());
            }
        }

        let new_seg = segments;
        file.grow_to((new_seg + 1) * self.seg_size)?;
        let mut buf = vec![0u8; self.seg_size as usize];
        buf[0..record_len].copy_from_slice(&record);
        file.write_at(new_seg * self.seg_size, &buf)?;
        self.remember(name, new_seg, value);
        Ok(())
    }

    fn first_free_offset(buf: &[u8]) -> usize {
        let mut pos = 0;
        while pos < buf.len() {
            let name_len = buf[pos] as usize;
            if name_len == 0 {
                return pos;
            }
            let advance = 1 + name_len + VALUE_SIZE;
            if pos + advance > buf.len() {
                return buf.len();
            }
            pos += advance;
        }
        pos
    }

    /// Locates `name`, then rewrites its segment with the entry removed and
    /// every following entry shifted left.
    pub fn delete<F: SegmentedFile>(&mut self, file: &mut F, name: &str) -> Result<DirValue, Error> {
        let value = self.search(file, name)?;
        let seg_idx = self
            .name_ent
            .peek(name)
            .map(|&(s, _)| s)
            .expect("search just populated name_ent for this name");

        let mut buf = vec![0u8; self.seg_size as usize];
        file.read_at(seg_idx * self.seg_size, &mut buf)?;
        let mut out = vec![0u8; self.seg_size as usize];
        let mut read_pos = 0usize;
        let mut write_pos = 0usize;
        while read_pos < buf.len() {
            let name_len = buf[read_pos] as usize;
            if name_len == 0 {
                break;
            }
            let entry_len = 1 + name_len + VALUE_SIZE;
            let entry_name = String::from_utf8_lossy(&buf[read_pos + 1..read_pos + 1 + name_len]).into_owned();
            if entry_name != name {
                out[write_pos..write_pos + entry_len].copy_from_slice(&buf[read_pos..read_pos + entry_len]);
                write_pos += entry_len;
            }
            read_pos += entry_len;
        }
        file.write_at(seg_idx * self.seg_size, &out)?;

        self.name_ent.pop(name);
        self.name_pos.pop(name);
        Ok(value)
    }

    /// True if every segment's first entry slot is the empty sentinel.
    pub fn is_empty<F: SegmentedFile>(&mut self, file: &mut F) -> Result<bool, Error> {
        let segments = self.segment_count(file);
        for seg_idx in 0..segments {
            let mut buf = vec![0u8; self.seg_size as usize];
            file.read_at(seg_idx * self.seg_size, &mut buf)?;
            if buf[0] != 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Visits every entry in segment order, calling `visit` with each
    /// `(name, value)`. `visit` returns `false` to stop early; the caller
    /// plays the consumer side of a bounded producer/consumer listing,
    /// expressed here as a plain callback rather than a literal channel.
    pub fn list_up<F: SegmentedFile>(
        &mut self,
        file: &mut F,
        mut visit: impl FnMut(&str, DirValue) -> bool,
    ) -> Result<(), Error> {
        let segments = self.segment_count(file);
        'segs: for seg_idx in 0..segments {
            let mut buf = vec![0u8; self.seg_size as usize];
            file.read_at(seg_idx * self.seg_size, &mut buf)?;
            let mut pos = 0usize;
            while pos < buf.len() {
                let name_len = buf[pos] as usize;
                if name_len == 0 {
                    break;
                }
                let name_start = pos + 1;
                let name_end = name_start + name_len;
                let value_end = name_end + VALUE_SIZE;
                if value_end > buf.len() {
                    break;
                }
                let name = String::from_utf8_lossy(&buf[name_start..name_end]).into_owned();
                let value = DirValue::from_bytes(&buf[name_end..value_end]);
                self.remember(&name, seg_idx, value);
                if !visit(&name, value) {
                    break 'segs;
                }
                pos = value_end;
            }
        }
        Ok(())
    }
}

/// In-memory [`SegmentedFile`] used by unit tests; grows by appending
/// zero-filled bytes, never shrinks.
#[derive(Default)]
pub struct MemFile {
    data: Vec<u8>,
}

impl SegmentedFile for MemFile {
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<(), Error> {
        let start = pos as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(Error::EndOfRange { requested: end as u64, length: self.data.len() as u64 });
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<(), Error> {
        let start = pos as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn grow_to(&mut self, new_len: u64) -> Result<(), Error> {
        if new_len > self.data.len() as u64 {
            self.data.resize(new_len as usize, 0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(slot: u32) -> DirValue {
        DirValue { file_table: 7, file_slot: slot, cookie: 0xABCD, file_type: 0xF0 }
    }

    #[test]
    fn add_then_search_round_trips() {
        let mut file = MemFile::default();
        let mut dir = Directory::new(256);
        dir.add(&mut file, "hello.txt", value(1)).unwrap();
        let found = dir.search(&mut file, "hello.txt").unwrap();
        assert_eq!(found, value(1));
    }

    #[test]
    fn search_missing_name_is_not_found() {
        let mut file = MemFile::default();
        let mut dir = Directory::new(256);
        dir.add(&mut file, "a", value(1)).unwrap();
        assert!(matches!(dir.search(&mut file, "b"), Err(Error::NotFound)));
    }

    #[test]
    fn rejects_empty_and_oversized_names() {
        let mut file = MemFile::default();
        let mut dir = Directory::new(256);
        assert!(dir.add(&mut file, "", value(1)).is_err());
        let long = "x".repeat(256);
        assert!(dir.add(&mut file, &long, value(1)).is_err());
        let max = "x".repeat(255);
        // Fits the 255-byte name boundary but not necessarily this tiny segment.
        let mut dir2 = Directory::new(4096);
        assert!(dir2.add(&mut file, &max, value(1)).is_ok());
    }

    #[test]
    fn delete_removes_entry_and_cache() {
        let mut file = MemFile::default();
        let mut dir = Directory::new(256);
        dir.add(&mut file, "a", value(1)).unwrap();
        dir.add(&mut file, "b", value(2)).unwrap();
        let removed = dir.delete(&mut file, "a").unwrap();
        assert_eq!(removed, value(1));
        assert!(matches!(dir.search(&mut file, "a"), Err(Error::NotFound)));
        assert_eq!(dir.search(&mut file, "b").unwrap(), value(2));
    }

    #[test]
    fn is_empty_true_until_first_add() {
        let mut file = MemFile::default();
        let mut dir = Directory::new(256);
        assert!(dir.is_empty(&mut file).unwrap());
        dir.add(&mut file, "a", value(1)).unwrap();
        assert!(!dir.is_empty(&mut file).unwrap());
    }

    #[test]
    fn add_spills_into_new_segment_when_full() {
        let mut file = MemFile::default();
        // Segment fits exactly one "aa"-named (record_len = 1+2+17 = 20) entry twice: 40 bytes.
        let mut dir = Directory::new(20);
        dir.add(&mut file, "aa", value(1)).unwrap();
        dir.add(&mut file, "bb", value(2)).unwrap();
        assert_eq!(file.len(), 40);
        assert_eq!(dir.search(&mut file, "aa").unwrap(), value(1));
        assert_eq!(dir.search(&mut file, "bb").unwrap(), value(2));
    }

    #[test]
    fn list_up_visits_every_entry_in_order() {
        let mut file = MemFile::default();
        let mut dir = Directory::new(256);
        dir.add(&mut file, "a", value(1)).unwrap();
        dir.add(&mut file, "b", value(2)).unwrap();
        let mut seen = Vec::new();
        dir.list_up(&mut file, |name, v| {
            seen.push((name.to_string(), v));
            true
        })
        .unwrap();
        assert_eq!(seen, vec![("a".to_string(), value(1)), ("b".to_string(), value(2))]);
    }

    #[test]
    fn list_up_stops_when_visitor_returns_false() {
        let mut file = MemFile::default();
        let mut dir = Directory::new(256);
        dir.add(&mut file, "a", value(1)).unwrap();
        dir.add(&mut file, "b", value(2)).unwrap();
        let mut count = 0;
        dir.list_up(&mut file, |_, _| {
            count += 1;
            false
        })
        .unwrap();
        assert_eq!(count, 1);
    }
}
