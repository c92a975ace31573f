//! Backing device abstraction: positioned I/O over the image, bounded
//! sub-region ("section") views, and an optional fsync-on-write wrapper.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::Error;

/// Random-access read/write over a fixed-size backing image.
///
/// Implementations are not required to be `Sync`; callers serialize access
/// themselves via the locking discipline described at the crate root.
pub trait BlockDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), Error>;
    fn sync(&mut self) -> Result<(), Error>;
    /// Total addressable length of the image, in bytes.
    fn len(&self) -> u64;
}

/// A plain `std::fs::File`-backed device. No implicit fsync; callers that
/// want crash safety wrap this in [`SyncDevice`].
pub struct FileDevice {
    file: File,
    len: u64,
}

impl FileDevice {
    pub fn open(file: File) -> std::io::Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }

    pub fn set_len(&mut self, len: u64) -> std::io::Result<()> {
        self.file.set_len(len)?;
        self.len = len;
        Ok(())
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), Error> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        if offset + buf.len() as u64 > self.len {
            self.len = offset + buf.len() as u64;
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<(), Error> {
        self.file.sync_all()?;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// Wraps any [`BlockDevice`] and issues a full sync after every write.
///
/// `mkfs` disables this (writing through the inner device directly) for
/// speed; a mounted, live filesystem wraps its device in this for crash
/// safety.
pub struct SyncDevice<D> {
    inner: D,
}

impl<D: BlockDevice> SyncDevice<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> D {
        self.inner
    }
}

impl<D: BlockDevice> BlockDevice for SyncDevice<D> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.inner.read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), Error> {
        self.inner.write_at(offset, buf)?;
        self.inner.sync()
    }

    fn sync(&mut self) -> Result<(), Error> {
        self.inner.sync()
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }
}

/// An in-memory device, used by the CLI tools only when explicitly asked to
/// buffer; also the harness every unit test in this crate mounts against.
#[derive(Default)]
pub struct MemDevice {
    data: Vec<u8>,
}

impl MemDevice {
    pub fn with_len(len: u64) -> Self {
        Self {
            data: vec![0u8; len as usize],
        }
    }
}

impl BlockDevice for MemDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(Error::EndOfRange {
                requested: end as u64,
                length: self.data.len() as u64,
            });
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), Error> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

/// A bounded view `[base, base+length)` over a device. `length` may be
/// widened or narrowed after construction — used when reading the MFT
/// header reveals the table's true length in blocks.
pub struct Section<'a, D> {
    device: &'a mut D,
    base: u64,
    length: u64,
}

impl<'a, D: BlockDevice> Section<'a, D> {
    pub fn new(device: &'a mut D, base: u64, length: u64) -> Self {
        Self { device, base, length }
    }

    pub fn set_length(&mut self, length: u64) {
        self.length = length;
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Reads `buf.len()` bytes at `offset` within the section. Fails with
    /// [`Error::EndOfRange`] if the access does not fit within `[0, length)`.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        let end = offset + buf.len() as u64;
        if end > self.length {
            return Err(Error::EndOfRange {
                requested: end,
                length: self.length,
            });
        }
        self.device.read_at(self.base + offset, buf)
    }

    /// Writes `buf` at `offset` within the section. Fails with
    /// [`Error::EndOfRange`] under the same rule as `read_at`.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), Error> {
        let end = offset + buf.len() as u64;
        if end > self.length {
            return Err(Error::EndOfRange {
                requested: end,
                length: self.length,
            });
        }
        self.device.write_at(self.base + offset, buf)
    }
}

/// Wraps a device and silently drops every write past the `N`th, simulating
/// a process that crashes mid-operation: the caller believes the write
/// succeeded (this returns `Ok`), but the bytes never reach the inner
/// device. Used only to exercise the crash-point scenarios in `fs.rs`'s
/// test module; not exposed outside the crate.
#[cfg(test)]
pub(crate) struct FaultDevice<D> {
    inner: D,
    writes_seen: u64,
    fail_after: u64,
}

#[cfg(test)]
impl<D: BlockDevice> FaultDevice<D> {
    pub(crate) fn new(inner: D, fail_after: u64) -> Self {
        Self { inner, writes_seen: 0, fail_after }
    }

    pub(crate) fn writes_seen(&self) -> u64 {
        self.writes_seen
    }

    pub(crate) fn into_inner(self) -> D {
        self.inner
    }
}

#[cfg(test)]
impl<D: BlockDevice> BlockDevice for FaultDevice<D> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.inner.read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), Error> {
        self.writes_seen += 1;
        if self.writes_seen > self.fail_after {
            return Ok(());
        }
        self.inner.write_at(offset, buf)
    }

    fn sync(&mut self) -> Result<(), Error> {
        self.inner.sync()
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }
}

/// Fixed-width record I/O: `read_index`/`write_index` perform positioned
/// access at `i * width` within a section. Used uniformly for MFT entries
/// (64 B), metadata entries (16 B), MFT headers, directory segments, and
/// the superblock.
pub struct FixedRecordIo {
    pub width: u64,
}

impl FixedRecordIo {
    pub fn new(width: u64) -> Self {
        Self { width }
    }

    pub fn read_index<D: BlockDevice>(
        &self,
        section: &mut Section<'_, D>,
        index: u64,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        debug_assert_eq!(buf.len() as u64, self.width);
        section.read_at(index * self.width, buf)
    }

    pub fn write_index<D: BlockDevice>(
        &self,
        section: &mut Section<'_, D>,
        index: u64,
        buf: &[u8],
    ) -> Result<(), Error> {
        debug_assert_eq!(buf.len() as u64, self.width);
        section.write_at(index * self.width, buf)
    }
}
