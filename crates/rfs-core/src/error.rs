//! Error taxonomy for the filesystem engine.
//!
//! Every fallible operation in this crate returns [`Error`]. Variants carry
//! enough context to log or display meaningfully; I/O failures keep the
//! original `std::io::Error` as their source rather than discarding it.

use thiserror::Error;

/// The single error type shared by every subsystem in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The allocator found no window satisfying a request.
    #[error("no free space for a request of {requested} block(s)")]
    NoSpace { requested: u64 },

    /// `Mft::allocate` scanned the whole table without finding a free slot.
    #[error("MFT table {table_id} has no free slot")]
    AllocFail { table_id: u32 },

    /// A create-file loop exhausted its retry budget across random tables.
    #[error("exhausted retry budget allocating a new file across all tables")]
    OutOfResources,

    /// An MFT read decoded a record whose `slot_idx`/`table_id` did not match
    /// the slot it was read from. This is also the on-disk encoding of "free".
    #[error("MFT entry {table_id}:{slot} is corrupt (or free)")]
    CorruptEntry { table_id: u32, slot: u32 },

    /// `Mft::build_chain` found a segment whose `first_idx` disagreed with the
    /// chain's head.
    #[error("extent chain headed at slot {head} is broken at slot {at}")]
    ChainCorrupt { head: u32, at: u32 },

    /// The superblock magic number did not match at load time.
    #[error("bad superblock magic: expected {expected:#010x}, found {found:#010x}")]
    BadMagic { expected: u32, found: u32 },

    /// The superblock's embedded CRC did not match the computed checksum.
    #[error("superblock CRC mismatch: expected {expected:#010x}, computed {found:#010x}")]
    BadCrc { expected: u32, found: u32 },

    /// A wrapped I/O failure from the backing device.
    #[error("device I/O error")]
    Io(#[from] std::io::Error),

    /// A directory or metadata lookup found nothing by that key.
    #[error("not found")]
    NotFound,

    /// A directory entry name was empty or exceeded 255 bytes.
    #[error("name length {0} is out of range 1..=255")]
    NameTooLong(usize),

    /// A file handle referred to a slot that is not a valid chain head, or
    /// whose cookie no longer matches the caller's expectation.
    #[error("invalid file handle (stale cookie or non-head slot)")]
    InvalidFile,

    /// A section view was accessed past its `[base, base+length)` bound.
    #[error("access past end of section (requested end {requested}, section length {length})")]
    EndOfRange { requested: u64, length: u64 },
}

impl Error {
    /// True for the errors that `Directory::add`/mkfs validation raise on a
    /// name that cannot ever be stored, independent of free space.
    pub fn is_name_too_long(&self) -> bool {
        matches!(self, Error::NameTooLong(_))
    }
}
