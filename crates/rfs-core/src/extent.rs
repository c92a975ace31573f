//! File extent engine: translates `(file, offset, length)` into device byte
//! ranges, and grows/shrinks files by composing the allocator and the MFT.
//!
//! All shape-changing operations here assume the caller already holds the
//! filesystem's `MFTLck` (and, transitively, `BMLck` while the allocator is
//! invoked — acquired in that order, never the reverse).

use crate::alloc::Allocator;
use crate::device::BlockDevice;
use crate::error::Error;
use crate::mft::{Chain, MftEntry};

/// One physical byte range to read or write on the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

/// Translates `[pos, pos+len)` (trimmed to the head's `file_size`) into a
/// sequence of device byte ranges. `chain` must include, per segment, the
/// segment's physical starting block (`chain.begins[i]`).
pub fn translate(block_size: u32, head: &MftEntry, chain: &Chain, pos: u64, len: u64) -> Vec<ByteRange> {
    let file_size = head.file_size.max(0) as u64;
    if pos >= file_size {
        return Vec::new();
    }
    let len = len.min(file_size - pos);
    if len == 0 {
        return Vec::new();
    }

    let b = block_size as u64;
    let end = pos + len;
    let first_block = pos / b;
    let last_block = (end + b - 1) / b; // exclusive

    let mut ranges = Vec::new();
    let mut vblock = first_block;
    while vblock < last_block {
        let Some((_, seg_idx)) = chain.find_block_offset(vblock) else {
            break;
        };
        let seg_start_vblock = chain.offsets[seg_idx];
        let seg_len_blocks = if seg_idx + 1 < chain.offsets.len() {
            chain.offsets[seg_idx + 1] - seg_start_vblock
        } else {
            chain.total_blocks - seg_start_vblock
        };
        let local_start = vblock - seg_start_vblock;
        let run_blocks = (seg_len_blocks - local_start).min(last_block - vblock);

        let phys_begin = chain.begins[seg_idx] + local_start;
        let run_byte_start_abs = vblock * b;
        let run_byte_end_abs = (vblock + run_blocks) * b;
        let trim_head = if vblock == first_block { pos - run_byte_start_abs } else { 0 };
        let trim_tail = run_byte_end_abs.saturating_sub(end);

        ranges.push(ByteRange {
            offset: phys_begin * b + trim_head,
            length: run_blocks * b - trim_head - trim_tail,
        });
        vblock += run_blocks;
    }
    ranges
}

/// A pending data-movement job produced while planning a grow, executed
/// against the device after the allocator lock has been released.
pub enum Job {
    Zero { begin_blk: u64, end_blk: u64 },
    Copy { from_begin: u64, to_begin: u64, blocks: u64 },
}

/// Whether a grow step satisfied the whole request or needs another
/// segment chained on to make up the residual.
pub enum GrowOutcome {
    Done,
    MoreNeeded { residual_blocks: u64 },
}

/// Plans growing one segment's extent by `n` blocks using the
/// allocate-in-place / append / best-fit cascade. Mutates
/// `entry`'s `begin_blk`/`end_blk` in place. Returns the jobs to run once
/// the bitmap lock is released, the old extent to free (if the segment
/// moved), and whether the caller must chain a new segment for a residual.
pub fn plan_grow<D: BlockDevice>(
    allocator: &mut Allocator<'_, D>,
    entry: &mut MftEntry,
    n: u64,
) -> Result<(Vec<Job>, Option<(u64, u64)>, GrowOutcome), Error> {
    let mut jobs = Vec::new();

    if entry.begin_blk == entry.end_blk {
        return match allocator.allocate_range(n) {
            Ok((b, e)) => {
                entry.begin_blk = b;
                entry.end_blk = e;
                jobs.push(Job::Zero { begin_blk: b, end_blk: e });
                let got = e - b;
                let outcome = if got < n {
                    GrowOutcome::MoreNeeded { residual_blocks: n - got }
                } else {
                    GrowOutcome::Done
                };
                Ok((jobs, None, outcome))
            }
            Err(Error::NoSpace { .. }) => Ok((jobs, None, GrowOutcome::MoreNeeded { residual_blocks: n })),
            Err(e) => Err(e),
        };
    }

    let appended_end = allocator.alloc_append(entry.end_blk, n)?;
    let appended = appended_end - entry.end_blk;
    if appended > 0 {
        jobs.push(Job::Zero { begin_blk: entry.end_blk, end_blk: appended_end });
        entry.end_blk = appended_end;
    }
    let ndiff = n - appended;
    if ndiff == 0 {
        return Ok((jobs, None, GrowOutcome::Done));
    }

    // The relocation target is the *whole* segment's final size (existing
    // content plus the still-missing growth), not just the shortfall — and
    // `minimum` must never drop below the existing content's length, or a
    // successful-but-undersized allocation would silently truncate the file.
    let old_len = entry.end_blk - entry.begin_blk;
    let target = old_len + ndiff;
    let minimum = old_len + ndiff / 2;
    match allocator.allocate_biggest(target, minimum) {
        Ok((nb, ne)) => {
            let new_len = ne - nb;
            jobs.push(Job::Copy { from_begin: entry.begin_blk, to_begin: nb, blocks: old_len });
            if new_len > old_len {
                jobs.push(Job::Zero { begin_blk: nb + old_len, end_blk: ne });
            }
            let freed = (entry.begin_blk, entry.end_blk);
            entry.begin_blk = nb;
            entry.end_blk = ne;
            let outcome = if new_len < target {
                GrowOutcome::MoreNeeded { residual_blocks: target - new_len }
            } else {
                GrowOutcome::Done
            };
            Ok((jobs, Some(freed), outcome))
        }
        Err(Error::NoSpace { .. }) => Ok((jobs, None, GrowOutcome::MoreNeeded { residual_blocks: ndiff })),
        Err(e) => Err(e),
    }
}

/// Runs zero/copy jobs against the device. No allocator lock is required:
/// the blocks involved are already committed to this file in the bitmap.
pub fn run_jobs<D: BlockDevice>(device: &mut D, block_size: u32, jobs: Vec<Job>) -> Result<(), Error> {
    let bs = block_size as u64;
    let zero_buf = vec![0u8; bs as usize];
    let mut copy_buf = vec![0u8; bs as usize];
    for job in jobs {
        match job {
            Job::Zero { begin_blk, end_blk } => {
                for blk in begin_blk..end_blk {
                    device.write_at(blk * bs, &zero_buf)?;
                }
            }
            Job::Copy { from_begin, to_begin, blocks } => {
                for i in 0..blocks {
                    device.read_at((from_begin + i) * bs, &mut copy_buf)?;
                    device.write_at((to_begin + i) * bs, &copy_buf)?;
                }
            }
        }
    }
    Ok(())
}

/// Determines the block count a file needs to hold `file_size` bytes, used
/// by `ShrinkDsk`.
pub fn blocks_needed(block_size: u32, file_size: i64) -> u64 {
    let b = block_size as u64;
    let size = file_size.max(0) as u64;
    (size + b - 1) / b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn chain_single(begin: u64, len_blocks: u64) -> Chain {
        Chain { slots: vec![1], offsets: vec![0], total_blocks: len_blocks, begins: vec![begin] }
    }

    #[test]
    fn translate_trims_to_file_size() {
        let head = MftEntry { file_size: 10, ..MftEntry::zeroed() };
        let chain = chain_single(0, 1);
        let ranges = translate(4096, &head, &chain, 0, 100);
        assert_eq!(ranges.iter().map(|r| r.length).sum::<u64>(), 10);
        assert_eq!(ranges[0].offset, 0);
    }

    #[test]
    fn translate_spans_multiple_segments() {
        let head = MftEntry { file_size: 4096 * 6, ..MftEntry::zeroed() };
        let chain = Chain {
            slots: vec![1, 2],
            offsets: vec![0, 4],
            total_blocks: 6,
            begins: vec![100, 500],
        };
        // bytes [4095, 4096*5) span the tail of segment 0 and all of segment 1's first 4 blocks
        let ranges = translate(4096, &head, &chain, 4095, 4096 * 5 - 4095);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0], ByteRange { offset: 100 * 4096 + 4095, length: 1 });
        assert_eq!(ranges[1], ByteRange { offset: 500 * 4096, length: 4096 * 4 });
    }

    #[test]
    fn plan_grow_allocates_fresh_extent_when_empty() {
        let mut dev = MemDevice::with_len(8);
        let section = crate::device::Section::new(&mut dev, 0, 8);
        let mut allocator = Allocator::new(crate::bitmap::BitmapRegion::new(section), 64);
        let mut entry = MftEntry::zeroed();
        let (jobs, freed, outcome) = plan_grow(&mut allocator, &mut entry, 4).unwrap();
        assert_eq!((entry.begin_blk, entry.end_blk), (0, 4));
        assert!(freed.is_none());
        assert!(matches!(outcome, GrowOutcome::Done));
        assert_eq!(jobs.len(), 1);
    }

    /// When in-place append is blocked and the best-fit fallback can only
    /// find an extent smaller than the full requested size, it must still
    /// be large enough to hold every existing block — and every existing
    /// block must be scheduled for copy, not just a prefix sized to the
    /// shortfall.
    #[test]
    fn plan_grow_relocation_preserves_all_existing_blocks_even_when_undersized() {
        let mut dev = MemDevice::with_len(3);
        let section = crate::device::Section::new(&mut dev, 0, 3);
        let mut allocator = Allocator::new(crate::bitmap::BitmapRegion::new(section), 23);

        // This entry owns blocks [0, 10); block 10 belongs to some other
        // file, so in-place append is immediately blocked.
        let (b, e) = allocator.allocate_range(10).unwrap();
        assert_eq!((b, e), (0, 10));
        allocator.allocate_range(1).unwrap(); // blocks the append at block 10

        // Only 12 blocks remain free ([11, 23)): less than the full target
        // of old_len(10) + ndiff(3) = 13, but still >= minimum.
        let mut entry = MftEntry { begin_blk: 0, end_blk: 10, ..MftEntry::zeroed() };
        let (jobs, freed, outcome) = plan_grow(&mut allocator, &mut entry, 3).unwrap();

        let copy = jobs
            .iter()
            .find_map(|j| match j {
                Job::Copy { from_begin, to_begin, blocks } => Some((*from_begin, *to_begin, *blocks)),
                _ => None,
            })
            .expect("relocation must schedule a copy of the existing extent");
        assert_eq!(copy.0, 0);
        assert_eq!(copy.2, 10, "all 10 existing blocks must be copied, not just the shortfall");
        assert_eq!(freed, Some((0, 10)));
        assert_eq!(entry.end_blk - entry.begin_blk, 12);
        assert!(matches!(outcome, GrowOutcome::MoreNeeded { residual_blocks: 1 }));
    }
}
