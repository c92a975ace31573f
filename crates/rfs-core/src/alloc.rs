//! Block allocator over the bitmap: contiguous allocation, appending
//! growth, best-effort fragmented allocation, and range free.
//!
//! Every method here assumes the caller already holds the filesystem's
//! `BMLck` for the duration of the call.

use crate::bitmap::{scan_clear, scan_set, try_alloc, BitmapRegion};
use crate::device::BlockDevice;
use crate::error::Error;

/// Upper bound on the scratch buffer used per windowed scan, in bytes.
const MAX_SCAN_BUFFER: u64 = 1 << 20;

fn window_bits(n: u64) -> u64 {
    let bytes = (n + 7) / 8 + 2;
    bytes.min(MAX_SCAN_BUFFER) * 8
}

/// An inclusive-exclusive block range `[begin, end)`.
pub type Range = (u64, u64);

pub struct Allocator<'a, D> {
    bitmap: BitmapRegion<'a, D>,
    total_blocks: u64,
}

impl<'a, D: BlockDevice> Allocator<'a, D> {
    pub fn new(bitmap: BitmapRegion<'a, D>, total_blocks: u64) -> Self {
        Self { bitmap, total_blocks }
    }

    /// Finds the lowest block position `p` such that `[p, p+n)` is entirely
    /// free, marks it allocated, and returns `[p, p+n)`.
    pub fn allocate_range(&mut self, n: u64) -> Result<Range, Error> {
        if n == 0 {
            return Ok((0, 0));
        }
        let window = window_bits(n);
        let total = self.total_blocks;
        let mut pos = 0u64;
        loop {
            if pos >= total {
                return Err(Error::NoSpace { requested: n });
            }
            let chunk_end = (pos + window).min(total);
            let lp = self.bitmap.apply(pos, chunk_end, false, |b, s, e| scan_clear(b, s, e))?;
            if lp >= chunk_end {
                if chunk_end >= total {
                    return Err(Error::NoSpace { requested: n });
                }
                pos = chunk_end;
                continue;
            }
            let run_end = self.measure_free_run(lp, n, total, window)?;
            if run_end - lp >= n {
                let goal = lp + n;
                self.bitmap.apply(lp, goal, true, |b, s, e| {
                    crate::bitmap::set_range(b, s, e);
                    e
                })?;
                return Ok((lp, goal));
            }
            if run_end >= total {
                return Err(Error::NoSpace { requested: n });
            }
            pos = run_end;
        }
    }

    /// Same search as [`Allocator::allocate_range`], but if no window of
    /// size `n` exists, commits the largest free extent seen provided its
    /// length is at least `min`.
    pub fn allocate_biggest(&mut self, n: u64, min: u64) -> Result<Range, Error> {
        if n == 0 {
            return Ok((0, 0));
        }
        let window = window_bits(n);
        let total = self.total_blocks;
        let mut pos = 0u64;
        let mut best: Option<Range> = None;
        loop {
            if pos >= total {
                break;
            }
            let chunk_end = (pos + window).min(total);
            let lp = self.bitmap.apply(pos, chunk_end, false, |b, s, e| scan_clear(b, s, e))?;
            if lp >= chunk_end {
                pos = chunk_end;
                continue;
            }
            let run_end = self.measure_free_run(lp, n, total, window)?;
            if run_end - lp >= n {
                let goal = lp + n;
                self.bitmap.apply(lp, goal, true, |b, s, e| {
                    crate::bitmap::set_range(b, s, e);
                    e
                })?;
                return Ok((lp, goal));
            }
            if best.map_or(true, |(bp, be)| run_end - lp > be - bp) {
                best = Some((lp, run_end));
            }
            if run_end >= total {
                break;
            }
            pos = run_end;
        }
        match best {
            Some((bp, be)) if be - bp >= min => {
                self.bitmap.apply(bp, be, true, |b, s, e| {
                    crate::bitmap::set_range(b, s, e);
                    e
                })?;
                Ok((bp, be))
            }
            _ => Err(Error::NoSpace { requested: n }),
        }
    }

    /// Extends the free run starting at `lp`, possibly across several scan
    /// windows, until either a set bit is found or the free run already
    /// covers `n` blocks. Returns the (possibly provisional) end of the
    /// free run.
    fn measure_free_run(&mut self, lp: u64, n: u64, total: u64, window: u64) -> Result<u64, Error> {
        let mut scan_pos = lp;
        loop {
            let probe_end = (scan_pos + window).min(total);
            let fp = self.bitmap.apply(scan_pos, probe_end, false, |b, s, e| scan_set(b, s, e))?;
            if fp < probe_end {
                return Ok(fp);
            }
            if probe_end >= total || probe_end - lp >= n {
                return Ok(probe_end);
            }
            scan_pos = probe_end;
        }
    }

    /// Marks `[pos, min(pos+n, total))` allocated, stopping at the first
    /// already-allocated bit. Returns the new end (`>= pos`); the caller
    /// compares it against `pos + n` to see whether the whole append
    /// succeeded.
    pub fn alloc_append(&mut self, pos: u64, n: u64) -> Result<u64, Error> {
        if n == 0 {
            return Ok(pos);
        }
        let total = self.total_blocks;
        if pos >= total {
            return Ok(pos);
        }
        let window = window_bits(n);
        let mut cur = pos;
        let want_end = (pos + n).min(total);
        loop {
            let chunk_end = (cur + window).min(want_end);
            if chunk_end <= cur {
                return Ok(cur);
            }
            let stop = self.bitmap.apply(cur, chunk_end, true, |b, s, e| try_alloc(b, s, e))?;
            if stop < chunk_end {
                return Ok(stop);
            }
            cur = chunk_end;
            if cur >= want_end {
                return Ok(cur);
            }
        }
    }

    /// Counts free (clear) blocks across the whole addressable range. Used
    /// by reporting tools, not by the hot allocation path.
    pub fn count_free(&mut self) -> Result<u64, Error> {
        self.bitmap.count_clear(self.total_blocks)
    }

    /// Clears bits in `[pos, end)`, iterating over bounded windows. Each
    /// iteration is required to make forward progress.
    pub fn free_range(&mut self, pos: u64, end: u64) -> Result<(), Error> {
        if pos >= end {
            return Ok(());
        }
        let window = window_bits(end - pos);
        let mut cur = pos;
        while cur < end {
            let chunk_end = (cur + window).min(end);
            self.bitmap.apply(cur, chunk_end, true, |b, s, e| {
                crate::bitmap::clear_range(b, s, e);
                e
            })?;
            if chunk_end <= cur {
                break;
            }
            cur = chunk_end;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MemDevice, Section};

    fn allocator(total_blocks: u64) -> (MemDevice, u64) {
        let bytes = (total_blocks + 7) / 8;
        (MemDevice::with_len(bytes), total_blocks)
    }

    #[test]
    fn allocate_range_finds_lowest_free_window() {
        let (mut dev, total) = allocator(64);
        let section = Section::new(&mut dev, 0, (total + 7) / 8);
        let mut alloc = Allocator::new(BitmapRegion::new(section), total);
        let (b, e) = alloc.allocate_range(4).unwrap();
        assert_eq!((b, e), (0, 4));
        let (b2, e2) = alloc.allocate_range(4).unwrap();
        assert_eq!((b2, e2), (4, 8));
    }

    #[test]
    fn allocate_range_exhausts_then_fails() {
        let (mut dev, total) = allocator(8);
        let section = Section::new(&mut dev, 0, 1);
        let mut alloc = Allocator::new(BitmapRegion::new(section), total);
        alloc.allocate_range(8).unwrap();
        let err = alloc.allocate_range(1).unwrap_err();
        assert!(matches!(err, Error::NoSpace { .. }));
    }

    #[test]
    fn allocate_biggest_falls_back_to_largest_extent() {
        let (mut dev, total) = allocator(16);
        let section = Section::new(&mut dev, 0, 2);
        let mut alloc = Allocator::new(BitmapRegion::new(section), total);
        // Reserve blocks to leave two free extents: [0,3) and [5,10).
        alloc.allocate_range(3).unwrap(); // uses [0,3)
        let (_, _) = alloc.allocate_range(2).unwrap(); // [3,5)
        // remaining free: [5,16)
        let (b, e) = alloc.allocate_biggest(20, 0).unwrap();
        assert_eq!((b, e), (5, 16));
    }

    #[test]
    fn alloc_append_stops_at_collision() {
        let (mut dev, total) = allocator(16);
        let section = Section::new(&mut dev, 0, 2);
        let mut alloc = Allocator::new(BitmapRegion::new(section), total);
        alloc.allocate_range(4).unwrap(); // [0,4)
        alloc.free_range(2, 4).unwrap(); // free [2,4), allocated stays [0,2)
        // appending at 4 for 4 blocks should succeed fully since [4,8) is free
        let new_end = alloc.alloc_append(4, 4).unwrap();
        assert_eq!(new_end, 8);
    }

    #[test]
    fn free_range_then_reallocate() {
        let (mut dev, total) = allocator(16);
        let section = Section::new(&mut dev, 0, 2);
        let mut alloc = Allocator::new(BitmapRegion::new(section), total);
        let (b, e) = alloc.allocate_range(8).unwrap();
        alloc.free_range(b, e).unwrap();
        let (b2, e2) = alloc.allocate_range(8).unwrap();
        assert_eq!((b2, e2), (b, e));
    }
}
