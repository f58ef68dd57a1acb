//! Decomposition of a byte range into block-local pieces.

use vram_memory_pool::UNIT_SIZE;

/// The part of a request that falls inside one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub block: usize,
    pub block_offset: usize,
    pub len: usize,
    /// Where this piece starts in the caller's buffer.
    pub buf_offset: usize,
}

/// Iterator over the segments of `[offset, offset + len)`, in increasing
/// block order.
#[derive(Debug, Clone)]
pub struct Split {
    pos: u64,
    remaining: usize,
    buf_offset: usize,
}

pub fn split(offset: u64, len: usize) -> Split {
    Split {
        pos: offset,
        remaining: len,
        buf_offset: 0,
    }
}

impl Iterator for Split {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        if self.remaining == 0 {
            return None;
        }
        let block = (self.pos / UNIT_SIZE as u64) as usize;
        let block_offset = (self.pos % UNIT_SIZE as u64) as usize;
        let len = self.remaining.min(UNIT_SIZE - block_offset);
        let seg = Segment {
            block,
            block_offset,
            len,
            buf_offset: self.buf_offset,
        };
        self.pos += len as u64;
        self.remaining -= len;
        self.buf_offset += len;
        Some(seg)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.remaining == 0 {
            return (0, Some(0));
        }
        let first = (self.pos % UNIT_SIZE as u64) as usize;
        let n = (first + self.remaining).div_ceil(UNIT_SIZE);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Split {}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    const B: usize = UNIT_SIZE;

    #[test]
    fn empty_range_has_no_segments() {
        assert_eq!(split(12345, 0).count(), 0);
    }

    #[test]
    fn aligned_block() {
        let segs: Vec<_> = split(2 * B as u64, B).collect();
        assert_eq!(
            segs,
            vec![Segment {
                block: 2,
                block_offset: 0,
                len: B,
                buf_offset: 0
            }]
        );
    }

    #[test]
    fn straddles_three_blocks() {
        let segs: Vec<_> = split(B as u64 - 10, B + 20).collect();
        assert_eq!(segs.len(), 3);
        assert_eq!((segs[0].block, segs[0].block_offset, segs[0].len), (0, B - 10, 10));
        assert_eq!((segs[1].block, segs[1].block_offset, segs[1].len), (1, 0, B));
        assert_eq!((segs[2].block, segs[2].block_offset, segs[2].len), (2, 0, 10));
        assert_eq!(segs[2].buf_offset, B + 10);
    }

    #[test]
    fn random_ranges_tile_the_request() {
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let offset = rng.gen_range(0..64 * B as u64);
            let len = rng.gen_range(0..5 * B);
            let it = split(offset, len);
            assert_eq!(it.len(), it.clone().count());

            let mut pos = offset;
            let mut buf = 0;
            for seg in it {
                assert!(seg.len > 0 && seg.block_offset + seg.len <= B);
                assert_eq!(seg.block as u64 * B as u64 + seg.block_offset as u64, pos);
                assert_eq!(seg.buf_offset, buf);
                pos += seg.len as u64;
                buf += seg.len;
            }
            assert_eq!(buf, len);
        }
    }
}
