//! Block allocator over a packed free bitmap.
//!
//! One bit per block: 1 = free, 0 = used. Block 0 holds the superblock and
//! is permanently reserved. Allocation scans from a rotating cursor so that
//! writes spread across the device instead of churning the low blocks.
//! Every operation serializes on the allocator mutex.

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::FsError;

/// Summary counters for the block bitmap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockStats {
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub used_blocks: u32,
    pub usage_percent: f64,
}

struct AllocInner {
    /// Packed bitmap; bit i set means block i is free.
    bits: Vec<u8>,
    total_blocks: u32,
    cursor: u32,
}

impl AllocInner {
    fn is_free(&self, block: u32) -> bool {
        self.bits[block as usize / 8] & (1 << (block % 8)) != 0
    }

    fn set_free(&mut self, block: u32, free: bool) {
        let byte = block as usize / 8;
        let bit = 1u8 << (block % 8);
        if free {
            self.bits[byte] |= bit;
        } else {
            self.bits[byte] &= !bit;
        }
    }

    /// First free block at or after `start`, wrapping once around.
    fn find_free(&self, start: u32) -> Option<u32> {
        for step in 0..self.total_blocks {
            let block = (start + step) % self.total_blocks;
            if self.is_free(block) {
                return Some(block);
            }
        }
        None
    }

    fn free_count(&self) -> u32 {
        (0..self.total_blocks).filter(|b| self.is_free(*b)).count() as u32
    }
}

/// Thread-safe bitmap allocator for the data blocks of one image.
pub struct BlockAllocator {
    inner: Mutex<AllocInner>,
}

impl BlockAllocator {
    /// Creates an allocator with every block free except block 0.
    pub fn new(total_blocks: u32) -> Self {
        let mut inner = AllocInner {
            bits: vec![0xFF; (total_blocks as usize + 7) / 8],
            total_blocks,
            cursor: 1,
        };
        // Clear the phantom bits past total_blocks in the last byte.
        for block in total_blocks..((total_blocks + 7) / 8) * 8 {
            let byte = block as usize / 8;
            inner.bits[byte] &= !(1 << (block % 8));
        }
        if total_blocks > 0 {
            inner.set_free(0, false);
        }
        BlockAllocator { inner: Mutex::new(inner) }
    }

    /// Allocates the next free block after the cursor.
    pub fn allocate_one(&self) -> Result<u32, FsError> {
        let mut inner = self.inner.lock();
        let block = inner.find_free(inner.cursor).ok_or_else(|| {
            warn!("block bitmap exhausted");
            FsError::NoSpace { requested: 1, available: 0 }
        })?;
        inner.set_free(block, false);
        inner.cursor = (block + 1) % inner.total_blocks;
        debug!("allocated block {}", block);
        Ok(block)
    }

    /// Allocates `count` blocks, preferring one contiguous run.
    ///
    /// The run search starts at the cursor and wraps. A run never spans the
    /// wrap point because block 0 is always in use. When no run exists the
    /// allocation falls back to scattered single blocks; if even that runs
    /// dry, every block taken so far is released before the error returns.
    pub fn allocate_contiguous(&self, count: u32) -> Result<Vec<u32>, FsError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut inner = self.inner.lock();

        let mut run_start = inner.cursor;
        let mut run_len = 0u32;
        let mut block = inner.cursor;
        for _ in 0..inner.total_blocks {
            if inner.is_free(block) {
                if run_len == 0 {
                    run_start = block;
                }
                run_len += 1;
                if run_len == count {
                    let allocated: Vec<u32> = (run_start..run_start + count).collect();
                    for b in &allocated {
                        inner.set_free(*b, false);
                    }
                    inner.cursor = (run_start + count) % inner.total_blocks;
                    debug!("allocated {} contiguous blocks at {}", count, run_start);
                    return Ok(allocated);
                }
            } else {
                run_len = 0;
            }
            block = (block + 1) % inner.total_blocks;
        }

        warn!("no run of {} free blocks, falling back to scattered allocation", count);
        let mut allocated = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match inner.find_free(inner.cursor) {
                Some(b) => {
                    inner.set_free(b, false);
                    inner.cursor = (b + 1) % inner.total_blocks;
                    allocated.push(b);
                }
                None => {
                    for b in &allocated {
                        inner.set_free(*b, true);
                    }
                    let available = inner.free_count();
                    warn!(
                        "scattered allocation of {} blocks failed with {} available",
                        count, available
                    );
                    return Err(FsError::NoSpace { requested: count, available });
                }
            }
        }
        debug!("allocated {} scattered blocks", count);
        Ok(allocated)
    }

    /// Releases one block. Double frees are warned no-ops.
    pub fn free(&self, block: u32) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        if block >= inner.total_blocks {
            return Err(FsError::BlockNotFound { block });
        }
        if inner.is_free(block) {
            warn!("block {} is already free", block);
            return Ok(());
        }
        inner.set_free(block, true);
        debug!("freed block {}", block);
        Ok(())
    }

    /// Releases a batch of blocks. Every id is range checked before any
    /// bit changes so a bad id leaves the bitmap untouched.
    pub fn free_many(&self, blocks: &[u32]) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        if let Some(bad) = blocks.iter().find(|b| **b >= inner.total_blocks) {
            return Err(FsError::BlockNotFound { block: *bad });
        }
        for &block in blocks {
            if inner.is_free(block) {
                warn!("block {} is already free", block);
            } else {
                inner.set_free(block, true);
            }
        }
        debug!("freed {} blocks", blocks.len());
        Ok(())
    }

    /// True when the block is in range and free.
    pub fn is_free(&self, block: u32) -> bool {
        let inner = self.inner.lock();
        block < inner.total_blocks && inner.is_free(block)
    }

    /// Marks a block used without touching the cursor. Used during mount
    /// and log replay.
    pub fn mark_used(&self, block: u32) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        if block >= inner.total_blocks {
            return Err(FsError::BlockNotFound { block });
        }
        inner.set_free(block, false);
        Ok(())
    }

    /// Marks a block free without touching the cursor.
    pub fn mark_free(&self, block: u32) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        if block >= inner.total_blocks {
            return Err(FsError::BlockNotFound { block });
        }
        inner.set_free(block, true);
        Ok(())
    }

    /// Count of free blocks.
    pub fn free_count(&self) -> u32 {
        self.inner.lock().free_count()
    }

    /// Total block count.
    pub fn total(&self) -> u32 {
        self.inner.lock().total_blocks
    }

    /// Summary counters.
    pub fn stats(&self) -> BlockStats {
        let inner = self.inner.lock();
        let free = inner.free_count();
        let used = inner.total_blocks - free;
        BlockStats {
            total_blocks: inner.total_blocks,
            free_blocks: free,
            used_blocks: used,
            usage_percent: if inner.total_blocks == 0 {
                0.0
            } else {
                f64::from(used) / f64::from(inner.total_blocks) * 100.0
            },
        }
    }

    /// Serializes the packed bitmap, `ceil(total_blocks / 8)` bytes.
    pub fn serialize(&self) -> Vec<u8> {
        self.inner.lock().bits.clone()
    }

    /// Rebuilds the allocator from a serialized bitmap.
    pub fn deserialize(buf: &[u8], total_blocks: u32) -> Result<Self, FsError> {
        let expected = (total_blocks as usize + 7) / 8;
        if buf.len() < expected {
            return Err(FsError::CorruptedFilesystem {
                reason: format!("block bitmap truncated: {} bytes, expected {}", buf.len(), expected),
            });
        }
        let alloc = BlockAllocator {
            inner: Mutex::new(AllocInner {
                bits: buf[..expected].to_vec(),
                total_blocks,
                cursor: 1,
            }),
        };
        alloc.validate()?;
        Ok(alloc)
    }

    /// Rebuilds the bitmap from a known set of used blocks; everything
    /// else becomes free and block 0 stays reserved. Repair uses this
    /// after computing the union of all inode-reachable blocks.
    pub fn rebuild(&self, used: impl IntoIterator<Item = u32>) {
        let mut inner = self.inner.lock();
        let total = inner.total_blocks;
        for block in 1..total {
            inner.set_free(block, true);
        }
        if total > 0 {
            inner.set_free(0, false);
        }
        for block in used {
            if block < total {
                inner.set_free(block, false);
            }
        }
        inner.cursor = 1;
    }

    /// Structural invariants: bitmap length matches the geometry and block
    /// 0 is reserved.
    pub fn validate(&self) -> Result<(), FsError> {
        let inner = self.inner.lock();
        if inner.bits.len() != (inner.total_blocks as usize + 7) / 8 {
            return Err(FsError::CorruptedFilesystem {
                reason: "block bitmap length mismatch".into(),
            });
        }
        if inner.total_blocks > 0 && inner.is_free(0) {
            return Err(FsError::CorruptedFilesystem {
                reason: "block 0 must be reserved".into(),
            });
        }
        Ok(())
    }
}
