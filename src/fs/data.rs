//! File data I/O across the block-pointer tree.
//!
//! Logical block `i` of a file maps onto the inode's pointers with
//! `P = block_size / 4` pointers per indirect block:
//!
//! ```text
//! i < 12                      direct[i]
//! i < 12 + P                  single indirect
//! i < 12 + P + P^2            double indirect
//! i < 12 + P + P^2 + P^3      triple indirect
//! ```
//!
//! Reads that cross an unassigned pointer see zeroes (sparse reads).
//! Writes allocate missing indirect and data blocks lazily, charge them to
//! the inode's block count, and log one `WriteBlock` record per block
//! touched. Indirect blocks are staged in memory while an extent is being
//! written so each one is persisted and logged once, after its last
//! pointer update.

use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::device::DataBlock;
use crate::error::FsError;
use crate::fs::Volume;
use crate::inode::{Inode, DIRECT_POINTERS};
use crate::wal::{LogOp, LogRecord, TransactionGuard};

/// Position of a logical block within the pointer tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockPath {
    Direct(usize),
    Single(u64),
    Double(u64, u64),
    Triple(u64, u64, u64),
}

fn locate(logical: u64, pointers_per_block: u64) -> Result<BlockPath, FsError> {
    let p = pointers_per_block;
    let direct = DIRECT_POINTERS as u64;
    if logical < direct {
        return Ok(BlockPath::Direct(logical as usize));
    }
    let mut rest = logical - direct;
    if rest < p {
        return Ok(BlockPath::Single(rest));
    }
    rest -= p;
    if rest < p * p {
        return Ok(BlockPath::Double(rest / p, rest % p));
    }
    rest -= p * p;
    if rest < p * p * p {
        return Ok(BlockPath::Triple(rest / (p * p), rest / p % p, rest % p));
    }
    Err(FsError::OutOfBounds {
        offset: logical,
        len: 1,
        bound: direct + p + p * p + p * p * p,
    })
}

fn read_pointer(vol: &Volume, block: u32, index: u64) -> Result<u32, FsError> {
    let data = vol.device.read_block(block)?;
    Ok(LittleEndian::read_u32(&data[index as usize * 4..index as usize * 4 + 4]))
}

/// Resolves a logical block to its device block, or 0 when any pointer on
/// the way is unassigned.
fn lookup_block(vol: &Volume, inode: &Inode, logical: u64) -> Result<u32, FsError> {
    let p = vol.device.geometry().pointers_per_block();
    Ok(match locate(logical, p)? {
        BlockPath::Direct(i) => inode.direct[i],
        BlockPath::Single(i) => match inode.single_indirect {
            0 => 0,
            ind => read_pointer(vol, ind, i)?,
        },
        BlockPath::Double(i, j) => match inode.double_indirect {
            0 => 0,
            ind => match read_pointer(vol, ind, i)? {
                0 => 0,
                mid => read_pointer(vol, mid, j)?,
            },
        },
        BlockPath::Triple(i, j, k) => match inode.triple_indirect {
            0 => 0,
            ind => match read_pointer(vol, ind, i)? {
                0 => 0,
                mid => match read_pointer(vol, mid, j)? {
                    0 => 0,
                    low => read_pointer(vol, low, k)?,
                },
            },
        },
    })
}

/// Reads a file's full content, assembling sparse regions as zeroes.
pub(super) fn read_all(vol: &Volume, inode: &Inode) -> Result<Vec<u8>, FsError> {
    let bs = vol.device.geometry().block_size as u64;
    let mut out = vec![0u8; inode.size as usize];
    let mut offset = 0u64;
    let mut logical = 0u64;
    while offset < inode.size {
        let take = (inode.size - offset).min(bs) as usize;
        let block = lookup_block(vol, inode, logical)?;
        if block != 0 {
            let data = vol.device.read_block(block)?;
            out[offset as usize..offset as usize + take].copy_from_slice(&data[..take]);
        }
        offset += take as u64;
        logical += 1;
    }
    Ok(out)
}

/// Every block reachable from an inode's pointer tree.
#[derive(Debug, Default)]
pub(super) struct ReachableBlocks {
    pub data: Vec<u32>,
    pub indirect: Vec<u32>,
}

impl ReachableBlocks {
    /// Count of all reachable blocks, data and indirect alike. This is the
    /// figure the inode's `blocks` field must match.
    pub fn total(&self) -> u64 {
        (self.data.len() + self.indirect.len()) as u64
    }

    pub fn all(&self) -> impl Iterator<Item = u32> + '_ {
        self.data.iter().chain(self.indirect.iter()).copied()
    }
}

fn collect_pointer_block(
    vol: &Volume,
    block: u32,
    depth: u8,
    out: &mut ReachableBlocks,
) -> Result<(), FsError> {
    out.indirect.push(block);
    let data = vol.device.read_block(block)?;
    for chunk in data.chunks_exact(4) {
        let ptr = LittleEndian::read_u32(chunk);
        if ptr == 0 {
            continue;
        }
        if depth == 0 {
            out.data.push(ptr);
        } else {
            collect_pointer_block(vol, ptr, depth - 1, out)?;
        }
    }
    Ok(())
}

/// Walks the whole pointer tree and returns every assigned block.
pub(super) fn collect_blocks(vol: &Volume, inode: &Inode) -> Result<ReachableBlocks, FsError> {
    let mut out = ReachableBlocks::default();
    for ptr in inode.direct {
        if ptr != 0 {
            out.data.push(ptr);
        }
    }
    if inode.single_indirect != 0 {
        collect_pointer_block(vol, inode.single_indirect, 0, &mut out)?;
    }
    if inode.double_indirect != 0 {
        collect_pointer_block(vol, inode.double_indirect, 1, &mut out)?;
    }
    if inode.triple_indirect != 0 {
        collect_pointer_block(vol, inode.triple_indirect, 2, &mut out)?;
    }
    Ok(out)
}

/// Logs a `FreeBlock` record for every block reachable from the inode and
/// zeroes the inode's pointers and block count.
///
/// The bitmap and counters are untouched here: the caller releases the
/// returned blocks with [`release_blocks`] only after the transaction
/// commits, so a failed commit leaves the in-memory state exactly as it
/// was.
pub(super) fn stage_clear(
    vol: &Volume,
    txn: &TransactionGuard<'_>,
    inode: &mut Inode,
) -> Result<ReachableBlocks, FsError> {
    let reachable = collect_blocks(vol, inode)?;
    for block in reachable.all() {
        txn.append(LogRecord::new(LogOp::FreeBlock, 0, block))?;
    }
    debug!("staged release of {} blocks", reachable.total());
    inode.direct = [0; DIRECT_POINTERS];
    inode.single_indirect = 0;
    inode.double_indirect = 0;
    inode.triple_indirect = 0;
    inode.blocks = 0;
    Ok(reachable)
}

/// Returns blocks to the allocator and the superblock counters. Used both
/// to apply a staged release after commit and to reverse the allocations
/// of a failed operation; double frees only warn.
pub(super) fn release_blocks(vol: &Volume, blocks: impl IntoIterator<Item = u32>) {
    for block in blocks {
        if vol.allocator.free(block).is_err() {
            continue;
        }
        let _ = vol.superblock.lock().deallocate_block();
    }
}

/// Staged writer for one contiguous byte extent of a file.
///
/// Data blocks are written through (and logged) as they fill; indirect
/// blocks stay in the staging map until `finish`, so each is written and
/// logged exactly once per extent.
struct ExtentWriter<'a, 'b> {
    vol: &'a Volume,
    txn: &'a TransactionGuard<'b>,
    /// Dirty indirect blocks, by block number.
    staged: HashMap<u32, Vec<u8>>,
    /// Every block allocated by this writer, for rollback by the caller.
    allocated: Vec<u32>,
    /// Bitmap-reserved blocks handed in by the caller, drawn before the
    /// allocator is asked for more. Stored reversed so `pop` yields them
    /// in their original order.
    pool: Vec<u32>,
}

impl<'a, 'b> ExtentWriter<'a, 'b> {
    fn new(vol: &'a Volume, txn: &'a TransactionGuard<'b>, mut pool: Vec<u32>) -> Self {
        pool.reverse();
        ExtentWriter { vol, txn, staged: HashMap::new(), allocated: Vec::new(), pool }
    }

    fn alloc_block(&mut self, inode: &mut Inode) -> Result<u32, FsError> {
        let block = match self.pool.pop() {
            Some(reserved) => reserved,
            None => self.vol.allocator.allocate_one()?,
        };
        if let Err(e) = self.vol.superblock.lock().allocate_block() {
            let _ = self.vol.allocator.free(block);
            return Err(e);
        }
        self.allocated.push(block);
        inode.blocks += 1;
        Ok(block)
    }

    fn pointer_block(&mut self, block: u32) -> Result<&mut Vec<u8>, FsError> {
        if !self.staged.contains_key(&block) {
            let data = self.vol.device.read_block(block)?;
            self.staged.insert(block, data);
        }
        Ok(self.staged.get_mut(&block).expect("just inserted"))
    }

    fn get_pointer(&mut self, block: u32, index: u64) -> Result<u32, FsError> {
        let data = self.pointer_block(block)?;
        let at = index as usize * 4;
        Ok(LittleEndian::read_u32(&data[at..at + 4]))
    }

    fn set_pointer(&mut self, block: u32, index: u64, value: u32) -> Result<(), FsError> {
        let data = self.pointer_block(block)?;
        let at = index as usize * 4;
        LittleEndian::write_u32(&mut data[at..at + 4], value);
        Ok(())
    }

    /// Allocates a zeroed indirect block and stages it.
    fn alloc_pointer_block(&mut self, inode: &mut Inode) -> Result<u32, FsError> {
        let block = self.alloc_block(inode)?;
        let bs = self.vol.device.geometry().block_size as usize;
        self.staged.insert(block, vec![0u8; bs]);
        Ok(block)
    }

    /// Walks one level of the tree, allocating the child when missing.
    fn child(&mut self, parent: u32, index: u64, inode: &mut Inode) -> Result<u32, FsError> {
        let existing = self.get_pointer(parent, index)?;
        if existing != 0 {
            return Ok(existing);
        }
        let fresh = self.alloc_pointer_block(inode)?;
        self.set_pointer(parent, index, fresh)?;
        Ok(fresh)
    }

    /// Resolves the device block for `logical`, allocating the data block
    /// and any missing indirect links.
    fn ensure_block(&mut self, inode: &mut Inode, logical: u64) -> Result<u32, FsError> {
        let p = self.vol.device.geometry().pointers_per_block();
        match locate(logical, p)? {
            BlockPath::Direct(i) => {
                if inode.direct[i] == 0 {
                    inode.direct[i] = self.alloc_block(inode)?;
                }
                Ok(inode.direct[i])
            }
            BlockPath::Single(i) => {
                if inode.single_indirect == 0 {
                    inode.single_indirect = self.alloc_pointer_block(inode)?;
                }
                self.leaf(inode.single_indirect, i, inode)
            }
            BlockPath::Double(i, j) => {
                if inode.double_indirect == 0 {
                    inode.double_indirect = self.alloc_pointer_block(inode)?;
                }
                let mid = self.child(inode.double_indirect, i, inode)?;
                self.leaf(mid, j, inode)
            }
            BlockPath::Triple(i, j, k) => {
                if inode.triple_indirect == 0 {
                    inode.triple_indirect = self.alloc_pointer_block(inode)?;
                }
                let mid = self.child(inode.triple_indirect, i, inode)?;
                let low = self.child(mid, j, inode)?;
                self.leaf(low, k, inode)
            }
        }
    }

    /// Bottom level: the pointer slot names a data block.
    fn leaf(&mut self, parent: u32, index: u64, inode: &mut Inode) -> Result<u32, FsError> {
        let existing = self.get_pointer(parent, index)?;
        if existing != 0 {
            return Ok(existing);
        }
        let fresh = self.alloc_block(inode)?;
        self.set_pointer(parent, index, fresh)?;
        Ok(fresh)
    }

    /// Persists and logs every staged indirect block.
    fn finish(&mut self) -> Result<(), FsError> {
        for (block, data) in &self.staged {
            self.vol.device.write_block(*block, data)?;
            self.txn.append(
                LogRecord::new(LogOp::WriteBlock, 0, *block).with_new_data(data.clone()),
            )?;
        }
        Ok(())
    }
}

/// Writes `data` into the file at `offset`, allocating blocks as needed.
///
/// The caller passes a scratch copy of the inode; the table is only
/// updated once the whole extent succeeds. On success the list of newly
/// allocated blocks is returned so a later failure in the same operation
/// can still release them. On failure this function releases its own
/// allocations before returning.
pub(super) fn write_extent(
    vol: &Volume,
    txn: &TransactionGuard<'_>,
    inode: &mut Inode,
    offset: u64,
    data: &[u8],
) -> Result<Vec<u32>, FsError> {
    write_extent_from(vol, txn, inode, offset, data, Vec::new())
}

/// Like [`write_extent`], drawing data blocks from `pool` first.
///
/// The pool holds blocks already reserved in the bitmap (typically one
/// contiguous run sized for the whole extent) but not yet charged to the
/// superblock counters; charging happens as each block is taken. Whatever
/// is left over, on success or failure, goes back to the bitmap.
pub(super) fn write_extent_from(
    vol: &Volume,
    txn: &TransactionGuard<'_>,
    inode: &mut Inode,
    offset: u64,
    data: &[u8],
    pool: Vec<u32>,
) -> Result<Vec<u32>, FsError> {
    let geo = vol.device.geometry();
    let end = offset + data.len() as u64;
    if end > geo.max_file_size() {
        release_blocks_uncharged(vol, pool);
        return Err(FsError::OutOfBounds {
            offset,
            len: data.len() as u64,
            bound: geo.max_file_size(),
        });
    }

    let before = *inode;
    let mut writer = ExtentWriter::new(vol, txn, pool);
    let result =
        write_extent_inner(&mut writer, inode, offset, data).and_then(|()| writer.finish());
    let leftover: Vec<u32> = writer.pool.drain(..).collect();
    release_blocks_uncharged(vol, leftover);
    match result {
        Ok(()) => Ok(writer.allocated),
        Err(e) => {
            release_blocks(vol, writer.allocated.iter().copied());
            *inode = before;
            Err(e)
        }
    }
}

/// Returns bitmap-reserved blocks that were never charged to the
/// superblock counters.
fn release_blocks_uncharged(vol: &Volume, blocks: Vec<u32>) {
    for block in blocks {
        let _ = vol.allocator.free(block);
    }
}

fn write_extent_inner(
    writer: &mut ExtentWriter<'_, '_>,
    inode: &mut Inode,
    offset: u64,
    data: &[u8],
) -> Result<(), FsError> {
    let bs = writer.vol.device.geometry().block_size as u64;
    let mut written = 0u64;
    while written < data.len() as u64 {
        let pos = offset + written;
        let logical = pos / bs;
        let in_block = pos % bs;
        let take = (bs - in_block).min(data.len() as u64 - written) as usize;

        let block = writer.ensure_block(inode, logical)?;
        let whole_block = in_block == 0 && take as u64 == bs;
        let content = if whole_block {
            data[written as usize..written as usize + take].to_vec()
        } else {
            // Partial block: overlay onto the existing content. A block
            // allocated within this extent starts out as zeroes, whatever
            // its previous life left on the device.
            let base = if writer.allocated.contains(&block) {
                vec![0u8; bs as usize]
            } else {
                writer.vol.device.read_block(block)?
            };
            let mut staged = DataBlock::from_bytes(base);
            staged.write(&data[written as usize..written as usize + take], in_block as usize)?;
            staged.into_bytes()
        };
        writer.vol.device.write_block(block, &content)?;
        writer
            .txn
            .append(LogRecord::new(LogOp::WriteBlock, 0, block).with_new_data(content))?;
        written += take as u64;
    }
    Ok(())
}
