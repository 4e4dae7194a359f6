//! Device image access.
//!
//! The filesystem lives inside one regular host file laid out as:
//!
//! ```text
//! +--------------------+ offset 0
//! | Superblock         | 128-byte record, padded to block_size
//! +--------------------+ offset block_size
//! | Inode table        | inode_count * 128 bytes
//! | Inode free bitmap  | ceil(inode_count / 8) bytes
//! | Block free bitmap  | ceil(total_blocks / 8) bytes
//! +--------------------+ next block_size boundary
//! | Data blocks        | block b at data_start + (b - 1) * block_size
//! +--------------------+
//! ```
//!
//! Block 0 is the superblock; data block numbers start at 1. All integers
//! in the image are little-endian.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;
use parking_lot::Mutex;

use crate::error::FsError;
use crate::inode::INODE_SIZE;
use crate::superblock::{Superblock, SUPERBLOCK_SIZE};

/// Default block size used by format when the caller has no preference.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Byte offsets of every region in the image, derived from the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: u32,
    pub total_blocks: u32,
    pub inode_count: u32,
}

impl Geometry {
    pub fn from_superblock(sb: &Superblock) -> Self {
        Geometry {
            block_size: sb.block_size,
            total_blocks: sb.total_blocks,
            inode_count: sb.inode_count,
        }
    }

    /// Inode table begins right after the superblock's block.
    pub fn inode_table_offset(&self) -> u64 {
        u64::from(self.block_size)
    }

    pub fn inode_table_len(&self) -> u64 {
        u64::from(self.inode_count) * INODE_SIZE as u64
    }

    pub fn inode_bitmap_len(&self) -> u64 {
        (u64::from(self.inode_count) + 7) / 8
    }

    /// Inode table plus its free bitmap, serialized as one region.
    pub fn inode_region_len(&self) -> u64 {
        self.inode_table_len() + self.inode_bitmap_len()
    }

    pub fn block_bitmap_offset(&self) -> u64 {
        self.inode_table_offset() + self.inode_region_len()
    }

    pub fn block_bitmap_len(&self) -> u64 {
        (u64::from(self.total_blocks) + 7) / 8
    }

    /// First byte of the data area, aligned up to a block boundary.
    pub fn data_offset(&self) -> u64 {
        let end = self.block_bitmap_offset() + self.block_bitmap_len();
        let bs = u64::from(self.block_size);
        (end + bs - 1) / bs * bs
    }

    /// Byte offset of data block `block` (1-based).
    pub fn block_offset(&self, block: u32) -> u64 {
        self.data_offset() + u64::from(block - 1) * u64::from(self.block_size)
    }

    /// Total image length in bytes.
    pub fn image_len(&self) -> u64 {
        self.data_offset() + u64::from(self.total_blocks - 1) * u64::from(self.block_size)
    }

    /// Pointers held by one indirect block.
    pub fn pointers_per_block(&self) -> u64 {
        u64::from(self.block_size) / 4
    }

    /// Largest file size the pointer tree can address.
    pub fn max_file_size(&self) -> u64 {
        let p = self.pointers_per_block();
        let blocks = 12 + p + p * p + p * p * p;
        blocks.saturating_mul(u64::from(self.block_size))
    }
}

/// Handle on the device image file.
///
/// All access goes through seek-and-read under the file mutex; callers
/// provide higher-level ordering through the facade locks.
pub struct Device {
    file: Mutex<File>,
    geo: Geometry,
}

impl Device {
    /// Creates (or truncates) an image file sized for `geo`.
    pub fn create(path: &Path, geo: Geometry) -> Result<Self, FsError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(geo.image_len())?;
        debug!("created device image {:?} ({} bytes)", path, geo.image_len());
        Ok(Device { file: Mutex::new(file), geo })
    }

    /// Opens an existing image, reading and returning its superblock.
    /// The caller validates the superblock before trusting the geometry.
    pub fn open(path: &Path) -> Result<(Self, Superblock), FsError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut buf = [0u8; SUPERBLOCK_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf)?;
        let sb = Superblock::from_bytes(&buf)?;
        sb.validate()?;
        let geo = Geometry::from_superblock(&sb);
        debug!("opened device image {:?}", path);
        Ok((Device { file: Mutex::new(file), geo }, sb))
    }

    pub fn geometry(&self) -> Geometry {
        self.geo
    }

    /// Reads `buf.len()` bytes at an absolute offset.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), FsError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Writes `buf` at an absolute offset.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<(), FsError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    /// Reads one data block.
    pub fn read_block(&self, block: u32) -> Result<Vec<u8>, FsError> {
        self.check_block(block)?;
        let mut buf = vec![0u8; self.geo.block_size as usize];
        self.read_at(self.geo.block_offset(block), &mut buf)?;
        Ok(buf)
    }

    /// Writes one data block. Short payloads are zero padded to the block
    /// size so stale bytes never survive a rewrite.
    pub fn write_block(&self, block: u32, data: &[u8]) -> Result<(), FsError> {
        self.check_block(block)?;
        let bs = self.geo.block_size as usize;
        if data.len() > bs {
            return Err(FsError::OutOfBounds {
                offset: 0,
                len: data.len() as u64,
                bound: bs as u64,
            });
        }
        if data.len() == bs {
            self.write_at(self.geo.block_offset(block), data)
        } else {
            let mut padded = vec![0u8; bs];
            padded[..data.len()].copy_from_slice(data);
            self.write_at(self.geo.block_offset(block), &padded)
        }
    }

    /// Writes the superblock record into block 0.
    pub fn write_superblock(&self, sb: &Superblock) -> Result<(), FsError> {
        self.write_at(0, &sb.to_bytes())
    }

    /// Flushes all buffered writes to stable storage.
    pub fn sync(&self) -> Result<(), FsError> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn check_block(&self, block: u32) -> Result<(), FsError> {
        if block == 0 || block >= self.geo.total_blocks {
            return Err(FsError::BlockNotFound { block });
        }
        Ok(())
    }
}

/// A fixed-size block buffer with bounds-checked access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    data: Vec<u8>,
}

impl DataBlock {
    /// A zeroed block of `block_size` bytes.
    pub fn new(block_size: u32) -> Self {
        DataBlock { data: vec![0u8; block_size as usize] }
    }

    /// Wraps an existing block-sized buffer.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        DataBlock { data }
    }

    /// Reads up to `len` bytes at `offset`, clamped to the block bounds.
    pub fn read(&self, offset: usize, len: usize) -> &[u8] {
        if offset >= self.data.len() {
            return &[];
        }
        let end = (offset + len).min(self.data.len());
        &self.data[offset..end]
    }

    /// Writes `data` at `offset`; the write must fit inside the block.
    pub fn write(&mut self, data: &[u8], offset: usize) -> Result<(), FsError> {
        if offset + data.len() > self.data.len() {
            return Err(FsError::OutOfBounds {
                offset: offset as u64,
                len: data.len() as u64,
                bound: self.data.len() as u64,
            });
        }
        self.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Zeroes the whole block.
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    /// True when every byte is zero.
    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo(total_blocks: u32, block_size: u32) -> Geometry {
        Geometry {
            block_size,
            total_blocks,
            inode_count: total_blocks / 4,
        }
    }

    #[test]
    fn test_geometry_regions_do_not_overlap() {
        let g = geo(256, 4096);
        assert_eq!(g.inode_table_offset(), 4096);
        assert!(g.block_bitmap_offset() >= g.inode_table_offset() + g.inode_table_len());
        assert_eq!(g.data_offset() % 4096, 0);
        assert!(g.data_offset() >= g.block_bitmap_offset() + g.block_bitmap_len());
        assert_eq!(g.image_len(), g.data_offset() + 255 * 4096);
    }

    #[test]
    fn test_geometry_block_addressing() {
        let g = geo(256, 4096);
        assert_eq!(g.block_offset(1), g.data_offset());
        assert_eq!(g.block_offset(2), g.data_offset() + 4096);
        assert_eq!(g.pointers_per_block(), 1024);
    }

    #[test]
    fn test_device_block_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        let g = geo(64, 512);
        let dev = Device::create(&path, g).unwrap();
        let payload: Vec<u8> = (0..512).map(|i| (i % 251) as u8).collect();
        dev.write_block(3, &payload).unwrap();
        assert_eq!(dev.read_block(3).unwrap(), payload);
        // Short writes are zero padded.
        dev.write_block(3, b"tail").unwrap();
        let back = dev.read_block(3).unwrap();
        assert_eq!(&back[..4], b"tail");
        assert!(back[4..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_device_rejects_out_of_range_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        let dev = Device::create(&path, geo(16, 512)).unwrap();
        assert!(matches!(dev.read_block(0), Err(FsError::BlockNotFound { block: 0 })));
        assert!(dev.read_block(16).is_err());
        assert!(dev.write_block(17, b"x").is_err());
    }

    #[test]
    fn test_data_block_bounds() {
        let mut block = DataBlock::new(512);
        assert!(block.is_empty());
        block.write(b"hello", 10).unwrap();
        assert!(!block.is_empty());
        assert_eq!(block.read(10, 5), b"hello");
        // Reads clamp, writes reject.
        assert_eq!(block.read(510, 100).len(), 2);
        assert_eq!(block.read(600, 4), &[] as &[u8]);
        assert!(matches!(
            block.write(&[0u8; 16], 500),
            Err(FsError::OutOfBounds { .. })
        ));
        block.clear();
        assert!(block.is_empty());
    }
}
