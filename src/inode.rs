//! Inode records and the inode table.
//!
//! An inode is a fixed 128-byte record describing one file or directory:
//! ownership, mode, size, timestamps and the block-pointer tree (12 direct
//! pointers plus single, double and triple indirect pointers). The inode
//! table is a flat array of `inode_count` records plus a free bitmap.
//! Inode 0 is invalid and inode 1 is the root directory; both are reserved
//! at construction time.

use std::io::Cursor;

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::checksum::checksum;
use crate::error::FsError;
use crate::unix_now;

/// Serialized size of one inode record.
pub const INODE_SIZE: usize = 128;

/// Number of direct block pointers per inode.
pub const DIRECT_POINTERS: usize = 12;

/// Mask isolating the file type bits of a mode.
pub const S_IFMT: u16 = 0o170000;
/// Directory type bits.
pub const S_IFDIR: u16 = 0o040000;
/// Regular file type bits.
pub const S_IFREG: u16 = 0o100000;
/// Symbolic link type bits.
pub const S_IFLNK: u16 = 0o120000;

bitflags! {
    /// The nine permission bits of an inode mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u16 {
        const OWNER_READ  = 0o400;
        const OWNER_WRITE = 0o200;
        const OWNER_EXEC  = 0o100;
        const GROUP_READ  = 0o040;
        const GROUP_WRITE = 0o020;
        const GROUP_EXEC  = 0o010;
        const OTHER_READ  = 0o004;
        const OTHER_WRITE = 0o002;
        const OTHER_EXEC  = 0o001;
    }
}

/// One fixed-size inode record, identical in memory and on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    /// File type bits plus nine permission bits.
    pub mode: u16,
    /// Owner user id.
    pub uid: u16,
    /// Owner group id.
    pub gid: u16,
    /// File size in bytes.
    pub size: u64,
    /// Blocks charged to this inode, data and indirect blocks alike.
    pub blocks: u64,
    /// Last access time, seconds since the epoch.
    pub atime: u64,
    /// Last data modification time.
    pub mtime: u64,
    /// Last metadata change time.
    pub ctime: u64,
    /// Direct block pointers; 0 means unassigned.
    pub direct: [u32; DIRECT_POINTERS],
    /// Single indirect block pointer.
    pub single_indirect: u32,
    /// Double indirect block pointer.
    pub double_indirect: u32,
    /// Triple indirect block pointer.
    pub triple_indirect: u32,
    /// Persisted for external replication tooling; unused by the engine.
    pub replication_count: u32,
    /// Integrity checksum over the record with this field zeroed.
    pub checksum: u32,
    /// Hard link count; the namespace operations keep it at 1.
    pub link_count: u32,
}

impl Default for Inode {
    fn default() -> Self {
        Inode {
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            blocks: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            direct: [0; DIRECT_POINTERS],
            single_indirect: 0,
            double_indirect: 0,
            triple_indirect: 0,
            replication_count: 1,
            checksum: 0,
            link_count: 0,
        }
    }
}

impl Inode {
    /// Initializes a freshly allocated inode with the given mode and owner.
    pub fn init(mode: u16, uid: u16, gid: u16) -> Self {
        let now = unix_now();
        let mut inode = Inode {
            mode,
            uid,
            gid,
            atime: now,
            mtime: now,
            ctime: now,
            link_count: 1,
            replication_count: 1,
            ..Inode::default()
        };
        inode.update_checksum();
        inode
    }

    /// True when the type bits mark a directory.
    pub fn is_directory(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// True when the type bits mark a regular file.
    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    /// True when the type bits mark a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    /// Renders the mode as the familiar `drwxr-xr-x` form.
    pub fn permissions_string(&self) -> String {
        let mut out = String::with_capacity(10);
        out.push(if self.is_directory() {
            'd'
        } else if self.is_symlink() {
            'l'
        } else if self.is_file() {
            '-'
        } else {
            '?'
        });
        let perms = Permissions::from_bits_truncate(self.mode);
        let triplets = [
            (Permissions::OWNER_READ, Permissions::OWNER_WRITE, Permissions::OWNER_EXEC),
            (Permissions::GROUP_READ, Permissions::GROUP_WRITE, Permissions::GROUP_EXEC),
            (Permissions::OTHER_READ, Permissions::OTHER_WRITE, Permissions::OTHER_EXEC),
        ];
        for (r, w, x) in triplets {
            out.push(if perms.contains(r) { 'r' } else { '-' });
            out.push(if perms.contains(w) { 'w' } else { '-' });
            out.push(if perms.contains(x) { 'x' } else { '-' });
        }
        out
    }

    /// Stamps the access time and refreshes the checksum.
    pub fn touch_atime(&mut self) {
        self.atime = unix_now();
        self.update_checksum();
    }

    /// Stamps the modification time and refreshes the checksum.
    pub fn touch_mtime(&mut self) {
        self.mtime = unix_now();
        self.update_checksum();
    }

    /// Stamps the change time and refreshes the checksum.
    pub fn touch_ctime(&mut self) {
        self.ctime = unix_now();
        self.update_checksum();
    }

    /// Recomputes the checksum over the record with the checksum zeroed.
    pub fn update_checksum(&mut self) {
        self.checksum = 0;
        self.checksum = checksum(&self.to_bytes());
    }

    /// Validates an allocated inode: non-zero mode, live link count, sane
    /// timestamps, matching checksum.
    pub fn validate(&self, inode_num: u32) -> Result<(), FsError> {
        if self.mode == 0 {
            return Err(FsError::CorruptedInode { inode: inode_num });
        }
        if self.link_count == 0 {
            return Err(FsError::CorruptedInode { inode: inode_num });
        }
        let now = unix_now();
        if self.atime > now || self.mtime > now || self.ctime > now {
            return Err(FsError::CorruptedInode { inode: inode_num });
        }
        let mut copy = *self;
        copy.checksum = 0;
        if self.checksum != checksum(&copy.to_bytes()) {
            return Err(FsError::CorruptedInode { inode: inode_num });
        }
        Ok(())
    }

    /// Serializes the record to its fixed 128-byte layout.
    pub fn to_bytes(&self) -> [u8; INODE_SIZE] {
        let mut buf = [0u8; INODE_SIZE];
        let mut cur = Cursor::new(&mut buf[..]);
        cur.write_u16::<LittleEndian>(self.mode).unwrap();
        cur.write_u16::<LittleEndian>(self.uid).unwrap();
        cur.write_u16::<LittleEndian>(self.gid).unwrap();
        cur.write_u16::<LittleEndian>(0).unwrap(); // alignment padding
        cur.write_u64::<LittleEndian>(self.size).unwrap();
        cur.write_u64::<LittleEndian>(self.blocks).unwrap();
        cur.write_u64::<LittleEndian>(self.atime).unwrap();
        cur.write_u64::<LittleEndian>(self.mtime).unwrap();
        cur.write_u64::<LittleEndian>(self.ctime).unwrap();
        for ptr in self.direct {
            cur.write_u32::<LittleEndian>(ptr).unwrap();
        }
        cur.write_u32::<LittleEndian>(self.single_indirect).unwrap();
        cur.write_u32::<LittleEndian>(self.double_indirect).unwrap();
        cur.write_u32::<LittleEndian>(self.triple_indirect).unwrap();
        cur.write_u32::<LittleEndian>(self.replication_count).unwrap();
        cur.write_u32::<LittleEndian>(self.checksum).unwrap();
        cur.write_u32::<LittleEndian>(self.link_count).unwrap();
        buf
    }

    /// Parses the record from its fixed layout.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, FsError> {
        if buf.len() < INODE_SIZE {
            return Err(FsError::CorruptedFilesystem {
                reason: format!("inode record truncated to {} bytes", buf.len()),
            });
        }
        let mut cur = Cursor::new(buf);
        let mode = cur.read_u16::<LittleEndian>()?;
        let uid = cur.read_u16::<LittleEndian>()?;
        let gid = cur.read_u16::<LittleEndian>()?;
        let _pad = cur.read_u16::<LittleEndian>()?;
        let size = cur.read_u64::<LittleEndian>()?;
        let blocks = cur.read_u64::<LittleEndian>()?;
        let atime = cur.read_u64::<LittleEndian>()?;
        let mtime = cur.read_u64::<LittleEndian>()?;
        let ctime = cur.read_u64::<LittleEndian>()?;
        let mut direct = [0u32; DIRECT_POINTERS];
        for ptr in direct.iter_mut() {
            *ptr = cur.read_u32::<LittleEndian>()?;
        }
        Ok(Inode {
            mode,
            uid,
            gid,
            size,
            blocks,
            atime,
            mtime,
            ctime,
            direct,
            single_indirect: cur.read_u32::<LittleEndian>()?,
            double_indirect: cur.read_u32::<LittleEndian>()?,
            triple_indirect: cur.read_u32::<LittleEndian>()?,
            replication_count: cur.read_u32::<LittleEndian>()?,
            checksum: cur.read_u32::<LittleEndian>()?,
            link_count: cur.read_u32::<LittleEndian>()?,
        })
    }
}

/// Summary counters for the inode table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeStats {
    pub total_inodes: u32,
    pub free_inodes: u32,
    pub used_inodes: u32,
}

struct TableInner {
    inodes: Vec<Inode>,
    /// One flag per slot; true means free.
    free: Vec<bool>,
}

/// Fixed-size table of inode records plus a free bitmap.
///
/// Allocation and release serialize on the table mutex. Record contents are
/// handed out by value; mutation goes through [`InodeTable::put`] or
/// [`InodeTable::with_mut`] under the owning inode's lock in the facade.
pub struct InodeTable {
    inner: Mutex<TableInner>,
}

impl InodeTable {
    /// Creates an empty table with `inode_count` slots. Slot 0 is invalid
    /// and slot 1 is reserved for the root directory.
    pub fn new(inode_count: u32) -> Self {
        let mut free = vec![true; inode_count as usize];
        if !free.is_empty() {
            free[0] = false;
        }
        if free.len() > 1 {
            free[1] = false;
        }
        InodeTable {
            inner: Mutex::new(TableInner {
                inodes: vec![Inode::default(); inode_count as usize],
                free,
            }),
        }
    }

    /// Allocates the lowest free slot above the reserved pair.
    pub fn allocate(&self) -> Result<u32, FsError> {
        let mut inner = self.inner.lock();
        for i in 2..inner.free.len() {
            if inner.free[i] {
                inner.free[i] = false;
                debug!("allocated inode {}", i);
                return Ok(i as u32);
            }
        }
        warn!("inode table exhausted");
        Err(FsError::NoInodes)
    }

    /// Releases a slot, zeroing its record. Releasing an already free slot
    /// is a warned no-op.
    pub fn free(&self, inode_num: u32) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        let idx = inode_num as usize;
        if idx >= inner.free.len() {
            return Err(FsError::InodeNotFound { inode: inode_num });
        }
        if inner.free[idx] {
            warn!("inode {} is already free", inode_num);
            return Ok(());
        }
        inner.free[idx] = true;
        inner.inodes[idx] = Inode::default();
        debug!("freed inode {}", inode_num);
        Ok(())
    }

    /// Returns a copy of an allocated record.
    pub fn read(&self, inode_num: u32) -> Result<Inode, FsError> {
        let inner = self.inner.lock();
        let idx = inode_num as usize;
        if idx >= inner.inodes.len() || inner.free[idx] {
            return Err(FsError::InodeNotFound { inode: inode_num });
        }
        Ok(inner.inodes[idx])
    }

    /// Replaces the record in an allocated slot.
    pub fn put(&self, inode_num: u32, inode: Inode) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        let idx = inode_num as usize;
        if idx >= inner.inodes.len() || inner.free[idx] {
            return Err(FsError::InodeNotFound { inode: inode_num });
        }
        inner.inodes[idx] = inode;
        Ok(())
    }

    /// Runs `f` against a mutable reference to an allocated record.
    pub fn with_mut<R>(
        &self,
        inode_num: u32,
        f: impl FnOnce(&mut Inode) -> R,
    ) -> Result<R, FsError> {
        let mut inner = self.inner.lock();
        let idx = inode_num as usize;
        if idx >= inner.inodes.len() || inner.free[idx] {
            return Err(FsError::InodeNotFound { inode: inode_num });
        }
        Ok(f(&mut inner.inodes[idx]))
    }

    /// Installs a record into a slot and marks it used, free or not.
    /// Log replay uses this to reconstruct table state.
    pub fn install(&self, inode_num: u32, inode: Inode) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        let idx = inode_num as usize;
        if idx >= inner.inodes.len() {
            return Err(FsError::InodeNotFound { inode: inode_num });
        }
        inner.free[idx] = false;
        inner.inodes[idx] = inode;
        Ok(())
    }

    /// True when the slot exists and is free.
    pub fn is_free(&self, inode_num: u32) -> bool {
        let inner = self.inner.lock();
        inner
            .free
            .get(inode_num as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Numbers of every allocated slot, ascending.
    pub fn allocated(&self) -> Vec<u32> {
        let inner = self.inner.lock();
        inner
            .free
            .iter()
            .enumerate()
            .filter(|(i, free)| *i != 0 && !**free)
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Count of free slots.
    pub fn free_count(&self) -> u32 {
        let inner = self.inner.lock();
        inner.free.iter().filter(|f| **f).count() as u32
    }

    /// Total slot count.
    pub fn total(&self) -> u32 {
        self.inner.lock().inodes.len() as u32
    }

    /// Summary counters.
    pub fn stats(&self) -> InodeStats {
        let inner = self.inner.lock();
        let total = inner.inodes.len() as u32;
        let free = inner.free.iter().filter(|f| **f).count() as u32;
        InodeStats {
            total_inodes: total,
            free_inodes: free,
            used_inodes: total - free,
        }
    }

    /// Serializes all records back-to-back followed by the free bitmap
    /// (one bit per slot, 1 = free).
    pub fn serialize(&self) -> Vec<u8> {
        let inner = self.inner.lock();
        let bitmap_len = (inner.free.len() + 7) / 8;
        let mut out = Vec::with_capacity(inner.inodes.len() * INODE_SIZE + bitmap_len);
        for inode in &inner.inodes {
            out.extend_from_slice(&inode.to_bytes());
        }
        let mut bits = vec![0u8; bitmap_len];
        for (i, free) in inner.free.iter().enumerate() {
            if *free {
                bits[i / 8] |= 1 << (i % 8);
            }
        }
        out.extend_from_slice(&bits);
        out
    }

    /// Rebuilds the table from its serialized form.
    pub fn deserialize(buf: &[u8], inode_count: u32) -> Result<Self, FsError> {
        let count = inode_count as usize;
        let bitmap_len = (count + 7) / 8;
        let expected = count * INODE_SIZE + bitmap_len;
        if buf.len() < expected {
            return Err(FsError::CorruptedFilesystem {
                reason: format!(
                    "inode table truncated: {} bytes, expected {}",
                    buf.len(),
                    expected
                ),
            });
        }
        let mut inodes = Vec::with_capacity(count);
        for i in 0..count {
            inodes.push(Inode::from_bytes(&buf[i * INODE_SIZE..(i + 1) * INODE_SIZE])?);
        }
        let bits = &buf[count * INODE_SIZE..expected];
        let mut free = vec![false; count];
        for (i, slot) in free.iter_mut().enumerate() {
            *slot = bits[i / 8] & (1 << (i % 8)) != 0;
        }
        // The reserved slots are never free regardless of what was read.
        if count > 0 {
            free[0] = false;
        }
        if count > 1 {
            free[1] = false;
        }
        Ok(InodeTable {
            inner: Mutex::new(TableInner { inodes, free }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_sets_times_and_checksum() {
        let inode = Inode::init(S_IFREG | 0o644, 1000, 1000);
        assert!(inode.is_file());
        assert!(!inode.is_directory());
        assert_eq!(inode.link_count, 1);
        assert_eq!(inode.replication_count, 1);
        assert!(inode.atime > 0);
        inode.validate(2).unwrap();
    }

    #[test]
    fn test_record_round_trip() {
        let mut inode = Inode::init(S_IFDIR | 0o755, 0, 0);
        inode.size = 4096;
        inode.blocks = 1;
        inode.direct[0] = 42;
        inode.update_checksum();
        let parsed = Inode::from_bytes(&inode.to_bytes()).unwrap();
        assert_eq!(parsed, inode);
        parsed.validate(1).unwrap();
    }

    #[test]
    fn test_validate_rejects_tampered_record() {
        let mut inode = Inode::init(S_IFREG | 0o644, 0, 0);
        inode.size = 9999; // not reflected in the checksum
        assert!(matches!(
            inode.validate(3),
            Err(FsError::CorruptedInode { inode: 3 })
        ));
    }

    #[test]
    fn test_permissions_string() {
        let inode = Inode::init(S_IFDIR | 0o755, 0, 0);
        assert_eq!(inode.permissions_string(), "drwxr-xr-x");
        let inode = Inode::init(S_IFREG | 0o644, 0, 0);
        assert_eq!(inode.permissions_string(), "-rw-r--r--");
    }

    #[test]
    fn test_table_reserves_first_two_slots() {
        let table = InodeTable::new(16);
        assert!(!table.is_free(0));
        assert!(!table.is_free(1));
        assert_eq!(table.free_count(), 14);
        assert_eq!(table.allocate().unwrap(), 2);
        assert_eq!(table.allocate().unwrap(), 3);
    }

    #[test]
    fn test_table_exhaustion() {
        let table = InodeTable::new(4);
        table.allocate().unwrap();
        table.allocate().unwrap();
        assert!(matches!(table.allocate(), Err(FsError::NoInodes)));
    }

    #[test]
    fn test_free_clears_record_and_is_idempotent() {
        let table = InodeTable::new(8);
        let n = table.allocate().unwrap();
        table.put(n, Inode::init(S_IFREG | 0o644, 0, 0)).unwrap();
        table.free(n).unwrap();
        assert!(table.is_free(n));
        table.free(n).unwrap(); // warned no-op
        assert!(matches!(
            table.read(n),
            Err(FsError::InodeNotFound { .. })
        ));
        assert!(table.free(99).is_err());
    }

    #[test]
    fn test_table_serialization_round_trip() {
        let table = InodeTable::new(8);
        let n = table.allocate().unwrap();
        table.put(n, Inode::init(S_IFREG | 0o600, 7, 7)).unwrap();
        let bytes = table.serialize();
        let restored = InodeTable::deserialize(&bytes, 8).unwrap();
        assert_eq!(restored.free_count(), table.free_count());
        assert_eq!(restored.read(n).unwrap(), table.read(n).unwrap());
        assert!(restored.is_free(3));
    }
}
