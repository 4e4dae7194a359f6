//! Filesystem facade.
//!
//! Ties the superblock, inode table, block allocator and transaction
//! manager into a POSIX-like namespace over one device image. Every
//! mutation runs inside a single transaction: the operation stamps its
//! changes into log records, commits them, and only then applies the
//! bookkeeping (bitmap releases, inode table updates) that the records
//! describe. A failure before or during commit releases any fresh
//! allocations and leaves the mounted state untouched.
//!
//! ## Locking
//!
//! Acquisition order, outer to inner: the mount lock (read for every
//! operation, write for mount/unmount/format/repair), the transaction
//! manager, the log file, per-inode locks, the inode table, the block
//! allocator. Whenever two per-inode locks are held together they are
//! taken in ascending inode order; a pair acquisition that keeps losing
//! its re-verification race is abandoned as a concurrent-access failure
//! instead of risking a cycle.

mod check;
mod data;
pub mod dir;
pub mod path;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::alloc::BlockAllocator;
use crate::device::{Device, Geometry};
use crate::error::FsError;
use crate::inode::{Inode, InodeTable, S_IFDIR, S_IFREG};
use crate::superblock::Superblock;
use crate::wal::{LogOp, LogRecord, TransactionGuard, TransactionManager};

use self::dir::DirEntry;

/// Inode number of the root directory.
pub const ROOT_INODE: u32 = 1;

/// Mask selecting the permission bits of a mode.
const PERM_MASK: u16 = 0o7777;

/// Capacity and usage summary, from the superblock counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileSystemInfo {
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub total_inodes: u32,
    pub free_inodes: u32,
    pub block_size: u32,
    pub usage_percent: f64,
}

/// Namespace-wide counters, computed by walking the inode table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSystemStats {
    pub total_files: u32,
    pub total_directories: u32,
    pub total_data_size: u64,
    pub active_transactions: u32,
}

/// Reader-writer locks keyed by inode number.
///
/// An entry lives as long as its inode is allocated; freeing the inode
/// drops the entry. The map itself is only held long enough to clone the
/// lock out.
pub(crate) struct InodeLockMap {
    map: Mutex<HashMap<u32, Arc<RwLock<()>>>>,
}

impl InodeLockMap {
    fn new() -> Self {
        InodeLockMap { map: Mutex::new(HashMap::new()) }
    }

    pub(crate) fn entry(&self, inode: u32) -> Arc<RwLock<()>> {
        self.map
            .lock()
            .entry(inode)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    pub(crate) fn remove(&self, inode: u32) {
        self.map.lock().remove(&inode);
    }
}

/// Everything owned for the lifetime of one mount.
pub(crate) struct Volume {
    pub(crate) device: Device,
    pub(crate) superblock: Mutex<Superblock>,
    pub(crate) inodes: InodeTable,
    pub(crate) allocator: BlockAllocator,
    pub(crate) txns: TransactionManager,
    pub(crate) locks: InodeLockMap,
    pub(crate) needs_repair: AtomicBool,
}

/// Fresh allocations made by an in-flight mutation.
///
/// Dropped without [`Reversal::disarm`], it returns every block and inode
/// taken so far to the pools, so an early error cannot leak space.
struct Reversal<'a> {
    vol: &'a Volume,
    blocks: Vec<u32>,
    inodes: Vec<u32>,
    disarmed: bool,
}

impl<'a> Reversal<'a> {
    fn new(vol: &'a Volume) -> Self {
        Reversal { vol, blocks: Vec::new(), inodes: Vec::new(), disarmed: false }
    }

    fn add_blocks(&mut self, blocks: &[u32]) {
        self.blocks.extend_from_slice(blocks);
    }

    fn add_inode(&mut self, inode: u32) {
        self.inodes.push(inode);
    }

    fn disarm(&mut self) {
        self.disarmed = true;
    }
}

impl Drop for Reversal<'_> {
    fn drop(&mut self) {
        if self.disarmed {
            return;
        }
        data::release_blocks(self.vol, self.blocks.drain(..));
        for inode in self.inodes.drain(..) {
            let _ = self.vol.inodes.free(inode);
            let _ = self.vol.superblock.lock().deallocate_inode();
        }
    }
}

/// The filesystem engine.
///
/// All methods take `&self`; the mount lock inside arbitrates between
/// regular operations and lifecycle changes.
pub struct FileSystem {
    state: RwLock<Option<Volume>>,
}

impl Default for FileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem {
    pub fn new() -> Self {
        FileSystem { state: RwLock::new(None) }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Writes a fresh filesystem onto `device_path` and truncates the log
    /// at `wal_path`. The instance stays unmounted.
    pub fn format(
        &self,
        device_path: &Path,
        wal_path: &Path,
        total_blocks: u32,
        block_size: u32,
    ) -> Result<(), FsError> {
        let state = self.state.write();
        if state.is_some() {
            return Err(FsError::Configuration {
                param: "mount".into(),
                reason: "cannot format while mounted".into(),
            });
        }

        let sb = Superblock::initialize(total_blocks, block_size)?;
        let geo = Geometry::from_superblock(&sb);
        let device = Device::create(device_path, geo)?;

        let inodes = InodeTable::new(sb.inode_count);
        let root = Inode::init(S_IFDIR | 0o755, 0, 0);
        inodes.install(ROOT_INODE, root)?;
        let allocator = BlockAllocator::new(total_blocks);

        // A fresh image starts with an empty log.
        std::fs::File::create(wal_path)?;
        let txns = TransactionManager::new(wal_path)?;

        let volume = Volume {
            device,
            superblock: Mutex::new(sb),
            inodes,
            allocator,
            txns,
            locks: InodeLockMap::new(),
            needs_repair: AtomicBool::new(false),
        };
        flush_metadata(&volume)?;
        volume.device.sync()?;
        info!(
            "formatted {:?}: {} blocks of {} bytes",
            device_path, total_blocks, block_size
        );
        Ok(())
    }

    /// Loads the image, replays the log and brings the namespace online.
    pub fn mount(&self, device_path: &Path, wal_path: &Path) -> Result<(), FsError> {
        let mut state = self.state.write();
        if state.is_some() {
            return Err(FsError::Configuration {
                param: "mount".into(),
                reason: "already mounted".into(),
            });
        }

        let (device, mut sb) = Device::open(device_path)?;
        let geo = device.geometry();

        let mut region = vec![0u8; geo.inode_region_len() as usize];
        device.read_at(geo.inode_table_offset(), &mut region)?;
        let inodes = InodeTable::deserialize(&region, geo.inode_count)?;

        let mut bitmap = vec![0u8; geo.block_bitmap_len() as usize];
        device.read_at(geo.block_bitmap_offset(), &mut bitmap)?;
        let allocator = BlockAllocator::deserialize(&bitmap, geo.total_blocks)?;

        let txns = TransactionManager::new(wal_path)?;
        sb.update_mount_time();

        let volume = Volume {
            device,
            superblock: Mutex::new(sb),
            inodes,
            allocator,
            txns,
            locks: InodeLockMap::new(),
            needs_repair: AtomicBool::new(false),
        };

        let replayed = volume.txns.recover(|rec| check::apply_record(&volume, rec))?;
        if replayed > 0 {
            info!("recovery replayed {} log records", replayed);
        }

        // The counters are a summary; the bitmap and table are the truth.
        {
            let mut sb = volume.superblock.lock();
            sb.free_blocks = volume.allocator.free_count();
            sb.free_inodes = volume.inodes.free_count();
            sb.update_checksum();
            volume.device.write_superblock(&sb)?;
        }

        let root = volume.inodes.read(ROOT_INODE).map_err(|_| FsError::CorruptedFilesystem {
            reason: "root inode is not allocated".into(),
        })?;
        if !root.is_directory() {
            return Err(FsError::CorruptedFilesystem {
                reason: "root inode is not a directory".into(),
            });
        }

        *state = Some(volume);
        info!("mounted {:?}", device_path);
        Ok(())
    }

    /// Flushes every structure and the log, then releases the image.
    pub fn unmount(&self) -> Result<(), FsError> {
        let mut state = self.state.write();
        let volume = state.take().ok_or(FsError::NotMounted)?;
        flush_metadata(&volume)?;
        volume.txns.checkpoint()?;
        volume.device.sync()?;
        info!("unmounted");
        Ok(())
    }

    pub fn is_mounted(&self) -> bool {
        self.state.read().is_some()
    }

    // =========================================================================
    // Namespace operations
    // =========================================================================

    /// Creates an empty regular file.
    pub fn create_file(&self, path: &str, permissions: u16) -> Result<(), FsError> {
        self.create_node(path, permissions, false)
    }

    /// Creates an empty directory.
    pub fn create_directory(&self, path: &str, permissions: u16) -> Result<(), FsError> {
        self.create_node(path, permissions, true)
    }

    fn create_node(&self, path: &str, permissions: u16, directory: bool) -> Result<(), FsError> {
        self.write_op(|vol| {
            let (parent_comps, leaf) = path::split_parent(path)?;
            let parent = resolve(vol, &parent_comps, path)?;
            let parent_lock = vol.locks.entry(parent);
            let _pg = parent_lock.write();

            let parent_inode = vol.inodes.read(parent)?;
            if !parent_inode.is_directory() {
                return Err(FsError::DirectoryNotFound { path: path.into() });
            }
            let entries = dir::decode_entries(&data::read_all(vol, &parent_inode)?)?;
            if entries.iter().any(|e| e.name == leaf) {
                return Err(FsError::AlreadyExists { path: path.into() });
            }

            let mut txn = TransactionGuard::new(&vol.txns);
            let mut undo = Reversal::new(vol);

            let ino = vol.inodes.allocate()?;
            if let Err(e) = vol.superblock.lock().allocate_inode() {
                let _ = vol.inodes.free(ino);
                return Err(e);
            }
            undo.add_inode(ino);

            let type_bits = if directory { S_IFDIR } else { S_IFREG };
            let node = Inode::init(type_bits | (permissions & PERM_MASK), 0, 0);
            txn.append(
                LogRecord::new(LogOp::CreateInode, ino, 0).with_new_data(node.to_bytes().to_vec()),
            )?;

            let entry = DirEntry::new(ino, &leaf);
            let mut parent_scratch = parent_inode;
            let parent_scratch_size = parent_scratch.size;
            let allocated =
                data::write_extent(vol, &txn, &mut parent_scratch, parent_scratch_size, &entry.encode())?;
            undo.add_blocks(&allocated);
            parent_scratch.size += entry.encoded_len() as u64;
            parent_scratch.touch_mtime();
            parent_scratch.touch_ctime();
            txn.append(
                LogRecord::new(LogOp::UpdateInode, parent, 0)
                    .with_new_data(parent_scratch.to_bytes().to_vec()),
            )?;
            txn.append(LogRecord::new(LogOp::DirInsert, parent, 0).with_new_data(entry.encode()))?;

            txn.commit()?;
            undo.disarm();

            vol.inodes.put(ino, node)?;
            vol.inodes.put(parent, parent_scratch)?;
            info!("created {} {}", if directory { "directory" } else { "file" }, path);
            Ok(())
        })
    }

    /// Removes a regular file, releasing its inode and every data and
    /// indirect block it holds.
    pub fn delete_file(&self, path: &str) -> Result<(), FsError> {
        self.write_op(|vol| {
            let (parent_comps, leaf) = path::split_parent(path)?;
            let parent = resolve(vol, &parent_comps, path)?;
            with_entry_locked(vol, parent, &leaf, path, |parent_inode, entries, pos, target| {
                let target_inode = vol.inodes.read(target)?;
                if !target_inode.is_file() {
                    return Err(FsError::FileNotFound { path: path.into() });
                }
                remove_entry(vol, parent, parent_inode, entries, pos, target, target_inode)?;
                info!("deleted file {}", path);
                Ok(())
            })
        })
    }

    /// Removes an empty directory.
    pub fn delete_directory(&self, path: &str) -> Result<(), FsError> {
        self.write_op(|vol| {
            let (parent_comps, leaf) = path::split_parent(path)?;
            let parent = resolve(vol, &parent_comps, path)?;
            let result =
                with_entry_locked(vol, parent, &leaf, path, |parent_inode, entries, pos, target| {
                    let target_inode = vol.inodes.read(target)?;
                    if !target_inode.is_directory() {
                        return Err(FsError::DirectoryNotFound { path: path.into() });
                    }
                    if !dir::decode_entries(&data::read_all(vol, &target_inode)?)?.is_empty() {
                        return Err(FsError::DirectoryNotEmpty { path: path.into() });
                    }
                    remove_entry(vol, parent, parent_inode, entries, pos, target, target_inode)?;
                    info!("deleted directory {}", path);
                    Ok(())
                });
            result.map_err(|e| match e {
                FsError::FileNotFound { path } => FsError::DirectoryNotFound { path },
                other => other,
            })
        })
    }

    /// Moves `old_path` to `new_path` under a single transaction. Fails
    /// with `AlreadyExists` when the destination name is taken.
    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<(), FsError> {
        self.write_op(|vol| {
            let (old_parent_comps, old_leaf) = path::split_parent(old_path)?;
            let (new_parent_comps, new_leaf) = path::split_parent(new_path)?;

            let mut old_full = old_parent_comps.clone();
            old_full.push(old_leaf.clone());
            if new_parent_comps.len() >= old_full.len()
                && new_parent_comps[..old_full.len()] == old_full[..]
            {
                return Err(FsError::InvalidPath {
                    path: new_path.into(),
                    reason: "destination is inside the source".into(),
                });
            }

            let old_parent = resolve(vol, &old_parent_comps, old_path)?;
            let new_parent = resolve(vol, &new_parent_comps, new_path)?;

            if old_parent == new_parent {
                rename_within(vol, old_parent, &old_leaf, &new_leaf, old_path, new_path)
            } else {
                rename_across(
                    vol, old_parent, new_parent, &old_leaf, &new_leaf, old_path, new_path,
                )
            }
        })
    }

    /// Alias for [`FileSystem::rename`].
    pub fn mv(&self, old_path: &str, new_path: &str) -> Result<(), FsError> {
        self.rename(old_path, new_path)
    }

    /// Returns a file's full content. Sparse regions read as zeroes.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError> {
        self.read_op(|vol| {
            let comps = path::normalize(path)?;
            let ino = resolve(vol, &comps, path)?;
            let lock = vol.locks.entry(ino);

            let content = {
                let _g = lock.read();
                let inode = vol.inodes.read(ino)?;
                if !inode.is_file() {
                    return Err(FsError::FileNotFound { path: path.into() });
                }
                data::read_all(vol, &inode)?
            };

            // Stamping atime is a write; skip it while repair is pending
            // so reads keep working on a degraded filesystem.
            if !vol.needs_repair.load(Ordering::SeqCst) {
                let _g = lock.write();
                let mut txn = TransactionGuard::new(&vol.txns);
                let mut scratch = vol.inodes.read(ino)?;
                scratch.touch_atime();
                txn.append(
                    LogRecord::new(LogOp::UpdateInode, ino, 0)
                        .with_new_data(scratch.to_bytes().to_vec()),
                )?;
                txn.commit()?;
                vol.inodes.put(ino, scratch)?;
            }
            Ok(content)
        })
    }

    /// Replaces a file's content.
    pub fn write_file(&self, path: &str, content: &[u8]) -> Result<(), FsError> {
        self.write_op(|vol| {
            let comps = path::normalize(path)?;
            let ino = resolve(vol, &comps, path)?;
            let lock = vol.locks.entry(ino);
            let _g = lock.write();

            let inode = vol.inodes.read(ino)?;
            if !inode.is_file() {
                return Err(FsError::FileNotFound { path: path.into() });
            }

            let mut txn = TransactionGuard::new(&vol.txns);
            let mut undo = Reversal::new(vol);

            let mut scratch = inode;
            let old_blocks = data::stage_clear(vol, &txn, &mut scratch)?;

            // Reserve the data blocks up front, preferring one contiguous
            // run so a rewritten file lands sequentially on the device.
            let bs = u64::from(vol.device.geometry().block_size);
            let needed = ((content.len() as u64 + bs - 1) / bs) as u32;
            let run = vol.allocator.allocate_contiguous(needed)?;
            let allocated = data::write_extent_from(vol, &txn, &mut scratch, 0, content, run)?;
            undo.add_blocks(&allocated);
            scratch.size = content.len() as u64;
            scratch.touch_mtime();
            scratch.touch_ctime();
            txn.append(
                LogRecord::new(LogOp::UpdateInode, ino, 0)
                    .with_new_data(scratch.to_bytes().to_vec()),
            )?;

            txn.commit()?;
            undo.disarm();

            data::release_blocks(vol, old_blocks.all());
            vol.inodes.put(ino, scratch)?;
            info!("wrote {} bytes to {}", content.len(), path);
            Ok(())
        })
    }

    /// Extends a file's content starting at its current size.
    pub fn append_file(&self, path: &str, content: &[u8]) -> Result<(), FsError> {
        self.write_op(|vol| {
            let comps = path::normalize(path)?;
            let ino = resolve(vol, &comps, path)?;
            let lock = vol.locks.entry(ino);
            let _g = lock.write();

            let inode = vol.inodes.read(ino)?;
            if !inode.is_file() {
                return Err(FsError::FileNotFound { path: path.into() });
            }

            let mut txn = TransactionGuard::new(&vol.txns);
            let mut undo = Reversal::new(vol);

            let mut scratch = inode;
            let scratch_size = scratch.size;
            let allocated = data::write_extent(vol, &txn, &mut scratch, scratch_size, content)?;
            undo.add_blocks(&allocated);
            scratch.size += content.len() as u64;
            scratch.touch_mtime();
            scratch.touch_ctime();
            txn.append(
                LogRecord::new(LogOp::UpdateInode, ino, 0)
                    .with_new_data(scratch.to_bytes().to_vec()),
            )?;

            txn.commit()?;
            undo.disarm();

            vol.inodes.put(ino, scratch)?;
            info!("appended {} bytes to {}", content.len(), path);
            Ok(())
        })
    }

    /// True when the path resolves to a regular file.
    pub fn file_exists(&self, path: &str) -> Result<bool, FsError> {
        self.exists(path, Inode::is_file)
    }

    /// True when the path resolves to a directory.
    pub fn directory_exists(&self, path: &str) -> Result<bool, FsError> {
        self.exists(path, Inode::is_directory)
    }

    fn exists(&self, path: &str, pred: impl Fn(&Inode) -> bool) -> Result<bool, FsError> {
        let result = self.read_op(|vol| {
            let comps = path::normalize(path)?;
            let ino = resolve(vol, &comps, path)?;
            let lock = vol.locks.entry(ino);
            let _g = lock.read();
            Ok(pred(&vol.inodes.read(ino)?))
        });
        match result {
            Ok(found) => Ok(found),
            Err(FsError::FileNotFound { .. }) | Err(FsError::DirectoryNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Returns a copy of the inode record at `path`.
    pub fn stat(&self, path: &str) -> Result<Inode, FsError> {
        self.read_op(|vol| {
            let comps = path::normalize(path)?;
            let ino = resolve(vol, &comps, path)?;
            let lock = vol.locks.entry(ino);
            let _g = lock.read();
            vol.inodes.read(ino)
        })
    }

    /// Size in bytes of the inode at `path`.
    pub fn get_file_size(&self, path: &str) -> Result<u64, FsError> {
        self.read_op(|vol| {
            let comps = path::normalize(path)?;
            let ino = resolve(vol, &comps, path)?;
            let lock = vol.locks.entry(ino);
            let _g = lock.read();
            Ok(vol.inodes.read(ino)?.size)
        })
    }

    /// Replaces the permission bits, keeping the type bits.
    pub fn set_permissions(&self, path: &str, permissions: u16) -> Result<(), FsError> {
        self.update_inode(path, |inode| {
            inode.mode = (inode.mode & !PERM_MASK) | (permissions & PERM_MASK);
        })
    }

    /// Replaces the owner and group.
    pub fn set_ownership(&self, path: &str, uid: u16, gid: u16) -> Result<(), FsError> {
        self.update_inode(path, |inode| {
            inode.uid = uid;
            inode.gid = gid;
        })
    }

    fn update_inode(&self, path: &str, apply: impl FnOnce(&mut Inode)) -> Result<(), FsError> {
        self.write_op(|vol| {
            let comps = path::normalize(path)?;
            let ino = resolve(vol, &comps, path)?;
            let lock = vol.locks.entry(ino);
            let _g = lock.write();

            let mut txn = TransactionGuard::new(&vol.txns);
            let mut scratch = vol.inodes.read(ino)?;
            apply(&mut scratch);
            scratch.touch_ctime();
            txn.append(
                LogRecord::new(LogOp::UpdateInode, ino, 0)
                    .with_new_data(scratch.to_bytes().to_vec()),
            )?;
            txn.commit()?;
            vol.inodes.put(ino, scratch)?;
            Ok(())
        })
    }

    /// Entry names of a directory, in insertion order.
    pub fn list_directory(&self, path: &str) -> Result<Vec<String>, FsError> {
        self.read_op(|vol| {
            let comps = path::normalize(path)?;
            let ino = resolve(vol, &comps, path).map_err(|e| match e {
                FsError::FileNotFound { .. } => FsError::DirectoryNotFound { path: path.into() },
                other => other,
            })?;
            Ok(read_dir_entries(vol, ino, path)?
                .into_iter()
                .map(|e| e.name)
                .collect())
        })
    }

    // =========================================================================
    // Transactions for batching clients
    // =========================================================================

    pub fn begin_transaction(&self) -> Result<u64, FsError> {
        self.read_op(|vol| Ok(vol.txns.begin()))
    }

    pub fn commit_transaction(&self, tx_id: u64) -> Result<(), FsError> {
        self.read_op(|vol| vol.txns.commit(tx_id))
    }

    pub fn rollback_transaction(&self, tx_id: u64) -> Result<(), FsError> {
        self.read_op(|vol| vol.txns.rollback(tx_id))
    }

    // =========================================================================
    // Information
    // =========================================================================

    pub fn filesystem_info(&self) -> Result<FileSystemInfo, FsError> {
        self.read_op(|vol| {
            let sb = vol.superblock.lock();
            Ok(FileSystemInfo {
                total_blocks: sb.total_blocks,
                free_blocks: sb.free_blocks,
                total_inodes: sb.inode_count,
                free_inodes: sb.free_inodes,
                block_size: sb.block_size,
                usage_percent: sb.block_usage_percent(),
            })
        })
    }

    pub fn filesystem_stats(&self) -> Result<FileSystemStats, FsError> {
        self.read_op(|vol| {
            let mut files = 0;
            let mut directories = 0;
            let mut data_size = 0u64;
            for ino in vol.inodes.allocated() {
                let inode = vol.inodes.read(ino)?;
                if inode.is_directory() {
                    directories += 1;
                } else if inode.is_file() {
                    files += 1;
                    data_size += inode.size;
                }
            }
            Ok(FileSystemStats {
                total_files: files,
                total_directories: directories,
                total_data_size: data_size,
                active_transactions: vol.txns.active_count(),
            })
        })
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Runs a read-only operation against the mounted volume. Corruption
    /// surfaced by the operation latches the requires-repair flag.
    fn read_op<R>(&self, f: impl FnOnce(&Volume) -> Result<R, FsError>) -> Result<R, FsError> {
        let state = self.state.read();
        let vol = state.as_ref().ok_or(FsError::NotMounted)?;
        let result = f(vol);
        if let Err(e) = &result {
            if e.is_corruption() {
                vol.needs_repair.store(true, Ordering::SeqCst);
                error!("corruption detected, repair required: {}", e);
            }
        }
        result
    }

    /// Runs a mutation. Refused outright while repair is pending.
    fn write_op<R>(&self, f: impl FnOnce(&Volume) -> Result<R, FsError>) -> Result<R, FsError> {
        self.read_op(|vol| {
            if vol.needs_repair.load(Ordering::SeqCst) {
                warn!("write refused: filesystem requires repair");
                return Err(FsError::CorruptedFilesystem {
                    reason: "filesystem requires repair".into(),
                });
            }
            f(vol)
        })
    }
}

/// Writes the superblock, inode table and block bitmap to the image.
fn flush_metadata(vol: &Volume) -> Result<(), FsError> {
    let geo = vol.device.geometry();
    let sb = vol.superblock.lock().clone();
    vol.device.write_superblock(&sb)?;
    vol.device.write_at(geo.inode_table_offset(), &vol.inodes.serialize())?;
    vol.device.write_at(geo.block_bitmap_offset(), &vol.allocator.serialize())?;
    Ok(())
}

/// Walks `components` from the root, returning the final inode number.
fn resolve(vol: &Volume, components: &[String], full_path: &str) -> Result<u32, FsError> {
    let mut current = ROOT_INODE;
    for name in components {
        let entries = read_dir_entries(vol, current, full_path)?;
        current = entries
            .iter()
            .find(|e| e.name == *name)
            .map(|e| e.inode)
            .ok_or_else(|| FsError::FileNotFound { path: full_path.into() })?;
    }
    Ok(current)
}

/// Attempts before a pair acquisition gives up.
const ENTRY_LOCK_RETRIES: u32 = 10;

/// Resolves `leaf` inside `parent` and runs `f` with both the parent's
/// and the target's write locks held.
///
/// Locks are taken in ascending inode order: when the target sorts below
/// its parent, the parent lock is released, both are retaken child first,
/// and the entry is re-verified in case it moved in the window. A pair
/// that keeps moving is abandoned as a concurrent-access failure rather
/// than risking a lock cycle.
fn with_entry_locked<R>(
    vol: &Volume,
    parent: u32,
    leaf: &str,
    full_path: &str,
    f: impl FnOnce(&Inode, Vec<DirEntry>, usize, u32) -> Result<R, FsError>,
) -> Result<R, FsError> {
    for _ in 0..ENTRY_LOCK_RETRIES {
        let parent_lock = vol.locks.entry(parent);
        let first_guard = parent_lock.write();
        let parent_inode = vol.inodes.read(parent)?;
        if !parent_inode.is_directory() {
            return Err(FsError::DirectoryNotFound { path: full_path.into() });
        }
        let entries = dir::decode_entries(&data::read_all(vol, &parent_inode)?)?;
        let pos = match entries.iter().position(|e| e.name == leaf) {
            Some(pos) => pos,
            None => return Err(FsError::FileNotFound { path: full_path.into() }),
        };
        let target = entries[pos].inode;
        if target == parent {
            return Err(FsError::CorruptedFilesystem {
                reason: format!("directory {parent} lists itself as {leaf:?}"),
            });
        }

        if target > parent {
            let target_lock = vol.locks.entry(target);
            let _tg = target_lock.write();
            return f(&parent_inode, entries, pos, target);
        }

        drop(first_guard);
        let target_lock = vol.locks.entry(target);
        let _tg = target_lock.write();
        let _pg = parent_lock.write();
        let parent_inode = vol.inodes.read(parent)?;
        if !parent_inode.is_directory() {
            return Err(FsError::DirectoryNotFound { path: full_path.into() });
        }
        let entries = dir::decode_entries(&data::read_all(vol, &parent_inode)?)?;
        match entries.iter().position(|e| e.name == leaf) {
            Some(pos) if entries[pos].inode == target => {
                return f(&parent_inode, entries, pos, target);
            }
            _ => continue,
        }
    }
    warn!("gave up locking {} after {} attempts", full_path, ENTRY_LOCK_RETRIES);
    Err(FsError::ConcurrentAccess { inode: parent, op: format!("lock {full_path}") })
}

/// Reads a directory's entries under its shared lock.
fn read_dir_entries(vol: &Volume, ino: u32, full_path: &str) -> Result<Vec<DirEntry>, FsError> {
    let lock = vol.locks.entry(ino);
    let _g = lock.read();
    let inode = vol.inodes.read(ino)?;
    if !inode.is_directory() {
        return Err(FsError::DirectoryNotFound { path: full_path.into() });
    }
    dir::decode_entries(&data::read_all(vol, &inode)?)
}

/// Stages a full rewrite of a directory's content: logs the release of
/// its current blocks, writes the new entry list and returns the updated
/// scratch inode together with the old blocks (to release after commit)
/// and the new ones (for rollback bookkeeping).
fn stage_dir_rewrite(
    vol: &Volume,
    txn: &TransactionGuard<'_>,
    inode: &Inode,
    entries: &[DirEntry],
) -> Result<(Inode, data::ReachableBlocks, Vec<u32>), FsError> {
    let content = dir::encode_entries(entries);
    let mut scratch = *inode;
    let old = data::stage_clear(vol, txn, &mut scratch)?;
    let allocated = data::write_extent(vol, txn, &mut scratch, 0, &content)?;
    scratch.size = content.len() as u64;
    scratch.touch_mtime();
    scratch.touch_ctime();
    Ok((scratch, old, allocated))
}

/// Tears down one directory entry and the inode behind it under a single
/// transaction: stages the release of the target's blocks, the inode
/// release and the parent rewrite, commits, then applies the bookkeeping.
/// The caller holds both write locks.
fn remove_entry(
    vol: &Volume,
    parent: u32,
    parent_inode: &Inode,
    mut entries: Vec<DirEntry>,
    pos: usize,
    target: u32,
    target_inode: Inode,
) -> Result<(), FsError> {
    let mut txn = TransactionGuard::new(&vol.txns);
    let mut undo = Reversal::new(vol);

    let mut target_scratch = target_inode;
    let target_blocks = data::stage_clear(vol, &txn, &mut target_scratch)?;
    txn.append(
        LogRecord::new(LogOp::FreeInode, target, 0)
            .with_old_data(target_inode.to_bytes().to_vec()),
    )?;

    let removed = entries.remove(pos);
    let (parent_scratch, parent_old, allocated) =
        stage_dir_rewrite(vol, &txn, parent_inode, &entries)?;
    undo.add_blocks(&allocated);
    txn.append(
        LogRecord::new(LogOp::UpdateInode, parent, 0)
            .with_new_data(parent_scratch.to_bytes().to_vec()),
    )?;
    txn.append(LogRecord::new(LogOp::DirRemove, parent, 0).with_old_data(removed.encode()))?;

    txn.commit()?;
    undo.disarm();

    data::release_blocks(vol, target_blocks.all());
    data::release_blocks(vol, parent_old.all());
    let _ = vol.inodes.free(target);
    let _ = vol.superblock.lock().deallocate_inode();
    vol.inodes.put(parent, parent_scratch)?;
    vol.locks.remove(target);
    Ok(())
}

/// Rename where source and destination share a parent: the entry keeps
/// its position, only the name changes.
fn rename_within(
    vol: &Volume,
    parent: u32,
    old_leaf: &str,
    new_leaf: &str,
    old_path: &str,
    new_path: &str,
) -> Result<(), FsError> {
    let parent_lock = vol.locks.entry(parent);
    let _pg = parent_lock.write();

    let parent_inode = vol.inodes.read(parent)?;
    if !parent_inode.is_directory() {
        return Err(FsError::DirectoryNotFound { path: old_path.into() });
    }
    let mut entries = dir::decode_entries(&data::read_all(vol, &parent_inode)?)?;
    if entries.iter().any(|e| e.name == new_leaf) {
        return Err(FsError::AlreadyExists { path: new_path.into() });
    }
    let pos = entries
        .iter()
        .position(|e| e.name == old_leaf)
        .ok_or_else(|| FsError::FileNotFound { path: old_path.into() })?;

    let removed = entries[pos].clone();
    entries[pos].name = new_leaf.to_string();
    let inserted = entries[pos].clone();

    let mut txn = TransactionGuard::new(&vol.txns);
    let mut undo = Reversal::new(vol);

    let (scratch, old_blocks, allocated) = stage_dir_rewrite(vol, &txn, &parent_inode, &entries)?;
    undo.add_blocks(&allocated);
    txn.append(
        LogRecord::new(LogOp::UpdateInode, parent, 0).with_new_data(scratch.to_bytes().to_vec()),
    )?;
    txn.append(LogRecord::new(LogOp::DirRemove, parent, 0).with_old_data(removed.encode()))?;
    txn.append(LogRecord::new(LogOp::DirInsert, parent, 0).with_new_data(inserted.encode()))?;

    txn.commit()?;
    undo.disarm();

    data::release_blocks(vol, old_blocks.all());
    vol.inodes.put(parent, scratch)?;
    info!("renamed {} to {}", old_path, new_path);
    Ok(())
}

/// Rename across two directories: remove from one parent, insert into the
/// other, atomically under one transaction. Both parent locks are taken
/// in ascending inode order.
fn rename_across(
    vol: &Volume,
    old_parent: u32,
    new_parent: u32,
    old_leaf: &str,
    new_leaf: &str,
    old_path: &str,
    new_path: &str,
) -> Result<(), FsError> {
    let (first, second) = if old_parent < new_parent {
        (old_parent, new_parent)
    } else {
        (new_parent, old_parent)
    };
    let first_lock = vol.locks.entry(first);
    let _g1 = first_lock.write();
    let second_lock = vol.locks.entry(second);
    let _g2 = second_lock.write();

    let old_parent_inode = vol.inodes.read(old_parent)?;
    let new_parent_inode = vol.inodes.read(new_parent)?;
    if !old_parent_inode.is_directory() {
        return Err(FsError::DirectoryNotFound { path: old_path.into() });
    }
    if !new_parent_inode.is_directory() {
        return Err(FsError::DirectoryNotFound { path: new_path.into() });
    }

    let mut old_entries = dir::decode_entries(&data::read_all(vol, &old_parent_inode)?)?;
    let mut new_entries = dir::decode_entries(&data::read_all(vol, &new_parent_inode)?)?;
    if new_entries.iter().any(|e| e.name == new_leaf) {
        return Err(FsError::AlreadyExists { path: new_path.into() });
    }
    let pos = old_entries
        .iter()
        .position(|e| e.name == old_leaf)
        .ok_or_else(|| FsError::FileNotFound { path: old_path.into() })?;

    let removed = old_entries.remove(pos);
    let inserted = DirEntry::new(removed.inode, new_leaf);
    new_entries.push(inserted.clone());

    let mut txn = TransactionGuard::new(&vol.txns);
    let mut undo = Reversal::new(vol);

    let (old_scratch, old_released, old_allocated) =
        stage_dir_rewrite(vol, &txn, &old_parent_inode, &old_entries)?;
    undo.add_blocks(&old_allocated);
    txn.append(
        LogRecord::new(LogOp::UpdateInode, old_parent, 0)
            .with_new_data(old_scratch.to_bytes().to_vec()),
    )?;
    txn.append(LogRecord::new(LogOp::DirRemove, old_parent, 0).with_old_data(removed.encode()))?;

    let (new_scratch, new_released, new_allocated) =
        stage_dir_rewrite(vol, &txn, &new_parent_inode, &new_entries)?;
    undo.add_blocks(&new_allocated);
    txn.append(
        LogRecord::new(LogOp::UpdateInode, new_parent, 0)
            .with_new_data(new_scratch.to_bytes().to_vec()),
    )?;
    txn.append(LogRecord::new(LogOp::DirInsert, new_parent, 0).with_new_data(inserted.encode()))?;

    txn.commit()?;
    undo.disarm();

    data::release_blocks(vol, old_released.all());
    data::release_blocks(vol, new_released.all());
    vol.inodes.put(old_parent, old_scratch)?;
    vol.inodes.put(new_parent, new_scratch)?;
    info!("moved {} to {}", old_path, new_path);
    Ok(())
}
