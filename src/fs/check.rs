//! Recovery application and consistency checking.
//!
//! Log replay runs over freshly loaded metadata. Every application is
//! absolute (install this record, write this block, mark this bit), so
//! replaying the full history over an image that already contains some of
//! the effects converges on the same state. Directory insert and remove
//! records are verified rather than re-applied: the block writes and inode
//! updates committed alongside them carry the actual change.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use log::{info, warn};

use crate::error::FsError;
use crate::fs::{data, dir, flush_metadata, FileSystem, Volume, ROOT_INODE};
use crate::inode::Inode;
use crate::wal::{LogOp, LogRecord};

/// Applies one committed log record to the mounted structures.
pub(super) fn apply_record(vol: &Volume, rec: &LogRecord) -> Result<(), FsError> {
    match rec.op {
        LogOp::CreateInode | LogOp::UpdateInode => {
            let inode = Inode::from_bytes(&rec.new_data)?;
            vol.inodes.install(rec.inode, inode)?;
        }
        LogOp::FreeInode => {
            vol.inodes.free(rec.inode)?;
        }
        LogOp::WriteBlock => {
            vol.allocator.mark_used(rec.block)?;
            vol.device.write_block(rec.block, &rec.new_data)?;
        }
        LogOp::FreeBlock => {
            vol.allocator.mark_free(rec.block)?;
        }
        LogOp::DirInsert => {
            verify_dir_entry(vol, rec.inode, &rec.new_data, true);
        }
        LogOp::DirRemove => {
            verify_dir_entry(vol, rec.inode, &rec.old_data, false);
        }
    }
    Ok(())
}

/// Confirms that a directory does (or no longer does) contain the entry a
/// replayed record describes. Mismatches are reported but do not stop
/// recovery; the authoritative state came from the block writes.
fn verify_dir_entry(vol: &Volume, dir_inode: u32, payload: &[u8], expect_present: bool) {
    let Ok((entry, _)) = dir::DirEntry::decode(payload) else {
        warn!("directory log record with undecodable entry payload");
        return;
    };
    let Ok(inode) = vol.inodes.read(dir_inode) else {
        if expect_present {
            warn!("directory {} missing while verifying entry {:?}", dir_inode, entry.name);
        }
        return;
    };
    let present = data::read_all(vol, &inode)
        .ok()
        .and_then(|content| dir::decode_entries(&content).ok())
        .map(|entries| entries.iter().any(|e| e.name == entry.name))
        .unwrap_or(false);
    if present != expect_present {
        warn!(
            "directory {} entry {:?}: expected {}, found {}",
            dir_inode,
            entry.name,
            if expect_present { "present" } else { "absent" },
            if present { "present" } else { "absent" },
        );
    }
}

impl FileSystem {
    /// Validates the whole filesystem: superblock, bitmap, counters,
    /// every allocated inode and every directory.
    ///
    /// The first inconsistency is returned as a corruption error, which
    /// also latches the requires-repair state.
    pub fn check(&self) -> Result<(), FsError> {
        self.read_op(|vol| {
            vol.superblock.lock().validate()?;
            vol.allocator.validate()?;

            {
                let sb = vol.superblock.lock();
                if sb.free_blocks != vol.allocator.free_count() {
                    return Err(FsError::CorruptedFilesystem {
                        reason: format!(
                            "superblock says {} free blocks, bitmap says {}",
                            sb.free_blocks,
                            vol.allocator.free_count()
                        ),
                    });
                }
                if sb.free_inodes != vol.inodes.free_count() {
                    return Err(FsError::CorruptedFilesystem {
                        reason: format!(
                            "superblock says {} free inodes, table says {}",
                            sb.free_inodes,
                            vol.inodes.free_count()
                        ),
                    });
                }
            }

            let total_inodes = vol.inodes.total();
            let mut owner_of: HashMap<u32, u32> = HashMap::new();
            for ino in vol.inodes.allocated() {
                let inode = vol.inodes.read(ino)?;
                inode.validate(ino)?;

                let reachable = data::collect_blocks(vol, &inode)?;
                if reachable.total() != inode.blocks {
                    warn!(
                        "inode {} charges {} blocks but {} are reachable",
                        ino,
                        inode.blocks,
                        reachable.total()
                    );
                    return Err(FsError::CorruptedInode { inode: ino });
                }
                for block in reachable.all() {
                    if vol.allocator.is_free(block) {
                        return Err(FsError::CorruptedFilesystem {
                            reason: format!("block {block} reachable from inode {ino} but marked free"),
                        });
                    }
                    if let Some(other) = owner_of.insert(block, ino) {
                        return Err(FsError::CorruptedFilesystem {
                            reason: format!("block {block} shared by inodes {other} and {ino}"),
                        });
                    }
                }

                if inode.is_directory() {
                    let entries = dir::decode_entries(&data::read_all(vol, &inode)?)?;
                    for entry in entries {
                        if entry.inode == 0
                            || entry.inode >= total_inodes
                            || vol.inodes.is_free(entry.inode)
                        {
                            return Err(FsError::CorruptedFilesystem {
                                reason: format!(
                                    "directory {} entry {:?} points at unallocated inode {}",
                                    ino, entry.name, entry.inode
                                ),
                            });
                        }
                    }
                }
            }

            if !vol.inodes.read(ROOT_INODE)?.is_directory() {
                return Err(FsError::CorruptedFilesystem {
                    reason: "root inode is not a directory".into(),
                });
            }
            Ok(())
        })
    }

    /// Rebuilds the block bitmap from the union of all inode-reachable
    /// blocks, corrects the superblock counters, flushes everything and
    /// clears the requires-repair state.
    pub fn repair(&self) -> Result<(), FsError> {
        let state = self.state.write();
        let vol = state.as_ref().ok_or(FsError::NotMounted)?;
        info!("repair started");

        let mut used: Vec<u32> = Vec::new();
        for ino in vol.inodes.allocated() {
            let inode = vol.inodes.read(ino)?;
            let reachable = data::collect_blocks(vol, &inode)?;
            used.extend(reachable.all());
        }
        vol.allocator.rebuild(used);

        {
            let mut sb = vol.superblock.lock();
            sb.free_blocks = vol.allocator.free_count();
            sb.free_inodes = vol.inodes.free_count();
            sb.update_checksum();
        }
        flush_metadata(vol)?;
        vol.device.sync()?;
        vol.needs_repair.store(false, Ordering::SeqCst);
        info!("repair complete");
        Ok(())
    }
}
